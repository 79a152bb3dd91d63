//! Memcache protocol server
//!
//! One task per accepted connection. Each task reads command lines, runs
//! them against the cache, and writes protocol responses. A connection is
//! closed on the first malformed line or processing failure; idiomatic
//! memcache clients reconnect.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use blobcache_common::{unix_now, Allocator, Item, MAX_VALUE_SIZE};
use blobcache_protocol::response;
use blobcache_protocol::{client_error, parse_command, server_error, Command, Verb};
use blobcache_storage::Cache;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exptimes up to 30 days are relative TTLs; anything larger is an
/// absolute Unix timestamp
const MAX_RELATIVE_EXPTIME: u32 = 30 * 86400;

/// Counters the `stats` command reports about the server itself
#[derive(Default)]
struct ServerMetrics {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    curr_connections: AtomicI64,
    total_connections: AtomicU64,
}

/// The daemon: a cache plus the TCP front end
pub struct MemcacheServer {
    cache: Cache,
    allocator: Arc<dyn Allocator>,
    metrics: ServerMetrics,
    start_time: Instant,
}

impl MemcacheServer {
    pub fn new(cache: Cache, allocator: Arc<dyn Allocator>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            allocator,
            metrics: ServerMetrics::default(),
            start_time: Instant::now(),
        })
    }

    /// Accept loop; runs until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "memcache server listening");
        loop {
            let (stream, peer) = listener.accept().await.context("accept")?;
            let _ = stream.set_nodelay(true);
            self.metrics
                .total_connections
                .fetch_add(1, Ordering::Relaxed);

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server
                    .metrics
                    .curr_connections
                    .fetch_add(1, Ordering::Relaxed);
                if let Err(e) = server.handle(stream).await {
                    debug!(%peer, error = %e, "connection closed");
                }
                server
                    .metrics
                    .curr_connections
                    .fetch_add(-1, Ordering::Relaxed);
            });
        }
    }

    /// Serve one connection until EOF or error
    pub async fn handle<S>(&self, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (r, w) = tokio::io::split(stream);
        let mut reader = BufReader::with_capacity(64 * 1024, r);
        let mut writer = BufWriter::new(w);
        let mut line = Vec::with_capacity(512);

        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Ok(()); // clean EOF
            }
            self.metrics.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
            if line.last() != Some(&b'\n') {
                return Ok(()); // EOF in the middle of a line
            }

            let cmd = match parse_command(&line) {
                Ok((_, cmd)) => cmd,
                Err(e) => {
                    self.send(&mut writer, &client_error(e), false).await?;
                    writer.flush().await?;
                    anyhow::bail!("bad command line");
                }
            };

            let result = match cmd.verb {
                Verb::Get | Verb::Gets => self.handle_get(&mut writer, &cmd).await,
                Verb::Set => self.handle_set(&mut reader, &mut writer, &cmd).await,
                Verb::Delete => self.handle_del(&mut writer, &cmd).await,
                Verb::Touch => self.handle_touch(&mut writer, &cmd).await,
                Verb::Stats => self.handle_stats(&mut writer, &cmd).await,
                _ => {
                    self.send(
                        &mut writer,
                        &server_error("not supported command"),
                        cmd.noreply,
                    )
                    .await?;
                    writer.flush().await?;
                    anyhow::bail!("not supported command");
                }
            };
            writer.flush().await?;
            result?;
        }
    }

    /// Write `buf` unless the command asked for no reply
    async fn send<W>(&self, writer: &mut W, buf: &[u8], noreply: bool) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if noreply {
            return Ok(());
        }
        writer.write_all(buf).await?;
        self.metrics
            .bytes_written
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn handle_get<W>(&self, writer: &mut W, cmd: &Command) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        for key in &cmd.keys {
            let item = match self.cache.get(key) {
                Ok(item) => item,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(key, error = %e, "get failed");
                    continue;
                }
            };
            // VALUE <key> <flags> <bytes> [<cas unique>]\r\n<data block>\r\n
            let header = if cmd.verb == Verb::Gets {
                // CAS is not implemented; report unique 0
                format!("VALUE {} {} {} 0\r\n", key, item.flags, item.len())
            } else {
                format!("VALUE {} {} {}\r\n", key, item.flags, item.len())
            };
            self.send(writer, header.as_bytes(), cmd.noreply).await?;
            self.send(writer, item.value(), cmd.noreply).await?;
            self.send(writer, response::EOL, cmd.noreply).await?;
        }
        self.send(writer, response::END, cmd.noreply).await?;
        Ok(())
    }

    async fn handle_set<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        cmd: &Command,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if cmd.payload_len < 0 || cmd.payload_len > MAX_VALUE_SIZE - 4096 {
            let e = blobcache_common::Error::ValueSize {
                size: cmd.payload_len,
                max: MAX_VALUE_SIZE - 4096,
            };
            self.send(writer, &client_error(&e), cmd.noreply).await?;
            return Err(e.into());
        }

        let mut item = Item::pooled(Arc::clone(&self.allocator), cmd.payload_len as usize);
        item.key = cmd.key.clone();
        item.flags = cmd.flags;
        reader.read_exact(item.value_mut()).await?;
        let mut eol = [0u8; 2];
        reader.read_exact(&mut eol).await?;
        self.metrics
            .bytes_read
            .fetch_add(cmd.payload_len as u64 + 2, Ordering::Relaxed);

        match exptime_to_ttl(cmd.exptime) {
            Some(ttl) => item.ttl = ttl,
            None => {
                // an absolute exptime in the past: accept, store nothing
                self.send(writer, response::STORED, cmd.noreply).await?;
                return Ok(());
            }
        }

        if let Err(e) = self.cache.set(&item) {
            self.send(writer, &server_error(&e), cmd.noreply).await?;
            return Err(e.into());
        }
        self.send(writer, response::STORED, cmd.noreply).await?;
        Ok(())
    }

    async fn handle_del<W>(&self, writer: &mut W, cmd: &Command) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match self.cache.del(&cmd.key) {
            Ok(()) => self.send(writer, response::DELETED, cmd.noreply).await?,
            Err(e) => self.send(writer, &server_error(&e), cmd.noreply).await?,
        }
        Ok(())
    }

    async fn handle_touch<W>(&self, writer: &mut W, cmd: &Command) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut item = match self.cache.get(&cmd.key) {
            Ok(item) => item,
            Err(e) if e.is_not_found() => {
                self.send(writer, response::NOT_FOUND, cmd.noreply).await?;
                return Ok(());
            }
            Err(e) => {
                self.send(writer, &server_error(&e), cmd.noreply).await?;
                return Err(e.into());
            }
        };

        match exptime_to_ttl(cmd.exptime) {
            Some(ttl) => item.ttl = ttl,
            None => {
                // touching with a past exptime expires the item outright
                self.send(writer, response::TOUCHED, cmd.noreply).await?;
                self.cache.del(&cmd.key)?;
                return Ok(());
            }
        }
        if let Err(e) = self.cache.set(&item) {
            self.send(writer, &server_error(&e), cmd.noreply).await?;
            return Err(e.into());
        }
        self.send(writer, response::TOUCHED, cmd.noreply).await?;
        Ok(())
    }

    async fn handle_stats<W>(&self, writer: &mut W, cmd: &Command) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        use std::fmt::Write as _;

        let mut out = String::with_capacity(1024);
        let mut stat = |name: &str, value: String| {
            let _ = write!(out, "STAT {name} {value}\r\n");
        };

        stat("pid", std::process::id().to_string());
        stat("uptime", self.start_time.elapsed().as_secs().to_string());
        stat("time", unix_now().to_string());
        stat("version", format!("{VERSION} (blobcached)"));

        stat("limit_maxbytes", self.cache.options().size.to_string());

        let m = &self.metrics;
        stat(
            "curr_connections",
            m.curr_connections.load(Ordering::Relaxed).to_string(),
        );
        stat(
            "total_connections",
            m.total_connections.load(Ordering::Relaxed).to_string(),
        );
        stat(
            "bytes_read",
            m.bytes_read.load(Ordering::Relaxed).to_string(),
        );
        stat(
            "bytes_written",
            m.bytes_written.load(Ordering::Relaxed).to_string(),
        );

        let stats = self.cache.stats();
        stat("curr_items", stats.keys.to_string());
        stat("bytes", stats.bytes.to_string());

        let metrics = self.cache.metrics();
        stat("cmd_get", metrics.get_total.to_string());
        stat("cmd_set", metrics.set_total.to_string());
        stat("get_hits", metrics.get_hits.to_string());
        stat("get_misses", metrics.get_misses.to_string());
        stat("get_expired", metrics.get_expired.to_string());
        stat("reclaimed", metrics.expired.to_string());
        stat("evictions", metrics.evicted.to_string());
        stat("last_evicted_age", metrics.evicted_age.to_string());

        out.push_str("END\r\n");
        self.send(writer, out.as_bytes(), cmd.noreply).await?;
        Ok(())
    }
}

/// Convert a protocol exptime to a TTL in seconds.
///
/// Values up to 30 days are already relative. Larger values are absolute
/// Unix timestamps; `None` means the timestamp has already passed.
fn exptime_to_ttl(exptime: u32) -> Option<u32> {
    if exptime <= MAX_RELATIVE_EXPTIME {
        return Some(exptime);
    }
    let now = unix_now();
    if now >= i64::from(exptime) {
        None
    } else {
        Some((i64::from(exptime) - now) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobcache_common::{BufferPool, MIN_SHARD_SIZE};
    use blobcache_storage::CacheOptions;

    fn test_server(dir: &std::path::Path) -> Arc<MemcacheServer> {
        let allocator: Arc<dyn Allocator> = Arc::new(BufferPool::new());
        let cache = Cache::open(
            dir,
            CacheOptions {
                shard_num: 1,
                size: MIN_SHARD_SIZE,
                ttl: 0,
                allocator: Some(Arc::clone(&allocator)),
                disable_gc: true,
            },
        )
        .unwrap();
        MemcacheServer::new(cache, allocator)
    }

    async fn roundtrip(server: Arc<MemcacheServer>, input: &[u8]) -> Vec<u8> {
        let (client, server_side) = tokio::io::duplex(1 << 20);
        let task = tokio::spawn(async move {
            let _ = server.handle(server_side).await;
        });

        let (mut read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(input).await.unwrap();
        write_half.shutdown().await.unwrap();
        drop(write_half);

        let mut output = Vec::new();
        read_half.read_to_end(&mut output).await.unwrap();
        task.await.unwrap();
        output
    }

    #[tokio::test]
    async fn test_set_get_delete_flow() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let out = roundtrip(
            Arc::clone(&server),
            b"set k1 7 0 5\r\nhello\r\nget k1\r\ndelete k1\r\nget k1\r\n",
        )
        .await;
        assert_eq!(
            out,
            b"STORED\r\nVALUE k1 7 5\r\nhello\r\nEND\r\nDELETED\r\nEND\r\n"
        );
    }

    #[tokio::test]
    async fn test_gets_reports_zero_cas() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let out = roundtrip(
            Arc::clone(&server),
            b"set k1 0 0 3\r\nabc\r\ngets k1\r\n",
        )
        .await;
        assert_eq!(out, b"STORED\r\nVALUE k1 0 3 0\r\nabc\r\nEND\r\n");
    }

    #[tokio::test]
    async fn test_multi_key_get() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let out = roundtrip(
            Arc::clone(&server),
            b"set a 0 0 1\r\nx\r\nset b 0 0 1\r\ny\r\nget a b missing\r\n",
        )
        .await;
        assert_eq!(
            out,
            b"STORED\r\nSTORED\r\nVALUE a 0 1\r\nx\r\nVALUE b 0 1\r\ny\r\nEND\r\n"
        );
    }

    #[tokio::test]
    async fn test_noreply_suppresses_response() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let out = roundtrip(
            Arc::clone(&server),
            b"set k1 0 0 2 noreply\r\nhi\r\nget k1\r\n",
        )
        .await;
        assert_eq!(out, b"VALUE k1 0 2\r\nhi\r\nEND\r\n");
    }

    #[tokio::test]
    async fn test_touch_updates_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let out = roundtrip(
            Arc::clone(&server),
            b"set k1 0 0 2\r\nhi\r\ntouch k1 300\r\ntouch missing 300\r\n",
        )
        .await;
        assert_eq!(out, b"STORED\r\nTOUCHED\r\nNOT_FOUND\r\n");
    }

    #[tokio::test]
    async fn test_bad_command_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let out = roundtrip(Arc::clone(&server), b"bogus k1\r\nget k1\r\n").await;
        assert!(out.starts_with(b"CLIENT_ERROR"));
        // the second command never ran
        assert!(!out.ends_with(b"END\r\n"));
    }

    #[tokio::test]
    async fn test_past_absolute_exptime_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        // exptime far above the 30-day cutoff but long past
        let out = roundtrip(
            Arc::clone(&server),
            b"set k1 0 2592001 2\r\nhi\r\nget k1\r\n",
        )
        .await;
        assert_eq!(out, b"STORED\r\nEND\r\n");
    }

    #[tokio::test]
    async fn test_stats_keys_present() {
        let dir = tempfile::tempdir().unwrap();
        let server = test_server(dir.path());

        let out = roundtrip(Arc::clone(&server), b"set k1 0 0 2\r\nhi\r\nstats\r\n").await;
        let text = String::from_utf8(out).unwrap();
        for key in [
            "pid",
            "uptime",
            "time",
            "version",
            "limit_maxbytes",
            "curr_connections",
            "total_connections",
            "bytes_read",
            "bytes_written",
            "curr_items",
            "bytes",
            "cmd_get",
            "cmd_set",
            "get_hits",
            "get_misses",
            "get_expired",
            "reclaimed",
            "evictions",
            "last_evicted_age",
        ] {
            assert!(text.contains(&format!("STAT {key} ")), "missing {key}");
        }
        assert!(text.contains("STAT cmd_set 1\r\n"));
        assert!(text.ends_with("END\r\n"));
    }

    #[test]
    fn test_exptime_conversion() {
        assert_eq!(exptime_to_ttl(0), Some(0));
        assert_eq!(exptime_to_ttl(300), Some(300));
        assert_eq!(exptime_to_ttl(MAX_RELATIVE_EXPTIME), Some(MAX_RELATIVE_EXPTIME));
        // absolute but long past
        assert_eq!(exptime_to_ttl(MAX_RELATIVE_EXPTIME + 1), None);
        // absolute one hour from now
        let future = (unix_now() + 3600) as u32;
        let ttl = exptime_to_ttl(future).unwrap();
        assert!((3595..=3600).contains(&ttl));
    }
}
