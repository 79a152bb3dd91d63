//! blobcache-stat - poll a running blobcached and print rates
//!
//! Issues `stats` once per interval and prints per-second deltas of the
//! interesting counters, plus current occupancy.

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "blobcache-stat")]
#[command(about = "Stats poller for a running blobcached instance")]
#[command(version)]
struct Args {
    /// Server address; a bare host defaults to port 11211
    addr: String,

    /// Poll interval in seconds
    #[arg(default_value_t = 1)]
    interval: u64,
}

/// Counters pulled from one `stats` response
#[derive(Clone, Copy, Debug, Default)]
struct Stats {
    cmd_set: i64,
    cmd_get: i64,
    get_hits: i64,
    bytes_read: i64,
    bytes_written: i64,
    curr_items: i64,
    bytes: i64,
    limit_maxbytes: i64,
}

impl Stats {
    /// Counter movement since `prev`; gauges are carried as-is
    fn delta(mut self, prev: &Stats) -> Stats {
        self.cmd_set -= prev.cmd_set;
        self.cmd_get -= prev.cmd_get;
        self.get_hits -= prev.get_hits;
        self.bytes_read -= prev.bytes_read;
        self.bytes_written -= prev.bytes_written;
        self
    }
}

async fn fetch_stats<R, W>(reader: &mut BufReader<R>, writer: &mut W) -> anyhow::Result<Stats>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(b"stats\r\n").await?;
    writer.flush().await?;

    let mut st = Stats::default();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            bail!("connection closed by server");
        }
        let trimmed = line.trim_end();
        if trimmed == "END" {
            return Ok(st);
        }
        let mut fields = trimmed.split_whitespace();
        let (Some("STAT"), Some(name), Some(value)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let value: i64 = value.parse().unwrap_or(0);
        match name {
            "cmd_set" => st.cmd_set = value,
            "cmd_get" => st.cmd_get = value,
            "get_hits" => st.get_hits = value,
            "bytes_read" => st.bytes_read = value,
            "bytes_written" => st.bytes_written = value,
            "curr_items" => st.curr_items = value,
            "bytes" => st.bytes = value,
            "limit_maxbytes" => st.limit_maxbytes = value,
            _ => {}
        }
    }
}

fn fmt_size(n: i64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n}{}", UNITS[0])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let interval = args.interval.max(1);

    let addr = if args.addr.contains(':') {
        args.addr.clone()
    } else {
        format!("{}:11211", args.addr)
    };
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connect {addr}"))?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut prev: Option<Stats> = None;
    for round in 0u64.. {
        let st = fetch_stats(&mut reader, &mut writer).await?;

        if let Some(prev) = prev {
            if (round - 1) % 20 == 0 {
                println!(
                    "{:>8} {:>8} {:>6} {:>8} {:>8} {:>10} {:>10} {:>6}",
                    "set/s", "get/s", "hit%", "rx/s", "tx/s", "keys", "bytes", "use%"
                );
            }
            let d = st.delta(&prev);
            let secs = interval as i64;
            let hit_rate = if d.cmd_get > 0 {
                100.0 * d.get_hits as f64 / d.cmd_get as f64
            } else {
                0.0
            };
            let usage = if st.limit_maxbytes > 0 {
                100.0 * st.bytes as f64 / st.limit_maxbytes as f64
            } else {
                0.0
            };
            println!(
                "{:>8} {:>8} {:>5.1}% {:>8} {:>8} {:>10} {:>10} {:>5.1}%",
                d.cmd_set / secs,
                d.cmd_get / secs,
                hit_rate,
                fmt_size(d.bytes_read / secs),
                fmt_size(d.bytes_written / secs),
                st.curr_items,
                fmt_size(st.bytes),
                usage,
            );
        }
        prev = Some(st);
        tokio::time::sleep(Duration::from_secs(interval)).await;
    }
    Ok(())
}
