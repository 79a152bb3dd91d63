//! Command-line parsing

use std::str::FromStr;

use thiserror::Error;

/// Errors from [`parse_command`]
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer does not yet hold a full `\n`-terminated line
    #[error("need more data")]
    NeedMoreData,

    /// The line is complete but not a well-formed command. `advance` is the
    /// number of bytes the malformed line occupies, so the caller can still
    /// discard it.
    #[error("bad command line")]
    BadCommand { advance: usize },
}

/// Protocol verbs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
    Get,
    Gets,
    Delete,
    Incr,
    Decr,
    Touch,
    Stats,
}

impl Verb {
    fn from_token(token: &str) -> Option<Verb> {
        Some(match token {
            "set" => Verb::Set,
            "add" => Verb::Add,
            "replace" => Verb::Replace,
            "append" => Verb::Append,
            "prepend" => Verb::Prepend,
            "cas" => Verb::Cas,
            "get" => Verb::Get,
            "gets" => Verb::Gets,
            "delete" => Verb::Delete,
            "incr" => Verb::Incr,
            "decr" => Verb::Decr,
            "touch" => Verb::Touch,
            "stats" => Verb::Stats,
            _ => return None,
        })
    }
}

/// One parsed command line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub key: String,
    /// All keys of a retrieval command, or the arguments of `stats`
    pub keys: Vec<String>,
    /// Amount for `incr`/`decr`
    pub delta: u64,
    pub flags: u32,
    pub exptime: u32,
    /// Payload bytes following the line (storage commands)
    pub payload_len: i64,
    pub cas_unique: i64,
    pub noreply: bool,
}

impl Command {
    fn new(verb: Verb) -> Self {
        Self {
            verb,
            key: String::new(),
            keys: Vec::new(),
            delta: 0,
            flags: 0,
            exptime: 0,
            payload_len: 0,
            cas_unique: 0,
            noreply: false,
        }
    }
}

/// Parse one command line out of `data`.
///
/// Returns the number of bytes consumed (through the terminating `\n`) and
/// the parsed command. [`ParseError::NeedMoreData`] means no full line is
/// buffered yet; a malformed line still reports how far to skip.
pub fn parse_command(data: &[u8]) -> Result<(usize, Command), ParseError> {
    let Some(idx) = data.iter().position(|&b| b == b'\n') else {
        return Err(ParseError::NeedMoreData);
    };
    let advance = idx + 1;
    let bad = ParseError::BadCommand { advance };

    let line = std::str::from_utf8(&data[..advance])
        .map_err(|_| bad)?
        .trim_ascii();
    if line.is_empty() {
        return Err(bad);
    }

    let (verb_token, rest) = match line.find(' ') {
        Some(i) => (&line[..i], &line[i + 1..]),
        None => (line, ""),
    };
    let Some(verb) = Verb::from_token(verb_token) else {
        return Err(bad);
    };

    let cmd = match verb {
        Verb::Set | Verb::Add | Verb::Replace | Verb::Append | Verb::Prepend | Verb::Cas => {
            parse_storage(verb, rest, bad)?
        }
        Verb::Get | Verb::Gets => parse_retrieval(verb, rest, bad)?,
        Verb::Delete => parse_delete(rest, bad)?,
        Verb::Incr | Verb::Decr => parse_incr_decr(verb, rest, bad)?,
        Verb::Touch => parse_touch(rest, bad)?,
        Verb::Stats => parse_stats(rest),
    };
    Ok((advance, cmd))
}

fn parse_field<T: FromStr>(token: Option<&str>, bad: ParseError) -> Result<T, ParseError> {
    token.ok_or(bad)?.parse().map_err(|_| bad)
}

/// `<verb> <key> <flags> <exptime> <bytes> [noreply]`,
/// `cas <key> <flags> <exptime> <bytes> <cas unique> [noreply]`
fn parse_storage(verb: Verb, rest: &str, bad: ParseError) -> Result<Command, ParseError> {
    let mut tokens = rest.split_ascii_whitespace();
    let mut cmd = Command::new(verb);
    cmd.key = tokens.next().ok_or(bad)?.to_string();
    cmd.flags = parse_field(tokens.next(), bad)?;
    cmd.exptime = parse_field(tokens.next(), bad)?;
    cmd.payload_len = parse_field(tokens.next(), bad)?;
    if verb == Verb::Cas {
        cmd.cas_unique = parse_field(tokens.next(), bad)?;
    }
    cmd.noreply = rest.ends_with("noreply");
    Ok(cmd)
}

/// `get <key>*` / `gets <key>*`
fn parse_retrieval(verb: Verb, rest: &str, bad: ParseError) -> Result<Command, ParseError> {
    let mut cmd = Command::new(verb);
    cmd.keys = rest.split_ascii_whitespace().map(str::to_string).collect();
    if cmd.keys.is_empty() {
        return Err(bad);
    }
    cmd.key = cmd.keys[0].clone();
    Ok(cmd)
}

/// `delete <key> [noreply]`
fn parse_delete(rest: &str, bad: ParseError) -> Result<Command, ParseError> {
    let tokens: Vec<&str> = rest.split_ascii_whitespace().collect();
    let mut cmd = Command::new(Verb::Delete);
    match tokens.as_slice() {
        [key] => cmd.key = (*key).to_string(),
        [key, "noreply"] => {
            cmd.key = (*key).to_string();
            cmd.noreply = true;
        }
        _ => return Err(bad),
    }
    Ok(cmd)
}

/// `incr <key> <value> [noreply]` / `decr <key> <value> [noreply]`
fn parse_incr_decr(verb: Verb, rest: &str, bad: ParseError) -> Result<Command, ParseError> {
    let mut tokens = rest.split_ascii_whitespace();
    let mut cmd = Command::new(verb);
    cmd.key = tokens.next().ok_or(bad)?.to_string();
    cmd.delta = parse_field(tokens.next(), bad)?;
    cmd.noreply = rest.ends_with("noreply");
    Ok(cmd)
}

/// `touch <key> <exptime> [noreply]`
fn parse_touch(rest: &str, bad: ParseError) -> Result<Command, ParseError> {
    let mut tokens = rest.split_ascii_whitespace();
    let mut cmd = Command::new(Verb::Touch);
    cmd.key = tokens.next().ok_or(bad)?.to_string();
    cmd.exptime = parse_field(tokens.next(), bad)?;
    cmd.noreply = rest.ends_with("noreply");
    Ok(cmd)
}

/// `stats [args]*`
fn parse_stats(rest: &str) -> Command {
    let mut cmd = Command::new(Verb::Stats);
    cmd.keys = rest.split_ascii_whitespace().map(str::to_string).collect();
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set() {
        let data = b"set k1 1 2 3 noreply\r\nxxx\r\n";
        let (advance, cmd) = parse_command(data).unwrap();
        assert_eq!(advance, 22);
        assert_eq!(cmd.verb, Verb::Set);
        assert_eq!(cmd.key, "k1");
        assert_eq!(cmd.flags, 1);
        assert_eq!(cmd.exptime, 2);
        assert_eq!(cmd.payload_len, 3);
        assert!(cmd.noreply);
        assert_eq!(&data[advance..], b"xxx\r\n");
    }

    #[test]
    fn test_parse_cas() {
        let data = b"cas k1 1 2 3 4 noreply\r\nxxx\r\n";
        let (advance, cmd) = parse_command(data).unwrap();
        assert_eq!(cmd.verb, Verb::Cas);
        assert_eq!(cmd.key, "k1");
        assert_eq!(cmd.flags, 1);
        assert_eq!(cmd.exptime, 2);
        assert_eq!(cmd.payload_len, 3);
        assert_eq!(cmd.cas_unique, 4);
        assert!(cmd.noreply);
        assert_eq!(&data[advance..], b"xxx\r\n");
    }

    #[test]
    fn test_parse_get_multi() {
        let data = b"get k1 k2\r\nxxx\r\n";
        let (advance, cmd) = parse_command(data).unwrap();
        assert_eq!(cmd.verb, Verb::Get);
        assert_eq!(cmd.key, "k1");
        assert_eq!(cmd.keys, vec!["k1", "k2"]);
        assert_eq!(&data[advance..], b"xxx\r\n");
    }

    #[test]
    fn test_parse_delete() {
        let (_, cmd) = parse_command(b"delete k1 noreply\r\n").unwrap();
        assert_eq!(cmd.verb, Verb::Delete);
        assert_eq!(cmd.key, "k1");
        assert!(cmd.noreply);

        let (_, cmd) = parse_command(b"delete k1\r\n").unwrap();
        assert!(!cmd.noreply);

        assert!(parse_command(b"delete k1 fast\r\n").is_err());
    }

    #[test]
    fn test_parse_incr() {
        let (_, cmd) = parse_command(b"incr k1 7 noreply\r\n").unwrap();
        assert_eq!(cmd.verb, Verb::Incr);
        assert_eq!(cmd.key, "k1");
        assert_eq!(cmd.delta, 7);
        assert!(cmd.noreply);
    }

    #[test]
    fn test_parse_touch() {
        let (_, cmd) = parse_command(b"touch k1 7 noreply\r\n").unwrap();
        assert_eq!(cmd.verb, Verb::Touch);
        assert_eq!(cmd.key, "k1");
        assert_eq!(cmd.exptime, 7);
        assert!(cmd.noreply);
    }

    #[test]
    fn test_parse_stats() {
        let (advance, cmd) = parse_command(b"stats\r\n").unwrap();
        assert_eq!(cmd.verb, Verb::Stats);
        assert_eq!(advance, 7);
        assert!(cmd.keys.is_empty());

        let (_, cmd) = parse_command(b"stats settings\r\n").unwrap();
        assert_eq!(cmd.keys, vec!["settings"]);
    }

    #[test]
    fn test_parse_unknown_verb_reports_advance() {
        let data = b"xxx k1 7 noreply\r\nxxx\r\n";
        let err = parse_command(data).unwrap_err();
        assert_eq!(
            err,
            ParseError::BadCommand {
                advance: b"xxx k1 7 noreply\r\n".len()
            }
        );
    }

    #[test]
    fn test_parse_incomplete_line() {
        assert_eq!(
            parse_command(b"set k1 1 2 3"),
            Err(ParseError::NeedMoreData)
        );
        assert_eq!(parse_command(b""), Err(ParseError::NeedMoreData));
    }

    #[test]
    fn test_parse_malformed_storage() {
        assert!(parse_command(b"set k1 1 2\r\n").is_err());
        assert!(parse_command(b"set k1 one 2 3\r\n").is_err());
        assert!(parse_command(b"get\r\n").is_err());
        assert!(parse_command(b"\r\n").is_err());
    }
}
