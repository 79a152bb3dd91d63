//! Canned protocol responses

use std::fmt::Display;

pub const ERROR: &[u8] = b"ERROR\r\n";
pub const STORED: &[u8] = b"STORED\r\n";
pub const NOT_STORED: &[u8] = b"NOT_STORED\r\n";
pub const EXISTS: &[u8] = b"EXISTS\r\n";
pub const NOT_FOUND: &[u8] = b"NOT_FOUND\r\n";
pub const DELETED: &[u8] = b"DELETED\r\n";
pub const END: &[u8] = b"END\r\n";
pub const TOUCHED: &[u8] = b"TOUCHED\r\n";

pub const EOL: &[u8] = b"\r\n";

/// A `CLIENT_ERROR` line: the client sent something broken
#[must_use]
pub fn client_error(err: impl Display) -> Vec<u8> {
    format!("CLIENT_ERROR {err}\r\n").into_bytes()
}

/// A `SERVER_ERROR` line: we could not carry out a valid request
#[must_use]
pub fn server_error(err: impl Display) -> Vec<u8> {
    format!("SERVER_ERROR {err}\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_lines() {
        assert_eq!(client_error("bad line"), b"CLIENT_ERROR bad line\r\n");
        assert_eq!(server_error("no space"), b"SERVER_ERROR no space\r\n");
    }
}
