//! Memcache text protocol
//!
//! Parses the command-line half of the protocol (the `\r\n`-terminated first
//! line; payload framing is the server's job) and provides the canned
//! response lines. Follows the memcached protocol document:
//! <https://github.com/memcached/memcached/blob/master/doc/protocol.txt>

pub mod command;
pub mod response;

pub use command::{parse_command, Command, ParseError, Verb};
pub use response::{client_error, server_error};
