use std::num::ParseIntError;

use displaydoc::Display;
use thiserror::Error;

#[derive(Debug, Display, Error)]
pub enum Error {
    /// The transport to the debugger is closed
    Disconnected,
    /// The command was dropped before its result arrived
    Abandoned,
    /// Expected a different payload shape
    ExpectedDifferentPayload,
    /// Expected key `{0}` in the payload
    ExpectedKey(String),
    /// Failed to parse an integer: {0}
    ParseInt(#[from] ParseIntError),
    /// Failed to parse a hex value: {0}
    ParseHex(#[from] ParseHexError),
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ParseHexError {
    /// Expected a `0x` prefix
    InvalidPrefix,
    /// Invalid hex digits: {0}
    InvalidDigits(#[from] ParseIntError),
}
