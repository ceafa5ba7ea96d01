//! Parse and dispatch records of the GDB machine interface (MI).
//!
//! The crate is split the way data flows through it: [`parser`] turns one
//! line of MI text into a [`Record`] built from [`raw`] values, [`tracker`]
//! correlates result records with the commands that asked for them,
//! [`session`] owns the read side of a connection and routes every line, and
//! [`interaction`] reads numbered-choice menus out of console output.

pub mod error;
pub mod interaction;
pub mod parser;
pub mod raw;
pub mod session;
pub mod tracker;

pub use error::{Error, ParseHexError};
pub use interaction::InteractionMenu;
pub use parser::{parse_record, Record, RecordKind};
pub use session::{Session, SessionConfig, SessionEvent};
pub use tracker::{FinishedCmd, MiCommand, OutputSource, ResultClass, Tracker};

use serde::Serialize;

/// Number prefixed to a command and echoed on its result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Token(pub u64);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Token {
    fn from(token: u64) -> Self {
        Self(token)
    }
}
