//! Reply definitions
//!
//! Represents replies to clients.

use crate::error::EmberError;

/// A reply to send to the client
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `OK`
    Ok,

    /// A short status line (e.g. `PONG`)
    Status(String),

    /// Binary-safe payload
    Bulk(Vec<u8>),

    /// Absent value
    Nil,

    Integer(i64),

    Array(Vec<Reply>),

    /// Error line: `<CODE> <message>`
    Error { code: &'static str, message: String },
}

impl Reply {
    /// Create a bulk reply from text
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Bulk(text.into().into_bytes())
    }

    /// Create an integer reply from a count
    pub fn count(n: usize) -> Self {
        Reply::Integer(i64::try_from(n).unwrap_or(i64::MAX))
    }

    /// Create an `ERR` reply
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            code: "ERR",
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error { .. })
    }
}

impl From<&EmberError> for Reply {
    fn from(e: &EmberError) -> Self {
        let code = match e {
            EmberError::Loading => "LOADING",
            EmberError::WrongType => "WRONGTYPE",
            EmberError::Busy => "BUSY",
            _ => "ERR",
        };
        Reply::Error {
            code,
            message: e.to_string(),
        }
    }
}
