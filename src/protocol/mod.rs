//! Protocol Module
//!
//! The command surface: text commands in, typed replies out.
//!
//! ## Request Format
//! ```text
//! ┌──────────┬──────────┬──────────┬─────
//! │ COMMAND  │  arg 1   │  arg 2   │ ...
//! └──────────┴──────────┴──────────┴─────
//!   whitespace-separated, quotes group
//! ```
//!
//! `split_args` tokenizes a line, `Command::parse` turns the tokens into a
//! tagged `Command`, and the engine answers with a `Reply`.
//!
//! ### Error Codes
//! - `ERR`: generic failure
//! - `LOADING`: a snapshot load is in progress
//! - `WRONGTYPE`: operation against the wrong kind of value
//! - `BUSY`: another save is running

mod codec;
mod command;
mod response;

pub use codec::{render_reply, split_args};
pub use command::{
    Command, ConfigParam, InfoSection, DEFAULT_POPULATE_PREFIX, DEFAULT_POPULATE_SIZE,
};
pub use response::Reply;
