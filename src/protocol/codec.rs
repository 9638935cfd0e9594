//! Protocol codec
//!
//! Tokenizes command lines and renders replies for the console.
//!
//! ## Line Format
//! ```text
//! SET "my key" 'a value' plain\x41
//! └┬┘ └──┬───┘ └───┬───┘ └───┬────┘
//! cmd  double    single    bare word
//! ```
//!
//! Double-quoted arguments understand `\n`, `\r`, `\t`, `\\`, `\"` and
//! `\xHH`; single-quoted arguments only `\'`. Arguments are separated by
//! ASCII whitespace.

use crate::error::{EmberError, Result};

use super::Reply;

// =============================================================================
// Tokenizing
// =============================================================================

/// Split a command line into arguments
///
/// Arguments are raw bytes: a `\xHH` escape produces the byte `HH`, so
/// values outside UTF-8 survive tokenizing unchanged.
pub fn split_args(line: &str) -> Result<Vec<Vec<u8>>> {
    let mut args = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().map_or(false, |c| c.is_ascii_whitespace()) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            return Ok(args);
        };

        let mut arg = Vec::new();
        match first {
            '"' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => unescape(&mut chars, &mut arg)?,
                        Some(c) => push_char(&mut arg, c),
                        None => return Err(unbalanced()),
                    }
                }
                closing_quote_ends_arg(chars.peek())?;
            }
            '\'' => {
                chars.next();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some('\\') if chars.peek() == Some(&'\'') => {
                            chars.next();
                            arg.push(b'\'');
                        }
                        Some(c) => push_char(&mut arg, c),
                        None => return Err(unbalanced()),
                    }
                }
                closing_quote_ends_arg(chars.peek())?;
            }
            _ => {
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_whitespace() {
                        break;
                    }
                    push_char(&mut arg, c);
                    chars.next();
                }
            }
        }
        args.push(arg);
    }
}

fn push_char(arg: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    arg.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

fn unescape(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, arg: &mut Vec<u8>) -> Result<()> {
    match chars.next() {
        Some('n') => arg.push(b'\n'),
        Some('r') => arg.push(b'\r'),
        Some('t') => arg.push(b'\t'),
        Some('x') => {
            let hex: String = chars.by_ref().take(2).collect();
            let byte = u8::from_str_radix(&hex, 16)
                .map_err(|_| EmberError::Protocol(format!("invalid escape \\x{}", hex)))?;
            arg.push(byte);
        }
        Some(c) => push_char(arg, c),
        None => return Err(unbalanced()),
    }
    Ok(())
}

fn closing_quote_ends_arg(next: Option<&char>) -> Result<()> {
    match next {
        Some(c) if !c.is_ascii_whitespace() => Err(EmberError::Protocol(
            "closing quote must be followed by a space".to_string(),
        )),
        _ => Ok(()),
    }
}

fn unbalanced() -> EmberError {
    EmberError::Protocol("unbalanced quotes in request".to_string())
}

// =============================================================================
// Rendering
// =============================================================================

/// Render a reply the way an interactive client shows it
pub fn render_reply(reply: &Reply) -> String {
    let mut out = String::new();
    render_into(reply, 0, &mut out);
    out
}

fn render_into(reply: &Reply, indent: usize, out: &mut String) {
    match reply {
        Reply::Ok => out.push_str("OK"),
        Reply::Status(status) => out.push_str(status),
        Reply::Bulk(bytes) => {
            out.push('"');
            out.push_str(&String::from_utf8_lossy(bytes).escape_debug().to_string());
            out.push('"');
        }
        Reply::Nil => out.push_str("(nil)"),
        Reply::Integer(n) => out.push_str(&format!("(integer) {}", n)),
        Reply::Array(items) if items.is_empty() => out.push_str("(empty array)"),
        Reply::Array(items) => {
            let width = items.len().to_string().len();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                    out.push_str(&" ".repeat(indent));
                }
                let label = format!("{:>width$}) ", i + 1, width = width);
                out.push_str(&label);
                render_into(item, indent + label.len(), out);
            }
        }
        Reply::Error { code, message } => {
            out.push_str(&format!("(error) {} {}", code, message));
        }
    }
}
