//! Newline escaping for line-framed records.
//!
//! A record is stored as `escape(payload) + '\n'`. Escaping replaces the three bytes that could
//! confuse a line reader with two-byte sequences:
//!
//! ```text
//! 0x1B (ESC) -> 0x1B 0x01
//! 0x0A (LF)  -> 0x1B 0x02
//! 0x0D (CR)  -> 0x1B 0x03
//! ```

use crate::error::{Result, StoreError};

/// Escape byte.
pub const ESCAPE_CHAR: u8 = 0x1B;

/// Record delimiter.
pub const NEWLINE_CHAR: u8 = 0x0A;

/// Carriage return.
pub const CARRIAGE_RETURN_CHAR: u8 = 0x0D;

const ESCAPE_ESCAPE_CHAR: u8 = 0x01;
const NEWLINE_ESCAPE_CHAR: u8 = 0x02;
const CARRIAGE_RETURN_ESCAPE_CHAR: u8 = 0x03;

/// Escapes `input` so that it contains no newline or carriage return bytes.
pub fn escape(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 16 + 1);
    escape_into(input, &mut out);
    out
}

/// Appends the escaped form of `input` to `out`.
pub fn escape_into(input: &[u8], out: &mut Vec<u8>) {
    for &b in input {
        match b {
            ESCAPE_CHAR => out.extend_from_slice(&[ESCAPE_CHAR, ESCAPE_ESCAPE_CHAR]),
            NEWLINE_CHAR => out.extend_from_slice(&[ESCAPE_CHAR, NEWLINE_ESCAPE_CHAR]),
            CARRIAGE_RETURN_CHAR => {
                out.extend_from_slice(&[ESCAPE_CHAR, CARRIAGE_RETURN_ESCAPE_CHAR])
            }
            _ => out.push(b),
        }
    }
}

/// Reverses [`escape`].
///
/// # Errors
///
/// Returns a decode error for an unknown escape sequence or a dangling escape byte.
pub fn unescape(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.iter();
    while let Some(&b) = bytes.next() {
        if b != ESCAPE_CHAR {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(&ESCAPE_ESCAPE_CHAR) => out.push(ESCAPE_CHAR),
            Some(&NEWLINE_ESCAPE_CHAR) => out.push(NEWLINE_CHAR),
            Some(&CARRIAGE_RETURN_ESCAPE_CHAR) => out.push(CARRIAGE_RETURN_CHAR),
            Some(other) => {
                return Err(StoreError::decode(
                    input.len(),
                    format!("unknown escape sequence 0x1b 0x{:02x}", other),
                ))
            }
            None => {
                return Err(StoreError::decode(
                    input.len(),
                    "dangling escape byte at end of line",
                ))
            }
        }
    }
    Ok(out)
}
