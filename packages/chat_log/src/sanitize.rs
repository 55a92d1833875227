//! Input cleanup: turn whatever a terminal sent into one printable line.

use std::iter::Peekable;
use std::str::Chars;

use crate::error::LogError;

/// Strip escape sequences and control characters from a raw input line.
///
/// Tabs become single spaces, surrounding whitespace is trimmed and the
/// result is cut to at most `max_bytes` on a char boundary. A line with
/// nothing printable left is rejected rather than appended.
pub fn sanitize_line(raw: &str, max_bytes: usize) -> Result<String, LogError> {
    let raw = raw.strip_suffix('\n').unwrap_or(raw);
    let raw = raw.strip_suffix('\r').unwrap_or(raw);

    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\x1b' => skip_escape(&mut chars),
            '\t' => out.push(' '),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    let line = truncate(out.trim(), max_bytes).trim_end();
    if line.is_empty() {
        return Err(LogError::MalformedInput("nothing printable"));
    }
    Ok(line.to_string())
}

/// Consume the remainder of an escape sequence whose ESC was already read.
fn skip_escape(chars: &mut Peekable<Chars<'_>>) {
    match chars.next() {
        // CSI: parameters then a final byte in 0x40..=0x7e
        Some('[') => {
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
        // OSC: terminated by BEL or ST (ESC \)
        Some(']') => {
            while let Some(c) = chars.next() {
                if c == '\x07' {
                    break;
                }
                if c == '\x1b' {
                    if chars.peek() == Some(&'\\') {
                        chars.next();
                    }
                    break;
                }
            }
        }
        _ => {}
    }
}

fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
