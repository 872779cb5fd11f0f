//! Helpers that keep mesh-supplied text safe to log: one line, bounded length,
//! never split inside a UTF-8 sequence.

use std::fmt::Write;

const MAX_PREVIEW_CHARS: usize = 300;

/// Escape control characters so a log record stays on one line.
///
/// Newline, carriage return, tab and backslash get their usual escapes; other
/// control characters become `\xNN`. Output is capped at 300 characters.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW_CHARS) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW_CHARS {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Escape and cut to at most `max_bytes` of input, appending `...` when cut.
pub fn truncate_for_log(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

/// Hex preview of the first `max` bytes of a frame.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2 + 3);
    for b in data.iter().take(max) {
        let _ = write!(out, "{:02x}", b);
    }
    if data.len() > max {
        out.push_str("...");
    }
    out
}
