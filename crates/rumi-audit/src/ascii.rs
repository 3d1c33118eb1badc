// SPDX-License-Identifier: MIT OR Apache-2.0
//! ASCII-only JSON serialization.

use serde_json::Value;

/// Serialize a JSON value to a single line of pure printable ASCII.
///
/// `serde_json` already escapes control characters inside strings; what
/// remains raw in its output is exactly the non-ASCII range, which is
/// rewritten here as `\uXXXX` (surrogate pairs beyond the BMP). The result
/// parses back to the identical value and can never contain a raw newline,
/// `U+2028`, `U+2029`, or an ANSI escape byte.
pub fn ascii_json_line(value: &Value) -> String {
    let compact = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    let mut out = String::with_capacity(compact.len());
    for ch in compact.chars() {
        if (' '..='~').contains(&ch) {
            out.push(ch);
        } else {
            let code = ch as u32;
            if code <= 0xFFFF {
                out.push_str(&format!("\\u{code:04x}"));
            } else {
                let reduced = code - 0x10000;
                let high = 0xD800 + (reduced >> 10);
                let low = 0xDC00 + (reduced & 0x3FF);
                out.push_str(&format!("\\u{high:04x}\\u{low:04x}"));
            }
        }
    }
    out
}
