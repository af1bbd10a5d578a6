//! Logging helpers for keeping radio-originated text single-line in logs.
//! Mesh text payloads are user input and may contain control characters.

/// Escape a payload string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Long payloads are cut at `MAX_PREVIEW` chars with an ellipsis; a mesh
///   frame tops out around 230 bytes so the cap rarely triggers.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 240;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}
