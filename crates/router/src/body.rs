//! Command body unescaping with form/query semantics.

use percent_encoding::percent_decode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BodyError {
    #[error("empty command body")]
    Empty,
    #[error("invalid escape at byte {0}")]
    InvalidEscape(usize),
}

/// `+` becomes a space and `%XX` a byte; a `%` not followed by two hex digits is rejected.
pub fn unescape(raw: &[u8]) -> Result<Vec<u8>, BodyError> {
    if raw.is_empty() {
        return Err(BodyError::Empty);
    }
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            match raw.get(i + 1..i + 3) {
                Some([h, l]) if h.is_ascii_hexdigit() && l.is_ascii_hexdigit() => i += 3,
                _ => return Err(BodyError::InvalidEscape(i)),
            }
        } else {
            i += 1;
        }
    }
    let spaced: Vec<u8> = raw.iter().map(|&b| if b == b'+' { b' ' } else { b }).collect();
    Ok(percent_decode(&spaced).collect())
}
