//! Transcoding of DAB label bytes into `String` values.
//!
//! FIG labels are 16 bytes of ISO 8859-1 (charset 0, _EBU Latin_ treated as Latin-1 here),
//! padded to the right with spaces.

/// Converts ISO 8859-1 (Latin-1) bytes to UTF-8.
///
/// Total for all byte values: `b < 0x80` passes through, `b >= 0x80` becomes the two-byte
/// sequence `0xC0|(b>>6), 0x80|(b&0x3F)`.  Conversion stops at the first NUL byte.
pub fn latin1_to_utf8(src: &[u8]) -> String {
    let mut result = String::with_capacity(src.len() * 2);
    for &c in src {
        if c == 0 {
            break;
        }
        // char::from(u8) gives the Latin-1 interpretation of the byte
        result.push(char::from(c));
    }
    result
}

/// Extracts a DAB label from a 16-byte field: trailing spaces and NULs are trimmed, the
/// remainder transcoded from ISO 8859-1 to UTF-8.
pub fn label(field: &[u8]) -> String {
    let end = field
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    latin1_to_utf8(&field[..end])
}
