//! NUL-terminated string encoding
//!
//! The stores keep string keys and values in their on-disk form with a
//! trailing NUL, so that fixed tooling and older agents agree on byte
//! layout. These helpers convert between that form and Rust strings.

/// Encode a string key or value with its trailing NUL
pub fn to_c_bytes(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}

/// Decode a NUL-terminated byte string.
///
/// Requires at least the terminator, valid UTF-8, and no interior NUL
/// bytes; returns `None` otherwise.
pub fn from_c_bytes(bytes: &[u8]) -> Option<&str> {
    let (last, body) = bytes.split_last()?;
    if *last != 0 || body.contains(&0) {
        return None;
    }
    std::str::from_utf8(body).ok()
}

/// Decode bytes that are usually NUL-terminated but may be a bare
/// single-byte flag (`"0"`/`"1"` values are stored without NUL).
pub fn from_loose_c_bytes(bytes: &[u8]) -> Option<&str> {
    match bytes.split_last() {
        Some((&0, body)) if !body.contains(&0) => std::str::from_utf8(body).ok(),
        _ if !bytes.contains(&0) => std::str::from_utf8(bytes).ok(),
        _ => None,
    }
}
