//! Strict percent-decoding for request targets.
//!
//! Unlike lenient decoders, a `%` that is not followed by two hex digits is an
//! error rather than passed through. Decoded output is an owned byte vector
//! since escapes may produce NUL or non-UTF-8 bytes.

use crate::error::ParseError;

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Decodes every `%XY` escape in `input`.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.iter().copied();

    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            out.push(byte);
            continue;
        }
        let high = bytes.next().and_then(hex_value).ok_or(ParseError::PercentEscape)?;
        let low = bytes.next().and_then(hex_value).ok_or(ParseError::PercentEscape)?;
        out.push(high << 4 | low);
    }

    Ok(out)
}

/// Encodes everything outside the RFC 3986 unreserved set (plus `/`).
pub fn encode(input: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(input.len());
    for &byte in input {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 0x0f) as usize] as char);
            }
        }
    }
    out
}

/// Like [`encode`], but also escapes `/`. Used for query keys and values.
pub fn encode_component(input: &[u8]) -> String {
    encode(input).replace('/', "%2F")
}
