//! Plain (non-reversed) hex used by the worker protocol and control surface.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexDecodeError {
    OddLength,
    InvalidChar(usize),
}

impl fmt::Display for HexDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexDecodeError::OddLength => write!(f, "hex string has odd length"),
            HexDecodeError::InvalidChar(pos) => write!(f, "invalid hex character at {pos}"),
        }
    }
}

impl std::error::Error for HexDecodeError {}

pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

pub fn from_hex(input: &str) -> Result<Vec<u8>, HexDecodeError> {
    let raw = input.trim().as_bytes();
    if raw.len() % 2 != 0 {
        return Err(HexDecodeError::OddLength);
    }
    raw.chunks(2)
        .enumerate()
        .map(|(i, pair)| {
            let hi = nibble(pair[0]).ok_or(HexDecodeError::InvalidChar(i * 2))?;
            let lo = nibble(pair[1]).ok_or(HexDecodeError::InvalidChar(i * 2 + 1))?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
