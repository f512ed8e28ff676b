//! Token encoding: the smallest unit of the XXMP tree format.
//!
//! # Token Format
//!
//! Every token starts with a marker byte that fully determines its shape:
//!
//! | Marker        | Token            | Body                                      |
//! |---------------|------------------|-------------------------------------------|
//! | `0x00..=0xEB` | `Literal`        | none, the marker is the primary index     |
//! | `0xEC..=0xEF` | `Secondary`      | 1 byte index within the page              |
//! | `0xFA`        | `Jid`            | user token, server token                  |
//! | `0xFB`        | `PackedHex`      | packed header byte, packed nibbles        |
//! | `0xFC`        | `LengthString8`  | 1 byte length, bytes                      |
//! | `0xFD`        | `LengthString20` | 3 byte length (20 bits), bytes            |
//! | `0xFE`        | `LengthString31` | 4 byte length (31 bits), bytes            |
//! | `0xFF`        | `PackedNibble`   | packed header byte, packed nibbles        |
//!
//! `0xF8` and `0xF9` introduce lists and are handled by [`crate::list`].

use bytes::{Buf, BufMut};

use crate::dictionary::{
    Dictionary, MAX_PRIMARY_ENTRIES, MAX_SECONDARY_ENTRIES, SECONDARY_PAGE_SIZE,
};
use crate::error::{Error, Result};

/// First secondary page marker.
pub const SECONDARY_FIRST: u8 = 0xEC;
/// Last secondary page marker.
pub const SECONDARY_LAST: u8 = 0xEF;
/// Short list marker (1 byte count).
pub const SHORT_LIST: u8 = 0xF8;
/// Long list marker (2 byte count).
pub const LONG_LIST: u8 = 0xF9;
/// JID pair marker.
pub const JID_PAIR: u8 = 0xFA;
/// Packed hex marker.
pub const PACKED_HEX: u8 = 0xFB;
/// 8-bit length string marker.
pub const LENGTH_STRING_8: u8 = 0xFC;
/// 20-bit length string marker.
pub const LENGTH_STRING_20: u8 = 0xFD;
/// 31-bit length string marker.
pub const LENGTH_STRING_31: u8 = 0xFE;
/// Packed nibble marker.
pub const PACKED_NIBBLE: u8 = 0xFF;

/// Capacity of [`Token::LengthString8`].
pub const MAX_LENGTH_8: usize = 0xFF;
/// Capacity of [`Token::LengthString20`].
pub const MAX_LENGTH_20: usize = 0x0F_FFFF;
/// Capacity of [`Token::LengthString31`].
pub const MAX_LENGTH_31: usize = 0x7FFF_FFFF;

/// Longest digit string a packed token can hold (127 bytes of two nibbles).
pub const MAX_PACKED_DIGITS: usize = 0x7F * 2;

/// Nesting limit for recursive decoding (JIDs and lists).
pub(crate) const MAX_DEPTH: usize = 128;

const NIBBLE_PAD: u8 = 0x0F;

/// A single wire token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Primary dictionary reference.
    Literal(u8),
    /// Secondary dictionary reference (extended index 0..1024).
    Secondary(u16),
    /// `user@server` identifier, each half tokenized on its own.
    Jid {
        /// Part before the first `@`.
        user: Box<Token>,
        /// Part after the first `@`.
        server: Box<Token>,
    },
    /// Raw bytes with a 1 byte length.
    LengthString8(Vec<u8>),
    /// Raw bytes with a 20-bit length.
    LengthString20(Vec<u8>),
    /// Raw bytes with a 31-bit length.
    LengthString31(Vec<u8>),
    /// Uppercase hex digits packed two per byte.
    PackedHex(String),
    /// Decimal digits, `-` and `.` packed two per byte.
    PackedNibble(String),
}

impl Token {
    /// Encodes a string, preferring the most compact representation.
    ///
    /// Dictionary hits win over JID splitting, which wins over the
    /// length-prefixed fallback.
    pub fn from_text(s: &str, dict: &Dictionary) -> Result<Token> {
        if s.is_empty() {
            return Ok(Token::Literal(0));
        }
        if let Some(index) = dict.primary_index(s) {
            return Ok(Token::Literal(index));
        }
        if let Some(index) = dict.secondary_index(s) {
            return Ok(Token::Secondary(index));
        }
        if let Some((user, server)) = s.split_once('@') {
            return Ok(Token::Jid {
                user: Box::new(Token::from_text(user, dict)?),
                server: Box::new(Token::from_text(server, dict)?),
            });
        }
        Token::from_bytes(s.as_bytes().to_vec())
    }

    /// Wraps raw bytes in the smallest length-prefixed variant that fits.
    pub fn from_bytes(data: Vec<u8>) -> Result<Token> {
        match data.len() {
            len if len <= MAX_LENGTH_8 => Ok(Token::LengthString8(data)),
            len if len <= MAX_LENGTH_20 => Ok(Token::LengthString20(data)),
            len if len <= MAX_LENGTH_31 => Ok(Token::LengthString31(data)),
            len => Err(Error::StringTooLong {
                size: len,
                max: MAX_LENGTH_31,
            }),
        }
    }

    /// Builds a packed nibble token, validating the charset.
    pub fn packed_nibble(digits: impl Into<String>) -> Result<Token> {
        let digits = digits.into();
        pack(&digits, nibble_value)?;
        Ok(Token::PackedNibble(digits))
    }

    /// Builds a packed hex token, validating the charset.
    pub fn packed_hex(digits: impl Into<String>) -> Result<Token> {
        let digits = digits.into();
        pack(&digits, hex_value)?;
        Ok(Token::PackedHex(digits))
    }

    /// Returns the marker byte this token is written with.
    pub fn marker(&self) -> u8 {
        match self {
            Token::Literal(index) => *index,
            Token::Secondary(index) => {
                SECONDARY_FIRST.wrapping_add((*index as usize / SECONDARY_PAGE_SIZE) as u8)
            }
            Token::Jid { .. } => JID_PAIR,
            Token::LengthString8(_) => LENGTH_STRING_8,
            Token::LengthString20(_) => LENGTH_STRING_20,
            Token::LengthString31(_) => LENGTH_STRING_31,
            Token::PackedHex(_) => PACKED_HEX,
            Token::PackedNibble(_) => PACKED_NIBBLE,
        }
    }

    /// Writes the token to a buffer.
    pub fn write<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Token::Literal(index) => {
                if *index as usize >= MAX_PRIMARY_ENTRIES {
                    return Err(Error::UnknownToken {
                        table: "primary",
                        index: *index as u16,
                    });
                }
                buf.put_u8(*index);
            }
            Token::Secondary(index) => {
                if *index as usize >= MAX_SECONDARY_ENTRIES {
                    return Err(Error::UnknownToken {
                        table: "secondary",
                        index: *index,
                    });
                }
                buf.put_u8(self.marker());
                buf.put_u8((*index as usize % SECONDARY_PAGE_SIZE) as u8);
            }
            Token::Jid { user, server } => {
                buf.put_u8(JID_PAIR);
                user.write(buf)?;
                server.write(buf)?;
            }
            Token::LengthString8(data) => {
                check_capacity(data.len(), MAX_LENGTH_8)?;
                buf.put_u8(LENGTH_STRING_8);
                buf.put_u8(data.len() as u8);
                buf.put_slice(data);
            }
            Token::LengthString20(data) => {
                check_capacity(data.len(), MAX_LENGTH_20)?;
                let len = data.len() as u32;
                buf.put_u8(LENGTH_STRING_20);
                buf.put_u8(((len >> 16) & 0x0F) as u8);
                buf.put_u8((len >> 8) as u8);
                buf.put_u8(len as u8);
                buf.put_slice(data);
            }
            Token::LengthString31(data) => {
                check_capacity(data.len(), MAX_LENGTH_31)?;
                buf.put_u8(LENGTH_STRING_31);
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
            Token::PackedHex(digits) => {
                let packed = pack(digits, hex_value)?;
                buf.put_u8(PACKED_HEX);
                buf.put_slice(&packed);
            }
            Token::PackedNibble(digits) => {
                let packed = pack(digits, nibble_value)?;
                buf.put_u8(PACKED_NIBBLE);
                buf.put_slice(&packed);
            }
        }
        Ok(())
    }

    /// Reads one token, marker included.
    pub fn read<B: Buf>(buf: &mut B) -> Result<Token> {
        let marker = take_u8(buf)?;
        Token::read_body(marker, buf, 0)
    }

    /// Reads the body of a token whose marker has already been consumed.
    pub(crate) fn read_body<B: Buf>(marker: u8, buf: &mut B, depth: usize) -> Result<Token> {
        if depth > MAX_DEPTH {
            return Err(Error::MalformedNode("token nesting too deep".to_string()));
        }
        match marker {
            SECONDARY_FIRST..=SECONDARY_LAST => {
                let page = (marker - SECONDARY_FIRST) as u16;
                let index = take_u8(buf)? as u16;
                Ok(Token::Secondary(page * SECONDARY_PAGE_SIZE as u16 + index))
            }
            JID_PAIR => {
                let user_marker = take_u8(buf)?;
                let user = Token::read_body(user_marker, buf, depth + 1)?;
                let server_marker = take_u8(buf)?;
                let server = Token::read_body(server_marker, buf, depth + 1)?;
                Ok(Token::Jid {
                    user: Box::new(user),
                    server: Box::new(server),
                })
            }
            LENGTH_STRING_8 => {
                let len = take_u8(buf)? as usize;
                Ok(Token::LengthString8(take_bytes(buf, len)?))
            }
            LENGTH_STRING_20 => {
                ensure(buf, 3)?;
                let len = (((buf.get_u8() & 0x0F) as usize) << 16)
                    | ((buf.get_u8() as usize) << 8)
                    | buf.get_u8() as usize;
                Ok(Token::LengthString20(take_bytes(buf, len)?))
            }
            LENGTH_STRING_31 => {
                ensure(buf, 4)?;
                let len = (buf.get_u32() & 0x7FFF_FFFF) as usize;
                Ok(Token::LengthString31(take_bytes(buf, len)?))
            }
            PACKED_HEX => Ok(Token::PackedHex(unpack(buf, hex_char)?)),
            PACKED_NIBBLE => Ok(Token::PackedNibble(unpack(buf, nibble_char)?)),
            index if (index as usize) < MAX_PRIMARY_ENTRIES => Ok(Token::Literal(index)),
            other => Err(Error::UnknownMarker(other)),
        }
    }

    /// Resolves the token to its text form.
    pub fn resolve(&self, dict: &Dictionary) -> Result<String> {
        match self {
            Token::Literal(index) => dict.primary(*index).map(str::to_string),
            Token::Secondary(index) => dict.secondary(*index).map(str::to_string),
            Token::Jid { user, server } => Ok(format!(
                "{}@{}",
                user.resolve(dict)?,
                server.resolve(dict)?
            )),
            Token::LengthString8(data)
            | Token::LengthString20(data)
            | Token::LengthString31(data) => {
                String::from_utf8(data.clone()).map_err(|_| Error::InvalidUtf8)
            }
            Token::PackedHex(digits) | Token::PackedNibble(digits) => Ok(digits.clone()),
        }
    }

    /// Converts the token to raw bytes, as used for node data.
    pub fn into_bytes(self, dict: &Dictionary) -> Result<Vec<u8>> {
        match self {
            Token::LengthString8(data)
            | Token::LengthString20(data)
            | Token::LengthString31(data) => Ok(data),
            other => other.resolve(dict).map(String::into_bytes),
        }
    }
}

fn check_capacity(len: usize, max: usize) -> Result<()> {
    if len > max {
        return Err(Error::StringTooLong { size: len, max });
    }
    Ok(())
}

pub(crate) fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn take_u8<B: Buf>(buf: &mut B) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_bytes<B: Buf>(buf: &mut B, len: usize) -> Result<Vec<u8>> {
    ensure(buf, len)?;
    let mut data = vec![0u8; len];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

fn nibble_value(c: char) -> Option<u8> {
    match c {
        '0'..='9' => Some(c as u8 - b'0'),
        '-' => Some(10),
        '.' => Some(11),
        '\0' => Some(NIBBLE_PAD),
        _ => None,
    }
}

fn hex_value(c: char) -> Option<u8> {
    match c {
        '0'..='9' => Some(c as u8 - b'0'),
        'A'..='F' => Some(c as u8 - b'A' + 10),
        _ => None,
    }
}

fn nibble_char(value: u8) -> Result<char> {
    match value {
        0..=9 => Ok((b'0' + value) as char),
        10 => Ok('-'),
        11 => Ok('.'),
        NIBBLE_PAD => Ok('\0'),
        other => Err(Error::InvalidNibble(other)),
    }
}

fn hex_char(value: u8) -> Result<char> {
    match value {
        0..=9 => Ok((b'0' + value) as char),
        10..=15 => Ok((b'A' + value - 10) as char),
        other => Err(Error::InvalidNibble(other)),
    }
}

/// Packs digits two per byte behind a header byte holding the byte count,
/// with the high bit set when the digit count is odd.
fn pack(digits: &str, value: fn(char) -> Option<u8>) -> Result<Vec<u8>> {
    let nibbles = digits
        .chars()
        .map(|c| {
            value(c).ok_or_else(|| {
                Error::InvalidPackedString(format!("character {:?} cannot be packed", c))
            })
        })
        .collect::<Result<Vec<u8>>>()?;
    if nibbles.len() > MAX_PACKED_DIGITS {
        return Err(Error::InvalidPackedString(format!(
            "{} digits exceeds maximum of {}",
            nibbles.len(),
            MAX_PACKED_DIGITS
        )));
    }

    let odd = nibbles.len() % 2 == 1;
    let byte_count = nibbles.len().div_ceil(2);
    let mut out = Vec::with_capacity(byte_count + 1);
    out.push(byte_count as u8 | if odd { 0x80 } else { 0 });
    for pair in nibbles.chunks(2) {
        let low = pair.get(1).copied().unwrap_or(NIBBLE_PAD);
        out.push((pair[0] << 4) | low);
    }
    Ok(out)
}

fn unpack<B: Buf>(buf: &mut B, to_char: fn(u8) -> Result<char>) -> Result<String> {
    let header = take_u8(buf)?;
    let odd = header & 0x80 != 0;
    let byte_count = (header & 0x7F) as usize;
    if odd && byte_count == 0 {
        return Err(Error::InvalidPackedString(
            "odd flag set on empty packed string".to_string(),
        ));
    }
    ensure(buf, byte_count)?;

    let mut out = String::with_capacity(byte_count * 2);
    for _ in 0..byte_count {
        let byte = buf.get_u8();
        out.push(to_char(byte >> 4)?);
        out.push(to_char(byte & 0x0F)?);
    }
    if odd {
        out.pop();
    }
    Ok(out)
}
