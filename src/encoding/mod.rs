//! BACnet Encoding and Decoding
//!
//! This module implements the BACnet tag-length-value wire format of
//! ASHRAE 135 Clause 20.2: the universal tag header and the thirteen
//! primitive application types, together with the context-specific tag
//! helpers used by constructed types.
//!
//! # Overview
//!
//! Every encoded BACnet value starts with a tag header carrying:
//!
//! - **Tag number**: the application type (0..12) or a context-specific
//!   number assigned by the enclosing production (0..254)
//! - **Class**: application or context
//! - **Length/value/type**: the content length, or for constructed data
//!   the opening (6) and closing (7) markers
//!
//! # Application Tags
//!
//! | Tag | Type |
//! |-----|------|
//! | 0 | Null |
//! | 1 | Boolean |
//! | 2 | Unsigned Integer |
//! | 3 | Signed Integer |
//! | 4 | Real (IEEE-754 single) |
//! | 5 | Double (IEEE-754 double) |
//! | 6 | Octet String |
//! | 7 | Character String |
//! | 8 | Bit String |
//! | 9 | Enumerated |
//! | 10 | Date |
//! | 11 | Time |
//! | 12 | Object Identifier |
//!
//! All integer payloads use the minimum-length canonical form. Decoders
//! take `(data, offset)` and return `(value, new_offset)` so callers can
//! walk a buffer without slicing.
//!
//! # Examples
//!
//! ```rust
//! use bacnet_core::encoding::{encode_application_unsigned, decode_application_unsigned};
//!
//! let mut buffer = Vec::new();
//! encode_application_unsigned(&mut buffer, 42).unwrap();
//! assert_eq!(buffer, vec![0x21, 0x2A]);
//!
//! let (value, offset) = decode_application_unsigned(&buffer, 0).unwrap();
//! assert_eq!(value, 42);
//! assert_eq!(offset, 2);
//! ```

use std::error::Error;
use std::fmt;

pub mod constructed;

/// Result type for encoding operations
pub type Result<T> = std::result::Result<T, EncodingError>;

/// Errors that can occur during encoding/decoding operations
#[derive(Debug, Clone, PartialEq)]
pub enum EncodingError {
    /// Decoder ran past the end of the buffer; payload is the cursor position
    UnexpectedEnd(usize),
    /// Malformed or unexpected tag header at the given position
    InvalidTag(usize),
    /// Length field inconsistent with the content at the given position
    InvalidLength(usize),
    /// Value cannot be represented on the wire
    ValueOutOfRange(&'static str),
    /// Content bytes are structurally invalid
    InvalidFormat(String),
    /// Character string charset not supported for encoding
    UnsupportedCharacterSet(u8),
    /// A context-tagged value carried a different tag number than required
    TagMismatch { expected: u8, found: u8 },
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingError::UnexpectedEnd(pos) => {
                write!(f, "Unexpected end of data at offset {}", pos)
            }
            EncodingError::InvalidTag(pos) => write!(f, "Invalid tag at offset {}", pos),
            EncodingError::InvalidLength(pos) => write!(f, "Invalid length at offset {}", pos),
            EncodingError::ValueOutOfRange(what) => write!(f, "Value out of range: {}", what),
            EncodingError::InvalidFormat(msg) => write!(f, "Invalid format: {}", msg),
            EncodingError::UnsupportedCharacterSet(code) => {
                write!(f, "Unsupported character set {} for encoding", code)
            }
            EncodingError::TagMismatch { expected, found } => {
                write!(f, "Expected context tag {}, found {}", expected, found)
            }
        }
    }
}

impl Error for EncodingError {}

/// BACnet application tag numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApplicationTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectIdentifier = 12,
}

impl TryFrom<u8> for ApplicationTag {
    type Error = EncodingError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ApplicationTag::Null),
            1 => Ok(ApplicationTag::Boolean),
            2 => Ok(ApplicationTag::UnsignedInt),
            3 => Ok(ApplicationTag::SignedInt),
            4 => Ok(ApplicationTag::Real),
            5 => Ok(ApplicationTag::Double),
            6 => Ok(ApplicationTag::OctetString),
            7 => Ok(ApplicationTag::CharacterString),
            8 => Ok(ApplicationTag::BitString),
            9 => Ok(ApplicationTag::Enumerated),
            10 => Ok(ApplicationTag::Date),
            11 => Ok(ApplicationTag::Time),
            12 => Ok(ApplicationTag::ObjectIdentifier),
            _ => Err(EncodingError::InvalidTag(0)),
        }
    }
}

/// Tag class: application-wide type or context-specific number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    Application,
    Context,
}

/// A decoded BACnet tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    /// Tag number (application type or context number, 0..254)
    pub number: u8,
    /// Application or context class
    pub class: TagClass,
    /// Content length in bytes (for Boolean the value itself)
    pub length: u32,
    /// Opening tag of a constructed value
    pub is_opening: bool,
    /// Closing tag of a constructed value
    pub is_closing: bool,
}

impl Tag {
    /// Application tag with a content length
    pub fn application(tag: ApplicationTag, length: u32) -> Self {
        Self {
            number: tag as u8,
            class: TagClass::Application,
            length,
            is_opening: false,
            is_closing: false,
        }
    }

    /// Context tag with a content length
    pub fn context(number: u8, length: u32) -> Self {
        Self {
            number,
            class: TagClass::Context,
            length,
            is_opening: false,
            is_closing: false,
        }
    }

    /// Opening tag of a constructed context value
    pub fn opening(number: u8) -> Self {
        Self {
            number,
            class: TagClass::Context,
            length: 0,
            is_opening: true,
            is_closing: false,
        }
    }

    /// Closing tag of a constructed context value
    pub fn closing(number: u8) -> Self {
        Self {
            number,
            class: TagClass::Context,
            length: 0,
            is_opening: false,
            is_closing: true,
        }
    }

    /// The application type, if this is an application-class tag
    pub fn application_tag(&self) -> Result<ApplicationTag> {
        match self.class {
            TagClass::Application => ApplicationTag::try_from(self.number),
            TagClass::Context => Err(EncodingError::InvalidTag(0)),
        }
    }

    pub fn is_context(&self) -> bool {
        self.class == TagClass::Context
    }
}

/// Encode a BACnet tag header
pub fn encode_tag(buffer: &mut Vec<u8>, tag: &Tag) -> Result<()> {
    if tag.number == 255 {
        return Err(EncodingError::ValueOutOfRange("tag number"));
    }

    let class_bit = match tag.class {
        TagClass::Application => 0x00,
        TagClass::Context => 0x08,
    };
    // Opening/closing markers always travel in context class.
    let lvt: u8 = if tag.is_opening {
        6
    } else if tag.is_closing {
        7
    } else if tag.length <= 4 {
        tag.length as u8
    } else {
        5
    };

    let number_nibble = if tag.number <= 14 { tag.number } else { 0x0F };
    buffer.push((number_nibble << 4) | class_bit | lvt);
    if tag.number > 14 {
        buffer.push(tag.number);
    }

    if lvt == 5 {
        if tag.length <= 253 {
            buffer.push(tag.length as u8);
        } else if tag.length <= 65535 {
            buffer.push(254);
            buffer.extend_from_slice(&(tag.length as u16).to_be_bytes());
        } else {
            buffer.push(255);
            buffer.extend_from_slice(&tag.length.to_be_bytes());
        }
    }

    Ok(())
}

/// Decode a BACnet tag header at `offset`, returning the tag and the
/// offset of the first content byte.
pub fn decode_tag(data: &[u8], offset: usize) -> Result<(Tag, usize)> {
    if offset >= data.len() {
        return Err(EncodingError::UnexpectedEnd(offset));
    }

    let initial = data[offset];
    let mut pos = offset + 1;

    let class = if initial & 0x08 != 0 {
        TagClass::Context
    } else {
        TagClass::Application
    };

    let mut number = initial >> 4;
    if number == 0x0F {
        if pos >= data.len() {
            return Err(EncodingError::UnexpectedEnd(pos));
        }
        number = data[pos];
        if number == 255 {
            return Err(EncodingError::InvalidTag(pos));
        }
        pos += 1;
    }

    let lvt = initial & 0x07;
    let (length, is_opening, is_closing) = match lvt {
        6 => (0, true, false),
        7 => (0, false, true),
        5 => {
            if pos >= data.len() {
                return Err(EncodingError::UnexpectedEnd(pos));
            }
            let first = data[pos];
            pos += 1;
            match first {
                254 => {
                    if pos + 2 > data.len() {
                        return Err(EncodingError::UnexpectedEnd(pos));
                    }
                    let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as u32;
                    pos += 2;
                    (len, false, false)
                }
                255 => {
                    if pos + 4 > data.len() {
                        return Err(EncodingError::UnexpectedEnd(pos));
                    }
                    let len =
                        u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
                    pos += 4;
                    (len, false, false)
                }
                n => (n as u32, false, false),
            }
        }
        n => (n as u32, false, false),
    };

    Ok((
        Tag {
            number,
            class,
            length,
            is_opening,
            is_closing,
        },
        pos,
    ))
}

/// Decode the tag header at `offset` without consuming it.
pub fn peek_tag(data: &[u8], offset: usize) -> Result<Tag> {
    decode_tag(data, offset).map(|(tag, _)| tag)
}

fn ensure_content(data: &[u8], offset: usize, length: usize) -> Result<()> {
    if offset + length > data.len() {
        Err(EncodingError::UnexpectedEnd(offset))
    } else {
        Ok(())
    }
}

fn expect_application(tag: &Tag, expected: ApplicationTag, offset: usize) -> Result<()> {
    if tag.class != TagClass::Application || tag.number != expected as u8 || tag.is_opening
        || tag.is_closing
    {
        return Err(EncodingError::InvalidTag(offset));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Integer content helpers (shared by application and context forms)
// ---------------------------------------------------------------------------

/// Minimum-length big-endian content bytes of an unsigned value
pub fn unsigned_content(value: u32) -> Vec<u8> {
    if value <= 0xFF {
        vec![value as u8]
    } else if value <= 0xFFFF {
        (value as u16).to_be_bytes().to_vec()
    } else if value <= 0xFF_FFFF {
        value.to_be_bytes()[1..].to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

/// Minimum-length content bytes of a signed value. The high bit of the
/// first byte always equals the sign.
pub fn signed_content(value: i32) -> Vec<u8> {
    if (-128..=127).contains(&value) {
        vec![value as u8]
    } else if (-32768..=32767).contains(&value) {
        (value as i16).to_be_bytes().to_vec()
    } else if (-8_388_608..=8_388_607).contains(&value) {
        value.to_be_bytes()[1..].to_vec()
    } else {
        value.to_be_bytes().to_vec()
    }
}

/// Decode unsigned content bytes (1..4 bytes, big-endian)
pub fn decode_unsigned_content(content: &[u8]) -> Result<u32> {
    match content.len() {
        1 => Ok(content[0] as u32),
        2 => Ok(u16::from_be_bytes([content[0], content[1]]) as u32),
        3 => Ok(u32::from_be_bytes([0, content[0], content[1], content[2]])),
        4 => Ok(u32::from_be_bytes([
            content[0], content[1], content[2], content[3],
        ])),
        _ => Err(EncodingError::InvalidLength(0)),
    }
}

/// Decode signed content bytes with sign extension
pub fn decode_signed_content(content: &[u8]) -> Result<i32> {
    match content.len() {
        1 => Ok(content[0] as i8 as i32),
        2 => Ok(i16::from_be_bytes([content[0], content[1]]) as i32),
        3 => {
            let extend = if content[0] & 0x80 != 0 { 0xFF } else { 0x00 };
            Ok(i32::from_be_bytes([extend, content[0], content[1], content[2]]))
        }
        4 => Ok(i32::from_be_bytes([
            content[0], content[1], content[2], content[3],
        ])),
        _ => Err(EncodingError::InvalidLength(0)),
    }
}

// ---------------------------------------------------------------------------
// Application-tagged primitives
// ---------------------------------------------------------------------------

/// Encode a BACnet Null value
pub fn encode_application_null(buffer: &mut Vec<u8>) -> Result<()> {
    encode_tag(buffer, &Tag::application(ApplicationTag::Null, 0))
}

/// Decode a BACnet Null value
pub fn decode_application_null(data: &[u8], offset: usize) -> Result<usize> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::Null, offset)?;
    if tag.length != 0 {
        return Err(EncodingError::InvalidLength(offset));
    }
    Ok(pos)
}

/// Encode a BACnet Boolean value (value rides in the length field)
pub fn encode_application_boolean(buffer: &mut Vec<u8>, value: bool) -> Result<()> {
    encode_tag(
        buffer,
        &Tag::application(ApplicationTag::Boolean, u32::from(value)),
    )
}

/// Decode a BACnet Boolean value
pub fn decode_application_boolean(data: &[u8], offset: usize) -> Result<(bool, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::Boolean, offset)?;
    match tag.length {
        0 => Ok((false, pos)),
        1 => Ok((true, pos)),
        _ => Err(EncodingError::InvalidLength(offset)),
    }
}

/// Encode a BACnet unsigned integer
pub fn encode_application_unsigned(buffer: &mut Vec<u8>, value: u32) -> Result<()> {
    let content = unsigned_content(value);
    encode_tag(
        buffer,
        &Tag::application(ApplicationTag::UnsignedInt, content.len() as u32),
    )?;
    buffer.extend_from_slice(&content);
    Ok(())
}

/// Decode a BACnet unsigned integer
pub fn decode_application_unsigned(data: &[u8], offset: usize) -> Result<(u32, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::UnsignedInt, offset)?;
    ensure_content(data, pos, tag.length as usize)?;
    let value = decode_unsigned_content(&data[pos..pos + tag.length as usize])
        .map_err(|_| EncodingError::InvalidLength(offset))?;
    Ok((value, pos + tag.length as usize))
}

/// Encode a BACnet signed integer
pub fn encode_application_signed(buffer: &mut Vec<u8>, value: i32) -> Result<()> {
    let content = signed_content(value);
    encode_tag(
        buffer,
        &Tag::application(ApplicationTag::SignedInt, content.len() as u32),
    )?;
    buffer.extend_from_slice(&content);
    Ok(())
}

/// Decode a BACnet signed integer
pub fn decode_application_signed(data: &[u8], offset: usize) -> Result<(i32, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::SignedInt, offset)?;
    ensure_content(data, pos, tag.length as usize)?;
    let value = decode_signed_content(&data[pos..pos + tag.length as usize])
        .map_err(|_| EncodingError::InvalidLength(offset))?;
    Ok((value, pos + tag.length as usize))
}

/// Encode a BACnet enumerated value
pub fn encode_application_enumerated(buffer: &mut Vec<u8>, value: u32) -> Result<()> {
    let content = unsigned_content(value);
    encode_tag(
        buffer,
        &Tag::application(ApplicationTag::Enumerated, content.len() as u32),
    )?;
    buffer.extend_from_slice(&content);
    Ok(())
}

/// Decode a BACnet enumerated value
pub fn decode_application_enumerated(data: &[u8], offset: usize) -> Result<(u32, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::Enumerated, offset)?;
    ensure_content(data, pos, tag.length as usize)?;
    let value = decode_unsigned_content(&data[pos..pos + tag.length as usize])
        .map_err(|_| EncodingError::InvalidLength(offset))?;
    Ok((value, pos + tag.length as usize))
}

/// Encode a BACnet Real (IEEE-754 single, big-endian)
pub fn encode_application_real(buffer: &mut Vec<u8>, value: f32) -> Result<()> {
    encode_tag(buffer, &Tag::application(ApplicationTag::Real, 4))?;
    buffer.extend_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Decode a BACnet Real
pub fn decode_application_real(data: &[u8], offset: usize) -> Result<(f32, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::Real, offset)?;
    if tag.length != 4 {
        return Err(EncodingError::InvalidLength(offset));
    }
    ensure_content(data, pos, 4)?;
    let value = f32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
    Ok((value, pos + 4))
}

/// Encode a BACnet Double (IEEE-754 double, big-endian)
pub fn encode_application_double(buffer: &mut Vec<u8>, value: f64) -> Result<()> {
    encode_tag(buffer, &Tag::application(ApplicationTag::Double, 8))?;
    buffer.extend_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Decode a BACnet Double
pub fn decode_application_double(data: &[u8], offset: usize) -> Result<(f64, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::Double, offset)?;
    if tag.length != 8 {
        return Err(EncodingError::InvalidLength(offset));
    }
    ensure_content(data, pos, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[pos..pos + 8]);
    Ok((f64::from_be_bytes(bytes), pos + 8))
}

/// Encode a BACnet octet string
pub fn encode_application_octet_string(buffer: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    encode_tag(
        buffer,
        &Tag::application(ApplicationTag::OctetString, value.len() as u32),
    )?;
    buffer.extend_from_slice(value);
    Ok(())
}

/// Decode a BACnet octet string
pub fn decode_application_octet_string(data: &[u8], offset: usize) -> Result<(Vec<u8>, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::OctetString, offset)?;
    ensure_content(data, pos, tag.length as usize)?;
    let value = data[pos..pos + tag.length as usize].to_vec();
    Ok((value, pos + tag.length as usize))
}

// ---------------------------------------------------------------------------
// Character strings
// ---------------------------------------------------------------------------

/// Character string charset byte values (Clause 20.2.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterSet {
    Utf8,
    Ucs4,
    Utf16,
    Latin1,
}

impl CharacterSet {
    pub fn code(&self) -> u8 {
        match self {
            CharacterSet::Utf8 => 0,
            CharacterSet::Ucs4 => 3,
            CharacterSet::Utf16 => 4,
            CharacterSet::Latin1 => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CharacterSet::Utf8),
            3 => Some(CharacterSet::Ucs4),
            4 => Some(CharacterSet::Utf16),
            5 => Some(CharacterSet::Latin1),
            _ => None,
        }
    }
}

/// Content bytes of a character string in the given charset (including
/// the leading charset byte). Fails if the charset cannot represent the
/// string or is unknown.
pub fn character_string_content(charset: CharacterSet, value: &str) -> Result<Vec<u8>> {
    let mut content = vec![charset.code()];
    match charset {
        CharacterSet::Utf8 => content.extend_from_slice(value.as_bytes()),
        CharacterSet::Ucs4 => {
            for ch in value.chars() {
                content.extend_from_slice(&(ch as u32).to_be_bytes());
            }
        }
        CharacterSet::Utf16 => {
            for unit in value.encode_utf16() {
                content.extend_from_slice(&unit.to_be_bytes());
            }
        }
        CharacterSet::Latin1 => {
            for ch in value.chars() {
                let code = ch as u32;
                if code > 0xFF {
                    return Err(EncodingError::ValueOutOfRange("Latin-1 character"));
                }
                content.push(code as u8);
            }
        }
    }
    Ok(content)
}

fn decode_character_string_content(content: &[u8], offset: usize) -> Result<String> {
    if content.is_empty() {
        return Err(EncodingError::UnexpectedEnd(offset));
    }
    let text = &content[1..];
    match CharacterSet::from_code(content[0]) {
        Some(CharacterSet::Utf8) => String::from_utf8(text.to_vec())
            .map_err(|_| EncodingError::InvalidFormat("invalid UTF-8 string".into())),
        Some(CharacterSet::Ucs4) => {
            if text.len() % 4 != 0 {
                return Err(EncodingError::InvalidLength(offset));
            }
            text.chunks_exact(4)
                .map(|c| {
                    let code = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                    char::from_u32(code)
                        .ok_or_else(|| EncodingError::InvalidFormat("invalid UCS-4 code".into()))
                })
                .collect()
        }
        Some(CharacterSet::Utf16) => {
            if text.len() % 2 != 0 {
                return Err(EncodingError::InvalidLength(offset));
            }
            let (decoded, _, _) = encoding_rs::UTF_16BE.decode(text);
            Ok(decoded.into_owned())
        }
        // Unknown charsets fall back to Latin-1 so foreign strings stay
        // readable instead of failing the whole PDU.
        Some(CharacterSet::Latin1) | None => Ok(text.iter().map(|&b| b as char).collect()),
    }
}

/// Encode a BACnet character string as UTF-8 (charset 0)
pub fn encode_application_character_string(buffer: &mut Vec<u8>, value: &str) -> Result<()> {
    encode_application_character_string_with(buffer, CharacterSet::Utf8, value)
}

/// Encode a BACnet character string in an explicit charset
pub fn encode_application_character_string_with(
    buffer: &mut Vec<u8>,
    charset: CharacterSet,
    value: &str,
) -> Result<()> {
    let content = character_string_content(charset, value)?;
    encode_tag(
        buffer,
        &Tag::application(ApplicationTag::CharacterString, content.len() as u32),
    )?;
    buffer.extend_from_slice(&content);
    Ok(())
}

/// Decode a BACnet character string
pub fn decode_application_character_string(data: &[u8], offset: usize) -> Result<(String, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::CharacterString, offset)?;
    ensure_content(data, pos, tag.length as usize)?;
    let value = decode_character_string_content(&data[pos..pos + tag.length as usize], offset)?;
    Ok((value, pos + tag.length as usize))
}

// ---------------------------------------------------------------------------
// Bit strings
// ---------------------------------------------------------------------------

/// A BACnet bit string: packed bits plus a trailing unused-bit count
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitString {
    /// Unused bits in the final byte (0..7)
    pub unused_bits: u8,
    /// Packed bits, most significant bit first
    pub data: Vec<u8>,
}

impl BitString {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from individual bits, most significant first
    pub fn from_bits(bits: &[bool]) -> Self {
        let mut data = vec![0u8; bits.len().div_ceil(8)];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                data[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        let unused_bits = if bits.len() % 8 == 0 {
            0
        } else {
            (8 - bits.len() % 8) as u8
        };
        Self { unused_bits, data }
    }

    /// Number of meaningful bits
    pub fn len(&self) -> usize {
        self.data.len() * 8 - self.unused_bits as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of bit `index`, or `None` past the end
    pub fn bit(&self, index: usize) -> Option<bool> {
        if index >= self.len() {
            return None;
        }
        Some(self.data[index / 8] & (1 << (7 - (index % 8))) != 0)
    }

    /// Unpack into individual bits
    pub fn bits(&self) -> Vec<bool> {
        (0..self.len()).map(|i| self.bit(i).unwrap_or(false)).collect()
    }
}

/// Encode a BACnet bit string
pub fn encode_application_bit_string(buffer: &mut Vec<u8>, value: &BitString) -> Result<()> {
    if value.unused_bits > 7 {
        return Err(EncodingError::ValueOutOfRange("unused bits"));
    }
    encode_tag(
        buffer,
        &Tag::application(ApplicationTag::BitString, value.data.len() as u32 + 1),
    )?;
    buffer.push(value.unused_bits);
    buffer.extend_from_slice(&value.data);
    Ok(())
}

/// Decode a BACnet bit string; rejects unused-bit counts of 8 or more
pub fn decode_application_bit_string(data: &[u8], offset: usize) -> Result<(BitString, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::BitString, offset)?;
    if tag.length == 0 {
        return Err(EncodingError::InvalidLength(offset));
    }
    ensure_content(data, pos, tag.length as usize)?;
    let unused_bits = data[pos];
    if unused_bits > 7 {
        return Err(EncodingError::InvalidFormat("unused bit count > 7".into()));
    }
    let value = BitString {
        unused_bits,
        data: data[pos + 1..pos + tag.length as usize].to_vec(),
    };
    Ok((value, pos + tag.length as usize))
}

// ---------------------------------------------------------------------------
// Date and Time
// ---------------------------------------------------------------------------

/// Wildcard octet for Date/Time fields
pub const DATE_TIME_WILDCARD: u8 = 0xFF;

/// A BACnet Date. `year` is the absolute year (1900..2154) or 255 for
/// the wildcard; month, day, and weekday use 0xFF wildcards. Weekday 1
/// is Monday, 7 is Sunday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacnetDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub weekday: u8,
}

impl BacnetDate {
    pub fn new(year: u16, month: u8, day: u8, weekday: u8) -> Self {
        Self {
            year,
            month,
            day,
            weekday,
        }
    }

    /// Today's date in local time
    pub fn today() -> Self {
        Self::from_naive(chrono::Local::now().date_naive())
    }

    pub fn from_naive(date: chrono::NaiveDate) -> Self {
        use chrono::Datelike;
        Self {
            year: date.year() as u16,
            month: date.month() as u8,
            day: date.day() as u8,
            weekday: date.weekday().number_from_monday() as u8,
        }
    }

    fn year_octet(&self) -> Result<u8> {
        if self.year == DATE_TIME_WILDCARD as u16 {
            Ok(DATE_TIME_WILDCARD)
        } else if (1900..1900 + 255).contains(&self.year) {
            Ok((self.year - 1900) as u8)
        } else {
            Err(EncodingError::ValueOutOfRange("year"))
        }
    }
}

/// A BACnet Time with hundredths resolution; 0xFF fields are wildcards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacnetTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub hundredths: u8,
}

impl BacnetTime {
    pub fn new(hour: u8, minute: u8, second: u8, hundredths: u8) -> Self {
        Self {
            hour,
            minute,
            second,
            hundredths,
        }
    }

    /// Current local wall-clock time
    pub fn now() -> Self {
        Self::from_naive(chrono::Local::now().time())
    }

    pub fn from_naive(time: chrono::NaiveTime) -> Self {
        use chrono::Timelike;
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
            second: time.second() as u8,
            hundredths: (time.nanosecond() / 10_000_000) as u8,
        }
    }
}

/// Encode a BACnet Date
pub fn encode_application_date(buffer: &mut Vec<u8>, value: &BacnetDate) -> Result<()> {
    encode_tag(buffer, &Tag::application(ApplicationTag::Date, 4))?;
    buffer.push(value.year_octet()?);
    buffer.push(value.month);
    buffer.push(value.day);
    buffer.push(value.weekday);
    Ok(())
}

/// Decode a BACnet Date
pub fn decode_application_date(data: &[u8], offset: usize) -> Result<(BacnetDate, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::Date, offset)?;
    if tag.length != 4 {
        return Err(EncodingError::InvalidLength(offset));
    }
    ensure_content(data, pos, 4)?;
    let year = if data[pos] == DATE_TIME_WILDCARD {
        DATE_TIME_WILDCARD as u16
    } else {
        1900 + data[pos] as u16
    };
    let value = BacnetDate {
        year,
        month: data[pos + 1],
        day: data[pos + 2],
        weekday: data[pos + 3],
    };
    Ok((value, pos + 4))
}

/// Encode a BACnet Time
pub fn encode_application_time(buffer: &mut Vec<u8>, value: &BacnetTime) -> Result<()> {
    encode_tag(buffer, &Tag::application(ApplicationTag::Time, 4))?;
    buffer.push(value.hour);
    buffer.push(value.minute);
    buffer.push(value.second);
    buffer.push(value.hundredths);
    Ok(())
}

/// Decode a BACnet Time
pub fn decode_application_time(data: &[u8], offset: usize) -> Result<(BacnetTime, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::Time, offset)?;
    if tag.length != 4 {
        return Err(EncodingError::InvalidLength(offset));
    }
    ensure_content(data, pos, 4)?;
    let value = BacnetTime {
        hour: data[pos],
        minute: data[pos + 1],
        second: data[pos + 2],
        hundredths: data[pos + 3],
    };
    Ok((value, pos + 4))
}

// ---------------------------------------------------------------------------
// Object identifiers
// ---------------------------------------------------------------------------

/// A BACnet object identifier: 10-bit type and 22-bit instance packed
/// into 32 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentifier {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectIdentifier {
    pub const MAX_INSTANCE: u32 = 0x3F_FFFF;
    pub const MAX_TYPE: u16 = 0x3FF;

    pub fn new(object_type: u16, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.object_type <= Self::MAX_TYPE && self.instance <= Self::MAX_INSTANCE
    }

    /// Packed 32-bit wire form
    pub fn to_u32(&self) -> u32 {
        ((self.object_type as u32) << 22) | (self.instance & Self::MAX_INSTANCE)
    }

    pub fn from_u32(value: u32) -> Self {
        Self {
            object_type: (value >> 22) as u16,
            instance: value & Self::MAX_INSTANCE,
        }
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

/// Encode a BACnet object identifier
pub fn encode_application_object_identifier(
    buffer: &mut Vec<u8>,
    value: &ObjectIdentifier,
) -> Result<()> {
    if !value.is_valid() {
        return Err(EncodingError::ValueOutOfRange("object identifier"));
    }
    encode_tag(buffer, &Tag::application(ApplicationTag::ObjectIdentifier, 4))?;
    buffer.extend_from_slice(&value.to_u32().to_be_bytes());
    Ok(())
}

/// Decode a BACnet object identifier
pub fn decode_application_object_identifier(
    data: &[u8],
    offset: usize,
) -> Result<(ObjectIdentifier, usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    expect_application(&tag, ApplicationTag::ObjectIdentifier, offset)?;
    if tag.length != 4 {
        return Err(EncodingError::InvalidLength(offset));
    }
    ensure_content(data, pos, 4)?;
    let raw = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
    Ok((ObjectIdentifier::from_u32(raw), pos + 4))
}

// ---------------------------------------------------------------------------
// Context-specific tags
// ---------------------------------------------------------------------------

/// Encode an opening tag for constructed context data
pub fn encode_opening_tag(buffer: &mut Vec<u8>, number: u8) -> Result<()> {
    encode_tag(buffer, &Tag::opening(number))
}

/// Encode a closing tag for constructed context data
pub fn encode_closing_tag(buffer: &mut Vec<u8>, number: u8) -> Result<()> {
    encode_tag(buffer, &Tag::closing(number))
}

/// Consume an opening tag with the given number, returning the content offset
pub fn expect_opening_tag(data: &[u8], offset: usize, number: u8) -> Result<usize> {
    let (tag, pos) = decode_tag(data, offset)?;
    if !tag.is_opening || tag.number != number {
        return Err(EncodingError::TagMismatch {
            expected: number,
            found: tag.number,
        });
    }
    Ok(pos)
}

/// Consume a closing tag with the given number; a mismatched closing tag
/// is a decode failure.
pub fn expect_closing_tag(data: &[u8], offset: usize, number: u8) -> Result<usize> {
    let (tag, pos) = decode_tag(data, offset)?;
    if !tag.is_closing || tag.number != number {
        return Err(EncodingError::TagMismatch {
            expected: number,
            found: tag.number,
        });
    }
    Ok(pos)
}

fn decode_context_content<'a>(
    data: &'a [u8],
    offset: usize,
    number: u8,
) -> Result<(&'a [u8], usize)> {
    let (tag, pos) = decode_tag(data, offset)?;
    if !tag.is_context() || tag.is_opening || tag.is_closing {
        return Err(EncodingError::InvalidTag(offset));
    }
    if tag.number != number {
        return Err(EncodingError::TagMismatch {
            expected: number,
            found: tag.number,
        });
    }
    ensure_content(data, pos, tag.length as usize)?;
    Ok((&data[pos..pos + tag.length as usize], pos + tag.length as usize))
}

/// Encode a context-tagged unsigned integer
pub fn encode_context_unsigned(buffer: &mut Vec<u8>, number: u8, value: u32) -> Result<()> {
    let content = unsigned_content(value);
    encode_tag(buffer, &Tag::context(number, content.len() as u32))?;
    buffer.extend_from_slice(&content);
    Ok(())
}

/// Decode a context-tagged unsigned integer
pub fn decode_context_unsigned(data: &[u8], offset: usize, number: u8) -> Result<(u32, usize)> {
    let (content, pos) = decode_context_content(data, offset, number)?;
    let value =
        decode_unsigned_content(content).map_err(|_| EncodingError::InvalidLength(offset))?;
    Ok((value, pos))
}

/// Encode a context-tagged signed integer
pub fn encode_context_signed(buffer: &mut Vec<u8>, number: u8, value: i32) -> Result<()> {
    let content = signed_content(value);
    encode_tag(buffer, &Tag::context(number, content.len() as u32))?;
    buffer.extend_from_slice(&content);
    Ok(())
}

/// Decode a context-tagged signed integer
pub fn decode_context_signed(data: &[u8], offset: usize, number: u8) -> Result<(i32, usize)> {
    let (content, pos) = decode_context_content(data, offset, number)?;
    let value = decode_signed_content(content).map_err(|_| EncodingError::InvalidLength(offset))?;
    Ok((value, pos))
}

/// Encode a context-tagged enumerated value
pub fn encode_context_enumerated(buffer: &mut Vec<u8>, number: u8, value: u32) -> Result<()> {
    encode_context_unsigned(buffer, number, value)
}

/// Decode a context-tagged enumerated value
pub fn decode_context_enumerated(data: &[u8], offset: usize, number: u8) -> Result<(u32, usize)> {
    decode_context_unsigned(data, offset, number)
}

/// Encode a context-tagged Real
pub fn encode_context_real(buffer: &mut Vec<u8>, number: u8, value: f32) -> Result<()> {
    encode_tag(buffer, &Tag::context(number, 4))?;
    buffer.extend_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Decode a context-tagged Real
pub fn decode_context_real(data: &[u8], offset: usize, number: u8) -> Result<(f32, usize)> {
    let (content, pos) = decode_context_content(data, offset, number)?;
    if content.len() != 4 {
        return Err(EncodingError::InvalidLength(offset));
    }
    Ok((
        f32::from_be_bytes([content[0], content[1], content[2], content[3]]),
        pos,
    ))
}

/// Encode a context-tagged Double
pub fn encode_context_double(buffer: &mut Vec<u8>, number: u8, value: f64) -> Result<()> {
    encode_tag(buffer, &Tag::context(number, 8))?;
    buffer.extend_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Decode a context-tagged Double
pub fn decode_context_double(data: &[u8], offset: usize, number: u8) -> Result<(f64, usize)> {
    let (content, pos) = decode_context_content(data, offset, number)?;
    if content.len() != 8 {
        return Err(EncodingError::InvalidLength(offset));
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(content);
    Ok((f64::from_be_bytes(bytes), pos))
}

/// Encode a context-tagged octet string
pub fn encode_context_octet_string(buffer: &mut Vec<u8>, number: u8, value: &[u8]) -> Result<()> {
    encode_tag(buffer, &Tag::context(number, value.len() as u32))?;
    buffer.extend_from_slice(value);
    Ok(())
}

/// Decode a context-tagged octet string
pub fn decode_context_octet_string(
    data: &[u8],
    offset: usize,
    number: u8,
) -> Result<(Vec<u8>, usize)> {
    let (content, pos) = decode_context_content(data, offset, number)?;
    Ok((content.to_vec(), pos))
}

/// Encode a context-tagged character string (UTF-8)
pub fn encode_context_character_string(
    buffer: &mut Vec<u8>,
    number: u8,
    value: &str,
) -> Result<()> {
    let content = character_string_content(CharacterSet::Utf8, value)?;
    encode_tag(buffer, &Tag::context(number, content.len() as u32))?;
    buffer.extend_from_slice(&content);
    Ok(())
}

/// Decode a context-tagged character string
pub fn decode_context_character_string(
    data: &[u8],
    offset: usize,
    number: u8,
) -> Result<(String, usize)> {
    let (content, pos) = decode_context_content(data, offset, number)?;
    Ok((decode_character_string_content(content, offset)?, pos))
}

/// Encode a context-tagged Date
pub fn encode_context_date(buffer: &mut Vec<u8>, number: u8, value: &BacnetDate) -> Result<()> {
    encode_tag(buffer, &Tag::context(number, 4))?;
    buffer.push(value.year_octet()?);
    buffer.push(value.month);
    buffer.push(value.day);
    buffer.push(value.weekday);
    Ok(())
}

/// Decode a context-tagged Date
pub fn decode_context_date(data: &[u8], offset: usize, number: u8) -> Result<(BacnetDate, usize)> {
    let (content, pos) = decode_context_content(data, offset, number)?;
    if content.len() != 4 {
        return Err(EncodingError::InvalidLength(offset));
    }
    let year = if content[0] == DATE_TIME_WILDCARD {
        DATE_TIME_WILDCARD as u16
    } else {
        1900 + content[0] as u16
    };
    Ok((
        BacnetDate {
            year,
            month: content[1],
            day: content[2],
            weekday: content[3],
        },
        pos,
    ))
}

/// Encode a context-tagged Time
pub fn encode_context_time(buffer: &mut Vec<u8>, number: u8, value: &BacnetTime) -> Result<()> {
    encode_tag(buffer, &Tag::context(number, 4))?;
    buffer.push(value.hour);
    buffer.push(value.minute);
    buffer.push(value.second);
    buffer.push(value.hundredths);
    Ok(())
}

/// Decode a context-tagged Time
pub fn decode_context_time(data: &[u8], offset: usize, number: u8) -> Result<(BacnetTime, usize)> {
    let (content, pos) = decode_context_content(data, offset, number)?;
    if content.len() != 4 {
        return Err(EncodingError::InvalidLength(offset));
    }
    Ok((
        BacnetTime {
            hour: content[0],
            minute: content[1],
            second: content[2],
            hundredths: content[3],
        },
        pos,
    ))
}

/// Encode a context-tagged object identifier
pub fn encode_context_object_identifier(
    buffer: &mut Vec<u8>,
    number: u8,
    value: &ObjectIdentifier,
) -> Result<()> {
    if !value.is_valid() {
        return Err(EncodingError::ValueOutOfRange("object identifier"));
    }
    encode_tag(buffer, &Tag::context(number, 4))?;
    buffer.extend_from_slice(&value.to_u32().to_be_bytes());
    Ok(())
}

/// Decode a context-tagged object identifier
pub fn decode_context_object_identifier(
    data: &[u8],
    offset: usize,
    number: u8,
) -> Result<(ObjectIdentifier, usize)> {
    let (content, pos) = decode_context_content(data, offset, number)?;
    if content.len() != 4 {
        return Err(EncodingError::InvalidLength(offset));
    }
    let raw = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
    Ok((ObjectIdentifier::from_u32(raw), pos))
}

/// Skip one application- or context-tagged value (including constructed
/// values) and return the offset just past it.
pub fn skip_value(data: &[u8], offset: usize) -> Result<usize> {
    let (tag, mut pos) = decode_tag(data, offset)?;
    if tag.is_closing {
        return Err(EncodingError::InvalidTag(offset));
    }
    if tag.is_opening {
        loop {
            let peeked = peek_tag(data, pos)?;
            if peeked.is_closing && peeked.number == tag.number {
                let (_, after) = decode_tag(data, pos)?;
                return Ok(after);
            }
            pos = skip_value(data, pos)?;
        }
    }
    ensure_content(data, pos, tag.length as usize)?;
    Ok(pos + tag.length as usize)
}
