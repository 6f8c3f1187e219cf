//! Constructed BACnet types
//!
//! Structured values built from the primitive codecs: date/time
//! aggregates, property references, priority arrays, and the CHOICE
//! productions that dispatch on an opening context tag (TimeStamp,
//! CalendarEntry, Recipient, ValueSource, FaultParameter).
//!
//! Every type follows the same shape: `encode(&self) -> Vec<u8>` and
//! `decode(data, offset) -> Result<(Self, usize)>`. CHOICE decoders read
//! the opening tag, dispatch on its number, then require the matching
//! closing tag; a mismatch fails the decode.

use super::{
    decode_application_character_string, decode_application_date,
    decode_application_enumerated, decode_application_null, decode_application_time,
    decode_application_unsigned, decode_context_object_identifier, decode_context_octet_string,
    decode_context_time, decode_context_unsigned, decode_tag, encode_application_boolean,
    encode_application_character_string, encode_application_date, encode_application_double,
    encode_application_enumerated, encode_application_null, encode_application_real,
    encode_application_signed, encode_application_time, encode_application_unsigned,
    encode_closing_tag, encode_context_object_identifier, encode_context_octet_string,
    encode_context_time, encode_context_unsigned, encode_opening_tag, expect_closing_tag,
    expect_opening_tag, peek_tag, skip_value, ApplicationTag, EncodingError, ObjectIdentifier,
    Result, Tag, TagClass,
};
use crate::network::BacnetAddress;

fn unknown_choice(tag: &Tag, what: &str) -> EncodingError {
    EncodingError::InvalidFormat(format!("unknown {} choice tag {}", what, tag.number))
}

// ---------------------------------------------------------------------------
// DateTime, DateRange, WeekNDay
// ---------------------------------------------------------------------------

/// A Date followed by a Time, both application-tagged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacnetDateTime {
    pub date: super::BacnetDate,
    pub time: super::BacnetTime,
}

impl BacnetDateTime {
    pub fn new(date: super::BacnetDate, time: super::BacnetTime) -> Self {
        Self { date, time }
    }

    /// Current local date and time
    pub fn now() -> Self {
        Self {
            date: super::BacnetDate::today(),
            time: super::BacnetTime::now(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(10);
        let _ = encode_application_date(&mut buffer, &self.date);
        let _ = encode_application_time(&mut buffer, &self.time);
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let (date, offset) = decode_application_date(data, offset)?;
        let (time, offset) = decode_application_time(data, offset)?;
        Ok((Self { date, time }, offset))
    }
}

/// An inclusive range of dates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: super::BacnetDate,
    pub end: super::BacnetDate,
}

impl DateRange {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(10);
        let _ = encode_application_date(&mut buffer, &self.start);
        let _ = encode_application_date(&mut buffer, &self.end);
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let (start, offset) = decode_application_date(data, offset)?;
        let (end, offset) = decode_application_date(data, offset)?;
        Ok((Self { start, end }, offset))
    }
}

/// Month / week-of-month / day-of-week pattern, 0xFF wildcards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekNDay {
    pub month: u8,
    pub week_of_month: u8,
    pub weekday: u8,
}

impl WeekNDay {
    pub fn to_octets(&self) -> [u8; 3] {
        [self.month, self.week_of_month, self.weekday]
    }

    pub fn from_octets(octets: &[u8]) -> Result<Self> {
        if octets.len() != 3 {
            return Err(EncodingError::InvalidLength(0));
        }
        Ok(Self {
            month: octets[0],
            week_of_month: octets[1],
            weekday: octets[2],
        })
    }
}

// ---------------------------------------------------------------------------
// Property references
// ---------------------------------------------------------------------------

/// Reference to a property of an implied object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyReference {
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
}

impl PropertyReference {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let _ = encode_context_unsigned(&mut buffer, 0, self.property_identifier);
        if let Some(index) = self.property_array_index {
            let _ = encode_context_unsigned(&mut buffer, 1, index);
        }
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let (property_identifier, mut offset) = decode_context_unsigned(data, offset, 0)?;
        let mut property_array_index = None;
        if let Ok(tag) = peek_tag(data, offset) {
            if tag.is_context() && tag.number == 1 && !tag.is_opening && !tag.is_closing {
                let (index, next) = decode_context_unsigned(data, offset, 1)?;
                property_array_index = Some(index);
                offset = next;
            }
        }
        Ok((
            Self {
                property_identifier,
                property_array_index,
            },
            offset,
        ))
    }
}

/// Reference to a property of a named object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectPropertyReference {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
}

impl ObjectPropertyReference {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let _ = encode_context_object_identifier(&mut buffer, 0, &self.object_identifier);
        let _ = encode_context_unsigned(&mut buffer, 1, self.property_identifier);
        if let Some(index) = self.property_array_index {
            let _ = encode_context_unsigned(&mut buffer, 2, index);
        }
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let (object_identifier, offset) = decode_context_object_identifier(data, offset, 0)?;
        let (property_identifier, mut offset) = decode_context_unsigned(data, offset, 1)?;
        let mut property_array_index = None;
        if let Ok(tag) = peek_tag(data, offset) {
            if tag.is_context() && tag.number == 2 && !tag.is_opening && !tag.is_closing {
                let (index, next) = decode_context_unsigned(data, offset, 2)?;
                property_array_index = Some(index);
                offset = next;
            }
        }
        Ok((
            Self {
                object_identifier,
                property_identifier,
                property_array_index,
            },
            offset,
        ))
    }
}

/// Reference to a property of an object in a (possibly remote) device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceObjectPropertyReference {
    pub object_identifier: ObjectIdentifier,
    pub property_identifier: u32,
    pub property_array_index: Option<u32>,
    pub device_identifier: Option<ObjectIdentifier>,
}

impl DeviceObjectPropertyReference {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let _ = encode_context_object_identifier(&mut buffer, 0, &self.object_identifier);
        let _ = encode_context_unsigned(&mut buffer, 1, self.property_identifier);
        if let Some(index) = self.property_array_index {
            let _ = encode_context_unsigned(&mut buffer, 2, index);
        }
        if let Some(device) = &self.device_identifier {
            let _ = encode_context_object_identifier(&mut buffer, 3, device);
        }
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let (object_identifier, offset) = decode_context_object_identifier(data, offset, 0)?;
        let (property_identifier, mut offset) = decode_context_unsigned(data, offset, 1)?;
        let mut property_array_index = None;
        let mut device_identifier = None;
        if let Ok(tag) = peek_tag(data, offset) {
            if tag.is_context() && tag.number == 2 && !tag.is_opening && !tag.is_closing {
                let (index, next) = decode_context_unsigned(data, offset, 2)?;
                property_array_index = Some(index);
                offset = next;
            }
        }
        if let Ok(tag) = peek_tag(data, offset) {
            if tag.is_context() && tag.number == 3 && !tag.is_opening && !tag.is_closing {
                let (device, next) = decode_context_object_identifier(data, offset, 3)?;
                device_identifier = Some(device);
                offset = next;
            }
        }
        Ok((
            Self {
                object_identifier,
                property_identifier,
                property_array_index,
                device_identifier,
            },
            offset,
        ))
    }
}

/// Reference to an object in a (possibly remote) device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceObjectReference {
    pub device_identifier: Option<ObjectIdentifier>,
    pub object_identifier: ObjectIdentifier,
}

impl DeviceObjectReference {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        if let Some(device) = &self.device_identifier {
            let _ = encode_context_object_identifier(&mut buffer, 0, device);
        }
        let _ = encode_context_object_identifier(&mut buffer, 1, &self.object_identifier);
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let mut device_identifier = None;
        let mut offset = offset;
        let tag = peek_tag(data, offset)?;
        if tag.is_context() && tag.number == 0 && !tag.is_opening && !tag.is_closing {
            let (device, next) = decode_context_object_identifier(data, offset, 0)?;
            device_identifier = Some(device);
            offset = next;
        }
        let (object_identifier, offset) = decode_context_object_identifier(data, offset, 1)?;
        Ok((
            Self {
                device_identifier,
                object_identifier,
            },
            offset,
        ))
    }
}

// ---------------------------------------------------------------------------
// BacnetAddress encoding (used by Recipient and ValueSource)
// ---------------------------------------------------------------------------

fn encode_address_fields(buffer: &mut Vec<u8>, address: &BacnetAddress) {
    // network-number 0 denotes the local network in this production
    let network = address.network.unwrap_or(0) as u32;
    let _ = encode_application_unsigned(buffer, network);
    let mut mac_buf = Vec::new();
    let _ = super::encode_application_octet_string(&mut mac_buf, &address.mac);
    buffer.extend_from_slice(&mac_buf);
}

fn decode_address_fields(data: &[u8], offset: usize) -> Result<(BacnetAddress, usize)> {
    let (network, offset) = decode_application_unsigned(data, offset)?;
    if network > 0xFFFF {
        return Err(EncodingError::ValueOutOfRange("network number"));
    }
    let (mac, offset) = super::decode_application_octet_string(data, offset)?;
    let network = if network == 0 { None } else { Some(network as u16) };
    Ok((BacnetAddress { network, mac }, offset))
}

// ---------------------------------------------------------------------------
// TimeStamp CHOICE
// ---------------------------------------------------------------------------

/// BACnetTimeStamp: a time, a sequence number, or a full date-time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeStamp {
    Time(super::BacnetTime),
    Sequence(u32),
    DateTime(BacnetDateTime),
}

impl TimeStamp {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            TimeStamp::Time(time) => {
                let _ = encode_context_time(&mut buffer, 0, time);
            }
            TimeStamp::Sequence(seq) => {
                let _ = encode_context_unsigned(&mut buffer, 1, *seq);
            }
            TimeStamp::DateTime(dt) => {
                let _ = encode_opening_tag(&mut buffer, 2);
                buffer.extend_from_slice(&dt.encode());
                let _ = encode_closing_tag(&mut buffer, 2);
            }
        }
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let tag = peek_tag(data, offset)?;
        if tag.class != TagClass::Context {
            return Err(EncodingError::InvalidTag(offset));
        }
        match (tag.number, tag.is_opening) {
            (0, false) => {
                let (time, offset) = decode_context_time(data, offset, 0)?;
                Ok((TimeStamp::Time(time), offset))
            }
            (1, false) => {
                let (seq, offset) = decode_context_unsigned(data, offset, 1)?;
                Ok((TimeStamp::Sequence(seq), offset))
            }
            (2, true) => {
                let offset = expect_opening_tag(data, offset, 2)?;
                let (dt, offset) = BacnetDateTime::decode(data, offset)?;
                let offset = expect_closing_tag(data, offset, 2)?;
                Ok((TimeStamp::DateTime(dt), offset))
            }
            _ => Err(unknown_choice(&tag, "timestamp")),
        }
    }
}

// ---------------------------------------------------------------------------
// CalendarEntry CHOICE
// ---------------------------------------------------------------------------

/// BACnetCalendarEntry: a single date, a date range, or a month/week/day pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarEntry {
    Date(super::BacnetDate),
    DateRange(DateRange),
    WeekNDay(WeekNDay),
}

impl CalendarEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            CalendarEntry::Date(date) => {
                let _ = super::encode_context_date(&mut buffer, 0, date);
            }
            CalendarEntry::DateRange(range) => {
                let _ = encode_opening_tag(&mut buffer, 1);
                buffer.extend_from_slice(&range.encode());
                let _ = encode_closing_tag(&mut buffer, 1);
            }
            CalendarEntry::WeekNDay(pattern) => {
                let _ = encode_context_octet_string(&mut buffer, 2, &pattern.to_octets());
            }
        }
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let tag = peek_tag(data, offset)?;
        if tag.class != TagClass::Context {
            return Err(EncodingError::InvalidTag(offset));
        }
        match (tag.number, tag.is_opening) {
            (0, false) => {
                let (date, offset) = super::decode_context_date(data, offset, 0)?;
                Ok((CalendarEntry::Date(date), offset))
            }
            (1, true) => {
                let offset = expect_opening_tag(data, offset, 1)?;
                let (range, offset) = DateRange::decode(data, offset)?;
                let offset = expect_closing_tag(data, offset, 1)?;
                Ok((CalendarEntry::DateRange(range), offset))
            }
            (2, false) => {
                let (octets, offset) = decode_context_octet_string(data, offset, 2)?;
                Ok((CalendarEntry::WeekNDay(WeekNDay::from_octets(&octets)?), offset))
            }
            _ => Err(unknown_choice(&tag, "calendar entry")),
        }
    }
}

// ---------------------------------------------------------------------------
// Recipient CHOICE
// ---------------------------------------------------------------------------

/// BACnetRecipient: a device instance or an explicit network address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device(ObjectIdentifier),
    Address(BacnetAddress),
}

impl Recipient {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            Recipient::Device(id) => {
                let _ = encode_context_object_identifier(&mut buffer, 0, id);
            }
            Recipient::Address(address) => {
                let _ = encode_opening_tag(&mut buffer, 1);
                encode_address_fields(&mut buffer, address);
                let _ = encode_closing_tag(&mut buffer, 1);
            }
        }
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let tag = peek_tag(data, offset)?;
        if tag.class != TagClass::Context {
            return Err(EncodingError::InvalidTag(offset));
        }
        match (tag.number, tag.is_opening) {
            (0, false) => {
                let (id, offset) = decode_context_object_identifier(data, offset, 0)?;
                Ok((Recipient::Device(id), offset))
            }
            (1, true) => {
                let offset = expect_opening_tag(data, offset, 1)?;
                let (address, offset) = decode_address_fields(data, offset)?;
                let offset = expect_closing_tag(data, offset, 1)?;
                Ok((Recipient::Address(address), offset))
            }
            _ => Err(unknown_choice(&tag, "recipient")),
        }
    }
}

// ---------------------------------------------------------------------------
// ValueSource CHOICE
// ---------------------------------------------------------------------------

/// BACnetValueSource: who last commanded a value (Clause 19.5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSource {
    None,
    Object(DeviceObjectReference),
    Address(BacnetAddress),
}

impl ValueSource {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            ValueSource::None => {
                // context-tagged NULL: tag 0, zero length
                let _ = super::encode_tag(&mut buffer, &Tag::context(0, 0));
            }
            ValueSource::Object(reference) => {
                let _ = encode_opening_tag(&mut buffer, 1);
                buffer.extend_from_slice(&reference.encode());
                let _ = encode_closing_tag(&mut buffer, 1);
            }
            ValueSource::Address(address) => {
                let _ = encode_opening_tag(&mut buffer, 2);
                encode_address_fields(&mut buffer, address);
                let _ = encode_closing_tag(&mut buffer, 2);
            }
        }
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let tag = peek_tag(data, offset)?;
        if tag.class != TagClass::Context {
            return Err(EncodingError::InvalidTag(offset));
        }
        match (tag.number, tag.is_opening) {
            (0, false) => {
                let (tag, pos) = decode_tag(data, offset)?;
                if tag.length != 0 {
                    return Err(EncodingError::InvalidLength(offset));
                }
                Ok((ValueSource::None, pos))
            }
            (1, true) => {
                let offset = expect_opening_tag(data, offset, 1)?;
                let (reference, offset) = DeviceObjectReference::decode(data, offset)?;
                let offset = expect_closing_tag(data, offset, 1)?;
                Ok((ValueSource::Object(reference), offset))
            }
            (2, true) => {
                let offset = expect_opening_tag(data, offset, 2)?;
                let (address, offset) = decode_address_fields(data, offset)?;
                let offset = expect_closing_tag(data, offset, 2)?;
                Ok((ValueSource::Address(address), offset))
            }
            _ => Err(unknown_choice(&tag, "value source")),
        }
    }
}

// ---------------------------------------------------------------------------
// FaultParameter CHOICE (Clause 13.4)
// ---------------------------------------------------------------------------

/// A limit value for fault-out-of-range
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeValue {
    Unsigned(u32),
    Real(f32),
    Double(f64),
    Signed(i32),
}

impl RangeValue {
    fn encode(&self, buffer: &mut Vec<u8>, context: u8) {
        let _ = encode_opening_tag(buffer, context);
        match self {
            RangeValue::Unsigned(v) => {
                let _ = encode_application_unsigned(buffer, *v);
            }
            RangeValue::Real(v) => {
                let _ = encode_application_real(buffer, *v);
            }
            RangeValue::Double(v) => {
                let _ = encode_application_double(buffer, *v);
            }
            RangeValue::Signed(v) => {
                let _ = encode_application_signed(buffer, *v);
            }
        }
        let _ = encode_closing_tag(buffer, context);
    }

    fn decode(data: &[u8], offset: usize, context: u8) -> Result<(Self, usize)> {
        let offset = expect_opening_tag(data, offset, context)?;
        let tag = peek_tag(data, offset)?;
        let (value, offset) = match tag.application_tag()? {
            ApplicationTag::UnsignedInt => {
                let (v, o) = decode_application_unsigned(data, offset)?;
                (RangeValue::Unsigned(v), o)
            }
            ApplicationTag::Real => {
                let (v, o) = super::decode_application_real(data, offset)?;
                (RangeValue::Real(v), o)
            }
            ApplicationTag::Double => {
                let (v, o) = super::decode_application_double(data, offset)?;
                (RangeValue::Double(v), o)
            }
            ApplicationTag::SignedInt => {
                let (v, o) = super::decode_application_signed(data, offset)?;
                (RangeValue::Signed(v), o)
            }
            _ => return Err(EncodingError::InvalidTag(offset)),
        };
        let offset = expect_closing_tag(data, offset, context)?;
        Ok((value, offset))
    }
}

/// BACnetFaultParameter: how fault conditions are derived for an object
#[derive(Debug, Clone, PartialEq)]
pub enum FaultParameter {
    /// \[0\] no fault algorithm
    None,
    /// \[1\] fault-characterstring: fault when the monitored string matches
    CharacterString { fault_values: Vec<String> },
    /// \[2\] fault-extended: vendor-specific algorithm
    Extended {
        vendor_id: u16,
        extended_fault_type: u32,
        /// Raw application-tagged parameter list
        parameters: Vec<u8>,
    },
    /// \[3\] fault-life-safety
    LifeSafety {
        fault_values: Vec<u32>,
        mode_values: Vec<u32>,
    },
    /// \[4\] fault-state; values kept raw (BACnetPropertyStates is a
    /// 40-variant CHOICE)
    State { fault_values: Vec<u8> },
    /// \[5\] fault-status-flags
    StatusFlags {
        reference: DeviceObjectPropertyReference,
    },
    /// \[6\] fault-out-of-range
    OutOfRange { min: RangeValue, max: RangeValue },
    /// \[7\] fault-listed
    Listed {
        reference: DeviceObjectPropertyReference,
    },
}

impl FaultParameter {
    fn choice_tag(&self) -> u8 {
        match self {
            FaultParameter::None => 0,
            FaultParameter::CharacterString { .. } => 1,
            FaultParameter::Extended { .. } => 2,
            FaultParameter::LifeSafety { .. } => 3,
            FaultParameter::State { .. } => 4,
            FaultParameter::StatusFlags { .. } => 5,
            FaultParameter::OutOfRange { .. } => 6,
            FaultParameter::Listed { .. } => 7,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let choice = self.choice_tag();
        let _ = encode_opening_tag(&mut buffer, choice);
        match self {
            FaultParameter::None => {
                let _ = encode_application_null(&mut buffer);
            }
            FaultParameter::CharacterString { fault_values } => {
                let _ = encode_opening_tag(&mut buffer, 0);
                for value in fault_values {
                    let _ = encode_application_character_string(&mut buffer, value);
                }
                let _ = encode_closing_tag(&mut buffer, 0);
            }
            FaultParameter::Extended {
                vendor_id,
                extended_fault_type,
                parameters,
            } => {
                let _ = encode_context_unsigned(&mut buffer, 0, *vendor_id as u32);
                let _ = encode_context_unsigned(&mut buffer, 1, *extended_fault_type);
                let _ = encode_opening_tag(&mut buffer, 2);
                buffer.extend_from_slice(parameters);
                let _ = encode_closing_tag(&mut buffer, 2);
            }
            FaultParameter::LifeSafety {
                fault_values,
                mode_values,
            } => {
                let _ = encode_opening_tag(&mut buffer, 0);
                for value in fault_values {
                    let _ = encode_application_enumerated(&mut buffer, *value);
                }
                let _ = encode_closing_tag(&mut buffer, 0);
                let _ = encode_opening_tag(&mut buffer, 1);
                for value in mode_values {
                    let _ = encode_application_enumerated(&mut buffer, *value);
                }
                let _ = encode_closing_tag(&mut buffer, 1);
            }
            FaultParameter::State { fault_values } => {
                let _ = encode_opening_tag(&mut buffer, 0);
                buffer.extend_from_slice(fault_values);
                let _ = encode_closing_tag(&mut buffer, 0);
            }
            FaultParameter::StatusFlags { reference } | FaultParameter::Listed { reference } => {
                let _ = encode_opening_tag(&mut buffer, 0);
                buffer.extend_from_slice(&reference.encode());
                let _ = encode_closing_tag(&mut buffer, 0);
            }
            FaultParameter::OutOfRange { min, max } => {
                min.encode(&mut buffer, 0);
                max.encode(&mut buffer, 1);
            }
        }
        let _ = encode_closing_tag(&mut buffer, choice);
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let opening = peek_tag(data, offset)?;
        if !opening.is_opening {
            return Err(EncodingError::InvalidTag(offset));
        }
        let choice = opening.number;
        let offset = expect_opening_tag(data, offset, choice)?;

        let (value, offset) = match choice {
            0 => {
                let offset = decode_application_null(data, offset)?;
                (FaultParameter::None, offset)
            }
            1 => {
                let mut offset = expect_opening_tag(data, offset, 0)?;
                let mut fault_values = Vec::new();
                loop {
                    let tag = peek_tag(data, offset)?;
                    if tag.is_closing && tag.number == 0 {
                        break;
                    }
                    let (value, next) = decode_application_character_string(data, offset)?;
                    fault_values.push(value);
                    offset = next;
                }
                let offset = expect_closing_tag(data, offset, 0)?;
                (FaultParameter::CharacterString { fault_values }, offset)
            }
            2 => {
                let (vendor, offset) = decode_context_unsigned(data, offset, 0)?;
                if vendor > 0xFFFF {
                    return Err(EncodingError::ValueOutOfRange("vendor id"));
                }
                let (extended_fault_type, offset) = decode_context_unsigned(data, offset, 1)?;
                let mut end = expect_opening_tag(data, offset, 2)?;
                let start = end;
                loop {
                    let tag = peek_tag(data, end)?;
                    if tag.is_closing && tag.number == 2 {
                        break;
                    }
                    end = skip_value(data, end)?;
                }
                let parameters = data[start..end].to_vec();
                let offset = expect_closing_tag(data, end, 2)?;
                (
                    FaultParameter::Extended {
                        vendor_id: vendor as u16,
                        extended_fault_type,
                        parameters,
                    },
                    offset,
                )
            }
            3 => {
                let mut offset = expect_opening_tag(data, offset, 0)?;
                let mut fault_values = Vec::new();
                loop {
                    let tag = peek_tag(data, offset)?;
                    if tag.is_closing && tag.number == 0 {
                        break;
                    }
                    let (value, next) = decode_application_enumerated(data, offset)?;
                    fault_values.push(value);
                    offset = next;
                }
                let mut offset = expect_closing_tag(data, offset, 0)?;
                offset = expect_opening_tag(data, offset, 1)?;
                let mut mode_values = Vec::new();
                loop {
                    let tag = peek_tag(data, offset)?;
                    if tag.is_closing && tag.number == 1 {
                        break;
                    }
                    let (value, next) = decode_application_enumerated(data, offset)?;
                    mode_values.push(value);
                    offset = next;
                }
                let offset = expect_closing_tag(data, offset, 1)?;
                (
                    FaultParameter::LifeSafety {
                        fault_values,
                        mode_values,
                    },
                    offset,
                )
            }
            4 => {
                let mut end = expect_opening_tag(data, offset, 0)?;
                let start = end;
                loop {
                    let tag = peek_tag(data, end)?;
                    if tag.is_closing && tag.number == 0 {
                        break;
                    }
                    end = skip_value(data, end)?;
                }
                let fault_values = data[start..end].to_vec();
                let offset = expect_closing_tag(data, end, 0)?;
                (FaultParameter::State { fault_values }, offset)
            }
            5 | 7 => {
                let offset = expect_opening_tag(data, offset, 0)?;
                let (reference, offset) = DeviceObjectPropertyReference::decode(data, offset)?;
                let offset = expect_closing_tag(data, offset, 0)?;
                if choice == 5 {
                    (FaultParameter::StatusFlags { reference }, offset)
                } else {
                    (FaultParameter::Listed { reference }, offset)
                }
            }
            6 => {
                let (min, offset) = RangeValue::decode(data, offset, 0)?;
                let (max, offset) = RangeValue::decode(data, offset, 1)?;
                (FaultParameter::OutOfRange { min, max }, offset)
            }
            _ => return Err(unknown_choice(&opening, "fault parameter")),
        };

        let offset = expect_closing_tag(data, offset, choice)?;
        Ok((value, offset))
    }
}

// ---------------------------------------------------------------------------
// Priority arrays
// ---------------------------------------------------------------------------

/// One commandable slot value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriorityValue {
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    Enumerated(u32),
}

/// A commandable property's 16 priority slots. Index 0 is the highest
/// priority; a `None` slot is relinquished and encodes as Null.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PriorityArray {
    pub slots: [Option<PriorityValue>; 16],
}

impl PriorityArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set slot for BACnet priority `priority` (1..=16)
    pub fn set(&mut self, priority: u8, value: Option<PriorityValue>) -> Result<()> {
        if !(1..=16).contains(&priority) {
            return Err(EncodingError::ValueOutOfRange("priority"));
        }
        self.slots[priority as usize - 1] = value;
        Ok(())
    }

    /// The active value: the highest-priority non-relinquished slot,
    /// as `(priority 1..=16, value)`.
    pub fn resolve(&self) -> Option<(u8, PriorityValue)> {
        self.slots
            .iter()
            .enumerate()
            .find_map(|(i, slot)| slot.map(|value| (i as u8 + 1, value)))
    }

    /// Encode as exactly 16 consecutive application-tagged values
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(32);
        for slot in &self.slots {
            match slot {
                None => {
                    let _ = encode_application_null(&mut buffer);
                }
                Some(PriorityValue::Boolean(v)) => {
                    let _ = encode_application_boolean(&mut buffer, *v);
                }
                Some(PriorityValue::Unsigned(v)) => {
                    let _ = encode_application_unsigned(&mut buffer, *v);
                }
                Some(PriorityValue::Signed(v)) => {
                    let _ = encode_application_signed(&mut buffer, *v);
                }
                Some(PriorityValue::Real(v)) => {
                    let _ = encode_application_real(&mut buffer, *v);
                }
                Some(PriorityValue::Double(v)) => {
                    let _ = encode_application_double(&mut buffer, *v);
                }
                Some(PriorityValue::Enumerated(v)) => {
                    let _ = encode_application_enumerated(&mut buffer, *v);
                }
            }
        }
        buffer
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<(Self, usize)> {
        let mut array = Self::new();
        let mut offset = offset;
        for slot in array.slots.iter_mut() {
            let tag = peek_tag(data, offset)?;
            match tag.application_tag()? {
                ApplicationTag::Null => {
                    offset = decode_application_null(data, offset)?;
                    *slot = None;
                }
                ApplicationTag::Boolean => {
                    let (v, next) = super::decode_application_boolean(data, offset)?;
                    *slot = Some(PriorityValue::Boolean(v));
                    offset = next;
                }
                ApplicationTag::UnsignedInt => {
                    let (v, next) = decode_application_unsigned(data, offset)?;
                    *slot = Some(PriorityValue::Unsigned(v));
                    offset = next;
                }
                ApplicationTag::SignedInt => {
                    let (v, next) = super::decode_application_signed(data, offset)?;
                    *slot = Some(PriorityValue::Signed(v));
                    offset = next;
                }
                ApplicationTag::Real => {
                    let (v, next) = super::decode_application_real(data, offset)?;
                    *slot = Some(PriorityValue::Real(v));
                    offset = next;
                }
                ApplicationTag::Double => {
                    let (v, next) = super::decode_application_double(data, offset)?;
                    *slot = Some(PriorityValue::Double(v));
                    offset = next;
                }
                ApplicationTag::Enumerated => {
                    let (v, next) = decode_application_enumerated(data, offset)?;
                    *slot = Some(PriorityValue::Enumerated(v));
                    offset = next;
                }
                _ => {
                    return Err(EncodingError::InvalidFormat(
                        "unsupported priority array value type".into(),
                    ))
                }
            }
        }
        Ok((array, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{BacnetDate, BacnetTime};
    use super::*;

    #[test]
    fn test_datetime_round_trip() {
        let dt = BacnetDateTime::new(BacnetDate::new(2023, 6, 1, 4), BacnetTime::new(8, 30, 0, 0));
        let encoded = dt.encode();
        let (decoded, consumed) = BacnetDateTime::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, dt);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_timestamp_variants() {
        let cases = [
            TimeStamp::Time(BacnetTime::new(1, 2, 3, 4)),
            TimeStamp::Sequence(4711),
            TimeStamp::DateTime(BacnetDateTime::new(
                BacnetDate::new(2024, 12, 31, 2),
                BacnetTime::new(23, 59, 59, 99),
            )),
        ];
        for ts in cases {
            let encoded = ts.encode();
            let (decoded, consumed) = TimeStamp::decode(&encoded, 0).unwrap();
            assert_eq!(decoded, ts);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_timestamp_rejects_unknown_choice() {
        let mut buf = Vec::new();
        encode_context_unsigned(&mut buf, 5, 1).unwrap();
        assert!(TimeStamp::decode(&buf, 0).is_err());
    }

    #[test]
    fn test_choice_rejects_mismatched_closing_tag() {
        // Opening tag 2 closed with tag 3
        let mut buf = Vec::new();
        encode_opening_tag(&mut buf, 2).unwrap();
        let dt = BacnetDateTime::new(BacnetDate::new(2023, 1, 1, 7), BacnetTime::new(0, 0, 0, 0));
        buf.extend_from_slice(&dt.encode());
        encode_closing_tag(&mut buf, 3).unwrap();
        assert!(matches!(
            TimeStamp::decode(&buf, 0),
            Err(EncodingError::TagMismatch { expected: 2, found: 3 })
        ));
    }

    #[test]
    fn test_calendar_entry_variants() {
        let cases = [
            CalendarEntry::Date(BacnetDate::new(2024, 7, 4, 4)),
            CalendarEntry::DateRange(DateRange {
                start: BacnetDate::new(2024, 1, 1, 1),
                end: BacnetDate::new(2024, 1, 31, 3),
            }),
            CalendarEntry::WeekNDay(WeekNDay {
                month: 0xFF,
                week_of_month: 1,
                weekday: 5,
            }),
        ];
        for entry in cases {
            let encoded = entry.encode();
            let (decoded, consumed) = CalendarEntry::decode(&encoded, 0).unwrap();
            assert_eq!(decoded, entry);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_recipient_variants() {
        let device = Recipient::Device(ObjectIdentifier::new(8, 17));
        let encoded = device.encode();
        let (decoded, _) = Recipient::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, device);

        let address = Recipient::Address(BacnetAddress {
            network: Some(100),
            mac: vec![0xC0, 0xA8, 0x01, 0x01, 0xBA, 0xC0],
        });
        let encoded = address.encode();
        let (decoded, _) = Recipient::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, address);
    }

    #[test]
    fn test_value_source_variants() {
        let cases = [
            ValueSource::None,
            ValueSource::Object(DeviceObjectReference {
                device_identifier: Some(ObjectIdentifier::new(8, 1)),
                object_identifier: ObjectIdentifier::new(0, 5),
            }),
            ValueSource::Address(BacnetAddress {
                network: None,
                mac: vec![0x0A],
            }),
        ];
        for source in cases {
            let encoded = source.encode();
            let (decoded, consumed) = ValueSource::decode(&encoded, 0).unwrap();
            assert_eq!(decoded, source);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_device_object_property_reference_optional_fields() {
        let full = DeviceObjectPropertyReference {
            object_identifier: ObjectIdentifier::new(0, 1),
            property_identifier: 85,
            property_array_index: Some(3),
            device_identifier: Some(ObjectIdentifier::new(8, 99)),
        };
        let encoded = full.encode();
        let (decoded, _) = DeviceObjectPropertyReference::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, full);

        let minimal = DeviceObjectPropertyReference {
            object_identifier: ObjectIdentifier::new(0, 1),
            property_identifier: 85,
            property_array_index: None,
            device_identifier: None,
        };
        let encoded = minimal.encode();
        let (decoded, _) = DeviceObjectPropertyReference::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, minimal);
    }

    #[test]
    fn test_fault_parameter_variants() {
        let reference = DeviceObjectPropertyReference {
            object_identifier: ObjectIdentifier::new(5, 2),
            property_identifier: 111,
            property_array_index: None,
            device_identifier: None,
        };
        let mut raw_params = Vec::new();
        encode_application_unsigned(&mut raw_params, 12).unwrap();
        encode_application_real(&mut raw_params, 2.5).unwrap();

        let cases = [
            FaultParameter::None,
            FaultParameter::CharacterString {
                fault_values: vec!["FAULT".into(), "ALARM".into()],
            },
            FaultParameter::Extended {
                vendor_id: 555,
                extended_fault_type: 3,
                parameters: raw_params,
            },
            FaultParameter::LifeSafety {
                fault_values: vec![1, 2, 3],
                mode_values: vec![7],
            },
            FaultParameter::State {
                fault_values: {
                    let mut b = Vec::new();
                    encode_application_enumerated(&mut b, 4).unwrap();
                    b
                },
            },
            FaultParameter::StatusFlags {
                reference,
            },
            FaultParameter::OutOfRange {
                min: RangeValue::Real(-10.0),
                max: RangeValue::Real(90.5),
            },
            FaultParameter::Listed { reference },
        ];
        for param in cases {
            let encoded = param.encode();
            let (decoded, consumed) = FaultParameter::decode(&encoded, 0).unwrap();
            assert_eq!(decoded, param);
            assert_eq!(consumed, encoded.len(), "consumed all of {:?}", decoded);
        }
    }

    #[test]
    fn test_fault_parameter_unknown_choice() {
        let mut buf = Vec::new();
        encode_opening_tag(&mut buf, 9).unwrap();
        encode_closing_tag(&mut buf, 9).unwrap();
        assert!(FaultParameter::decode(&buf, 0).is_err());
    }

    #[test]
    fn test_priority_array_encoding() {
        let mut array = PriorityArray::new();
        array.set(8, Some(PriorityValue::Real(72.5))).unwrap();
        array.set(16, Some(PriorityValue::Real(68.0))).unwrap();

        let encoded = array.encode();
        // 14 Nulls at one byte each plus two 5-byte Reals
        assert_eq!(encoded.len(), 14 + 2 * 5);

        let (decoded, consumed) = PriorityArray::decode(&encoded, 0).unwrap();
        assert_eq!(decoded, array);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_priority_array_resolution_order() {
        let mut array = PriorityArray::new();
        assert_eq!(array.resolve(), None);

        array.set(10, Some(PriorityValue::Unsigned(1))).unwrap();
        array.set(4, Some(PriorityValue::Unsigned(2))).unwrap();
        // Lower index wins
        assert_eq!(array.resolve(), Some((4, PriorityValue::Unsigned(2))));

        array.set(4, None).unwrap();
        assert_eq!(array.resolve(), Some((10, PriorityValue::Unsigned(1))));
    }
}
