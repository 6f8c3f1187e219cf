//! BACnet Secure Connect (Annex AB)
//!
//! BVLC-SC frames over binary WebSockets: the frame codec and address
//! types here, the per-connection state machine in [`connection`], the
//! hub in [`hub`], and a [`crate::datalink::TransportPort`]
//! implementation for hub-connected nodes in [`node`].
//!
//! Every node has a 6-byte virtual MAC ([`ScVmac`]) and a device UUID.
//! Frames carry a function, control flags, a message ID, optional
//! destination and source VMACs, optional header options, and a
//! payload. Header options are parsed structurally and carried as raw
//! bytes; their semantics are not interpreted.

use std::error::Error;
use std::fmt;

use bitflags::bitflags;

pub mod connection;
pub mod hub;
pub mod node;

pub use connection::{ScConnection, ScConnectionConfig, ScConnectionRole, ScConnectionState};
pub use hub::ScHub;
pub use node::{ScNodeConfig, ScTransport};

/// Device identity carried in Connect-Request/Accept
pub type DeviceUuid = uuid::Uuid;

/// Result type for BACnet/SC operations
pub type Result<T> = std::result::Result<T, ScError>;

/// Error class "communication" (Clause 21)
pub const ERROR_CLASS_COMMUNICATION: u16 = 7;
/// Error code node-duplicate-VMAC (Clause 21)
pub const ERROR_CODE_NODE_DUPLICATE_VMAC: u16 = 0x0071;

/// Default largest BVLC-SC frame we offer
pub const SC_DEFAULT_MAX_BVLC: u16 = 1600;
/// Default largest NPDU we offer
pub const SC_DEFAULT_MAX_NPDU: u16 = 1497;

/// Errors that can occur in the BACnet/SC layer
#[derive(Debug, Clone, PartialEq)]
pub enum ScError {
    /// Frame failed structural validation
    InvalidFrame(String),
    /// Function octet not defined by Annex AB
    UnknownFunction(u8),
    /// Operation illegal in the current connection state
    InvalidState(String),
    /// The connection is not in the Connected state
    NotConnected,
    /// WebSocket-level failure
    WebSocket(String),
    /// A handshake step did not complete in time
    Timeout,
    /// The peer closed the socket
    Closed,
    /// The hub refused our VMAC as a duplicate
    DuplicateVmac,
}

impl fmt::Display for ScError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScError::InvalidFrame(msg) => write!(f, "Invalid BVLC-SC frame: {}", msg),
            ScError::UnknownFunction(code) => {
                write!(f, "Unknown BVLC-SC function 0x{:02X}", code)
            }
            ScError::InvalidState(msg) => write!(f, "Invalid connection state: {}", msg),
            ScError::NotConnected => write!(f, "Connection is not established"),
            ScError::WebSocket(msg) => write!(f, "WebSocket error: {}", msg),
            ScError::Timeout => write!(f, "BACnet/SC operation timed out"),
            ScError::Closed => write!(f, "Connection closed by peer"),
            ScError::DuplicateVmac => write!(f, "VMAC rejected as duplicate"),
        }
    }
}

impl Error for ScError {}

impl From<ScError> for super::DataLinkError {
    fn from(e: ScError) -> Self {
        match e {
            ScError::Timeout => super::DataLinkError::Timeout,
            ScError::Closed | ScError::NotConnected => super::DataLinkError::ConnectionClosed,
            other => super::DataLinkError::InvalidFrame(other.to_string()),
        }
    }
}

/// A 6-byte BACnet/SC virtual MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScVmac(pub [u8; 6]);

impl ScVmac {
    /// The local broadcast VMAC
    pub const BROADCAST: ScVmac = ScVmac([0xFF; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 6 {
            return Err(ScError::InvalidFrame(format!(
                "VMAC must be 6 bytes, got {}",
                bytes.len()
            )));
        }
        let mut vmac = [0u8; 6];
        vmac.copy_from_slice(bytes);
        Ok(Self(vmac))
    }

    /// A random VMAC with the locally-administered bit set and the
    /// group bit clear (AB.1.5.2).
    pub fn random() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let mut vmac = [0u8; 6];
        vmac.copy_from_slice(&uuid.as_bytes()[..6]);
        vmac[0] = (vmac[0] | 0x02) & !0x01;
        Self(vmac)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for ScVmac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// BVLC-SC function codes (AB.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvlcScFunction {
    Result = 0x00,
    EncapsulatedNpdu = 0x01,
    AddressResolution = 0x02,
    AddressResolutionAck = 0x03,
    Advertisement = 0x04,
    AdvertisementSolicitation = 0x05,
    ConnectRequest = 0x06,
    ConnectAccept = 0x07,
    DisconnectRequest = 0x08,
    DisconnectAck = 0x09,
    HeartbeatRequest = 0x0A,
    HeartbeatAck = 0x0B,
}

impl BvlcScFunction {
    /// Response functions never elicit a BVLC-Result, even when
    /// malformed (AB.3.1.4); answering them would loop NAKs forever.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            BvlcScFunction::Result
                | BvlcScFunction::ConnectAccept
                | BvlcScFunction::DisconnectAck
                | BvlcScFunction::HeartbeatAck
                | BvlcScFunction::AddressResolutionAck
        )
    }
}

impl TryFrom<u8> for BvlcScFunction {
    type Error = ScError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(BvlcScFunction::Result),
            0x01 => Ok(BvlcScFunction::EncapsulatedNpdu),
            0x02 => Ok(BvlcScFunction::AddressResolution),
            0x03 => Ok(BvlcScFunction::AddressResolutionAck),
            0x04 => Ok(BvlcScFunction::Advertisement),
            0x05 => Ok(BvlcScFunction::AdvertisementSolicitation),
            0x06 => Ok(BvlcScFunction::ConnectRequest),
            0x07 => Ok(BvlcScFunction::ConnectAccept),
            0x08 => Ok(BvlcScFunction::DisconnectRequest),
            0x09 => Ok(BvlcScFunction::DisconnectAck),
            0x0A => Ok(BvlcScFunction::HeartbeatRequest),
            0x0B => Ok(BvlcScFunction::HeartbeatAck),
            other => Err(ScError::UnknownFunction(other)),
        }
    }
}

bitflags! {
    /// Control octet of a BVLC-SC frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScControlFlags: u8 {
        const DATA_OPTIONS = 0b0000_0001;
        const SOURCE_VMAC = 0b0000_0010;
        const DEST_VMAC = 0b0000_0100;
    }
}

/// Header-option marker bits: more options follow / option data present
const OPTION_MORE: u8 = 0x80;
const OPTION_DATA: u8 = 0x20;

/// Walk a header-option list starting at `offset`, returning the offset
/// just past it. Option semantics are not interpreted.
fn skip_header_options(data: &[u8], mut offset: usize) -> Result<usize> {
    loop {
        let marker = *data
            .get(offset)
            .ok_or_else(|| ScError::InvalidFrame("truncated header option".into()))?;
        offset += 1;
        if marker & OPTION_DATA != 0 {
            if offset + 2 > data.len() {
                return Err(ScError::InvalidFrame("truncated option length".into()));
            }
            let length = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            offset += 2;
            if offset + length > data.len() {
                return Err(ScError::InvalidFrame("option data exceeds frame".into()));
            }
            offset += length;
        }
        if marker & OPTION_MORE == 0 {
            return Ok(offset);
        }
    }
}

/// A BVLC-SC message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScMessage {
    pub function: BvlcScFunction,
    pub message_id: u16,
    pub destination: Option<ScVmac>,
    pub source: Option<ScVmac>,
    /// Raw header-option bytes, preserved but not interpreted
    pub data_options: Vec<u8>,
    pub payload: Vec<u8>,
}

impl ScMessage {
    pub fn new(function: BvlcScFunction, message_id: u16) -> Self {
        Self {
            function,
            message_id,
            destination: None,
            source: None,
            data_options: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_payload(function: BvlcScFunction, message_id: u16, payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::new(function, message_id)
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = ScControlFlags::empty();
        if self.destination.is_some() {
            flags |= ScControlFlags::DEST_VMAC;
        }
        if self.source.is_some() {
            flags |= ScControlFlags::SOURCE_VMAC;
        }
        if !self.data_options.is_empty() {
            flags |= ScControlFlags::DATA_OPTIONS;
        }

        let mut frame = Vec::with_capacity(4 + 12 + self.payload.len());
        frame.push(self.function as u8);
        frame.push(flags.bits());
        frame.extend_from_slice(&self.message_id.to_be_bytes());
        if let Some(destination) = &self.destination {
            frame.extend_from_slice(destination.as_bytes());
        }
        if let Some(source) = &self.source {
            frame.extend_from_slice(source.as_bytes());
        }
        frame.extend_from_slice(&self.data_options);
        frame.extend_from_slice(&self.payload);
        frame
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(ScError::InvalidFrame("frame shorter than header".into()));
        }
        let function = BvlcScFunction::try_from(data[0])?;
        let flags = ScControlFlags::from_bits(data[1])
            .ok_or_else(|| ScError::InvalidFrame(format!("reserved control bits 0x{:02X}", data[1])))?;
        let message_id = u16::from_be_bytes([data[2], data[3]]);
        let mut offset = 4;

        let destination = if flags.contains(ScControlFlags::DEST_VMAC) {
            if offset + 6 > data.len() {
                return Err(ScError::InvalidFrame("truncated destination VMAC".into()));
            }
            let vmac = ScVmac::from_slice(&data[offset..offset + 6])?;
            offset += 6;
            Some(vmac)
        } else {
            None
        };

        let source = if flags.contains(ScControlFlags::SOURCE_VMAC) {
            if offset + 6 > data.len() {
                return Err(ScError::InvalidFrame("truncated source VMAC".into()));
            }
            let vmac = ScVmac::from_slice(&data[offset..offset + 6])?;
            offset += 6;
            Some(vmac)
        } else {
            None
        };

        let data_options = if flags.contains(ScControlFlags::DATA_OPTIONS) {
            let end = skip_header_options(data, offset)?;
            let options = data[offset..end].to_vec();
            offset = end;
            options
        } else {
            Vec::new()
        };

        Ok(Self {
            function,
            message_id,
            destination,
            source,
            data_options,
            payload: data[offset..].to_vec(),
        })
    }

    /// Read only the destination VMAC out of a raw frame, so a hub can
    /// route without a full decode. `None` means the frame is too
    /// mangled to route.
    pub fn peek_destination(data: &[u8]) -> Option<Option<ScVmac>> {
        if data.len() < 4 {
            return None;
        }
        let flags = ScControlFlags::from_bits(data[1])?;
        if !flags.contains(ScControlFlags::DEST_VMAC) {
            return Some(None);
        }
        ScVmac::from_slice(data.get(4..10)?).ok().map(Some)
    }
}

/// Payload of Connect-Request and Connect-Accept (AB.2.6): VMAC, UUID,
/// max BVLC length, max NPDU length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectPayload {
    pub vmac: ScVmac,
    pub uuid: DeviceUuid,
    pub max_bvlc_length: u16,
    pub max_npdu_length: u16,
}

impl ConnectPayload {
    pub const WIRE_SIZE: usize = 26;

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(Self::WIRE_SIZE);
        payload.extend_from_slice(self.vmac.as_bytes());
        payload.extend_from_slice(self.uuid.as_bytes());
        payload.extend_from_slice(&self.max_bvlc_length.to_be_bytes());
        payload.extend_from_slice(&self.max_npdu_length.to_be_bytes());
        payload
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::WIRE_SIZE {
            return Err(ScError::InvalidFrame("short connect payload".into()));
        }
        let vmac = ScVmac::from_slice(&data[..6])?;
        let uuid = DeviceUuid::from_slice(&data[6..22])
            .map_err(|_| ScError::InvalidFrame("bad device UUID".into()))?;
        Ok(Self {
            vmac,
            uuid,
            max_bvlc_length: u16::from_be_bytes([data[22], data[23]]),
            max_npdu_length: u16::from_be_bytes([data[24], data[25]]),
        })
    }
}

/// Payload of a BVLC-Result (AB.2.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScResultPayload {
    /// Function the result responds to
    pub for_function: u8,
    pub nak: bool,
    pub error_header_marker: u8,
    pub error_class: u16,
    pub error_code: u16,
    pub error_details: String,
}

impl ScResultPayload {
    pub fn ack(for_function: BvlcScFunction) -> Self {
        Self {
            for_function: for_function as u8,
            nak: false,
            error_header_marker: 0,
            error_class: 0,
            error_code: 0,
            error_details: String::new(),
        }
    }

    pub fn nak(
        for_function: u8,
        error_class: u16,
        error_code: u16,
        error_details: impl Into<String>,
    ) -> Self {
        Self {
            for_function,
            nak: true,
            error_header_marker: 0,
            error_class,
            error_code,
            error_details: error_details.into(),
        }
    }

    /// The NAK a hub sends for a colliding VMAC
    pub fn duplicate_vmac(for_function: BvlcScFunction) -> Self {
        Self::nak(
            for_function as u8,
            ERROR_CLASS_COMMUNICATION,
            ERROR_CODE_NODE_DUPLICATE_VMAC,
            "",
        )
    }

    pub fn is_duplicate_vmac(&self) -> bool {
        self.nak && self.error_code == ERROR_CODE_NODE_DUPLICATE_VMAC
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = vec![self.for_function, u8::from(self.nak)];
        if self.nak {
            payload.push(self.error_header_marker);
            payload.extend_from_slice(&self.error_class.to_be_bytes());
            payload.extend_from_slice(&self.error_code.to_be_bytes());
            payload.extend_from_slice(self.error_details.as_bytes());
        }
        payload
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(ScError::InvalidFrame("short result payload".into()));
        }
        let for_function = data[0];
        let nak = data[1] != 0;
        if !nak {
            return Ok(Self {
                for_function,
                nak,
                error_header_marker: 0,
                error_class: 0,
                error_code: 0,
                error_details: String::new(),
            });
        }
        if data.len() < 7 {
            return Err(ScError::InvalidFrame("short NAK payload".into()));
        }
        Ok(Self {
            for_function,
            nak,
            error_header_marker: data[2],
            error_class: u16::from_be_bytes([data[3], data[4]]),
            error_code: u16::from_be_bytes([data[5], data[6]]),
            error_details: String::from_utf8_lossy(&data[7..]).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmac_random_bits() {
        for _ in 0..16 {
            let vmac = ScVmac::random();
            assert_eq!(vmac.0[0] & 0x02, 0x02, "locally administered");
            assert_eq!(vmac.0[0] & 0x01, 0x00, "unicast");
            assert!(!vmac.is_broadcast());
        }
    }

    #[test]
    fn test_vmac_display() {
        let vmac = ScVmac::new([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03]);
        assert_eq!(format!("{}", vmac), "AA:BB:CC:01:02:03");
        assert!(ScVmac::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_message_round_trip_all_fields() {
        let message = ScMessage {
            function: BvlcScFunction::EncapsulatedNpdu,
            message_id: 0x1234,
            destination: Some(ScVmac::new([1, 2, 3, 4, 5, 6])),
            source: Some(ScVmac::new([7, 8, 9, 10, 11, 12])),
            data_options: vec![],
            payload: vec![0x01, 0x00, 0xAA],
        };
        let encoded = message.encode();
        assert_eq!(encoded[0], 0x01);
        assert_eq!(encoded[1], 0x06); // dest + source flags
        assert_eq!(&encoded[2..4], &[0x12, 0x34]);
        assert_eq!(ScMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_message_minimal() {
        let message = ScMessage::new(BvlcScFunction::HeartbeatRequest, 7);
        let encoded = message.encode();
        assert_eq!(encoded, vec![0x0A, 0x00, 0x00, 0x07]);
        assert_eq!(ScMessage::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_header_options_skipped_and_preserved() {
        // One option with data (marker 0x20, length 2), final
        let mut frame = vec![0x01, 0x01, 0x00, 0x01];
        frame.extend_from_slice(&[0x20, 0x00, 0x02, 0xDE, 0xAD]);
        frame.extend_from_slice(&[0x55, 0x66]);

        let message = ScMessage::decode(&frame).unwrap();
        assert_eq!(message.data_options, vec![0x20, 0x00, 0x02, 0xDE, 0xAD]);
        assert_eq!(message.payload, vec![0x55, 0x66]);
        // Raw options ride along unchanged on re-encode
        assert_eq!(message.encode(), frame);
    }

    #[test]
    fn test_header_options_chain() {
        // marker with MORE set and no data, then a final marker with data
        let mut frame = vec![0x01, 0x01, 0x00, 0x01];
        frame.extend_from_slice(&[0x80, 0x20, 0x00, 0x01, 0xFF]);
        let message = ScMessage::decode(&frame).unwrap();
        assert_eq!(message.data_options.len(), 5);
        assert!(message.payload.is_empty());

        // Truncated option data is malformed
        let bad = vec![0x01, 0x01, 0x00, 0x01, 0x20, 0x00, 0x05, 0x01];
        assert!(ScMessage::decode(&bad).is_err());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(ScMessage::decode(&[0x01, 0x00, 0x00]).is_err());
        assert!(matches!(
            ScMessage::decode(&[0x42, 0x00, 0x00, 0x01]),
            Err(ScError::UnknownFunction(0x42))
        ));
        // Reserved control bit
        assert!(ScMessage::decode(&[0x01, 0x80, 0x00, 0x01]).is_err());
        // Destination flag set but VMAC missing
        assert!(ScMessage::decode(&[0x01, 0x04, 0x00, 0x01, 0xAA]).is_err());
    }

    #[test]
    fn test_peek_destination() {
        let unicast = ScMessage {
            destination: Some(ScVmac::new([9; 6])),
            ..ScMessage::new(BvlcScFunction::EncapsulatedNpdu, 1)
        };
        assert_eq!(
            ScMessage::peek_destination(&unicast.encode()),
            Some(Some(ScVmac::new([9; 6])))
        );

        let plain = ScMessage::new(BvlcScFunction::HeartbeatRequest, 1);
        assert_eq!(ScMessage::peek_destination(&plain.encode()), Some(None));
        assert_eq!(ScMessage::peek_destination(&[0x01]), None);
    }

    #[test]
    fn test_connect_payload_round_trip() {
        let payload = ConnectPayload {
            vmac: ScVmac::random(),
            uuid: DeviceUuid::new_v4(),
            max_bvlc_length: 1600,
            max_npdu_length: 1497,
        };
        let encoded = payload.encode();
        assert_eq!(encoded.len(), ConnectPayload::WIRE_SIZE);
        assert_eq!(ConnectPayload::decode(&encoded).unwrap(), payload);
        assert!(ConnectPayload::decode(&encoded[..20]).is_err());
    }

    #[test]
    fn test_result_payload_round_trip() {
        let ack = ScResultPayload::ack(BvlcScFunction::ConnectRequest);
        let decoded = ScResultPayload::decode(&ack.encode()).unwrap();
        assert!(!decoded.nak);
        assert_eq!(decoded.for_function, 0x06);

        let nak = ScResultPayload::duplicate_vmac(BvlcScFunction::ConnectRequest);
        let decoded = ScResultPayload::decode(&nak.encode()).unwrap();
        assert!(decoded.is_duplicate_vmac());
        assert_eq!(decoded.error_class, ERROR_CLASS_COMMUNICATION);
        assert_eq!(decoded.error_code, ERROR_CODE_NODE_DUPLICATE_VMAC);
    }

    #[test]
    fn test_response_functions() {
        assert!(BvlcScFunction::Result.is_response());
        assert!(BvlcScFunction::HeartbeatAck.is_response());
        assert!(!BvlcScFunction::ConnectRequest.is_response());
        assert!(!BvlcScFunction::EncapsulatedNpdu.is_response());
    }
}
