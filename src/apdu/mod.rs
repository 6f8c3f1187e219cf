//! BACnet Application Layer PDUs
//!
//! Encoding and decoding of the APDU variants of ASHRAE 135 Clause 20.1:
//! Confirmed-Request, Unconfirmed-Request, Simple-ACK, Complex-ACK,
//! Segment-ACK, Error, Reject, and Abort.
//!
//! The first byte of every APDU carries the PDU type in the high nibble
//! and control flags in the low nibble. Confirmed-Request and
//! Complex-ACK grow a one-byte sequence number and proposed window size
//! when the segmented flag is set; Confirmed-Request additionally
//! carries the sender's max-segments and max-APDU capabilities in its
//! second byte.

use std::error::Error;
use std::fmt;

use crate::encoding::{
    decode_application_enumerated, encode_application_enumerated, EncodingError,
};
use crate::generate_custom_enum;

/// Result type for APDU operations
pub type Result<T> = std::result::Result<T, ApduError>;

/// Errors that can occur while encoding or decoding APDUs
#[derive(Debug, Clone, PartialEq)]
pub enum ApduError {
    /// Buffer ended before the fixed header was complete
    Truncated(usize),
    /// High nibble of the first byte is not a known PDU type
    UnknownPduType(u8),
    /// Flag combination forbidden by the standard
    MalformedFlags(&'static str),
    /// Reserved capability nibble
    InvalidMaxApdu(u8),
    /// Embedded value failed to decode
    Encoding(EncodingError),
}

impl fmt::Display for ApduError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApduError::Truncated(pos) => write!(f, "APDU truncated at offset {}", pos),
            ApduError::UnknownPduType(t) => write!(f, "Unknown APDU type {}", t),
            ApduError::MalformedFlags(msg) => write!(f, "Malformed APDU flags: {}", msg),
            ApduError::InvalidMaxApdu(nibble) => {
                write!(f, "Reserved max-APDU nibble {}", nibble)
            }
            ApduError::Encoding(e) => write!(f, "APDU encoding error: {}", e),
        }
    }
}

impl Error for ApduError {}

impl From<EncodingError> for ApduError {
    fn from(e: EncodingError) -> Self {
        ApduError::Encoding(e)
    }
}

impl ApduError {
    /// The abort reason a peer should receive for this decode failure
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            ApduError::MalformedFlags(_) => AbortReason::InvalidApduInThisState,
            _ => AbortReason::Other,
        }
    }
}

generate_custom_enum! {
    /// Why a request was rejected before any service processing
    /// (Clause 18.8). Values 64..255 are vendor-proprietary.
    RejectReason {
        Other = 0,
        BufferOverflow = 1,
        InconsistentParameters = 2,
        InvalidParameterDataType = 3,
        InvalidTag = 4,
        MissingRequiredParameter = 5,
        ParameterOutOfRange = 6,
        TooManyArguments = 7,
        UndefinedEnumeration = 8,
        UnrecognizedService = 9,
    },
    u8,
    64..=255
}

generate_custom_enum! {
    /// Why a transaction was aborted (Clause 18.9). Values 64..255 are
    /// vendor-proprietary; `CommunicationDisabled` is the local code
    /// (first vendor value) for "the transport under this transaction
    /// went away".
    AbortReason {
        Other = 0,
        BufferOverflow = 1,
        InvalidApduInThisState = 2,
        PreemptedByHigherPriorityTask = 3,
        SegmentationNotSupported = 4,
        SecurityError = 5,
        InsufficientSecurity = 6,
        WindowSizeOutOfRange = 7,
        ApplicationExceededReplyTime = 8,
        OutOfResources = 9,
        TsmTimeout = 10,
        ApduTooLong = 11,
        CommunicationDisabled = 64,
    },
    u8,
    65..=255
}

/// Max-APDU capability nibble (Clause 20.1.2.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum MaxApdu {
    Octets50 = 0,
    Octets128 = 1,
    Octets206 = 2,
    Octets480 = 3,
    Octets1024 = 4,
    Octets1476 = 5,
}

impl MaxApdu {
    pub fn try_from_nibble(nibble: u8) -> Result<Self> {
        match nibble {
            0 => Ok(MaxApdu::Octets50),
            1 => Ok(MaxApdu::Octets128),
            2 => Ok(MaxApdu::Octets206),
            3 => Ok(MaxApdu::Octets480),
            4 => Ok(MaxApdu::Octets1024),
            5 => Ok(MaxApdu::Octets1476),
            n => Err(ApduError::InvalidMaxApdu(n)),
        }
    }

    pub fn nibble(&self) -> u8 {
        *self as u8
    }

    /// Octet count this capability advertises
    pub fn octets(&self) -> usize {
        match self {
            MaxApdu::Octets50 => 50,
            MaxApdu::Octets128 => 128,
            MaxApdu::Octets206 => 206,
            MaxApdu::Octets480 => 480,
            MaxApdu::Octets1024 => 1024,
            MaxApdu::Octets1476 => 1476,
        }
    }

    /// The largest standard capability not exceeding `limit` octets
    pub fn fitting(limit: usize) -> Self {
        [
            MaxApdu::Octets1476,
            MaxApdu::Octets1024,
            MaxApdu::Octets480,
            MaxApdu::Octets206,
            MaxApdu::Octets128,
        ]
        .into_iter()
        .find(|m| m.octets() <= limit)
        .unwrap_or(MaxApdu::Octets50)
    }
}

/// Max-segments-accepted nibble, log2-encoded with 7 = unlimited
/// (Clause 20.1.2.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum MaxSegments {
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    Unlimited = 7,
}

impl MaxSegments {
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x07 {
            0 => MaxSegments::Unspecified,
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            _ => MaxSegments::Unlimited,
        }
    }

    pub fn nibble(&self) -> u8 {
        *self as u8
    }

    /// Segment cap, or `None` when unlimited or unspecified
    pub fn count(&self) -> Option<u32> {
        match self {
            MaxSegments::Unspecified | MaxSegments::Unlimited => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
        }
    }
}

/// BACnet-Confirmed-Request-PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedRequest {
    pub segmented: bool,
    pub more_follows: bool,
    pub segmented_response_accepted: bool,
    pub max_segments: MaxSegments,
    pub max_apdu: MaxApdu,
    pub invoke_id: u8,
    /// Present only when `segmented`
    pub sequence_number: Option<u8>,
    /// Present only when `segmented`
    pub proposed_window_size: Option<u8>,
    pub service_choice: u8,
    pub service_data: Vec<u8>,
}

impl ConfirmedRequest {
    /// An unsegmented request advertising our receive capabilities
    pub fn new(
        invoke_id: u8,
        service_choice: u8,
        service_data: Vec<u8>,
        max_segments: MaxSegments,
        max_apdu: MaxApdu,
    ) -> Self {
        Self {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments,
            max_apdu,
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice,
            service_data,
        }
    }
}

/// BACnet-Complex-ACK-PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplexAck {
    pub segmented: bool,
    pub more_follows: bool,
    pub invoke_id: u8,
    pub sequence_number: Option<u8>,
    pub proposed_window_size: Option<u8>,
    pub service_choice: u8,
    pub service_data: Vec<u8>,
}

impl ComplexAck {
    pub fn new(invoke_id: u8, service_choice: u8, service_data: Vec<u8>) -> Self {
        Self {
            segmented: false,
            more_follows: false,
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice,
            service_data,
        }
    }
}

/// The eight APDU variants as a tagged union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    ConfirmedRequest(ConfirmedRequest),
    UnconfirmedRequest {
        service_choice: u8,
        service_data: Vec<u8>,
    },
    SimpleAck {
        invoke_id: u8,
        service_choice: u8,
    },
    ComplexAck(ComplexAck),
    SegmentAck {
        negative_ack: bool,
        /// Set when the ACK was sent by the responding (server) side
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
    },
    Error {
        invoke_id: u8,
        service_choice: u8,
        /// Service-specific error production, usually class + code
        error_data: Vec<u8>,
    },
    Reject {
        invoke_id: u8,
        reason: RejectReason,
    },
    Abort {
        /// Set when the abort was sent by the responding (server) side
        server: bool,
        invoke_id: u8,
        reason: AbortReason,
    },
}

const PDU_TYPE_CONFIRMED_REQUEST: u8 = 0x0;
const PDU_TYPE_UNCONFIRMED_REQUEST: u8 = 0x1;
const PDU_TYPE_SIMPLE_ACK: u8 = 0x2;
const PDU_TYPE_COMPLEX_ACK: u8 = 0x3;
const PDU_TYPE_SEGMENT_ACK: u8 = 0x4;
const PDU_TYPE_ERROR: u8 = 0x5;
const PDU_TYPE_REJECT: u8 = 0x6;
const PDU_TYPE_ABORT: u8 = 0x7;

impl Apdu {
    /// The invoke ID, for every variant that carries one
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest(req) => Some(req.invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::ComplexAck(ack) => Some(ack.invoke_id),
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(8);
        match self {
            Apdu::ConfirmedRequest(req) => {
                let mut first = PDU_TYPE_CONFIRMED_REQUEST << 4;
                if req.segmented {
                    first |= 0x08;
                }
                if req.more_follows {
                    first |= 0x04;
                }
                if req.segmented_response_accepted {
                    first |= 0x02;
                }
                buffer.push(first);
                buffer.push((req.max_segments.nibble() << 4) | req.max_apdu.nibble());
                buffer.push(req.invoke_id);
                if req.segmented {
                    buffer.push(req.sequence_number.unwrap_or(0));
                    buffer.push(req.proposed_window_size.unwrap_or(1));
                }
                buffer.push(req.service_choice);
                buffer.extend_from_slice(&req.service_data);
            }
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push(PDU_TYPE_UNCONFIRMED_REQUEST << 4);
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }
            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.push(PDU_TYPE_SIMPLE_ACK << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
            }
            Apdu::ComplexAck(ack) => {
                let mut first = PDU_TYPE_COMPLEX_ACK << 4;
                if ack.segmented {
                    first |= 0x08;
                }
                if ack.more_follows {
                    first |= 0x04;
                }
                buffer.push(first);
                buffer.push(ack.invoke_id);
                if ack.segmented {
                    buffer.push(ack.sequence_number.unwrap_or(0));
                    buffer.push(ack.proposed_window_size.unwrap_or(1));
                }
                buffer.push(ack.service_choice);
                buffer.extend_from_slice(&ack.service_data);
            }
            Apdu::SegmentAck {
                negative_ack,
                server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                let mut first = PDU_TYPE_SEGMENT_ACK << 4;
                if *negative_ack {
                    first |= 0x02;
                }
                if *server {
                    first |= 0x01;
                }
                buffer.push(first);
                buffer.push(*invoke_id);
                buffer.push(*sequence_number);
                buffer.push(*actual_window_size);
            }
            Apdu::Error {
                invoke_id,
                service_choice,
                error_data,
            } => {
                buffer.push(PDU_TYPE_ERROR << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
                buffer.extend_from_slice(error_data);
            }
            Apdu::Reject { invoke_id, reason } => {
                buffer.push(PDU_TYPE_REJECT << 4);
                buffer.push(*invoke_id);
                buffer.push(u8::from(*reason));
            }
            Apdu::Abort {
                server,
                invoke_id,
                reason,
            } => {
                buffer.push((PDU_TYPE_ABORT << 4) | u8::from(*server));
                buffer.push(*invoke_id);
                buffer.push(u8::from(*reason));
            }
        }
        buffer
    }

    /// Decode wire bytes into an APDU variant
    pub fn decode(data: &[u8]) -> Result<Apdu> {
        if data.is_empty() {
            return Err(ApduError::Truncated(0));
        }
        let first = data[0];
        match first >> 4 {
            PDU_TYPE_CONFIRMED_REQUEST => {
                let segmented = first & 0x08 != 0;
                let more_follows = first & 0x04 != 0;
                let segmented_response_accepted = first & 0x02 != 0;
                if more_follows && !segmented {
                    return Err(ApduError::MalformedFlags("more-follows without segmented"));
                }
                let fixed = if segmented { 6 } else { 4 };
                if data.len() < fixed {
                    return Err(ApduError::Truncated(data.len()));
                }
                let max_segments = MaxSegments::from_nibble(data[1] >> 4);
                let max_apdu = MaxApdu::try_from_nibble(data[1] & 0x0F)?;
                let invoke_id = data[2];
                let (sequence_number, proposed_window_size, choice_at) = if segmented {
                    (Some(data[3]), Some(data[4]), 5)
                } else {
                    (None, None, 3)
                };
                Ok(Apdu::ConfirmedRequest(ConfirmedRequest {
                    segmented,
                    more_follows,
                    segmented_response_accepted,
                    max_segments,
                    max_apdu,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[choice_at],
                    service_data: data[choice_at + 1..].to_vec(),
                }))
            }
            PDU_TYPE_UNCONFIRMED_REQUEST => {
                if data.len() < 2 {
                    return Err(ApduError::Truncated(data.len()));
                }
                Ok(Apdu::UnconfirmedRequest {
                    service_choice: data[1],
                    service_data: data[2..].to_vec(),
                })
            }
            PDU_TYPE_SIMPLE_ACK => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated(data.len()));
                }
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }
            PDU_TYPE_COMPLEX_ACK => {
                let segmented = first & 0x08 != 0;
                let more_follows = first & 0x04 != 0;
                if more_follows && !segmented {
                    return Err(ApduError::MalformedFlags("more-follows without segmented"));
                }
                let fixed = if segmented { 5 } else { 3 };
                if data.len() < fixed {
                    return Err(ApduError::Truncated(data.len()));
                }
                let invoke_id = data[1];
                let (sequence_number, proposed_window_size, choice_at) = if segmented {
                    (Some(data[2]), Some(data[3]), 4)
                } else {
                    (None, None, 2)
                };
                Ok(Apdu::ComplexAck(ComplexAck {
                    segmented,
                    more_follows,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice: data[choice_at],
                    service_data: data[choice_at + 1..].to_vec(),
                }))
            }
            PDU_TYPE_SEGMENT_ACK => {
                if data.len() < 4 {
                    return Err(ApduError::Truncated(data.len()));
                }
                Ok(Apdu::SegmentAck {
                    negative_ack: first & 0x02 != 0,
                    server: first & 0x01 != 0,
                    invoke_id: data[1],
                    sequence_number: data[2],
                    actual_window_size: data[3],
                })
            }
            PDU_TYPE_ERROR => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated(data.len()));
                }
                Ok(Apdu::Error {
                    invoke_id: data[1],
                    service_choice: data[2],
                    error_data: data[3..].to_vec(),
                })
            }
            PDU_TYPE_REJECT => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated(data.len()));
                }
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reason: RejectReason::from(data[2]),
                })
            }
            PDU_TYPE_ABORT => {
                if data.len() < 3 {
                    return Err(ApduError::Truncated(data.len()));
                }
                Ok(Apdu::Abort {
                    server: first & 0x01 != 0,
                    invoke_id: data[1],
                    reason: AbortReason::from(data[2]),
                })
            }
            t => Err(ApduError::UnknownPduType(t)),
        }
    }
}

/// Encode the common `Error ::= SEQUENCE { error-class, error-code }`
/// production carried by Error PDUs.
pub fn encode_error_class_code(error_class: u32, error_code: u32) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(4);
    let _ = encode_application_enumerated(&mut buffer, error_class);
    let _ = encode_application_enumerated(&mut buffer, error_code);
    buffer
}

/// Decode error-class and error-code from an Error PDU's service data.
pub fn decode_error_class_code(error_data: &[u8]) -> Result<(u32, u32)> {
    let (class, offset) = decode_application_enumerated(error_data, 0)?;
    let (code, _) = decode_application_enumerated(error_data, offset)?;
    Ok((class, code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_request_unsegmented() {
        let req = ConfirmedRequest::new(
            1,
            12,
            vec![0x0C, 0x02, 0x00, 0x00, 0x08],
            MaxSegments::Unlimited,
            MaxApdu::Octets1476,
        );
        let encoded = Apdu::ConfirmedRequest(req.clone()).encode();
        assert_eq!(&encoded[..4], &[0x02, 0x75, 0x01, 0x0C]);

        match Apdu::decode(&encoded).unwrap() {
            Apdu::ConfirmedRequest(decoded) => assert_eq!(decoded, req),
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_confirmed_request_segmented() {
        let req = ConfirmedRequest {
            segmented: true,
            more_follows: true,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Sixteen,
            max_apdu: MaxApdu::Octets480,
            invoke_id: 77,
            sequence_number: Some(2),
            proposed_window_size: Some(4),
            service_choice: 12,
            service_data: vec![0xAA; 10],
        };
        let encoded = Apdu::ConfirmedRequest(req.clone()).encode();
        assert_eq!(encoded[0], 0x0E);
        assert_eq!(encoded[1], 0x43);
        assert_eq!(&encoded[2..6], &[77, 2, 4, 12]);

        match Apdu::decode(&encoded).unwrap() {
            Apdu::ConfirmedRequest(decoded) => assert_eq!(decoded, req),
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_more_follows_without_segmented_rejected() {
        // Confirmed-Request with MOR set but SEG clear
        let err = Apdu::decode(&[0x04, 0x75, 0x01, 0x0C]).unwrap_err();
        assert!(matches!(err, ApduError::MalformedFlags(_)));
        assert_eq!(err.abort_reason(), AbortReason::InvalidApduInThisState);

        // Same rule for Complex-ACK
        let err = Apdu::decode(&[0x34, 0x01, 0x0C]).unwrap_err();
        assert!(matches!(err, ApduError::MalformedFlags(_)));
    }

    #[test]
    fn test_unknown_pdu_type() {
        let err = Apdu::decode(&[0x80, 0x00, 0x00]).unwrap_err();
        assert_eq!(err, ApduError::UnknownPduType(8));
        assert_eq!(err.abort_reason(), AbortReason::Other);
    }

    #[test]
    fn test_simple_ack_round_trip() {
        let apdu = Apdu::SimpleAck {
            invoke_id: 9,
            service_choice: 15,
        };
        let encoded = apdu.encode();
        assert_eq!(encoded, vec![0x20, 9, 15]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn test_complex_ack_segmented_round_trip() {
        let ack = ComplexAck {
            segmented: true,
            more_follows: false,
            invoke_id: 3,
            sequence_number: Some(4),
            proposed_window_size: Some(8),
            service_choice: 12,
            service_data: vec![1, 2, 3],
        };
        let encoded = Apdu::ComplexAck(ack.clone()).encode();
        assert_eq!(encoded[0], 0x38);
        assert_eq!(Apdu::decode(&encoded).unwrap(), Apdu::ComplexAck(ack));
    }

    #[test]
    fn test_segment_ack_layout() {
        let apdu = Apdu::SegmentAck {
            negative_ack: true,
            server: false,
            invoke_id: 5,
            sequence_number: 3,
            actual_window_size: 4,
        };
        let encoded = apdu.encode();
        assert_eq!(encoded, vec![0x42, 5, 3, 4]);
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);

        let server_ack = Apdu::SegmentAck {
            negative_ack: false,
            server: true,
            invoke_id: 5,
            sequence_number: 3,
            actual_window_size: 4,
        };
        assert_eq!(server_ack.encode()[0], 0x41);
    }

    #[test]
    fn test_error_round_trip() {
        let apdu = Apdu::Error {
            invoke_id: 12,
            service_choice: 12,
            error_data: encode_error_class_code(1, 31),
        };
        let encoded = apdu.encode();
        let decoded = Apdu::decode(&encoded).unwrap();
        assert_eq!(decoded, apdu);
        if let Apdu::Error { error_data, .. } = decoded {
            assert_eq!(decode_error_class_code(&error_data).unwrap(), (1, 31));
        }
    }

    #[test]
    fn test_reject_and_abort_reasons() {
        let reject = Apdu::Reject {
            invoke_id: 1,
            reason: RejectReason::MissingRequiredParameter,
        };
        assert_eq!(reject.encode(), vec![0x60, 1, 5]);
        assert_eq!(Apdu::decode(&[0x60, 1, 5]).unwrap(), reject);

        let abort = Apdu::Abort {
            server: true,
            invoke_id: 2,
            reason: AbortReason::SegmentationNotSupported,
        };
        assert_eq!(abort.encode(), vec![0x71, 2, 4]);
        assert_eq!(Apdu::decode(&[0x71, 2, 4]).unwrap(), abort);

        // Proprietary reason codes survive the round trip
        match Apdu::decode(&[0x70, 3, 200]).unwrap() {
            Apdu::Abort { reason, .. } => {
                assert!(matches!(reason, AbortReason::Custom(_)));
                assert_eq!(u8::from(reason), 200);
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_max_apdu_table() {
        for (nibble, octets) in [(0, 50), (1, 128), (2, 206), (3, 480), (4, 1024), (5, 1476)] {
            let value = MaxApdu::try_from_nibble(nibble).unwrap();
            assert_eq!(value.octets(), octets);
            assert_eq!(value.nibble(), nibble);
        }
        assert!(MaxApdu::try_from_nibble(6).is_err());
        assert_eq!(MaxApdu::fitting(500), MaxApdu::Octets480);
        assert_eq!(MaxApdu::fitting(40), MaxApdu::Octets50);
    }

    #[test]
    fn test_max_segments_counts() {
        assert_eq!(MaxSegments::Unspecified.count(), None);
        assert_eq!(MaxSegments::Unlimited.count(), None);
        assert_eq!(MaxSegments::Sixteen.count(), Some(16));
        assert_eq!(MaxSegments::from_nibble(6), MaxSegments::SixtyFour);
    }

    #[test]
    fn test_truncated_apdus() {
        assert!(Apdu::decode(&[]).is_err());
        assert!(Apdu::decode(&[0x00, 0x75]).is_err());
        assert!(Apdu::decode(&[0x40, 1, 2]).is_err());
        assert!(Apdu::decode(&[0x08, 0x75, 1, 0]).is_err()); // segmented but too short
    }
}
