//! BACnet Network Layer
//!
//! NPDU encoding and decoding per ASHRAE 135 Clause 6.2, the
//! `BacnetAddress` model used throughout the stack, and the network
//! layer message types. The forwarding engine lives in [`router`].
//!
//! # NPDU wire layout
//!
//! After the version byte (always 0x01) and the control byte:
//!
//! - DNET (2 bytes BE), DLEN, DADR, when the destination bit is set
//! - SNET (2 bytes BE), SLEN, SADR, when the source bit is set
//! - hop count, when the destination bit is set
//! - message type (+ 2-byte vendor ID for proprietary types ≥ 0x80) and
//!   message body for network messages, otherwise the APDU
//!
//! Structural invariants are enforced on both encode and decode: SNET
//! may not be 0 or 0xFFFF, a present source may not have an empty MAC,
//! and DLEN/SLEN may not run past the buffer.

use std::error::Error;
use std::fmt;

use crate::generate_custom_enum;

pub mod router;

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur in network layer operations
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// Invalid NPDU format
    InvalidNpdu(String),
    /// Invalid network address
    InvalidAddress(String),
    /// No route to the destination network
    NetworkUnreachable(u16),
    /// Router misconfiguration (duplicate ports, missing application port)
    Configuration(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::InvalidNpdu(msg) => write!(f, "Invalid NPDU: {}", msg),
            NetworkError::InvalidAddress(msg) => write!(f, "Invalid address: {}", msg),
            NetworkError::NetworkUnreachable(net) => write!(f, "Network {} unreachable", net),
            NetworkError::Configuration(msg) => write!(f, "Router configuration: {}", msg),
        }
    }
}

impl Error for NetworkError {}

/// Network priority from the NPCI control byte (Clause 6.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NetworkPriority {
    #[default]
    Normal = 0,
    Urgent = 1,
    CriticalEquipment = 2,
    LifeSafety = 3,
}

impl NetworkPriority {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => NetworkPriority::Urgent,
            2 => NetworkPriority::CriticalEquipment,
            3 => NetworkPriority::LifeSafety,
            _ => NetworkPriority::Normal,
        }
    }
}

generate_custom_enum! {
    /// Network layer message types (Clause 6.4). Values 0x80..0xFF are
    /// vendor-proprietary and carry a vendor ID on the wire.
    NetworkMessageType {
        WhoIsRouterToNetwork = 0x00,
        IAmRouterToNetwork = 0x01,
        ICouldBeRouterToNetwork = 0x02,
        RejectMessageToNetwork = 0x03,
        RouterBusyToNetwork = 0x04,
        RouterAvailableToNetwork = 0x05,
        InitializeRoutingTable = 0x06,
        InitializeRoutingTableAck = 0x07,
        EstablishConnectionToNetwork = 0x08,
        DisconnectConnectionToNetwork = 0x09,
        WhatIsNetworkNumber = 0x12,
        NetworkNumberIs = 0x13,
    },
    u8,
    0x80..=0xFF
}

/// The four destination kinds a `BacnetAddress` can select
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    LocalUnicast,
    LocalBroadcast,
    RemoteUnicast,
    RemoteBroadcast,
    GlobalBroadcast,
}

/// A BACnet network address: optional network number plus an opaque MAC.
///
/// `network == None` means the local network; `0xFFFF` is the global
/// broadcast network; an empty MAC is a broadcast on the selected
/// network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BacnetAddress {
    pub network: Option<u16>,
    pub mac: Vec<u8>,
}

impl BacnetAddress {
    /// Unicast on the local network
    pub fn local(mac: Vec<u8>) -> Self {
        Self {
            network: None,
            mac,
        }
    }

    /// Broadcast on the local network
    pub fn local_broadcast() -> Self {
        Self {
            network: None,
            mac: Vec::new(),
        }
    }

    /// Unicast on a remote network
    pub fn remote(network: u16, mac: Vec<u8>) -> Self {
        Self {
            network: Some(network),
            mac,
        }
    }

    /// Directed broadcast on a remote network
    pub fn remote_broadcast(network: u16) -> Self {
        Self {
            network: Some(network),
            mac: Vec::new(),
        }
    }

    /// Broadcast on every network
    pub fn global_broadcast() -> Self {
        Self {
            network: Some(0xFFFF),
            mac: Vec::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.network.is_none()
    }

    pub fn is_broadcast(&self) -> bool {
        self.mac.is_empty()
    }

    pub fn is_global_broadcast(&self) -> bool {
        self.network == Some(0xFFFF)
    }

    pub fn kind(&self) -> AddressKind {
        match (self.network, self.mac.is_empty()) {
            (None, false) => AddressKind::LocalUnicast,
            (None, true) => AddressKind::LocalBroadcast,
            (Some(0xFFFF), _) => AddressKind::GlobalBroadcast,
            (Some(_), false) => AddressKind::RemoteUnicast,
            (Some(_), true) => AddressKind::RemoteBroadcast,
        }
    }
}

impl fmt::Display for BacnetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.network {
            Some(net) => write!(f, "{}:{}", net, crate::util::format_mac(&self.mac)),
            None => write!(f, "local:{}", crate::util::format_mac(&self.mac)),
        }
    }
}

/// Default initial hop count for routed NPDUs
pub const DEFAULT_HOP_COUNT: u8 = 255;

/// Network Protocol Data Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// Carries a network layer message instead of an APDU
    pub is_network_message: bool,
    /// The sender expects a reply (routers may use this for path setup)
    pub expecting_reply: bool,
    pub priority: NetworkPriority,
    pub destination: Option<BacnetAddress>,
    pub source: Option<BacnetAddress>,
    /// Meaningful only while a destination is present
    pub hop_count: u8,
    /// Network message type byte, for network messages
    pub message_type: Option<u8>,
    /// Vendor ID, for proprietary message types (≥ 0x80)
    pub vendor_id: Option<u16>,
    /// Application payload, for data NPDUs
    pub apdu: Vec<u8>,
    /// Message body, for network messages
    pub network_message_data: Vec<u8>,
}

impl Default for Npdu {
    fn default() -> Self {
        Self {
            is_network_message: false,
            expecting_reply: false,
            priority: NetworkPriority::Normal,
            destination: None,
            source: None,
            hop_count: DEFAULT_HOP_COUNT,
            message_type: None,
            vendor_id: None,
            apdu: Vec::new(),
            network_message_data: Vec::new(),
        }
    }
}

impl Npdu {
    /// A data NPDU carrying an APDU with no addressing
    pub fn application(apdu: Vec<u8>) -> Self {
        Self {
            apdu,
            ..Default::default()
        }
    }

    /// A network layer message NPDU
    pub fn network_message(message_type: NetworkMessageType, data: Vec<u8>) -> Self {
        Self {
            is_network_message: true,
            message_type: Some(u8::from(message_type)),
            network_message_data: data,
            ..Default::default()
        }
    }

    /// A data NPDU addressed to every network
    pub fn global_broadcast(apdu: Vec<u8>) -> Self {
        Self {
            destination: Some(BacnetAddress::global_broadcast()),
            apdu,
            ..Default::default()
        }
    }

    /// Decoded message type, for network messages
    pub fn network_message_type(&self) -> Option<NetworkMessageType> {
        self.message_type.map(NetworkMessageType::from)
    }

    fn control_byte(&self) -> u8 {
        let mut byte = self.priority as u8;
        if self.is_network_message {
            byte |= 0x80;
        }
        if self.destination.is_some() {
            byte |= 0x20;
        }
        if self.source.is_some() {
            byte |= 0x08;
        }
        if self.expecting_reply {
            byte |= 0x04;
        }
        byte
    }

    /// Encode to wire bytes, enforcing the structural invariants
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(self.apdu.len() + 16);
        buffer.push(crate::BACNET_PROTOCOL_VERSION);
        buffer.push(self.control_byte());

        if let Some(dest) = &self.destination {
            let dnet = dest.network.ok_or_else(|| {
                NetworkError::InvalidAddress("destination requires a network number".into())
            })?;
            buffer.extend_from_slice(&dnet.to_be_bytes());
            if dest.mac.len() > 255 {
                return Err(NetworkError::InvalidAddress("DADR too long".into()));
            }
            buffer.push(dest.mac.len() as u8);
            buffer.extend_from_slice(&dest.mac);
        }

        if let Some(source) = &self.source {
            let snet = source
                .network
                .ok_or_else(|| NetworkError::InvalidAddress("SNET missing".into()))?;
            if snet == 0 {
                return Err(NetworkError::InvalidAddress("SNET cannot be 0".into()));
            }
            if snet == 0xFFFF {
                return Err(NetworkError::InvalidAddress("SNET cannot be 0xFFFF".into()));
            }
            if source.mac.is_empty() {
                return Err(NetworkError::InvalidAddress("SLEN cannot be 0".into()));
            }
            if source.mac.len() > 255 {
                return Err(NetworkError::InvalidAddress("SADR too long".into()));
            }
            buffer.extend_from_slice(&snet.to_be_bytes());
            buffer.push(source.mac.len() as u8);
            buffer.extend_from_slice(&source.mac);
        }

        if self.destination.is_some() {
            buffer.push(self.hop_count);
        }

        if self.is_network_message {
            let message_type = self
                .message_type
                .ok_or_else(|| NetworkError::InvalidNpdu("missing message type".into()))?;
            buffer.push(message_type);
            if message_type >= 0x80 {
                let vendor_id = self.vendor_id.ok_or_else(|| {
                    NetworkError::InvalidNpdu("proprietary message requires vendor id".into())
                })?;
                buffer.extend_from_slice(&vendor_id.to_be_bytes());
            }
            buffer.extend_from_slice(&self.network_message_data);
        } else {
            buffer.extend_from_slice(&self.apdu);
        }

        Ok(buffer)
    }

    /// Decode from wire bytes; the APDU or message body is the remainder
    /// of the buffer.
    pub fn decode(data: &[u8]) -> Result<Npdu> {
        if data.len() < 2 {
            return Err(NetworkError::InvalidNpdu("NPDU too short".into()));
        }
        if data[0] != crate::BACNET_PROTOCOL_VERSION {
            return Err(NetworkError::InvalidNpdu(format!(
                "unsupported NPDU version {}",
                data[0]
            )));
        }

        let control = data[1];
        let is_network_message = control & 0x80 != 0;
        let destination_present = control & 0x20 != 0;
        let source_present = control & 0x08 != 0;
        let expecting_reply = control & 0x04 != 0;
        let priority = NetworkPriority::from_bits(control);

        let mut pos = 2;

        let destination = if destination_present {
            if pos + 3 > data.len() {
                return Err(NetworkError::InvalidNpdu("truncated destination".into()));
            }
            let dnet = u16::from_be_bytes([data[pos], data[pos + 1]]);
            let dlen = data[pos + 2] as usize;
            pos += 3;
            if pos + dlen > data.len() {
                return Err(NetworkError::InvalidNpdu("DLEN exceeds buffer".into()));
            }
            let mac = data[pos..pos + dlen].to_vec();
            pos += dlen;
            Some(BacnetAddress {
                network: Some(dnet),
                mac,
            })
        } else {
            None
        };

        let source = if source_present {
            if pos + 3 > data.len() {
                return Err(NetworkError::InvalidNpdu("truncated source".into()));
            }
            let snet = u16::from_be_bytes([data[pos], data[pos + 1]]);
            if snet == 0 {
                return Err(NetworkError::InvalidNpdu("SNET cannot be 0".into()));
            }
            if snet == 0xFFFF {
                return Err(NetworkError::InvalidNpdu("SNET cannot be 0xFFFF".into()));
            }
            let slen = data[pos + 2] as usize;
            if slen == 0 {
                return Err(NetworkError::InvalidNpdu("SLEN cannot be 0".into()));
            }
            pos += 3;
            if pos + slen > data.len() {
                return Err(NetworkError::InvalidNpdu("SLEN exceeds buffer".into()));
            }
            let mac = data[pos..pos + slen].to_vec();
            pos += slen;
            Some(BacnetAddress {
                network: Some(snet),
                mac,
            })
        } else {
            None
        };

        let hop_count = if destination_present {
            if pos >= data.len() {
                return Err(NetworkError::InvalidNpdu("missing hop count".into()));
            }
            let hc = data[pos];
            pos += 1;
            hc
        } else {
            DEFAULT_HOP_COUNT
        };

        let mut message_type = None;
        let mut vendor_id = None;
        let mut apdu = Vec::new();
        let mut network_message_data = Vec::new();

        if is_network_message {
            if pos >= data.len() {
                return Err(NetworkError::InvalidNpdu("missing message type".into()));
            }
            let mt = data[pos];
            pos += 1;
            if mt >= 0x80 {
                if pos + 2 > data.len() {
                    return Err(NetworkError::InvalidNpdu("missing vendor id".into()));
                }
                vendor_id = Some(u16::from_be_bytes([data[pos], data[pos + 1]]));
                pos += 2;
            }
            message_type = Some(mt);
            network_message_data = data[pos..].to_vec();
        } else {
            apdu = data[pos..].to_vec();
        }

        Ok(Npdu {
            is_network_message,
            expecting_reply,
            priority,
            destination,
            source,
            hop_count,
            message_type,
            vendor_id,
            apdu,
            network_message_data,
        })
    }
}
