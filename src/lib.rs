#![doc = include_str!("../README.md")]

pub mod apdu;
pub mod datalink;
pub mod encoding;
pub mod network;
pub mod segmentation;
pub mod transaction;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use apdu::{AbortReason, Apdu, MaxApdu, MaxSegments, RejectReason};
pub use datalink::{DataLinkError, TransportPort};
pub use encoding::{ApplicationTag, EncodingError, ObjectIdentifier};
pub use network::{BacnetAddress, NetworkPriority, Npdu};
pub use transaction::{ServiceResponse, TransactionError, TransactionManager};

/// NPDU protocol version carried in every network PDU.
pub const BACNET_PROTOCOL_VERSION: u8 = 1;
/// Largest APDU any BACnet data link can carry (Table 6-1).
pub const BACNET_MAX_APDU: usize = 1476;
/// Largest NPDU for BACnet/IP (Annex J).
pub const BACNET_MAX_MPDU: usize = 1497;

#[cfg(test)]
mod tests {
    use crate::encoding::{encode_application_unsigned, ObjectIdentifier};
    use crate::network::BacnetAddress;
    use crate::{ApplicationTag, BACNET_MAX_APDU, BACNET_MAX_MPDU};

    #[test]
    fn test_core_types() {
        let tag = ApplicationTag::Boolean;
        assert_eq!(tag as u8, 1);

        let obj_id = ObjectIdentifier::new(8, 123);
        assert_eq!(obj_id.instance, 123);
        assert!(obj_id.is_valid());

        let addr = BacnetAddress::global_broadcast();
        assert!(addr.is_global_broadcast());
    }

    #[test]
    fn test_constants() {
        // An APDU plus the worst-case NPCI must fit in a BACnet/IP MPDU.
        assert!(BACNET_MAX_APDU + 21 == BACNET_MAX_MPDU);
    }

    #[test]
    fn test_encoding_available_at_root() {
        let mut buffer = Vec::new();
        encode_application_unsigned(&mut buffer, 42).unwrap();
        assert_eq!(buffer, vec![0x21, 0x2A]);
    }
}
