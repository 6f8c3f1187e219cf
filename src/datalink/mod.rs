//! BACnet Data Link Layer
//!
//! The transport engines that move NPDUs over real media, and the
//! [`TransportPort`] contract the network router consumes:
//!
//! - **BACnet/IP** ([`bip`]): UDP datagrams wrapped in BVLL (Annex J),
//!   with foreign-device registration and an attachable BBMD ([`bbmd`]).
//! - **BACnet/SC** ([`sc`]): BVLC-SC frames over WebSockets (Annex AB),
//!   with per-connection state machines and a hub.
//!
//! A transport owns its socket exclusively. Outbound frames are queued
//! to a single writer task per transport, which gives a total order to
//! all sends on one port; receive callbacks are invoked from the
//! transport's reader task.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub mod bbmd;
pub mod bip;
pub mod sc;

/// Result type for data link operations
pub type Result<T> = std::result::Result<T, DataLinkError>;

/// Errors that can occur during data link operations
#[derive(Debug)]
pub enum DataLinkError {
    /// Network I/O error
    IoError(std::io::Error),
    /// Received frame does not conform to the expected format
    InvalidFrame(String),
    /// Operation requires a started transport
    NotStarted,
    /// Invalid transport configuration
    InvalidConfiguration(String),
    /// A helper (BBMD, foreign device) is already attached
    AlreadyAttached(&'static str),
    /// A request did not complete in time
    Timeout,
    /// The underlying connection closed
    ConnectionClosed,
}

impl fmt::Display for DataLinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataLinkError::IoError(e) => write!(f, "I/O error: {}", e),
            DataLinkError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            DataLinkError::NotStarted => write!(f, "Transport not started"),
            DataLinkError::InvalidConfiguration(msg) => {
                write!(f, "Invalid configuration: {}", msg)
            }
            DataLinkError::AlreadyAttached(what) => write!(f, "{} already attached", what),
            DataLinkError::Timeout => write!(f, "Request timed out"),
            DataLinkError::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl Error for DataLinkError {}

impl From<std::io::Error> for DataLinkError {
    fn from(error: std::io::Error) -> Self {
        DataLinkError::IoError(error)
    }
}

/// Callback invoked with `(npdu_bytes, source_mac)` for every received
/// NPDU. Runs on the transport's reader task; implementations must not
/// block.
pub type ReceiveCallback = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;

/// The contract between a data link transport and the network router.
///
/// `send_unicast` and `send_broadcast` enqueue the frame on the
/// transport's writer task and return immediately; ordering of sends on
/// one port is total.
#[async_trait]
pub trait TransportPort: Send + Sync {
    /// Bind sockets and start the reader/writer tasks
    async fn start(&self) -> Result<()>;

    /// Stop tasks and release the socket
    async fn stop(&self) -> Result<()>;

    /// Send an NPDU to a station identified by its data-link MAC
    fn send_unicast(&self, npdu: &[u8], mac: &[u8]) -> Result<()>;

    /// Send an NPDU to every station on the local network
    fn send_broadcast(&self, npdu: &[u8]) -> Result<()>;

    /// Register the receive callback; the router installs exactly one
    /// per port during startup.
    fn on_receive(&self, callback: ReceiveCallback);

    /// This port's data-link MAC address
    fn local_mac(&self) -> Vec<u8>;

    /// Largest NPDU this data link can carry
    fn max_npdu_length(&self) -> usize;
}
