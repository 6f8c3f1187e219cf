//! BACnet/IP transport (Annex J)
//!
//! UDP datagrams on port 0xBAC0 wrapped in the BACnet Virtual Link
//! Layer: a 4-byte header (type 0x81, function, big-endian length)
//! followed by the NPDU or a management payload. A BACnet/IP MAC is the
//! 6-byte concatenation of the IPv4 address and port.
//!
//! The transport owns the socket; one writer task drains an outbound
//! queue (total send order per port), one reader task decodes inbound
//! BVLL and applies the Annex J receive rules: own-datagram echo drop,
//! BBMD-first intercept, per-function NAKs when no BBMD is attached,
//! suppression of confirmed requests arriving via any broadcast path,
//! and anti-spoofed BVLC-Result routing to the foreign-device manager.
//!
//! BVLC client requests (Read/Write-BDT, Read-FDT, Delete-FDT) are
//! matched to their responses by `(expected function, responder)`.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::bbmd::{Bbmd, BbmdConfig, BdtEntry, BvllSender};
use super::{DataLinkError, ReceiveCallback, Result, TransportPort};

/// BACnet/IP well-known UDP port (0xBAC0)
pub const BACNET_IP_PORT: u16 = 0xBAC0;
/// BVLL type octet for BACnet/IP
pub const BVLL_TYPE_BACNET_IP: u8 = 0x81;
/// BVLL header size
pub const BVLL_HEADER_SIZE: usize = 4;
/// Largest NPDU a BACnet/IP link carries (Table 6-1)
pub const BIP_MAX_NPDU: usize = 1497;
/// BACnet/IP MAC size: 4-byte IPv4 address + 2-byte port
pub const BIP_MAC_SIZE: usize = 6;

/// BVLL function codes (Annex J.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BvlcFunction {
    Result = 0x00,
    WriteBdt = 0x01,
    ReadBdt = 0x02,
    ReadBdtAck = 0x03,
    ForwardedNpdu = 0x04,
    RegisterForeignDevice = 0x05,
    ReadFdt = 0x06,
    ReadFdtAck = 0x07,
    DeleteFdtEntry = 0x08,
    DistributeBroadcastToNetwork = 0x09,
    OriginalUnicastNpdu = 0x0A,
    OriginalBroadcastNpdu = 0x0B,
}

impl TryFrom<u8> for BvlcFunction {
    type Error = DataLinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(BvlcFunction::Result),
            0x01 => Ok(BvlcFunction::WriteBdt),
            0x02 => Ok(BvlcFunction::ReadBdt),
            0x03 => Ok(BvlcFunction::ReadBdtAck),
            0x04 => Ok(BvlcFunction::ForwardedNpdu),
            0x05 => Ok(BvlcFunction::RegisterForeignDevice),
            0x06 => Ok(BvlcFunction::ReadFdt),
            0x07 => Ok(BvlcFunction::ReadFdtAck),
            0x08 => Ok(BvlcFunction::DeleteFdtEntry),
            0x09 => Ok(BvlcFunction::DistributeBroadcastToNetwork),
            0x0A => Ok(BvlcFunction::OriginalUnicastNpdu),
            0x0B => Ok(BvlcFunction::OriginalBroadcastNpdu),
            other => Err(DataLinkError::InvalidFrame(format!(
                "unknown BVLC function 0x{:02X}",
                other
            ))),
        }
    }
}

/// BVLC-Result codes. The values are fixed by Annex J; other stacks
/// depend on them bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BvlcResultCode {
    Success = 0x0000,
    WriteBdtNak = 0x0010,
    ReadBdtNak = 0x0020,
    RegisterForeignDeviceNak = 0x0030,
    ReadFdtNak = 0x0040,
    DeleteFdtEntryNak = 0x0050,
    DistributeBroadcastNak = 0x0060,
}

impl TryFrom<u16> for BvlcResultCode {
    type Error = DataLinkError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0000 => Ok(BvlcResultCode::Success),
            0x0010 => Ok(BvlcResultCode::WriteBdtNak),
            0x0020 => Ok(BvlcResultCode::ReadBdtNak),
            0x0030 => Ok(BvlcResultCode::RegisterForeignDeviceNak),
            0x0040 => Ok(BvlcResultCode::ReadFdtNak),
            0x0050 => Ok(BvlcResultCode::DeleteFdtEntryNak),
            0x0060 => Ok(BvlcResultCode::DistributeBroadcastNak),
            other => Err(DataLinkError::InvalidFrame(format!(
                "unknown BVLC result code 0x{:04X}",
                other
            ))),
        }
    }
}

/// The NAK a non-BBMD sends back for each BVLC management function
fn nak_for(function: BvlcFunction) -> Option<BvlcResultCode> {
    match function {
        BvlcFunction::WriteBdt => Some(BvlcResultCode::WriteBdtNak),
        BvlcFunction::ReadBdt => Some(BvlcResultCode::ReadBdtNak),
        BvlcFunction::RegisterForeignDevice => Some(BvlcResultCode::RegisterForeignDeviceNak),
        BvlcFunction::ReadFdt => Some(BvlcResultCode::ReadFdtNak),
        BvlcFunction::DeleteFdtEntry => Some(BvlcResultCode::DeleteFdtEntryNak),
        BvlcFunction::DistributeBroadcastToNetwork => Some(BvlcResultCode::DistributeBroadcastNak),
        _ => None,
    }
}

/// A BACnet/IP address: IPv4 plus UDP port, 6 bytes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BipAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl BipAddress {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self::new(*v4.ip(), v4.port())),
            SocketAddr::V6(_) => None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    /// The 6-byte BACnet/IP MAC
    pub fn encode(&self) -> [u8; BIP_MAC_SIZE] {
        let octets = self.ip.octets();
        let port = self.port.to_be_bytes();
        [octets[0], octets[1], octets[2], octets[3], port[0], port[1]]
    }

    pub fn decode(mac: &[u8]) -> Result<Self> {
        if mac.len() != BIP_MAC_SIZE {
            return Err(DataLinkError::InvalidFrame(format!(
                "BACnet/IP MAC must be 6 bytes, got {}",
                mac.len()
            )));
        }
        Ok(Self {
            ip: Ipv4Addr::new(mac[0], mac[1], mac[2], mac[3]),
            port: u16::from_be_bytes([mac[4], mac[5]]),
        })
    }
}

impl fmt::Display for BipAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A decoded BVLL message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvllMessage {
    pub function: BvlcFunction,
    /// For Forwarded-NPDU: the address of the original broadcaster
    pub originating_address: Option<BipAddress>,
    /// The payload after the header (and originator, if any)
    pub data: Vec<u8>,
}

/// Wrap a payload in a BVLL frame
pub fn encode_bvll(function: BvlcFunction, payload: &[u8]) -> Vec<u8> {
    let length = (BVLL_HEADER_SIZE + payload.len()) as u16;
    let mut frame = Vec::with_capacity(length as usize);
    frame.push(BVLL_TYPE_BACNET_IP);
    frame.push(function as u8);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build a Forwarded-NPDU carrying the originator's 6-byte address
pub fn encode_forwarded_npdu(originator: BipAddress, npdu: &[u8]) -> Vec<u8> {
    let length = (BVLL_HEADER_SIZE + BIP_MAC_SIZE + npdu.len()) as u16;
    let mut frame = Vec::with_capacity(length as usize);
    frame.push(BVLL_TYPE_BACNET_IP);
    frame.push(BvlcFunction::ForwardedNpdu as u8);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&originator.encode());
    frame.extend_from_slice(npdu);
    frame
}

/// Decode a BVLL frame, validating the type octet and length field
pub fn decode_bvll(data: &[u8]) -> Result<BvllMessage> {
    if data.len() < BVLL_HEADER_SIZE {
        return Err(DataLinkError::InvalidFrame("BVLL header too short".into()));
    }
    if data[0] != BVLL_TYPE_BACNET_IP {
        return Err(DataLinkError::InvalidFrame(format!(
            "unexpected BVLL type 0x{:02X}",
            data[0]
        )));
    }
    let function = BvlcFunction::try_from(data[1])?;
    let length = u16::from_be_bytes([data[2], data[3]]) as usize;
    if length != data.len() {
        return Err(DataLinkError::InvalidFrame(format!(
            "BVLL length {} does not match datagram size {}",
            length,
            data.len()
        )));
    }

    let body = &data[BVLL_HEADER_SIZE..];
    if function == BvlcFunction::ForwardedNpdu {
        if body.len() < BIP_MAC_SIZE {
            return Err(DataLinkError::InvalidFrame(
                "Forwarded-NPDU missing originator".into(),
            ));
        }
        Ok(BvllMessage {
            function,
            originating_address: Some(BipAddress::decode(&body[..BIP_MAC_SIZE])?),
            data: body[BIP_MAC_SIZE..].to_vec(),
        })
    } else {
        Ok(BvllMessage {
            function,
            originating_address: None,
            data: body.to_vec(),
        })
    }
}

/// True when the NPDU carries a BACnet-Confirmed-Request-PDU. Parses
/// just enough of the NPCI to reach the APDU type octet; anything
/// malformed counts as not-confirmed.
pub fn is_confirmed_request_npdu(npdu: &[u8]) -> bool {
    if npdu.len() < 3 {
        return false;
    }
    let control = npdu[1];
    if control & 0x80 != 0 {
        return false; // network message
    }
    let mut offset = 2;
    if control & 0x20 != 0 {
        if offset + 3 > npdu.len() {
            return false;
        }
        let dlen = npdu[offset + 2] as usize;
        offset += 3 + dlen;
    }
    if control & 0x08 != 0 {
        if offset + 3 > npdu.len() {
            return false;
        }
        let slen = npdu[offset + 2] as usize;
        offset += 3 + slen;
    }
    if control & 0x20 != 0 {
        offset += 1; // hop count
    }
    match npdu.get(offset) {
        Some(apdu_type) => apdu_type >> 4 == 0,
        None => false,
    }
}

/// An FDT row as reported by a remote BBMD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFdtEntry {
    pub address: BipAddress,
    pub ttl: u16,
    pub remaining_seconds: u16,
}

/// BACnet/IP transport configuration
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BipConfig {
    /// Local bind address
    pub interface: Ipv4Addr,
    /// Local UDP port
    pub port: u16,
    /// Subnet broadcast address; derived from the interface when `None`
    pub broadcast_address: Option<Ipv4Addr>,
}

impl Default for BipConfig {
    fn default() -> Self {
        Self {
            interface: Ipv4Addr::UNSPECIFIED,
            port: BACNET_IP_PORT,
            broadcast_address: None,
        }
    }
}

struct BipRunning {
    local_address: BipAddress,
    broadcast_address: BipAddress,
    tasks: Vec<JoinHandle<()>>,
}

struct BipInner {
    config: BipConfig,
    running: Mutex<Option<BipRunning>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<(Bytes, SocketAddr)>>>,
    receive_callback: Mutex<Option<ReceiveCallback>>,
    bbmd: Mutex<Option<Bbmd>>,
    foreign_device: Mutex<Option<ForeignDeviceManager>>,
    pending_bvlc: Mutex<HashMap<(BvlcFunction, BipAddress), oneshot::Sender<Vec<u8>>>>,
}

/// BACnet/IP transport over tokio UDP. Cheap to clone.
#[derive(Clone)]
pub struct BipTransport {
    inner: Arc<BipInner>,
}

impl BipTransport {
    pub fn new(config: BipConfig) -> Self {
        Self {
            inner: Arc::new(BipInner {
                config,
                running: Mutex::new(None),
                outbound: Mutex::new(None),
                receive_callback: Mutex::new(None),
                bbmd: Mutex::new(None),
                foreign_device: Mutex::new(None),
                pending_bvlc: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The bound BACnet/IP address
    pub fn local_address(&self) -> Result<BipAddress> {
        self.inner
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.local_address)
            .ok_or(DataLinkError::NotStarted)
    }

    /// The attached BBMD, if any
    pub fn bbmd(&self) -> Option<Bbmd> {
        self.inner.bbmd.lock().unwrap().clone()
    }

    /// The attached foreign-device manager, if any
    pub fn foreign_device(&self) -> Option<ForeignDeviceManager> {
        self.inner.foreign_device.lock().unwrap().clone()
    }

    /// Attach and start a BBMD on this transport. Inbound BVLC is
    /// offered to the BBMD first, and outbound broadcasts are relayed to
    /// its BDT peers and foreign devices (Annex J.7.1 combined
    /// router/BBMD operation).
    pub fn attach_bbmd(&self, bdt: Vec<BdtEntry>, config: BbmdConfig) -> Result<Bbmd> {
        let (local_address, broadcast_address) = {
            let running = self.inner.running.lock().unwrap();
            let running = running.as_ref().ok_or(DataLinkError::NotStarted)?;
            (running.local_address, running.broadcast_address)
        };
        let mut slot = self.inner.bbmd.lock().unwrap();
        if slot.is_some() {
            return Err(DataLinkError::AlreadyAttached("BBMD"));
        }

        let send: BvllSender = {
            let inner = self.inner.clone();
            Arc::new(move |frame, dest| {
                let _ = inner.send_raw(frame, dest.socket_addr());
            })
        };
        let deliver = {
            let inner = self.inner.clone();
            Arc::new(move |npdu: &[u8], source: BipAddress| {
                // Confirmed requests are forbidden on every broadcast path
                if is_confirmed_request_npdu(npdu) {
                    debug!("dropped confirmed request via BBMD broadcast from {}", source);
                    return;
                }
                inner.deliver(npdu, source);
            })
        };
        let bbmd = Bbmd::new(local_address, broadcast_address, send, deliver, config);
        bbmd.set_bdt(bdt);
        bbmd.start();
        *slot = Some(bbmd.clone());
        info!("BBMD attached to transport {}", local_address);
        Ok(bbmd)
    }

    /// Attach a foreign-device manager that registers with `bbmd_address`
    /// and re-registers at half the TTL.
    pub fn attach_foreign_device(
        &self,
        bbmd_address: BipAddress,
        ttl: u16,
    ) -> Result<ForeignDeviceManager> {
        {
            let running = self.inner.running.lock().unwrap();
            if running.is_none() {
                return Err(DataLinkError::NotStarted);
            }
        }
        let mut slot = self.inner.foreign_device.lock().unwrap();
        if slot.is_some() {
            return Err(DataLinkError::AlreadyAttached("foreign device manager"));
        }
        let send: BvllSender = {
            let inner = self.inner.clone();
            Arc::new(move |frame, dest| {
                let _ = inner.send_raw(frame, dest.socket_addr());
            })
        };
        let manager = ForeignDeviceManager::new(bbmd_address, ttl, send);
        manager.start();
        *slot = Some(manager.clone());
        info!("foreign device manager attached, BBMD {}", bbmd_address);
        Ok(manager)
    }

    /// Read the Broadcast Distribution Table of a remote BBMD.
    pub async fn read_bdt(
        &self,
        bbmd_address: BipAddress,
        timeout: Duration,
    ) -> Result<Vec<BdtEntry>> {
        let data = self
            .bvlc_request(
                encode_bvll(BvlcFunction::ReadBdt, &[]),
                bbmd_address,
                BvlcFunction::ReadBdtAck,
                timeout,
            )
            .await?;
        data.chunks_exact(BdtEntry::WIRE_SIZE)
            .map(BdtEntry::decode)
            .collect()
    }

    /// Write the Broadcast Distribution Table of a remote BBMD.
    pub async fn write_bdt(
        &self,
        bbmd_address: BipAddress,
        entries: &[BdtEntry],
        timeout: Duration,
    ) -> Result<BvlcResultCode> {
        let payload: Vec<u8> = entries.iter().flat_map(|e| e.encode()).collect();
        let data = self
            .bvlc_request(
                encode_bvll(BvlcFunction::WriteBdt, &payload),
                bbmd_address,
                BvlcFunction::Result,
                timeout,
            )
            .await?;
        parse_result_code(&data)
    }

    /// Read the Foreign Device Table of a remote BBMD.
    pub async fn read_fdt(
        &self,
        bbmd_address: BipAddress,
        timeout: Duration,
    ) -> Result<Vec<RemoteFdtEntry>> {
        let data = self
            .bvlc_request(
                encode_bvll(BvlcFunction::ReadFdt, &[]),
                bbmd_address,
                BvlcFunction::ReadFdtAck,
                timeout,
            )
            .await?;
        data.chunks_exact(10)
            .map(|row| {
                Ok(RemoteFdtEntry {
                    address: BipAddress::decode(&row[..6])?,
                    ttl: u16::from_be_bytes([row[6], row[7]]),
                    remaining_seconds: u16::from_be_bytes([row[8], row[9]]),
                })
            })
            .collect()
    }

    /// Delete one FDT entry on a remote BBMD.
    pub async fn delete_fdt_entry(
        &self,
        bbmd_address: BipAddress,
        entry: BipAddress,
        timeout: Duration,
    ) -> Result<BvlcResultCode> {
        let data = self
            .bvlc_request(
                encode_bvll(BvlcFunction::DeleteFdtEntry, &entry.encode()),
                bbmd_address,
                BvlcFunction::Result,
                timeout,
            )
            .await?;
        parse_result_code(&data)
    }

    /// Send a BVLC request and wait for the matching response function
    /// from the destination. Timeout handling belongs to the caller; the
    /// pending slot is keyed by `(expected function, destination)`.
    async fn bvlc_request(
        &self,
        frame: Vec<u8>,
        destination: BipAddress,
        expected_response: BvlcFunction,
        wait: Duration,
    ) -> Result<Vec<u8>> {
        let key = (expected_response, destination);
        let (tx, rx) = oneshot::channel();
        self.inner.pending_bvlc.lock().unwrap().insert(key, tx);

        let result = async {
            self.inner
                .send_raw(Bytes::from(frame), destination.socket_addr())?;
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(_)) => Err(DataLinkError::ConnectionClosed),
                Err(_) => Err(DataLinkError::Timeout),
            }
        }
        .await;

        self.inner.pending_bvlc.lock().unwrap().remove(&key);
        result
    }
}

#[async_trait]
impl TransportPort for BipTransport {
    async fn start(&self) -> Result<()> {
        {
            let running = self.inner.running.lock().unwrap();
            if running.is_some() {
                return Ok(());
            }
        }

        let bind = SocketAddrV4::new(self.inner.config.interface, self.inner.config.port);
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(bind).into())?;
        let socket = Arc::new(UdpSocket::from_std(socket.into())?);

        let bound = socket.local_addr()?;
        let bound_port = bound.port();
        let local_ip = match bound.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => ip,
            _ => resolve_local_ip(),
        };
        let local_address = BipAddress::new(local_ip, bound_port);
        let broadcast_ip = self
            .inner
            .config
            .broadcast_address
            .unwrap_or_else(|| resolve_broadcast_ip(local_ip));
        let broadcast_address = BipAddress::new(broadcast_ip, self.inner.config.port);

        // Writer task: single drain point gives a total order to sends
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<(Bytes, SocketAddr)>();
        let writer_socket = socket.clone();
        let writer = tokio::spawn(async move {
            while let Some((frame, dest)) = outbound_rx.recv().await {
                if let Err(e) = writer_socket.send_to(&frame, dest).await {
                    warn!("UDP send to {} failed: {}", dest, e);
                }
            }
        });

        // Reader task
        let inner = self.inner.clone();
        let reader_socket = socket.clone();
        let reader = tokio::spawn(async move {
            let mut buffer = vec![0u8; 1500];
            loop {
                match reader_socket.recv_from(&mut buffer).await {
                    Ok((len, src)) => inner.handle_datagram(&buffer[..len], src),
                    Err(e) => {
                        warn!("UDP receive failed: {}", e);
                        return;
                    }
                }
            }
        });

        *self.inner.outbound.lock().unwrap() = Some(outbound_tx);
        *self.inner.running.lock().unwrap() = Some(BipRunning {
            local_address,
            broadcast_address,
            tasks: vec![writer, reader],
        });
        info!("BACnet/IP transport started on {}", local_address);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(manager) = self.inner.foreign_device.lock().unwrap().take() {
            manager.stop();
        }
        if let Some(bbmd) = self.inner.bbmd.lock().unwrap().take() {
            bbmd.stop();
        }
        self.inner.outbound.lock().unwrap().take();
        if let Some(running) = self.inner.running.lock().unwrap().take() {
            for task in running.tasks {
                task.abort();
            }
            info!("BACnet/IP transport stopped");
        }
        Ok(())
    }

    fn send_unicast(&self, npdu: &[u8], mac: &[u8]) -> Result<()> {
        let destination = BipAddress::decode(mac)?;
        let frame = Bytes::from(encode_bvll(BvlcFunction::OriginalUnicastNpdu, npdu));
        self.inner.send_raw(frame, destination.socket_addr())
    }

    fn send_broadcast(&self, npdu: &[u8]) -> Result<()> {
        // Registered foreign devices broadcast through their BBMD
        // (Annex J.5.6)
        if let Some(manager) = self.inner.foreign_device.lock().unwrap().as_ref() {
            if manager.is_registered() {
                return manager.send_distribute_broadcast(npdu);
            }
        }

        let (local, broadcast) = {
            let running = self.inner.running.lock().unwrap();
            let running = running.as_ref().ok_or(DataLinkError::NotStarted)?;
            (running.local_address, running.broadcast_address)
        };
        let frame = Bytes::from(encode_bvll(BvlcFunction::OriginalBroadcastNpdu, npdu));
        self.inner.send_raw(frame, broadcast.socket_addr())?;

        // An attached BBMD sees our outbound broadcasts too and relays
        // them to BDT peers and foreign devices.
        if let Some(bbmd) = self.inner.bbmd.lock().unwrap().as_ref() {
            bbmd.handle_bvlc(BvlcFunction::OriginalBroadcastNpdu, npdu, local, local);
        }
        Ok(())
    }

    fn on_receive(&self, callback: ReceiveCallback) {
        *self.inner.receive_callback.lock().unwrap() = Some(callback);
    }

    fn local_mac(&self) -> Vec<u8> {
        self.inner
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.local_address.encode().to_vec())
            .unwrap_or_default()
    }

    fn max_npdu_length(&self) -> usize {
        BIP_MAX_NPDU
    }
}

impl BipInner {
    fn send_raw(&self, frame: Bytes, destination: SocketAddr) -> Result<()> {
        let outbound = self.outbound.lock().unwrap();
        let tx = outbound.as_ref().ok_or(DataLinkError::NotStarted)?;
        tx.send((frame, destination))
            .map_err(|_| DataLinkError::ConnectionClosed)
    }

    fn deliver(&self, npdu: &[u8], source: BipAddress) {
        let callback = self.receive_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(npdu, &source.encode());
        }
    }

    fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let Some(source) = BipAddress::from_socket_addr(src) else {
            return;
        };
        let message = match decode_bvll(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropped malformed BVLL from {}: {}", source, e);
                return;
            }
        };

        let local_address = self
            .running
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.local_address);

        // Drop our own datagrams echoed back by the OS or re-broadcast
        // by a BBMD.
        if local_address == Some(source) {
            return;
        }
        // Likewise a Forwarded-NPDU we originated ourselves.
        if message.function == BvlcFunction::ForwardedNpdu
            && message.originating_address == local_address
        {
            return;
        }

        // BBMD-first intercept
        let bbmd = self.bbmd.lock().unwrap().clone();
        if let Some(bbmd) = bbmd {
            let bbmd_source = match message.function {
                BvlcFunction::ForwardedNpdu => message.originating_address.unwrap_or(source),
                _ => source,
            };
            if bbmd.handle_bvlc(message.function, &message.data, bbmd_source, source) {
                return;
            }
            // The BBMD delivers Forwarded-NPDUs through its own local
            // callback; skip the normal path to avoid double delivery.
            if message.function == BvlcFunction::ForwardedNpdu {
                return;
            }
        } else if let Some(nak) = nak_for(message.function) {
            // Without a BBMD, management functions are refused per
            // function so the sender learns this station is no BBMD.
            debug!("NAKing BVLC {:?} from {}", message.function, source);
            let payload = (nak as u16).to_be_bytes();
            let frame = Bytes::from(encode_bvll(BvlcFunction::Result, &payload));
            let _ = self.send_raw(frame, source.socket_addr());
            return;
        }

        match message.function {
            BvlcFunction::OriginalUnicastNpdu => self.deliver(&message.data, source),
            BvlcFunction::OriginalBroadcastNpdu => {
                if is_confirmed_request_npdu(&message.data) {
                    debug!("dropped confirmed request via broadcast from {}", source);
                    return;
                }
                self.deliver(&message.data, source);
            }
            BvlcFunction::ForwardedNpdu => {
                if is_confirmed_request_npdu(&message.data) {
                    debug!(
                        "dropped confirmed request via forwarded broadcast from {}",
                        source
                    );
                    return;
                }
                if let Some(originator) = message.originating_address {
                    self.deliver(&message.data, originator);
                }
            }
            BvlcFunction::Result => {
                if self.resolve_pending(BvlcFunction::Result, &message.data, source) {
                    return;
                }
                self.handle_bvlc_result(&message.data, source);
            }
            BvlcFunction::ReadBdtAck | BvlcFunction::ReadFdtAck => {
                if !self.resolve_pending(message.function, &message.data, source) {
                    debug!("ignoring unsolicited {:?} from {}", message.function, source);
                }
            }
            other => debug!("ignoring BVLC {:?} from {}", other, source),
        }
    }

    fn resolve_pending(&self, function: BvlcFunction, data: &[u8], source: BipAddress) -> bool {
        let pending = self.pending_bvlc.lock().unwrap().remove(&(function, source));
        match pending {
            Some(tx) => tx.send(data.to_vec()).is_ok(),
            None => false,
        }
    }

    fn handle_bvlc_result(&self, data: &[u8], source: BipAddress) {
        // Only the BBMD we registered with may confirm or refuse our
        // registration; anything else could spoof the state.
        let manager = self.foreign_device.lock().unwrap().clone();
        if let Some(manager) = manager {
            if manager.bbmd_address() == source {
                manager.handle_bvlc_result(data);
            } else {
                debug!("ignoring BVLC-Result from non-registered BBMD {}", source);
            }
        }
        if data.len() >= 2 {
            let code = u16::from_be_bytes([data[0], data[1]]);
            if code != 0 {
                warn!("BVLC-Result NAK 0x{:04X} from {}", code, source);
            }
        }
    }
}

fn parse_result_code(data: &[u8]) -> Result<BvlcResultCode> {
    if data.len() < 2 {
        return Err(DataLinkError::InvalidFrame("short BVLC-Result".into()));
    }
    BvlcResultCode::try_from(u16::from_be_bytes([data[0], data[1]]))
}

/// Best-effort local IPv4 discovery via the interface list; falls back
/// to loopback.
fn resolve_local_ip() -> Ipv4Addr {
    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for interface in interfaces {
            if interface.is_loopback() {
                continue;
            }
            if let IpAddr::V4(ip) = interface.ip() {
                return ip;
            }
        }
    }
    Ipv4Addr::LOCALHOST
}

/// Subnet broadcast address for `local_ip`, from the interface netmask;
/// falls back to the limited broadcast address.
fn resolve_broadcast_ip(local_ip: Ipv4Addr) -> Ipv4Addr {
    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        for interface in interfaces {
            if let if_addrs::IfAddr::V4(v4) = &interface.addr {
                if v4.ip == local_ip {
                    if let Some(broadcast) = v4.broadcast {
                        return broadcast;
                    }
                    let ip = u32::from(v4.ip);
                    let mask = u32::from(v4.netmask);
                    return Ipv4Addr::from(ip | !mask);
                }
            }
        }
    }
    Ipv4Addr::BROADCAST
}

/// Keeps a foreign-device registration alive: registers immediately,
/// then re-registers at half the TTL. Registration state is driven by
/// BVLC-Result frames the transport routes in.
#[derive(Clone)]
pub struct ForeignDeviceManager {
    inner: Arc<FdInner>,
}

struct FdInner {
    bbmd_address: BipAddress,
    ttl: u16,
    registered: Mutex<bool>,
    send: BvllSender,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ForeignDeviceManager {
    pub fn new(bbmd_address: BipAddress, ttl: u16, send: BvllSender) -> Self {
        Self {
            inner: Arc::new(FdInner {
                bbmd_address,
                ttl,
                registered: Mutex::new(false),
                send,
                task: Mutex::new(None),
            }),
        }
    }

    /// Register now and keep re-registering at TTL/2.
    pub fn start(&self) {
        self.register();
        let weak = Arc::downgrade(&self.inner);
        let interval = Duration::from_secs((self.inner.ttl as u64 / 2).max(1));
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                ForeignDeviceManager { inner }.register();
            }
        });
        *self.inner.task.lock().unwrap() = Some(task);
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().unwrap().take() {
            task.abort();
        }
        *self.inner.registered.lock().unwrap() = false;
    }

    pub fn bbmd_address(&self) -> BipAddress {
        self.inner.bbmd_address
    }

    pub fn is_registered(&self) -> bool {
        *self.inner.registered.lock().unwrap()
    }

    fn register(&self) {
        let payload = self.inner.ttl.to_be_bytes();
        let frame = Bytes::from(encode_bvll(BvlcFunction::RegisterForeignDevice, &payload));
        (self.inner.send)(frame, self.inner.bbmd_address);
        debug!(
            "sent foreign device registration to {} (ttl {}s)",
            self.inner.bbmd_address, self.inner.ttl
        );
    }

    /// Track registration state from a BVLC-Result sent by our BBMD.
    pub fn handle_bvlc_result(&self, data: &[u8]) {
        if data.len() < 2 {
            return;
        }
        match u16::from_be_bytes([data[0], data[1]]) {
            0x0000 => {
                let mut registered = self.inner.registered.lock().unwrap();
                if !*registered {
                    info!("foreign device registered with {}", self.inner.bbmd_address);
                }
                *registered = true;
            }
            code => {
                warn!(
                    "foreign device registration refused by {} (0x{:04X})",
                    self.inner.bbmd_address, code
                );
                *self.inner.registered.lock().unwrap() = false;
            }
        }
    }

    /// Broadcast through the BBMD instead of the local subnet.
    pub fn send_distribute_broadcast(&self, npdu: &[u8]) -> Result<()> {
        let frame = Bytes::from(encode_bvll(
            BvlcFunction::DistributeBroadcastToNetwork,
            npdu,
        ));
        (self.inner.send)(frame, self.inner.bbmd_address);
        Ok(())
    }
}
