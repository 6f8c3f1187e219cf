//! BACnet Broadcast Management Device (Annex J.4)
//!
//! A BBMD relays local broadcasts across IP subnets: every
//! Original-Broadcast-NPDU is re-wrapped as a Forwarded-NPDU and sent
//! unicast to each peer BBMD in the Broadcast Distribution Table and to
//! every registered foreign device. Foreign devices register with a TTL
//! and are swept out after expiry plus a grace period.
//!
//! The BBMD owns its BDT and FDT; the transport hands it every inbound
//! BVLC via [`Bbmd::handle_bvlc`] and forwards its own outbound
//! broadcasts through the same path. The BBMD never touches a socket:
//! sends go through an injected callback, which keeps the
//! transport/BBMD dependency cycle out of the type graph.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::bip::{
    encode_bvll, encode_forwarded_npdu, BipAddress, BvlcFunction, BvlcResultCode,
};
use super::{DataLinkError, Result};

/// Sends a complete BVLL frame to a BACnet/IP address
pub type BvllSender = Arc<dyn Fn(Bytes, BipAddress) + Send + Sync>;

/// Delivers a relayed NPDU to the local stack as `(npdu, originator)`
pub type LocalDeliver = Arc<dyn Fn(&[u8], BipAddress) + Send + Sync>;

/// One Broadcast Distribution Table entry: peer address plus the
/// broadcast distribution mask. The mask is carried on the wire for
/// compatibility but ignored for relay decisions (two-hop distribution).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BdtEntry {
    pub address: BipAddress,
    pub mask: [u8; 4],
}

impl BdtEntry {
    /// Wire size: 6-byte address + 4-byte mask
    pub const WIRE_SIZE: usize = 10;

    pub fn new(address: BipAddress) -> Self {
        Self {
            address,
            mask: [0xFF; 4],
        }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut bytes = [0u8; Self::WIRE_SIZE];
        bytes[..6].copy_from_slice(&self.address.encode());
        bytes[6..].copy_from_slice(&self.mask);
        bytes
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::WIRE_SIZE {
            return Err(DataLinkError::InvalidFrame("short BDT entry".into()));
        }
        let address = BipAddress::decode(&data[..6])?;
        let mut mask = [0u8; 4];
        mask.copy_from_slice(&data[6..10]);
        Ok(Self { address, mask })
    }
}

/// One Foreign Device Table row
#[derive(Debug, Clone, Copy)]
pub struct FdtEntry {
    pub address: BipAddress,
    pub ttl: u16,
    /// When the row may be swept (registration + TTL + grace)
    pub expiry: Instant,
}

impl FdtEntry {
    /// Seconds left before this row is swept
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expiry.saturating_duration_since(now)
    }
}

/// BBMD behavior knobs
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BbmdConfig {
    /// Answer Register-Foreign-Device with success
    pub accept_registrations: bool,
    /// FDT capacity; registrations beyond it are NAKed
    pub max_fdt_entries: usize,
    /// Retention past TTL expiry; not pinned down by the standard
    pub grace_period: Duration,
    /// FDT sweep cadence
    pub sweep_interval: Duration,
    /// Re-broadcast Forwarded-NPDUs on the local subnet (for subnets
    /// whose stations cannot receive directed messages)
    pub rebroadcast_forwarded: bool,
}

impl Default for BbmdConfig {
    fn default() -> Self {
        Self {
            accept_registrations: true,
            max_fdt_entries: 128,
            grace_period: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            rebroadcast_forwarded: false,
        }
    }
}

struct BbmdInner {
    config: BbmdConfig,
    local_address: BipAddress,
    broadcast_address: BipAddress,
    send: BvllSender,
    local_deliver: LocalDeliver,
    bdt: Mutex<Vec<BdtEntry>>,
    fdt: Mutex<HashMap<BipAddress, FdtEntry>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

/// The broadcast management engine. Cheap to clone; clones share the
/// tables.
#[derive(Clone)]
pub struct Bbmd {
    inner: Arc<BbmdInner>,
}

impl Bbmd {
    pub fn new(
        local_address: BipAddress,
        broadcast_address: BipAddress,
        send: BvllSender,
        local_deliver: LocalDeliver,
        config: BbmdConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BbmdInner {
                config,
                local_address,
                broadcast_address,
                send,
                local_deliver,
                bdt: Mutex::new(Vec::new()),
                fdt: Mutex::new(HashMap::new()),
                sweep_task: Mutex::new(None),
            }),
        }
    }

    /// Start the periodic FDT expiry sweep.
    pub fn start(&self) {
        let weak: Weak<BbmdInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { return };
                inner.sweep_fdt();
            }
        });
        *self.inner.sweep_task.lock().unwrap() = Some(task);
        info!("BBMD started at {}", self.inner.local_address);
    }

    pub fn stop(&self) {
        if let Some(task) = self.inner.sweep_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Replace the BDT (configuration, not learned state)
    pub fn set_bdt(&self, entries: Vec<BdtEntry>) {
        *self.inner.bdt.lock().unwrap() = entries;
    }

    pub fn bdt(&self) -> Vec<BdtEntry> {
        self.inner.bdt.lock().unwrap().clone()
    }

    pub fn fdt(&self) -> Vec<FdtEntry> {
        self.inner.fdt.lock().unwrap().values().copied().collect()
    }

    /// Offer an inbound BVLC to the BBMD. For Forwarded-NPDU, `source`
    /// is the originating address from the frame; `udp_source` is always
    /// the datagram peer. Returns true when the message was consumed and
    /// must not continue down the normal receive path.
    pub fn handle_bvlc(
        &self,
        function: BvlcFunction,
        payload: &[u8],
        source: BipAddress,
        udp_source: BipAddress,
    ) -> bool {
        self.inner.handle_bvlc(function, payload, source, udp_source)
    }
}

impl BbmdInner {
    fn handle_bvlc(
        &self,
        function: BvlcFunction,
        payload: &[u8],
        source: BipAddress,
        udp_source: BipAddress,
    ) -> bool {
        match function {
            BvlcFunction::RegisterForeignDevice => {
                self.register_foreign_device(payload, udp_source);
                true
            }
            BvlcFunction::DeleteFdtEntry => {
                self.delete_fdt_entry(payload, udp_source);
                true
            }
            BvlcFunction::ReadBdt => {
                let encoded: Vec<u8> = self
                    .bdt
                    .lock()
                    .unwrap()
                    .iter()
                    .flat_map(|e| e.encode())
                    .collect();
                self.reply(BvlcFunction::ReadBdtAck, &encoded, udp_source);
                true
            }
            BvlcFunction::ReadFdt => {
                let now = Instant::now();
                let encoded: Vec<u8> = self
                    .fdt
                    .lock()
                    .unwrap()
                    .values()
                    .flat_map(|e| {
                        let mut row = [0u8; 10];
                        row[..6].copy_from_slice(&e.address.encode());
                        row[6..8].copy_from_slice(&e.ttl.to_be_bytes());
                        let remaining = e.remaining(now).as_secs().min(u16::MAX as u64) as u16;
                        row[8..10].copy_from_slice(&remaining.to_be_bytes());
                        row
                    })
                    .collect();
                self.reply(BvlcFunction::ReadFdtAck, &encoded, udp_source);
                true
            }
            BvlcFunction::WriteBdt => {
                self.write_bdt(payload, udp_source);
                true
            }
            BvlcFunction::DistributeBroadcastToNetwork => {
                if !self.fdt.lock().unwrap().contains_key(&udp_source) {
                    debug!(
                        "Distribute-Broadcast from unregistered device {}",
                        udp_source
                    );
                    self.send_result(BvlcResultCode::DistributeBroadcastNak, udp_source);
                    return true;
                }
                self.relay_broadcast(payload, udp_source);
                (self.local_deliver)(payload, udp_source);
                true
            }
            BvlcFunction::OriginalBroadcastNpdu => {
                // Relay to peers and foreign devices, but let the normal
                // receive path deliver the broadcast locally.
                self.relay_broadcast(payload, source);
                false
            }
            BvlcFunction::ForwardedNpdu => {
                if source == self.local_address {
                    debug!("dropping echoed Forwarded-NPDU");
                    return true;
                }
                (self.local_deliver)(payload, source);
                self.replay_to_foreign_devices(payload, source);
                if self.config.rebroadcast_forwarded {
                    let frame = Bytes::from(encode_forwarded_npdu(source, payload));
                    (self.send)(frame, self.broadcast_address);
                }
                true
            }
            _ => false,
        }
    }

    fn register_foreign_device(&self, payload: &[u8], udp_source: BipAddress) {
        if payload.len() != 2 {
            self.send_result(BvlcResultCode::RegisterForeignDeviceNak, udp_source);
            return;
        }
        let ttl = u16::from_be_bytes([payload[0], payload[1]]);
        if ttl == 0 {
            self.send_result(BvlcResultCode::RegisterForeignDeviceNak, udp_source);
            return;
        }

        let mut fdt = self.fdt.lock().unwrap();
        let already_present = fdt.contains_key(&udp_source);
        if !self.config.accept_registrations
            || (fdt.len() >= self.config.max_fdt_entries && !already_present)
        {
            drop(fdt);
            warn!("rejecting foreign device registration from {}", udp_source);
            self.send_result(BvlcResultCode::RegisterForeignDeviceNak, udp_source);
            return;
        }

        let expiry = Instant::now() + Duration::from_secs(ttl as u64) + self.config.grace_period;
        fdt.insert(
            udp_source,
            FdtEntry {
                address: udp_source,
                ttl,
                expiry,
            },
        );
        drop(fdt);
        debug!("foreign device {} registered, ttl {}s", udp_source, ttl);
        self.send_result(BvlcResultCode::Success, udp_source);
    }

    fn delete_fdt_entry(&self, payload: &[u8], udp_source: BipAddress) {
        let removed = BipAddress::decode(payload)
            .ok()
            .and_then(|address| self.fdt.lock().unwrap().remove(&address));
        let code = if removed.is_some() {
            BvlcResultCode::Success
        } else {
            BvlcResultCode::DeleteFdtEntryNak
        };
        self.send_result(code, udp_source);
    }

    fn write_bdt(&self, payload: &[u8], udp_source: BipAddress) {
        if payload.len() % BdtEntry::WIRE_SIZE != 0 {
            self.send_result(BvlcResultCode::WriteBdtNak, udp_source);
            return;
        }
        let entries: Vec<BdtEntry> = match payload
            .chunks_exact(BdtEntry::WIRE_SIZE)
            .map(BdtEntry::decode)
            .collect()
        {
            Ok(entries) => entries,
            Err(_) => {
                self.send_result(BvlcResultCode::WriteBdtNak, udp_source);
                return;
            }
        };
        info!("BDT written with {} entries", entries.len());
        *self.bdt.lock().unwrap() = entries;
        self.send_result(BvlcResultCode::Success, udp_source);
    }

    /// Fan a broadcast out as Forwarded-NPDUs: to every BDT peer except
    /// ourselves and the broadcast's source, and to every registered
    /// foreign device except the source.
    fn relay_broadcast(&self, npdu: &[u8], broadcast_source: BipAddress) {
        let frame = Bytes::from(encode_forwarded_npdu(self.local_address, npdu));
        for entry in self.bdt.lock().unwrap().iter() {
            if entry.address == self.local_address || entry.address == broadcast_source {
                continue;
            }
            (self.send)(frame.clone(), entry.address);
        }
        self.replay_to_foreign_devices_frame(&frame, broadcast_source);
    }

    fn replay_to_foreign_devices(&self, npdu: &[u8], originator: BipAddress) {
        let frame = Bytes::from(encode_forwarded_npdu(originator, npdu));
        self.replay_to_foreign_devices_frame(&frame, originator);
    }

    fn replay_to_foreign_devices_frame(&self, frame: &Bytes, skip: BipAddress) {
        for address in self.fdt.lock().unwrap().keys() {
            if *address == skip {
                continue;
            }
            (self.send)(frame.clone(), *address);
        }
    }

    fn reply(&self, function: BvlcFunction, payload: &[u8], destination: BipAddress) {
        (self.send)(Bytes::from(encode_bvll(function, payload)), destination);
    }

    fn send_result(&self, code: BvlcResultCode, destination: BipAddress) {
        let payload = (code as u16).to_be_bytes();
        self.reply(BvlcFunction::Result, &payload, destination);
    }

    fn sweep_fdt(&self) {
        let now = Instant::now();
        let mut fdt = self.fdt.lock().unwrap();
        let before = fdt.len();
        fdt.retain(|_, entry| entry.expiry > now);
        let removed = before - fdt.len();
        if removed > 0 {
            debug!("swept {} expired foreign device registrations", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::bip::decode_bvll;
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> BipAddress {
        BipAddress::new(Ipv4Addr::new(192, 168, 1, last), 0xBAC0)
    }

    struct Harness {
        bbmd: Bbmd,
        sent: Arc<Mutex<Vec<(Bytes, BipAddress)>>>,
        delivered: Arc<Mutex<Vec<(Vec<u8>, BipAddress)>>>,
    }

    fn harness(config: BbmdConfig) -> Harness {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let send_sink = sent.clone();
        let deliver_sink = delivered.clone();
        let bbmd = Bbmd::new(
            addr(1),
            BipAddress::new(Ipv4Addr::new(192, 168, 1, 255), 0xBAC0),
            Arc::new(move |frame, dest| send_sink.lock().unwrap().push((frame, dest))),
            Arc::new(move |npdu, source| {
                deliver_sink.lock().unwrap().push((npdu.to_vec(), source))
            }),
            config,
        );
        Harness {
            bbmd,
            sent,
            delivered,
        }
    }

    fn result_code(frame: &[u8]) -> BvlcResultCode {
        let msg = decode_bvll(frame).unwrap();
        assert_eq!(msg.function, BvlcFunction::Result);
        BvlcResultCode::try_from(u16::from_be_bytes([msg.data[0], msg.data[1]])).unwrap()
    }

    #[tokio::test]
    async fn test_register_foreign_device() {
        let h = harness(BbmdConfig::default());
        let consumed = h
            .bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], addr(9), addr(9));
        assert!(consumed);

        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, addr(9));
        assert_eq!(result_code(&sent[0].0), BvlcResultCode::Success);

        let fdt = h.bbmd.fdt();
        assert_eq!(fdt.len(), 1);
        assert_eq!(fdt[0].ttl, 60);
    }

    #[tokio::test]
    async fn test_register_rejects_zero_ttl_and_bad_length() {
        let h = harness(BbmdConfig::default());
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x00], addr(9), addr(9));
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x3C], addr(9), addr(9));

        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        for (frame, _) in sent.iter() {
            assert_eq!(result_code(frame), BvlcResultCode::RegisterForeignDeviceNak);
        }
        assert!(h.bbmd.fdt().is_empty());
    }

    #[tokio::test]
    async fn test_register_respects_capacity_and_policy() {
        let h = harness(BbmdConfig {
            max_fdt_entries: 1,
            ..Default::default()
        });
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], addr(8), addr(8));
        // Table full: a new address is NAKed
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], addr(9), addr(9));
        // Refresh of the existing entry still succeeds
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x78], addr(8), addr(8));

        let sent = h.sent.lock().unwrap();
        assert_eq!(result_code(&sent[0].0), BvlcResultCode::Success);
        assert_eq!(result_code(&sent[1].0), BvlcResultCode::RegisterForeignDeviceNak);
        assert_eq!(result_code(&sent[2].0), BvlcResultCode::Success);
        assert_eq!(h.bbmd.fdt()[0].ttl, 120);

        let h = harness(BbmdConfig {
            accept_registrations: false,
            ..Default::default()
        });
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], addr(9), addr(9));
        assert_eq!(
            result_code(&h.sent.lock().unwrap()[0].0),
            BvlcResultCode::RegisterForeignDeviceNak
        );
    }

    #[tokio::test]
    async fn test_delete_fdt_entry() {
        let h = harness(BbmdConfig::default());
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], addr(9), addr(9));
        h.sent.lock().unwrap().clear();

        h.bbmd
            .handle_bvlc(BvlcFunction::DeleteFdtEntry, &addr(9).encode(), addr(2), addr(2));
        assert!(h.bbmd.fdt().is_empty());
        assert_eq!(
            result_code(&h.sent.lock().unwrap()[0].0),
            BvlcResultCode::Success
        );

        h.sent.lock().unwrap().clear();
        h.bbmd
            .handle_bvlc(BvlcFunction::DeleteFdtEntry, &addr(9).encode(), addr(2), addr(2));
        assert_eq!(
            result_code(&h.sent.lock().unwrap()[0].0),
            BvlcResultCode::DeleteFdtEntryNak
        );
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_property() {
        // BDT = [self, P], FDT = {F}; a broadcast from S yields exactly
        // one Forwarded-NPDU to P and one to F, none back to S or self.
        let h = harness(BbmdConfig::default());
        let peer_p = addr(2);
        let fd_f = addr(3);
        let source_s = addr(4);
        h.bbmd
            .set_bdt(vec![BdtEntry::new(addr(1)), BdtEntry::new(peer_p)]);
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], fd_f, fd_f);
        h.sent.lock().unwrap().clear();

        let npdu = [0x01, 0x00, 0xAA];
        let consumed =
            h.bbmd
                .handle_bvlc(BvlcFunction::OriginalBroadcastNpdu, &npdu, source_s, source_s);
        // Not consumed: the transport still delivers the broadcast locally
        assert!(!consumed);

        let sent = h.sent.lock().unwrap();
        let mut destinations: Vec<BipAddress> = sent.iter().map(|(_, d)| *d).collect();
        destinations.sort_by_key(|a| a.encode());
        assert_eq!(destinations, vec![peer_p, fd_f]);

        for (frame, _) in sent.iter() {
            let msg = decode_bvll(frame).unwrap();
            assert_eq!(msg.function, BvlcFunction::ForwardedNpdu);
            assert_eq!(msg.originating_address, Some(addr(1)));
            assert_eq!(msg.data, npdu);
        }
    }

    #[tokio::test]
    async fn test_forwarded_npdu_delivery_and_replay() {
        let h = harness(BbmdConfig::default());
        let fd_a = addr(5);
        let fd_b = addr(6);
        for fd in [fd_a, fd_b] {
            h.bbmd
                .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], fd, fd);
        }
        h.sent.lock().unwrap().clear();

        let npdu = [0x01, 0x00, 0xBB];
        // Forwarded from a peer BBMD, originated by fd_a
        let consumed = h
            .bbmd
            .handle_bvlc(BvlcFunction::ForwardedNpdu, &npdu, fd_a, addr(2));
        assert!(consumed);

        // Delivered locally with the originator as source
        let delivered = h.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], (npdu.to_vec(), fd_a));

        // Replayed only to the other foreign device
        let sent = h.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, fd_b);
    }

    #[tokio::test]
    async fn test_forwarded_echo_dropped() {
        let h = harness(BbmdConfig::default());
        let consumed = h
            .bbmd
            .handle_bvlc(BvlcFunction::ForwardedNpdu, &[0x01, 0x00], addr(1), addr(2));
        assert!(consumed);
        assert!(h.sent.lock().unwrap().is_empty());
        assert!(h.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_distribute_broadcast_requires_registration() {
        let h = harness(BbmdConfig::default());
        let npdu = [0x01, 0x00, 0xCC];

        // Unregistered source is NAKed
        let consumed = h.bbmd.handle_bvlc(
            BvlcFunction::DistributeBroadcastToNetwork,
            &npdu,
            addr(9),
            addr(9),
        );
        assert!(consumed);
        assert_eq!(
            result_code(&h.sent.lock().unwrap()[0].0),
            BvlcResultCode::DistributeBroadcastNak
        );
        assert!(h.delivered.lock().unwrap().is_empty());
        h.sent.lock().unwrap().clear();

        // After registration the broadcast is relayed and delivered
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], addr(9), addr(9));
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], addr(8), addr(8));
        h.bbmd.set_bdt(vec![BdtEntry::new(addr(2))]);
        h.sent.lock().unwrap().clear();

        h.bbmd.handle_bvlc(
            BvlcFunction::DistributeBroadcastToNetwork,
            &npdu,
            addr(9),
            addr(9),
        );
        assert_eq!(h.delivered.lock().unwrap().len(), 1);
        // Relayed to the BDT peer and the other foreign device, not the sender
        let destinations: Vec<BipAddress> =
            h.sent.lock().unwrap().iter().map(|(_, d)| *d).collect();
        assert!(destinations.contains(&addr(2)));
        assert!(destinations.contains(&addr(8)));
        assert!(!destinations.contains(&addr(9)));
    }

    #[tokio::test]
    async fn test_read_bdt_and_fdt() {
        let h = harness(BbmdConfig::default());
        h.bbmd.set_bdt(vec![BdtEntry::new(addr(1)), BdtEntry::new(addr(2))]);
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], addr(9), addr(9));
        h.sent.lock().unwrap().clear();

        h.bbmd
            .handle_bvlc(BvlcFunction::ReadBdt, &[], addr(7), addr(7));
        h.bbmd
            .handle_bvlc(BvlcFunction::ReadFdt, &[], addr(7), addr(7));

        let sent = h.sent.lock().unwrap();
        let bdt_ack = decode_bvll(&sent[0].0).unwrap();
        assert_eq!(bdt_ack.function, BvlcFunction::ReadBdtAck);
        assert_eq!(bdt_ack.data.len(), 2 * BdtEntry::WIRE_SIZE);
        assert_eq!(BdtEntry::decode(&bdt_ack.data).unwrap().address, addr(1));

        let fdt_ack = decode_bvll(&sent[1].0).unwrap();
        assert_eq!(fdt_ack.function, BvlcFunction::ReadFdtAck);
        assert_eq!(fdt_ack.data.len(), 10);
        assert_eq!(BipAddress::decode(&fdt_ack.data[..6]).unwrap(), addr(9));
        assert_eq!(u16::from_be_bytes([fdt_ack.data[6], fdt_ack.data[7]]), 60);
    }

    #[tokio::test]
    async fn test_write_bdt() {
        let h = harness(BbmdConfig::default());
        let mut payload = Vec::new();
        payload.extend_from_slice(&BdtEntry::new(addr(1)).encode());
        payload.extend_from_slice(&BdtEntry::new(addr(2)).encode());
        h.bbmd
            .handle_bvlc(BvlcFunction::WriteBdt, &payload, addr(7), addr(7));
        assert_eq!(h.bbmd.bdt().len(), 2);
        assert_eq!(
            result_code(&h.sent.lock().unwrap()[0].0),
            BvlcResultCode::Success
        );

        h.sent.lock().unwrap().clear();
        h.bbmd
            .handle_bvlc(BvlcFunction::WriteBdt, &payload[..7], addr(7), addr(7));
        assert_eq!(
            result_code(&h.sent.lock().unwrap()[0].0),
            BvlcResultCode::WriteBdtNak
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fdt_sweep_honors_ttl_plus_grace() {
        let h = harness(BbmdConfig {
            grace_period: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            ..Default::default()
        });
        h.bbmd.start();
        h.bbmd
            .handle_bvlc(BvlcFunction::RegisterForeignDevice, &[0x00, 0x3C], addr(9), addr(9));

        // TTL has elapsed but the grace period has not
        tokio::time::sleep(Duration::from_secs(75)).await;
        assert_eq!(h.bbmd.fdt().len(), 1);

        // TTL + grace elapsed: the row is swept
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(h.bbmd.fdt().is_empty());
        h.bbmd.stop();
    }

    #[tokio::test]
    async fn test_unhandled_functions_not_consumed() {
        let h = harness(BbmdConfig::default());
        assert!(!h
            .bbmd
            .handle_bvlc(BvlcFunction::OriginalUnicastNpdu, &[0x01], addr(9), addr(9)));
        assert!(!h
            .bbmd
            .handle_bvlc(BvlcFunction::Result, &[0x00, 0x00], addr(9), addr(9)));
    }
}
