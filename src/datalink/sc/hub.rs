//! BACnet/SC hub (AB.5.3)
//!
//! Hosts many accepting connections keyed by peer VMAC and switches
//! Encapsulated-NPDUs between them: broadcast frames go to every
//! connected node except the sender, unicast frames only to the
//! addressed node. Forwarding reuses the raw frame bytes; only the
//! routing fields are examined, and a missing source VMAC is stamped in
//! before the frame travels on.
//!
//! A second Connect-Request carrying an in-use VMAC with a different
//! device UUID is refused with a Duplicate-VMAC NAK.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::connection::{ScConnection, ScConnectionConfig, VmacChecker};
use super::{
    BvlcScFunction, DeviceUuid, Result, ScError, ScMessage, ScVmac, SC_DEFAULT_MAX_BVLC,
    SC_DEFAULT_MAX_NPDU,
};

/// Hub-addressed NPDU delivery: `(npdu_bytes, source_vmac)`
pub type HubNpduCallback = Arc<dyn Fn(&[u8], ScVmac) + Send + Sync>;

/// Hub settings
#[derive(Debug, Clone)]
pub struct ScHubConfig {
    pub max_bvlc_length: u16,
    pub max_npdu_length: u16,
    pub connection: ScConnectionConfig,
}

impl Default for ScHubConfig {
    fn default() -> Self {
        Self {
            max_bvlc_length: SC_DEFAULT_MAX_BVLC,
            max_npdu_length: SC_DEFAULT_MAX_NPDU,
            connection: ScConnectionConfig::default(),
        }
    }
}

struct ScHubInner {
    vmac: ScVmac,
    uuid: DeviceUuid,
    config: ScHubConfig,
    peers: Mutex<HashMap<ScVmac, ScConnection>>,
    on_npdu: Mutex<Option<HubNpduCallback>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// A BACnet/SC hub. Cheap to clone.
#[derive(Clone)]
pub struct ScHub {
    inner: Arc<ScHubInner>,
}

impl ScHub {
    pub fn new(vmac: ScVmac, uuid: DeviceUuid, config: ScHubConfig) -> Self {
        Self {
            inner: Arc::new(ScHubInner {
                vmac,
                uuid,
                config,
                peers: Mutex::new(HashMap::new()),
                on_npdu: Mutex::new(None),
                listener_task: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// NPDUs addressed to the hub itself (or broadcast) land here.
    pub fn on_npdu(&self, callback: HubNpduCallback) {
        *self.inner.on_npdu.lock().unwrap() = Some(callback);
    }

    pub fn vmac(&self) -> ScVmac {
        self.inner.vmac
    }

    /// The bound listener address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    pub fn connected_peers(&self) -> Vec<ScVmac> {
        self.inner.peers.lock().unwrap().keys().copied().collect()
    }

    /// Bind and start accepting node connections. A bind failure is the
    /// caller's startup error; everything after that is per-connection.
    pub async fn start(&self, bind: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| ScError::WebSocket(format!("hub bind failed: {}", e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| ScError::WebSocket(e.to_string()))?;
        *self.inner.local_addr.lock().unwrap() = Some(local);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!("hub: inbound socket from {}", peer_addr);
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            inner.handle_incoming(stream).await;
                        });
                    }
                    Err(e) => {
                        warn!("hub accept failed: {}", e);
                        return;
                    }
                }
            }
        });
        *self.inner.listener_task.lock().unwrap() = Some(task);
        info!("SC hub {} listening on {}", self.inner.vmac, local);
        Ok(local)
    }

    /// Stop listening and disconnect every node.
    pub async fn stop(&self) {
        if let Some(task) = self.inner.listener_task.lock().unwrap().take() {
            task.abort();
        }
        let peers: Vec<ScConnection> = {
            let mut peers = self.inner.peers.lock().unwrap();
            peers.drain().map(|(_, connection)| connection).collect()
        };
        for connection in peers {
            connection.disconnect().await;
        }
        info!("SC hub stopped");
    }
}

impl ScHubInner {
    async fn handle_incoming(self: Arc<Self>, stream: tokio::net::TcpStream) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("hub: WebSocket upgrade failed: {}", e);
                return;
            }
        };

        let connection = ScConnection::new(
            self.vmac,
            self.uuid,
            self.config.connection.clone(),
            self.config.max_bvlc_length,
            self.config.max_npdu_length,
        );

        // Same VMAC with a different UUID is a collision; the same
        // device reconnecting is allowed (the stale entry is replaced).
        let checker: VmacChecker = {
            let inner = self.clone();
            Arc::new(move |vmac, uuid| match inner.peers.lock().unwrap().get(vmac) {
                Some(existing) => existing
                    .peer()
                    .map(|peer| peer.uuid == *uuid)
                    .unwrap_or(false),
                None => true,
            })
        };

        // Wire routing before the handshake finishes so no early frame
        // is lost.
        {
            let inner = self.clone();
            let source = connection.clone();
            connection.on_message(Arc::new(move |message, raw| {
                inner.route(&source, message, raw);
            }));
        }

        if let Err(e) = connection.accept(ws, Some(checker)).await {
            debug!("hub: connection rejected: {}", e);
            return;
        }

        let Some(peer) = connection.peer() else { return };
        let stale = {
            let mut peers = self.peers.lock().unwrap();
            let stale = peers.remove(&peer.vmac);
            peers.insert(peer.vmac, connection.clone());
            stale
        };
        if let Some(stale) = stale {
            debug!("hub: replacing stale connection for {}", peer.vmac);
            stale.disconnect().await;
        }
        info!("hub: node {} connected", peer.vmac);

        // Drop the table entry when the node goes away
        let inner = self.clone();
        let vmac = peer.vmac;
        let this = connection.clone();
        connection.on_disconnected(Arc::new(move || {
            let mut peers = inner.peers.lock().unwrap();
            if peers.get(&vmac).map(|c| c.same(&this)).unwrap_or(false) {
                peers.remove(&vmac);
                info!("hub: node {} disconnected", vmac);
            }
        }));
    }

    fn route(&self, source_connection: &ScConnection, message: ScMessage, raw: Bytes) {
        let source_vmac = message
            .source
            .or_else(|| source_connection.peer().map(|peer| peer.vmac));
        let Some(source_vmac) = source_vmac else {
            return;
        };

        match message.function {
            BvlcScFunction::EncapsulatedNpdu => {
                // Stamp the source VMAC so receivers can answer; reuse
                // the raw bytes when it is already present.
                let frame = if message.source.is_some() {
                    raw
                } else {
                    let mut stamped = message.clone();
                    stamped.source = Some(source_vmac);
                    Bytes::from(stamped.encode())
                };

                match message.destination {
                    Some(destination) if destination.is_broadcast() => {
                        self.deliver_local(&message.payload, source_vmac);
                        self.forward_to_all_except(frame, source_vmac);
                    }
                    Some(destination) if destination == self.vmac => {
                        self.deliver_local(&message.payload, source_vmac);
                    }
                    Some(destination) => {
                        let target = self.peers.lock().unwrap().get(&destination).cloned();
                        match target {
                            Some(connection) => {
                                if let Err(e) = connection.send_raw(frame) {
                                    debug!("hub: forward to {} failed: {}", destination, e);
                                }
                            }
                            None => {
                                debug!("hub: no route to {}, dropping", destination)
                            }
                        }
                    }
                    None => self.deliver_local(&message.payload, source_vmac),
                }
            }
            BvlcScFunction::AddressResolution => {
                let mut ack =
                    ScMessage::new(BvlcScFunction::AddressResolutionAck, message.message_id);
                ack.destination = Some(source_vmac);
                ack.source = Some(self.vmac);
                if let Err(e) = source_connection.send_message(&ack) {
                    debug!("hub: address resolution ack failed: {}", e);
                }
            }
            BvlcScFunction::AdvertisementSolicitation => {
                // Advertisement payload: hub status, direct-connect
                // support, our frame limits (AB.2.12)
                let mut payload = vec![0x01, 0x00];
                payload.extend_from_slice(&self.config.max_bvlc_length.to_be_bytes());
                payload.extend_from_slice(&self.config.max_npdu_length.to_be_bytes());
                let mut advertisement = ScMessage::with_payload(
                    BvlcScFunction::Advertisement,
                    message.message_id,
                    payload,
                );
                advertisement.destination = Some(source_vmac);
                advertisement.source = Some(self.vmac);
                if let Err(e) = source_connection.send_message(&advertisement) {
                    debug!("hub: advertisement failed: {}", e);
                }
            }
            other => debug!("hub: ignoring {:?} from {}", other, source_vmac),
        }
    }

    fn deliver_local(&self, npdu: &[u8], source: ScVmac) {
        if let Some(callback) = self.on_npdu.lock().unwrap().clone() {
            callback(npdu, source);
        }
    }

    fn forward_to_all_except(&self, frame: Bytes, source: ScVmac) {
        let targets: Vec<(ScVmac, ScConnection)> = {
            let peers = self.peers.lock().unwrap();
            peers
                .iter()
                .filter(|(vmac, _)| **vmac != source)
                .map(|(vmac, connection)| (*vmac, connection.clone()))
                .collect()
        };
        for (vmac, connection) in targets {
            if let Err(e) = connection.send_raw(frame.clone()) {
                debug!("hub: broadcast to {} failed: {}", vmac, e);
            }
        }
    }
}
