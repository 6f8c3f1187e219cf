//! Hub-connected BACnet/SC node as a router transport port.
//!
//! [`ScTransport`] dials the hub, runs the initiating handshake, and
//! maps the [`crate::datalink::TransportPort`] contract onto
//! Encapsulated-NPDU frames: the 6-byte MAC of this data link is the
//! node VMAC, and a broadcast is the FF:FF:FF:FF:FF:FF destination.
//!
//! A Duplicate-VMAC NAK during connect regenerates the local VMAC and
//! retries with a fresh socket.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};

use super::connection::{ScConnection, ScConnectionConfig, ScConnectionState};
use super::{
    BvlcScFunction, DeviceUuid, ScMessage, ScVmac, SC_DEFAULT_MAX_BVLC, SC_DEFAULT_MAX_NPDU,
};
use crate::datalink::{DataLinkError, ReceiveCallback, Result, TransportPort};

/// Node transport settings
#[derive(Debug, Clone)]
pub struct ScNodeConfig {
    /// Hub WebSocket URI, e.g. `ws://hub.example:47809`
    pub hub_uri: String,
    /// Fixed VMAC; a random one is generated when `None`
    pub vmac: Option<ScVmac>,
    /// Device UUID; generated when `None`
    pub uuid: Option<DeviceUuid>,
    pub max_bvlc_length: u16,
    pub max_npdu_length: u16,
    pub connection: ScConnectionConfig,
    /// Connect attempts before giving up (also bounds VMAC-collision
    /// retries)
    pub max_connect_attempts: u32,
}

impl ScNodeConfig {
    pub fn new(hub_uri: impl Into<String>) -> Self {
        Self {
            hub_uri: hub_uri.into(),
            vmac: None,
            uuid: None,
            max_bvlc_length: SC_DEFAULT_MAX_BVLC,
            max_npdu_length: SC_DEFAULT_MAX_NPDU,
            connection: ScConnectionConfig::default(),
            max_connect_attempts: 3,
        }
    }
}

struct ScNodeInner {
    config: ScNodeConfig,
    vmac: Mutex<ScVmac>,
    uuid: DeviceUuid,
    connection: Mutex<Option<ScConnection>>,
    receive_callback: Mutex<Option<ReceiveCallback>>,
    connection_lost: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

/// BACnet/SC node transport. Cheap to clone.
#[derive(Clone)]
pub struct ScTransport {
    inner: Arc<ScNodeInner>,
}

impl ScTransport {
    pub fn new(config: ScNodeConfig) -> Self {
        let vmac = config.vmac.unwrap_or_else(ScVmac::random);
        let uuid = config.uuid.unwrap_or_else(DeviceUuid::new_v4);
        Self {
            inner: Arc::new(ScNodeInner {
                config,
                vmac: Mutex::new(vmac),
                uuid,
                connection: Mutex::new(None),
                receive_callback: Mutex::new(None),
                connection_lost: Mutex::new(None),
            }),
        }
    }

    /// The node's current VMAC (may change after collision retries)
    pub fn vmac(&self) -> ScVmac {
        *self.inner.vmac.lock().unwrap()
    }

    /// Called when the hub connection drops outside a graceful stop.
    /// Owners typically wire this to
    /// [`crate::transaction::TransactionManager::abort_all_clients`]
    /// with `AbortReason::CommunicationDisabled`.
    pub fn on_connection_lost(&self, callback: Arc<dyn Fn() + Send + Sync>) {
        *self.inner.connection_lost.lock().unwrap() = Some(callback);
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.state() == ScConnectionState::Connected)
            .unwrap_or(false)
    }

    fn connection(&self) -> Result<ScConnection> {
        self.inner
            .connection
            .lock()
            .unwrap()
            .clone()
            .ok_or(DataLinkError::NotStarted)
    }
}

#[async_trait]
impl TransportPort for ScTransport {
    async fn start(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut last_error = DataLinkError::ConnectionClosed;
        for attempt in 1..=self.inner.config.max_connect_attempts {
            let vmac = self.vmac();
            let connection = ScConnection::new(
                vmac,
                self.inner.uuid,
                self.inner.config.connection.clone(),
                self.inner.config.max_bvlc_length,
                self.inner.config.max_npdu_length,
            );

            {
                let inner = self.inner.clone();
                connection.on_disconnected(Arc::new(move || {
                    if let Some(callback) = inner.connection_lost.lock().unwrap().clone() {
                        callback();
                    }
                }));
            }

            let inner = self.inner.clone();
            connection.on_message(Arc::new(move |message, _raw| {
                if message.function != BvlcScFunction::EncapsulatedNpdu {
                    debug!("node: ignoring {:?}", message.function);
                    return;
                }
                let source_mac = message
                    .source
                    .map(|vmac| vmac.as_bytes().to_vec())
                    .unwrap_or_default();
                let callback = inner.receive_callback.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(&message.payload, &source_mac);
                }
            }));

            let (ws, _) =
                match tokio_tungstenite::connect_async(self.inner.config.hub_uri.as_str()).await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(
                        "hub connect attempt {} to {} failed: {}",
                        attempt, self.inner.config.hub_uri, e
                    );
                    last_error = DataLinkError::IoError(std::io::Error::other(e));
                    continue;
                }
            };

            match connection.initiate(ws).await {
                Ok(()) => {
                    info!(
                        "SC node {} connected to hub {}",
                        vmac, self.inner.config.hub_uri
                    );
                    *self.inner.connection.lock().unwrap() = Some(connection);
                    return Ok(());
                }
                Err(super::ScError::DuplicateVmac) => {
                    // The caller of the collision contract is us: pick a
                    // fresh VMAC and dial again.
                    let fresh = ScVmac::random();
                    info!("VMAC {} collided, retrying as {}", vmac, fresh);
                    *self.inner.vmac.lock().unwrap() = fresh;
                    last_error = super::ScError::DuplicateVmac.into();
                }
                Err(e) => {
                    last_error = e.into();
                }
            }
        }
        Err(last_error)
    }

    async fn stop(&self) -> Result<()> {
        let connection = self.inner.connection.lock().unwrap().take();
        if let Some(connection) = connection {
            // A requested stop is not a lost connection
            connection.on_disconnected(Arc::new(|| {}));
            connection.disconnect().await;
        }
        Ok(())
    }

    fn send_unicast(&self, npdu: &[u8], mac: &[u8]) -> Result<()> {
        let destination =
            ScVmac::from_slice(mac).map_err(|e| DataLinkError::InvalidFrame(e.to_string()))?;
        let connection = self.connection()?;
        let mut message = ScMessage::with_payload(
            BvlcScFunction::EncapsulatedNpdu,
            connection.next_message_id(),
            npdu.to_vec(),
        );
        message.destination = Some(destination);
        message.source = Some(self.vmac());
        connection.send_message(&message).map_err(DataLinkError::from)
    }

    fn send_broadcast(&self, npdu: &[u8]) -> Result<()> {
        self.send_unicast(npdu, ScVmac::BROADCAST.as_bytes())
    }

    fn on_receive(&self, callback: ReceiveCallback) {
        *self.inner.receive_callback.lock().unwrap() = Some(callback);
    }

    fn local_mac(&self) -> Vec<u8> {
        self.vmac().as_bytes().to_vec()
    }

    fn max_npdu_length(&self) -> usize {
        self.inner
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|c| c.negotiated_max_npdu())
            .unwrap_or(self.inner.config.max_npdu_length) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::super::hub::{ScHub, ScHubConfig};
    use super::*;
    use std::time::Duration;

    async fn started_hub() -> (ScHub, String) {
        let hub = ScHub::new(ScVmac::random(), DeviceUuid::new_v4(), ScHubConfig::default());
        let addr = hub
            .start("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        (hub, format!("ws://{}", addr))
    }

    async fn connected_node(uri: &str, config: impl Fn(&mut ScNodeConfig)) -> ScTransport {
        let mut node_config = ScNodeConfig::new(uri);
        config(&mut node_config);
        let node = ScTransport::new(node_config);
        node.start().await.unwrap();
        node
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..500 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_unicast_routed_through_hub() {
        let (hub, uri) = started_hub().await;
        let node_a = connected_node(&uri, |_| {}).await;
        let node_b = connected_node(&uri, |_| {}).await;
        wait_until(|| hub.connected_peers().len() == 2).await;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        node_b.on_receive(Arc::new(move |npdu, mac| {
            sink.lock().unwrap().push((npdu.to_vec(), mac.to_vec()));
        }));

        node_a
            .send_unicast(&[0x01, 0x00, 0xAA], &node_b.local_mac())
            .unwrap();

        wait_until(|| !received.lock().unwrap().is_empty()).await;
        let received = received.lock().unwrap();
        assert_eq!(received[0].0, vec![0x01, 0x00, 0xAA]);
        assert_eq!(received[0].1, node_a.local_mac());

        node_a.stop().await.unwrap();
        node_b.stop().await.unwrap();
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_other_nodes() {
        let (hub, uri) = started_hub().await;
        let node_a = connected_node(&uri, |_| {}).await;
        let node_b = connected_node(&uri, |_| {}).await;
        let node_c = connected_node(&uri, |_| {}).await;
        wait_until(|| hub.connected_peers().len() == 3).await;

        let hits = Arc::new(Mutex::new(0usize));
        for node in [&node_b, &node_c] {
            let sink = hits.clone();
            node.on_receive(Arc::new(move |_npdu, _mac| {
                *sink.lock().unwrap() += 1;
            }));
        }
        let self_hits = Arc::new(Mutex::new(0usize));
        {
            let sink = self_hits.clone();
            node_a.on_receive(Arc::new(move |_npdu, _mac| {
                *sink.lock().unwrap() += 1;
            }));
        }

        node_a.send_broadcast(&[0x01, 0x00, 0xBB]).unwrap();

        wait_until(|| *hits.lock().unwrap() == 2).await;
        // The sender never hears its own broadcast back
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*self_hits.lock().unwrap(), 0);

        for node in [node_a, node_b, node_c] {
            node.stop().await.unwrap();
        }
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_vmac_collision_triggers_regeneration() {
        let (hub, uri) = started_hub().await;
        let shared_vmac = ScVmac::random();

        let node_a = connected_node(&uri, |c| c.vmac = Some(shared_vmac)).await;
        wait_until(|| hub.connected_peers().len() == 1).await;

        // Same VMAC, different UUID: the hub NAKs with Duplicate-VMAC
        // and the node retries under a fresh address.
        let node_b = connected_node(&uri, |c| c.vmac = Some(shared_vmac)).await;
        wait_until(|| hub.connected_peers().len() == 2).await;

        assert_eq!(node_a.vmac(), shared_vmac);
        assert_ne!(node_b.vmac(), shared_vmac);
        assert!(node_b.is_connected());

        node_a.stop().await.unwrap();
        node_b.stop().await.unwrap();
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_hub_local_delivery() {
        let (hub, uri) = started_hub().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        hub.on_npdu(Arc::new(move |npdu, source| {
            sink.lock().unwrap().push((npdu.to_vec(), source));
        }));

        let node = connected_node(&uri, |_| {}).await;
        wait_until(|| hub.connected_peers().len() == 1).await;

        // Addressed to the hub itself
        node.send_unicast(&[0x01, 0x00, 0xCC], hub.vmac().as_bytes())
            .unwrap();
        wait_until(|| !received.lock().unwrap().is_empty()).await;
        {
            let received = received.lock().unwrap();
            assert_eq!(received[0].0, vec![0x01, 0x00, 0xCC]);
            assert_eq!(received[0].1.as_bytes(), node.local_mac().as_slice());
        }

        // Broadcasts are delivered to the hub as well
        node.send_broadcast(&[0x01, 0x00, 0xDD]).unwrap();
        wait_until(|| received.lock().unwrap().len() == 2).await;

        node.stop().await.unwrap();
        hub.stop().await;
    }

    #[tokio::test]
    async fn test_node_disconnect_removes_hub_entry() {
        let (hub, uri) = started_hub().await;
        let node = connected_node(&uri, |_| {}).await;
        wait_until(|| hub.connected_peers().len() == 1).await;

        node.stop().await.unwrap();
        wait_until(|| hub.connected_peers().is_empty()).await;
        hub.stop().await;
    }
}
