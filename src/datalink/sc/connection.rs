//! BACnet/SC connection state machine (AB.6.2)
//!
//! One [`ScConnection`] drives a single WebSocket to a hub or direct
//! peer through the initiating (Figure AB-11) or accepting
//! (Figure AB-12) handshake, then into Connected operation: heartbeat
//! (initiator only), Disconnect-Request/ACK, and NAKs for malformed
//! frames.
//!
//! The socket is split once: a writer task drains an outbound queue
//! (total send order), a reader task dispatches inbound frames. The
//! state machine advances monotonically within a handshake attempt and
//! drops back to Idle on any failure; waiting senders then observe
//! `NotConnected`.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{
    BvlcScFunction, ConnectPayload, DeviceUuid, Result, ScError, ScMessage, ScResultPayload,
    ScVmac, ERROR_CLASS_COMMUNICATION,
};

/// Connection state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScConnectionState {
    Idle,
    /// Waiting for the WebSocket to come up (owned by the caller)
    AwaitingSocket,
    /// Initiator: Connect-Request sent, waiting for Connect-Accept
    AwaitingAccept,
    /// Acceptor: waiting for the peer's Connect-Request
    AwaitingRequest,
    Connected,
    Disconnecting,
}

impl fmt::Display for ScConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScConnectionState::Idle => "Idle",
            ScConnectionState::AwaitingSocket => "AwaitingSocket",
            ScConnectionState::AwaitingAccept => "AwaitingAccept",
            ScConnectionState::AwaitingRequest => "AwaitingRequest",
            ScConnectionState::Connected => "Connected",
            ScConnectionState::Disconnecting => "Disconnecting",
        };
        f.write_str(name)
    }
}

/// Whether this side initiated or accepted the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScConnectionRole {
    Initiating,
    Accepting,
}

/// Timeouts for an SC connection
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScConnectionConfig {
    /// Handshake wait (AB.6.2: Connect_Wait_Timeout)
    pub connect_wait_timeout: Duration,
    /// Bounded wait for Disconnect-ACK during graceful close
    pub disconnect_wait_timeout: Duration,
    /// Idle time before the initiator probes with Heartbeat-Request
    pub heartbeat_timeout: Duration,
}

impl Default for ScConnectionConfig {
    fn default() -> Self {
        Self {
            connect_wait_timeout: Duration::from_secs(10),
            disconnect_wait_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(300),
        }
    }
}

/// Peer identity and limits captured during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScPeerInfo {
    pub vmac: ScVmac,
    pub uuid: DeviceUuid,
    pub max_bvlc_length: u16,
    pub max_npdu_length: u16,
}

/// Accept/deny an incoming Connect-Request's `(vmac, uuid)` pair
pub type VmacChecker = Arc<dyn Fn(&ScVmac, &DeviceUuid) -> bool + Send + Sync>;
/// Delivery of non-housekeeping frames: `(decoded, raw)` so a hub can
/// forward without re-encoding
pub type MessageCallback = Arc<dyn Fn(ScMessage, Bytes) + Send + Sync>;
/// Connection lifecycle notification
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

struct ConnState {
    state: ScConnectionState,
    role: Option<ScConnectionRole>,
    peer: Option<ScPeerInfo>,
    message_id: u16,
}

struct ScConnectionInner {
    config: ScConnectionConfig,
    local_uuid: DeviceUuid,
    local_vmac: Mutex<ScVmac>,
    max_bvlc_length: u16,
    max_npdu_length: u16,
    state: Mutex<ConnState>,
    last_recv: Mutex<Instant>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    disconnect_ack: Mutex<Option<oneshot::Sender<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    on_connected: Mutex<Option<EventCallback>>,
    on_disconnected: Mutex<Option<EventCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_vmac_collision: Mutex<Option<EventCallback>>,
}

/// A single BACnet/SC connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ScConnection {
    inner: Arc<ScConnectionInner>,
}

impl ScConnection {
    pub fn new(
        local_vmac: ScVmac,
        local_uuid: DeviceUuid,
        config: ScConnectionConfig,
        max_bvlc_length: u16,
        max_npdu_length: u16,
    ) -> Self {
        Self {
            inner: Arc::new(ScConnectionInner {
                config,
                local_uuid,
                local_vmac: Mutex::new(local_vmac),
                max_bvlc_length,
                max_npdu_length,
                state: Mutex::new(ConnState {
                    state: ScConnectionState::Idle,
                    role: None,
                    peer: None,
                    message_id: 0,
                }),
                last_recv: Mutex::new(Instant::now()),
                outbound: Mutex::new(None),
                disconnect_ack: Mutex::new(None),
                reader_task: Mutex::new(None),
                heartbeat_task: Mutex::new(None),
                on_connected: Mutex::new(None),
                on_disconnected: Mutex::new(None),
                on_message: Mutex::new(None),
                on_vmac_collision: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ScConnectionState {
        self.inner.state.lock().unwrap().state
    }

    pub fn role(&self) -> Option<ScConnectionRole> {
        self.inner.state.lock().unwrap().role
    }

    pub fn peer(&self) -> Option<ScPeerInfo> {
        self.inner.state.lock().unwrap().peer
    }

    pub fn local_vmac(&self) -> ScVmac {
        *self.inner.local_vmac.lock().unwrap()
    }

    /// Replace the local VMAC (after a collision NAK, before retrying)
    pub fn set_local_vmac(&self, vmac: ScVmac) {
        *self.inner.local_vmac.lock().unwrap() = vmac;
    }

    /// Negotiated frame limit: the smaller of both sides' offers
    pub fn negotiated_max_bvlc(&self) -> Option<u16> {
        self.peer()
            .map(|peer| peer.max_bvlc_length.min(self.inner.max_bvlc_length))
    }

    /// Negotiated NPDU limit: the smaller of both sides' offers
    pub fn negotiated_max_npdu(&self) -> Option<u16> {
        self.peer()
            .map(|peer| peer.max_npdu_length.min(self.inner.max_npdu_length))
    }

    pub fn on_connected(&self, callback: EventCallback) {
        *self.inner.on_connected.lock().unwrap() = Some(callback);
    }

    pub fn on_disconnected(&self, callback: EventCallback) {
        *self.inner.on_disconnected.lock().unwrap() = Some(callback);
    }

    pub fn on_message(&self, callback: MessageCallback) {
        *self.inner.on_message.lock().unwrap() = Some(callback);
    }

    pub fn on_vmac_collision(&self, callback: EventCallback) {
        *self.inner.on_vmac_collision.lock().unwrap() = Some(callback);
    }

    /// True when both handles drive the same connection
    pub fn same(&self, other: &ScConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn next_message_id(&self) -> u16 {
        let mut state = self.inner.state.lock().unwrap();
        state.message_id = state.message_id.wrapping_add(1);
        state.message_id
    }

    /// Run the initiating handshake (Figure AB-11) on an established
    /// WebSocket: Idle → AwaitingAccept → Connected, or Idle on any
    /// failure. A Duplicate-VMAC NAK fires the collision callback and
    /// returns [`ScError::DuplicateVmac`].
    pub async fn initiate<S>(&self, ws: WebSocketStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.enter_handshake(
            ScConnectionRole::Initiating,
            ScConnectionState::AwaitingAccept,
        )?;
        let (mut sink, mut stream) = ws.split();

        let request = ScMessage::with_payload(
            BvlcScFunction::ConnectRequest,
            self.next_message_id(),
            ConnectPayload {
                vmac: self.local_vmac(),
                uuid: self.inner.local_uuid,
                max_bvlc_length: self.inner.max_bvlc_length,
                max_npdu_length: self.inner.max_npdu_length,
            }
            .encode(),
        );
        if let Err(e) = sink.send(Message::Binary(request.encode())).await {
            self.inner.go_idle(false);
            return Err(ScError::WebSocket(e.to_string()));
        }

        let deadline = Instant::now() + self.inner.config.connect_wait_timeout;
        let raw = match recv_binary(&mut stream, deadline).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("connect wait failed: {}", e);
                self.inner.go_idle(false);
                return Err(e);
            }
        };
        let response = match ScMessage::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                self.inner.go_idle(false);
                return Err(e);
            }
        };

        match response.function {
            BvlcScFunction::ConnectAccept => {
                let accept = match ConnectPayload::decode(&response.payload) {
                    Ok(accept) => accept,
                    Err(e) => {
                        self.inner.go_idle(false);
                        return Err(e);
                    }
                };
                self.inner.enter_connected(accept);
                self.inner.spawn_tasks(sink, stream, true);
                info!("SC connection established to {}", accept.vmac);
                self.inner.fire(&self.inner.on_connected);
                Ok(())
            }
            BvlcScFunction::Result => {
                let is_collision = ScResultPayload::decode(&response.payload)
                    .map(|r| r.is_duplicate_vmac())
                    .unwrap_or(false);
                if is_collision {
                    warn!("hub refused VMAC {} as duplicate", self.local_vmac());
                    self.inner.fire(&self.inner.on_vmac_collision);
                    self.inner.go_idle(false);
                    Err(ScError::DuplicateVmac)
                } else {
                    self.inner.go_idle(false);
                    Err(ScError::InvalidFrame("connect refused".into()))
                }
            }
            other => {
                self.inner.go_idle(false);
                Err(ScError::InvalidFrame(format!(
                    "unexpected {:?} during handshake",
                    other
                )))
            }
        }
    }

    /// Run the accepting handshake (Figure AB-12): Idle →
    /// AwaitingRequest → Connected, or Idle on failure. `vmac_checker`
    /// decides collisions; a refused pair is NAKed with
    /// Duplicate-VMAC.
    pub async fn accept<S>(
        &self,
        ws: WebSocketStream<S>,
        vmac_checker: Option<VmacChecker>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.enter_handshake(
            ScConnectionRole::Accepting,
            ScConnectionState::AwaitingRequest,
        )?;
        let (mut sink, mut stream) = ws.split();

        let deadline = Instant::now() + self.inner.config.connect_wait_timeout;
        let raw = match recv_binary(&mut stream, deadline).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("accept wait failed: {}", e);
                self.inner.go_idle(false);
                return Err(e);
            }
        };
        let request = match ScMessage::decode(&raw) {
            Ok(message) if message.function == BvlcScFunction::ConnectRequest => message,
            Ok(other) => {
                self.inner.go_idle(false);
                return Err(ScError::InvalidFrame(format!(
                    "expected Connect-Request, got {:?}",
                    other.function
                )));
            }
            Err(e) => {
                self.inner.go_idle(false);
                return Err(e);
            }
        };
        let payload = match ConnectPayload::decode(&request.payload) {
            Ok(payload) => payload,
            Err(e) => {
                self.inner.go_idle(false);
                return Err(e);
            }
        };

        if let Some(checker) = vmac_checker {
            if !checker(&payload.vmac, &payload.uuid) {
                let nak = ScMessage::with_payload(
                    BvlcScFunction::Result,
                    request.message_id,
                    ScResultPayload::duplicate_vmac(BvlcScFunction::ConnectRequest).encode(),
                );
                let _ = sink.send(Message::Binary(nak.encode())).await;
                self.inner.go_idle(false);
                return Err(ScError::DuplicateVmac);
            }
        }

        let accept = ScMessage::with_payload(
            BvlcScFunction::ConnectAccept,
            request.message_id,
            ConnectPayload {
                vmac: self.local_vmac(),
                uuid: self.inner.local_uuid,
                max_bvlc_length: self.inner.max_bvlc_length,
                max_npdu_length: self.inner.max_npdu_length,
            }
            .encode(),
        );
        if let Err(e) = sink.send(Message::Binary(accept.encode())).await {
            self.inner.go_idle(false);
            return Err(ScError::WebSocket(e.to_string()));
        }

        self.inner.enter_connected(payload);
        self.inner.spawn_tasks(sink, stream, false);
        info!("SC connection accepted from {}", payload.vmac);
        self.inner.fire(&self.inner.on_connected);
        Ok(())
    }

    /// Queue a message for transmission; fails unless Connected.
    pub fn send_message(&self, message: &ScMessage) -> Result<()> {
        if self.state() != ScConnectionState::Connected {
            return Err(ScError::NotConnected);
        }
        self.inner.enqueue(Bytes::from(message.encode()))
    }

    /// Queue pre-encoded frame bytes, skipping the encoder. Used by the
    /// hub to forward frames as-is.
    pub fn send_raw(&self, frame: Bytes) -> Result<()> {
        if self.state() != ScConnectionState::Connected {
            return Err(ScError::NotConnected);
        }
        self.inner.enqueue(frame)
    }

    /// Graceful close: silence the heartbeat, send Disconnect-Request,
    /// wait (bounded) for the Disconnect-ACK, then drop the transport.
    pub async fn disconnect(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.state != ScConnectionState::Connected {
                drop(state);
                self.inner.go_idle(false);
                return;
            }
            state.state = ScConnectionState::Disconnecting;
        }
        debug!("SC connection {}: disconnecting", self.local_vmac());

        // Quiet the heartbeat before the close handshake, waiting for it
        // to actually stop so nothing else writes mid-close.
        let heartbeat = self.inner.heartbeat_task.lock().unwrap().take();
        if let Some(task) = heartbeat {
            task.abort();
            let _ = task.await;
        }

        let (tx, rx) = oneshot::channel();
        *self.inner.disconnect_ack.lock().unwrap() = Some(tx);
        let request = ScMessage::new(BvlcScFunction::DisconnectRequest, self.next_message_id());
        if self.inner.enqueue(Bytes::from(request.encode())).is_ok() {
            let _ = timeout(self.inner.config.disconnect_wait_timeout, rx).await;
        }
        self.inner.go_idle(true);
    }
}

impl ScConnectionInner {
    fn enter_handshake(
        &self,
        role: ScConnectionRole,
        next: ScConnectionState,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.state != ScConnectionState::Idle {
            return Err(ScError::InvalidState(format!(
                "cannot start handshake in state {}",
                state.state
            )));
        }
        state.state = next;
        state.role = Some(role);
        Ok(())
    }

    fn enter_connected(&self, peer: ConnectPayload) {
        let mut state = self.state.lock().unwrap();
        state.peer = Some(ScPeerInfo {
            vmac: peer.vmac,
            uuid: peer.uuid,
            max_bvlc_length: peer.max_bvlc_length,
            max_npdu_length: peer.max_npdu_length,
        });
        state.state = ScConnectionState::Connected;
    }

    fn current_state(&self) -> ScConnectionState {
        self.state.lock().unwrap().state
    }

    fn enqueue(&self, frame: Bytes) -> Result<()> {
        let outbound = self.outbound.lock().unwrap();
        outbound
            .as_ref()
            .ok_or(ScError::NotConnected)?
            .send(frame)
            .map_err(|_| ScError::NotConnected)
    }

    fn fire(&self, slot: &Mutex<Option<EventCallback>>) {
        if let Some(callback) = slot.lock().unwrap().clone() {
            callback();
        }
    }

    fn spawn_tasks<S>(
        self: &Arc<Self>,
        mut sink: SplitSink<WebSocketStream<S>, Message>,
        mut stream: SplitStream<WebSocketStream<S>>,
        heartbeat: bool,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        *self.last_recv.lock().unwrap() = Instant::now();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        *self.outbound.lock().unwrap() = Some(outbound_tx);

        // Writer: exits (and closes the socket) when the queue is
        // dropped in go_idle, after draining what was already queued.
        let writer_inner = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                    debug!("SC write failed: {}", e);
                    writer_inner.connection_failed();
                    return;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: every inbound frame refreshes the heartbeat clock.
        let reader_inner = self.clone();
        let reader = tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(data))) => reader_inner.handle_frame(data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("SC read failed: {}", e);
                        break;
                    }
                }
                if reader_inner.current_state() == ScConnectionState::Idle {
                    return;
                }
            }
            reader_inner.connection_failed();
        });
        *self.reader_task.lock().unwrap() = Some(reader);

        if heartbeat {
            let hb_inner = self.clone();
            let task = tokio::spawn(async move {
                let period = hb_inner.config.heartbeat_timeout;
                loop {
                    let elapsed = hb_inner.last_recv.lock().unwrap().elapsed();
                    if elapsed >= period {
                        if hb_inner.current_state() != ScConnectionState::Connected {
                            return;
                        }
                        let message_id = {
                            let mut state = hb_inner.state.lock().unwrap();
                            state.message_id = state.message_id.wrapping_add(1);
                            state.message_id
                        };
                        debug!("SC heartbeat sent");
                        let hb = ScMessage::new(BvlcScFunction::HeartbeatRequest, message_id);
                        if hb_inner.enqueue(Bytes::from(hb.encode())).is_err() {
                            return;
                        }
                        tokio::time::sleep(period).await;
                    } else {
                        tokio::time::sleep(period - elapsed).await;
                    }
                    if hb_inner.current_state() != ScConnectionState::Connected {
                        return;
                    }
                }
            });
            *self.heartbeat_task.lock().unwrap() = Some(task);
        }
    }

    fn handle_frame(&self, raw: Vec<u8>) {
        *self.last_recv.lock().unwrap() = Instant::now();

        let message = match ScMessage::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("malformed BVLC-SC frame: {}", e);
                self.nak_malformed(&raw, &e);
                return;
            }
        };

        match message.function {
            BvlcScFunction::DisconnectRequest => {
                let ack = ScMessage::new(BvlcScFunction::DisconnectAck, message.message_id);
                let _ = self.enqueue(Bytes::from(ack.encode()));
                self.go_idle(true);
            }
            BvlcScFunction::DisconnectAck => {
                if self.current_state() == ScConnectionState::Disconnecting {
                    if let Some(tx) = self.disconnect_ack.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                }
            }
            BvlcScFunction::HeartbeatRequest => {
                let ack = ScMessage::new(BvlcScFunction::HeartbeatAck, message.message_id);
                let _ = self.enqueue(Bytes::from(ack.encode()));
            }
            BvlcScFunction::HeartbeatAck => {
                debug!("SC heartbeat acknowledged");
            }
            _ => {
                if let Some(callback) = self.on_message.lock().unwrap().clone() {
                    callback(message, Bytes::from(raw));
                }
            }
        }
    }

    /// NAK a malformed frame (AB.3.1.5) unless it claims to be a
    /// response type (AB.3.1.4), which would invite NAK loops.
    fn nak_malformed(&self, raw: &[u8], error: &ScError) {
        let for_function = raw.first().copied().unwrap_or(0);
        if BvlcScFunction::try_from(for_function)
            .map(|f| f.is_response())
            .unwrap_or(false)
        {
            return;
        }
        let mut details = error.to_string();
        details.truncate(128);
        let payload = ScResultPayload::nak(for_function, ERROR_CLASS_COMMUNICATION, 0, details);
        let nak = ScMessage::with_payload(BvlcScFunction::Result, 0, payload.encode());
        let _ = self.enqueue(Bytes::from(nak.encode()));
    }

    fn connection_failed(&self) {
        if matches!(
            self.current_state(),
            ScConnectionState::Connected | ScConnectionState::Disconnecting
        ) {
            self.go_idle(true);
        }
    }

    /// Drop to Idle: release the outbound queue (the writer drains and
    /// closes the socket), cancel the reader and heartbeat, and notify.
    fn go_idle(&self, notify: bool) {
        let was_connected = {
            let mut state = self.state.lock().unwrap();
            if state.state == ScConnectionState::Idle {
                return;
            }
            let was = matches!(
                state.state,
                ScConnectionState::Connected | ScConnectionState::Disconnecting
            );
            state.state = ScConnectionState::Idle;
            state.role = None;
            was
        };

        *self.outbound.lock().unwrap() = None;
        self.disconnect_ack.lock().unwrap().take();
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }

        if was_connected {
            info!("SC connection closed");
            if notify {
                self.fire(&self.on_disconnected);
            }
        }
    }
}

/// Wait for the next binary frame, skipping pings, until `deadline`.
async fn recv_binary<S>(
    stream: &mut SplitStream<WebSocketStream<S>>,
    deadline: Instant,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, stream.next()).await {
            Err(_) => return Err(ScError::Timeout),
            Ok(None) => return Err(ScError::Closed),
            Ok(Some(Err(e))) => return Err(ScError::WebSocket(e.to_string())),
            Ok(Some(Ok(Message::Binary(data)))) => return Ok(data),
            Ok(Some(Ok(Message::Close(_)))) => return Err(ScError::Closed),
            Ok(Some(Ok(_))) => continue,
        }
    }
}
