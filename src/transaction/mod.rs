//! Transaction State Machine (Clause 5.4)
//!
//! Owns every outstanding confirmed transaction and joins the router's
//! delivery callback to the service-handler layer.
//!
//! The client side allocates invoke IDs per peer, retries with the APDU
//! timer, and drives outbound segmentation ([`SegmentSender`]) and
//! inbound Complex-ACK reassembly ([`SegmentReceiver`]). The server side
//! reassembles segmented requests, runs the registered service handler,
//! and answers with Simple-ACK, Complex-ACK (segmented if the client
//! accepts it), Error, Reject, or Abort. Duplicate Confirmed-Requests
//! while a transaction is live re-trigger the last response.
//!
//! Each transaction is a tokio task fed through an unbounded channel
//! keyed by `(peer, invoke ID, direction)`; events for unknown keys are
//! silently discarded, which is also what makes cancelled transactions
//! safe against late replies.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};

use crate::apdu::{
    decode_error_class_code, encode_error_class_code, AbortReason, Apdu, ComplexAck,
    ConfirmedRequest, MaxApdu, MaxSegments, RejectReason,
};
use crate::network::router::{ApplicationCallback, NetworkRouter};
use crate::network::{BacnetAddress, NetworkError, NetworkPriority};
use crate::segmentation::{SegmentAction, SegmentKind, SegmentReceiver, SegmentSender};

/// Fixed header octets of an unsegmented Confirmed-Request
const CONFIRMED_REQUEST_HEADER: usize = 4;
/// Fixed header octets of an unsegmented Complex-ACK
const COMPLEX_ACK_HEADER: usize = 3;

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Timer and capability settings for the transaction manager
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TsmConfig {
    /// Wait per confirmed-request attempt (Clause 5.4.4: APDU timeout)
    pub apdu_timeout: Duration,
    /// Retransmissions after the initial send
    pub apdu_retries: u32,
    /// Wait per segment window
    pub segment_timeout: Duration,
    /// Window retransmissions before the transaction dies; the default
    /// gives a lost window segment_timeout × 4 to recover
    pub segment_retries: u32,
    /// Window size proposed when we segment
    pub proposed_window_size: u8,
    /// Largest APDU we emit and accept
    pub max_apdu: MaxApdu,
    /// Segment cap advertised in requests
    pub max_segments_accepted: MaxSegments,
    /// How long a finished server transaction keeps its response around
    /// for duplicate-request retransmission
    pub server_transaction_timeout: Duration,
}

impl Default for TsmConfig {
    fn default() -> Self {
        Self {
            apdu_timeout: Duration::from_secs(3),
            apdu_retries: 3,
            segment_timeout: Duration::from_secs(2),
            segment_retries: 4,
            proposed_window_size: 16,
            max_apdu: MaxApdu::Octets1476,
            max_segments_accepted: MaxSegments::Unlimited,
            server_transaction_timeout: Duration::from_secs(30),
        }
    }
}

/// Successful outcome of a confirmed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResponse {
    /// The service completed without result data
    SimpleAck,
    /// The reassembled service result
    ComplexAck(Vec<u8>),
}

impl ServiceResponse {
    /// The result bytes (empty for a Simple-ACK)
    pub fn payload(self) -> Vec<u8> {
        match self {
            ServiceResponse::SimpleAck => Vec::new(),
            ServiceResponse::ComplexAck(data) => data,
        }
    }
}

/// Failed outcome of a confirmed request, following the protocol's
/// three-way taxonomy plus local send failures.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionError {
    /// The peer rejected the request itself; nothing was executed
    Rejected(RejectReason),
    /// The service executed and failed
    ErrorPdu { error_class: u32, error_code: u32 },
    /// The transaction failed irrecoverably (either side)
    Aborted(AbortReason),
    /// The request never left this station
    Network(NetworkError),
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::Rejected(reason) => write!(f, "Rejected: {}", reason),
            TransactionError::ErrorPdu {
                error_class,
                error_code,
            } => write!(f, "Error: class {} code {}", error_class, error_code),
            TransactionError::Aborted(reason) => write!(f, "Aborted: {}", reason),
            TransactionError::Network(e) => write!(f, "Network error: {}", e),
        }
    }
}

impl Error for TransactionError {}

impl From<NetworkError> for TransactionError {
    fn from(e: NetworkError) -> Self {
        TransactionError::Network(e)
    }
}

/// Failure a service handler may return
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// The service ran and failed (Error PDU)
    Error { error_class: u32, error_code: u32 },
    /// The request itself is faulty (Reject PDU)
    Reject(RejectReason),
    /// Give up on the transaction (Abort PDU)
    Abort(AbortReason),
}

/// Handler for one confirmed service choice. Called with
/// `(invoke_id, service_bytes, source)`; returning `Ok(None)` produces a
/// Simple-ACK, `Ok(Some(bytes))` a Complex-ACK.
pub type ServiceHandler = Arc<
    dyn Fn(u8, &[u8], &BacnetAddress) -> std::result::Result<Option<Vec<u8>>, ServiceError>
        + Send
        + Sync,
>;

/// Handler for unconfirmed requests: `(service_choice, bytes, source)`
pub type UnconfirmedHandler = Arc<dyn Fn(u8, &[u8], &BacnetAddress) + Send + Sync>;

type TransactionKey = (BacnetAddress, u8);

#[derive(Debug)]
enum ClientEvent {
    SimpleAck,
    ComplexAck(ComplexAck),
    SegmentAck {
        sequence_number: u8,
        actual_window_size: u8,
        negative: bool,
    },
    ErrorPdu {
        error_class: u32,
        error_code: u32,
    },
    Reject(RejectReason),
    Abort(AbortReason),
}

#[derive(Debug)]
enum ServerEvent {
    /// A (re)transmission from the client: a request segment or a
    /// duplicate of the original request
    Request(ConfirmedRequest),
    SegmentAck {
        sequence_number: u8,
        actual_window_size: u8,
        negative: bool,
    },
    Abort(AbortReason),
}

struct TsmInner {
    config: TsmConfig,
    router: NetworkRouter,
    clients: Mutex<HashMap<TransactionKey, mpsc::UnboundedSender<ClientEvent>>>,
    servers: Mutex<HashMap<TransactionKey, mpsc::UnboundedSender<ServerEvent>>>,
    handlers: Mutex<HashMap<u8, ServiceHandler>>,
    unconfirmed: Mutex<Option<UnconfirmedHandler>>,
    invoke_released: Notify,
}

/// The transaction manager. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<TsmInner>,
}

/// Removes the client entry when the caller completes or is dropped, and
/// wakes anyone waiting for a free invoke ID.
struct ClientGuard {
    inner: Arc<TsmInner>,
    key: TransactionKey,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.inner.clients.lock().unwrap().remove(&self.key);
        self.inner.invoke_released.notify_one();
    }
}

impl TransactionManager {
    pub fn new(router: NetworkRouter, config: TsmConfig) -> Self {
        Self {
            inner: Arc::new(TsmInner {
                config,
                router,
                clients: Mutex::new(HashMap::new()),
                servers: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                unconfirmed: Mutex::new(None),
                invoke_released: Notify::new(),
            }),
        }
    }

    /// Register the handler for a confirmed service choice, replacing
    /// any previous one.
    pub fn register_handler(&self, service_choice: u8, handler: ServiceHandler) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(service_choice, handler);
    }

    /// Install the callback for unconfirmed requests.
    pub fn set_unconfirmed_handler(&self, handler: UnconfirmedHandler) {
        *self.inner.unconfirmed.lock().unwrap() = Some(handler);
    }

    /// The callback to install on the router with
    /// [`NetworkRouter::set_application_callback`].
    pub fn application_callback(&self) -> ApplicationCallback {
        let inner = self.inner.clone();
        Arc::new(move |apdu_bytes, source| inner.dispatch(apdu_bytes, source))
    }

    /// Number of in-flight client transactions (all peers)
    pub fn active_client_count(&self) -> usize {
        self.inner.clients.lock().unwrap().len()
    }

    /// Abort every in-flight client transaction. Owners wire this to a
    /// transport's connection-lost notification so waiters fail with
    /// [`AbortReason::CommunicationDisabled`] instead of timing out.
    pub fn abort_all_clients(&self, reason: AbortReason) {
        let clients = self.inner.clients.lock().unwrap();
        for tx in clients.values() {
            let _ = tx.send(ClientEvent::Abort(reason));
        }
    }

    /// Issue a confirmed request and wait for the peer's response on the
    /// same future. Dropping the future cancels the transaction: the
    /// invoke ID is recycled and any late reply is discarded.
    pub async fn confirmed_request(
        &self,
        peer: BacnetAddress,
        service_choice: u8,
        service_data: Vec<u8>,
    ) -> Result<ServiceResponse> {
        let inner = self.inner.clone();
        let (invoke_id, mut rx) = inner.allocate_invoke_id(&peer).await;
        let _guard = ClientGuard {
            inner: inner.clone(),
            key: (peer.clone(), invoke_id),
        };
        inner
            .run_client_transaction(&peer, invoke_id, service_choice, service_data, &mut rx)
            .await
    }

    /// Send an unconfirmed request; no transaction state is created.
    pub fn unconfirmed_request(
        &self,
        destination: &BacnetAddress,
        service_choice: u8,
        service_data: Vec<u8>,
        priority: NetworkPriority,
    ) -> Result<()> {
        let apdu = Apdu::UnconfirmedRequest {
            service_choice,
            service_data,
        };
        self.inner
            .router
            .send(&apdu.encode(), destination, false, priority)
            .map_err(TransactionError::Network)
    }
}

impl TsmInner {
    // -- Invoke ID arbitration ----------------------------------------------

    /// Claim a free invoke ID for `peer`, waiting when all 256 are in
    /// flight. The entry is installed before returning so no two
    /// transactions to one peer can share an ID.
    async fn allocate_invoke_id(
        self: &Arc<Self>,
        peer: &BacnetAddress,
    ) -> (u8, mpsc::UnboundedReceiver<ClientEvent>) {
        loop {
            {
                let mut clients = self.clients.lock().unwrap();
                if let Some(id) =
                    (0..=255u8).find(|id| !clients.contains_key(&(peer.clone(), *id)))
                {
                    let (tx, rx) = mpsc::unbounded_channel();
                    clients.insert((peer.clone(), id), tx);
                    return (id, rx);
                }
            }
            self.invoke_released.notified().await;
        }
    }

    // -- Client side --------------------------------------------------------

    async fn run_client_transaction(
        self: &Arc<Self>,
        peer: &BacnetAddress,
        invoke_id: u8,
        service_choice: u8,
        service_data: Vec<u8>,
        rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Result<ServiceResponse> {
        let max_unsegmented = self.config.max_apdu.octets() - CONFIRMED_REQUEST_HEADER;

        if service_data.len() > max_unsegmented {
            self.send_segmented_request(peer, invoke_id, service_choice, &service_data, rx)
                .await?;
            // The request is fully acknowledged; a response retry would
            // mean resending every segment, so the APDU timer runs once.
            self.await_confirmation(peer, invoke_id, None, rx).await
        } else {
            let request = Apdu::ConfirmedRequest(ConfirmedRequest::new(
                invoke_id,
                service_choice,
                service_data,
                self.config.max_segments_accepted,
                self.config.max_apdu,
            ));
            self.await_confirmation(peer, invoke_id, Some(request.encode()), rx)
                .await
        }
    }

    /// AwaitConfirmation: (re)transmit while the APDU timer runs, until
    /// a terminal APDU arrives.
    async fn await_confirmation(
        self: &Arc<Self>,
        peer: &BacnetAddress,
        invoke_id: u8,
        retransmit: Option<Vec<u8>>,
        rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Result<ServiceResponse> {
        let mut attempts = 0u32;
        loop {
            if let Some(frame) = &retransmit {
                self.router
                    .send(frame, peer, true, NetworkPriority::Normal)?;
            }

            let deadline = Instant::now() + self.config.apdu_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match timeout(remaining, rx.recv()).await {
                    Ok(Some(ClientEvent::SimpleAck)) => return Ok(ServiceResponse::SimpleAck),
                    Ok(Some(ClientEvent::ComplexAck(ack))) => {
                        return if ack.segmented {
                            self.receive_segmented_response(peer, invoke_id, ack, rx).await
                        } else {
                            Ok(ServiceResponse::ComplexAck(ack.service_data))
                        };
                    }
                    Ok(Some(ClientEvent::ErrorPdu {
                        error_class,
                        error_code,
                    })) => {
                        return Err(TransactionError::ErrorPdu {
                            error_class,
                            error_code,
                        })
                    }
                    Ok(Some(ClientEvent::Reject(reason))) => {
                        return Err(TransactionError::Rejected(reason))
                    }
                    Ok(Some(ClientEvent::Abort(reason))) => {
                        return Err(TransactionError::Aborted(reason))
                    }
                    // A stray Segment-ACK in this state carries no news
                    Ok(Some(ClientEvent::SegmentAck { .. })) => continue,
                    Ok(None) => return Err(TransactionError::Aborted(AbortReason::Other)),
                    Err(_) => break,
                }
            }

            attempts += 1;
            if retransmit.is_none() || attempts > self.config.apdu_retries {
                debug!(
                    "transaction {} to {} timed out after {} attempts",
                    invoke_id, peer, attempts
                );
                self.send_abort(peer, invoke_id, AbortReason::TsmTimeout, false);
                return Err(TransactionError::Aborted(AbortReason::TsmTimeout));
            }
        }
    }

    /// SegmentedRequest: transmit windows of segments, advancing on
    /// Segment-ACKs, retransmitting a lost window up to the configured
    /// multiple of the segment timer.
    async fn send_segmented_request(
        self: &Arc<Self>,
        peer: &BacnetAddress,
        invoke_id: u8,
        service_choice: u8,
        service_data: &[u8],
        rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Result<()> {
        let mut sender = SegmentSender::new(
            service_data,
            invoke_id,
            service_choice,
            self.config.max_apdu.octets(),
            SegmentKind::ConfirmedRequest,
            self.config.proposed_window_size,
            None,
        )
        .map_err(|e| {
            self.send_abort(peer, invoke_id, e.abort_reason, false);
            TransactionError::Aborted(e.abort_reason)
        })?;

        loop {
            let window: Vec<(u8, Vec<u8>, bool)> = sender
                .fill_window()
                .into_iter()
                .map(|(seq, data, more)| (seq, data.to_vec(), more))
                .collect();
            for (sequence_number, data, more_follows) in &window {
                let segment = Apdu::ConfirmedRequest(ConfirmedRequest {
                    segmented: true,
                    more_follows: *more_follows,
                    segmented_response_accepted: true,
                    max_segments: self.config.max_segments_accepted,
                    max_apdu: self.config.max_apdu,
                    invoke_id,
                    sequence_number: Some(*sequence_number),
                    proposed_window_size: Some(sender.proposed_window_size()),
                    service_choice,
                    service_data: data.clone(),
                });
                self.router
                    .send(&segment.encode(), peer, true, NetworkPriority::Normal)?;
            }

            let mut attempts = 0u32;
            loop {
                match timeout(self.config.segment_timeout, rx.recv()).await {
                    Ok(Some(ClientEvent::SegmentAck {
                        sequence_number,
                        actual_window_size,
                        negative,
                    })) => {
                        if sender.handle_segment_ack(sequence_number, actual_window_size, negative)
                        {
                            return Ok(());
                        }
                        break; // next window (or retransmit-from on NAK)
                    }
                    Ok(Some(ClientEvent::Abort(reason))) => {
                        return Err(TransactionError::Aborted(reason))
                    }
                    Ok(Some(ClientEvent::Reject(reason))) => {
                        return Err(TransactionError::Rejected(reason))
                    }
                    Ok(Some(ClientEvent::ErrorPdu {
                        error_class,
                        error_code,
                    })) => {
                        return Err(TransactionError::ErrorPdu {
                            error_class,
                            error_code,
                        })
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => return Err(TransactionError::Aborted(AbortReason::Other)),
                    Err(_) => {
                        attempts += 1;
                        if attempts >= self.config.segment_retries {
                            self.send_abort(peer, invoke_id, AbortReason::TsmTimeout, false);
                            return Err(TransactionError::Aborted(AbortReason::TsmTimeout));
                        }
                        break; // retransmit the same window
                    }
                }
            }
        }
    }

    /// SegmentedConfirmation: reassemble a segmented Complex-ACK,
    /// acknowledging at window boundaries.
    async fn receive_segmented_response(
        self: &Arc<Self>,
        peer: &BacnetAddress,
        invoke_id: u8,
        first: ComplexAck,
        rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
    ) -> Result<ServiceResponse> {
        let mut receiver = SegmentReceiver::new(
            &first.service_data,
            first.service_choice,
            first.proposed_window_size.unwrap_or(1),
            first.more_follows,
            self.config.proposed_window_size,
        );
        if receiver.is_complete() {
            self.send_segment_ack(peer, invoke_id, 0, receiver.actual_window_size(), false, false)?;
            return Ok(ServiceResponse::ComplexAck(
                receiver.reassemble().unwrap_or_default(),
            ));
        }

        let window_timeout = self.config.segment_timeout * self.config.segment_retries;
        loop {
            match timeout(window_timeout, rx.recv()).await {
                Ok(Some(ClientEvent::ComplexAck(ack))) if ack.segmented => {
                    let seq = ack.sequence_number.unwrap_or(0);
                    let window = receiver.actual_window_size();
                    match receiver.receive(seq, &ack.service_data, ack.more_follows) {
                        (SegmentAction::Continue, _) => {}
                        (SegmentAction::SendAck, ack_seq) => {
                            self.send_segment_ack(peer, invoke_id, ack_seq, window, false, false)?;
                        }
                        (SegmentAction::Complete, ack_seq) => {
                            self.send_segment_ack(peer, invoke_id, ack_seq, window, false, false)?;
                            return Ok(ServiceResponse::ComplexAck(
                                receiver.reassemble().unwrap_or_default(),
                            ));
                        }
                        (SegmentAction::ResendLastAck, ack_seq) => {
                            self.send_segment_ack(peer, invoke_id, ack_seq, window, false, false)?;
                        }
                        (SegmentAction::Abort, _) => {
                            self.send_abort(
                                peer,
                                invoke_id,
                                AbortReason::InvalidApduInThisState,
                                false,
                            );
                            return Err(TransactionError::Aborted(
                                AbortReason::InvalidApduInThisState,
                            ));
                        }
                    }
                }
                Ok(Some(ClientEvent::Abort(reason))) => {
                    return Err(TransactionError::Aborted(reason))
                }
                Ok(Some(ClientEvent::ErrorPdu {
                    error_class,
                    error_code,
                })) => {
                    return Err(TransactionError::ErrorPdu {
                        error_class,
                        error_code,
                    })
                }
                Ok(Some(_)) => {}
                Ok(None) => return Err(TransactionError::Aborted(AbortReason::Other)),
                Err(_) => {
                    self.send_abort(peer, invoke_id, AbortReason::TsmTimeout, false);
                    return Err(TransactionError::Aborted(AbortReason::TsmTimeout));
                }
            }
        }
    }

    // -- Dispatch from the router -------------------------------------------

    fn dispatch(self: &Arc<Self>, apdu_bytes: &[u8], source: &BacnetAddress) {
        let apdu = match Apdu::decode(apdu_bytes) {
            Ok(apdu) => apdu,
            Err(e) => {
                warn!("dropped malformed APDU from {}: {}", source, e);
                // For request-shaped garbage the peer at least learns the
                // transaction is dead.
                if apdu_bytes.first().map(|b| b >> 4) == Some(0) && apdu_bytes.len() >= 3 {
                    self.send_abort(source, apdu_bytes[2], e.abort_reason(), true);
                }
                return;
            }
        };

        match apdu {
            Apdu::ConfirmedRequest(request) => self.handle_confirmed_request(request, source),
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                let handler = self.unconfirmed.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler(service_choice, &service_data, source);
                }
            }
            Apdu::SimpleAck { invoke_id, .. } => {
                self.client_event(source, invoke_id, ClientEvent::SimpleAck);
            }
            Apdu::ComplexAck(ack) => {
                self.client_event(source, ack.invoke_id, ClientEvent::ComplexAck(ack));
            }
            Apdu::SegmentAck {
                negative_ack,
                server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                if server {
                    self.client_event(
                        source,
                        invoke_id,
                        ClientEvent::SegmentAck {
                            sequence_number,
                            actual_window_size,
                            negative: negative_ack,
                        },
                    );
                } else {
                    self.server_event(
                        source,
                        invoke_id,
                        ServerEvent::SegmentAck {
                            sequence_number,
                            actual_window_size,
                            negative: negative_ack,
                        },
                    );
                }
            }
            Apdu::Error {
                invoke_id,
                error_data,
                ..
            } => {
                let (error_class, error_code) =
                    decode_error_class_code(&error_data).unwrap_or((0, 0));
                self.client_event(
                    source,
                    invoke_id,
                    ClientEvent::ErrorPdu {
                        error_class,
                        error_code,
                    },
                );
            }
            Apdu::Reject { invoke_id, reason } => {
                self.client_event(source, invoke_id, ClientEvent::Reject(reason));
            }
            Apdu::Abort {
                server,
                invoke_id,
                reason,
            } => {
                if server {
                    self.client_event(source, invoke_id, ClientEvent::Abort(reason));
                } else {
                    self.server_event(source, invoke_id, ServerEvent::Abort(reason));
                }
            }
        }
    }

    fn client_event(&self, peer: &BacnetAddress, invoke_id: u8, event: ClientEvent) {
        let sender = self
            .clients
            .lock()
            .unwrap()
            .get(&(peer.clone(), invoke_id))
            .cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => debug!(
                "discarding response for unknown transaction {} from {}",
                invoke_id, peer
            ),
        }
    }

    fn server_event(&self, peer: &BacnetAddress, invoke_id: u8, event: ServerEvent) {
        let sender = self
            .servers
            .lock()
            .unwrap()
            .get(&(peer.clone(), invoke_id))
            .cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => debug!(
                "discarding client PDU for unknown server transaction {} from {}",
                invoke_id, peer
            ),
        }
    }

    // -- Server side --------------------------------------------------------

    fn handle_confirmed_request(self: &Arc<Self>, request: ConfirmedRequest, source: &BacnetAddress) {
        let key = (source.clone(), request.invoke_id);

        {
            let servers = self.servers.lock().unwrap();
            if let Some(tx) = servers.get(&key) {
                let _ = tx.send(ServerEvent::Request(request));
                return;
            }
        }

        if request.segmented && request.sequence_number != Some(0) {
            // A mid-stream segment with no transaction cannot be recovered
            self.send_abort(
                source,
                request.invoke_id,
                AbortReason::InvalidApduInThisState,
                true,
            );
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.servers.lock().unwrap().insert(key.clone(), tx);
        let inner = self.clone();
        let peer = source.clone();
        tokio::spawn(async move {
            inner.run_server_transaction(request, peer, rx).await;
            inner.servers.lock().unwrap().remove(&key);
        });
    }

    async fn run_server_transaction(
        self: &Arc<Self>,
        first_request: ConfirmedRequest,
        peer: BacnetAddress,
        mut rx: mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let invoke_id = first_request.invoke_id;
        let service_choice = first_request.service_choice;

        // AwaitingAllSegments
        let request_data = if first_request.segmented {
            match self
                .reassemble_request(&first_request, &peer, &mut rx)
                .await
            {
                Some(data) => data,
                None => return,
            }
        } else {
            first_request.service_data.clone()
        };

        // ServiceProcessing
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(&service_choice)
            .cloned();
        let outcome = match handler {
            None => Err(ServiceError::Reject(RejectReason::UnrecognizedService)),
            Some(handler) => handler(invoke_id, &request_data, &peer),
        };

        let response = match outcome {
            Ok(None) => Apdu::SimpleAck {
                invoke_id,
                service_choice,
            },
            Ok(Some(result_data)) => {
                let peer_max = first_request.max_apdu.octets();
                if result_data.len() > peer_max - COMPLEX_ACK_HEADER {
                    // SegmentedResponse
                    if !first_request.segmented_response_accepted {
                        self.send_abort(
                            &peer,
                            invoke_id,
                            AbortReason::SegmentationNotSupported,
                            true,
                        );
                        return;
                    }
                    self.send_segmented_response(
                        &peer,
                        invoke_id,
                        service_choice,
                        &result_data,
                        first_request.max_segments.count(),
                        peer_max,
                        &mut rx,
                    )
                    .await;
                    return;
                }
                Apdu::ComplexAck(ComplexAck::new(invoke_id, service_choice, result_data))
            }
            Err(ServiceError::Error {
                error_class,
                error_code,
            }) => Apdu::Error {
                invoke_id,
                service_choice,
                error_data: encode_error_class_code(error_class, error_code),
            },
            Err(ServiceError::Reject(reason)) => Apdu::Reject { invoke_id, reason },
            Err(ServiceError::Abort(reason)) => Apdu::Abort {
                server: true,
                invoke_id,
                reason,
            },
        };

        let encoded = response.encode();
        if self
            .router
            .send(&encoded, &peer, false, NetworkPriority::Normal)
            .is_err()
        {
            return;
        }

        // Keep the response for idempotent duplicate-request retries
        let retention = Instant::now() + self.config.server_transaction_timeout;
        loop {
            let remaining = retention.saturating_duration_since(Instant::now());
            match timeout(remaining, rx.recv()).await {
                Ok(Some(ServerEvent::Request(_))) => {
                    debug!(
                        "duplicate request {} from {}, re-sending response",
                        invoke_id, peer
                    );
                    let _ = self
                        .router
                        .send(&encoded, &peer, false, NetworkPriority::Normal);
                }
                Ok(Some(ServerEvent::Abort(_))) | Ok(None) | Err(_) => return,
                Ok(Some(_)) => {}
            }
        }
    }

    /// Reassemble a segmented request, acknowledging at window
    /// boundaries. `None` means the transaction died (abort sent or
    /// received).
    async fn reassemble_request(
        self: &Arc<Self>,
        first_request: &ConfirmedRequest,
        peer: &BacnetAddress,
        rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Option<Vec<u8>> {
        let invoke_id = first_request.invoke_id;
        let mut receiver = SegmentReceiver::new(
            &first_request.service_data,
            first_request.service_choice,
            first_request.proposed_window_size.unwrap_or(1),
            first_request.more_follows,
            self.config.proposed_window_size,
        );
        if receiver.is_complete() {
            return receiver.reassemble().ok();
        }

        let window_timeout = self.config.segment_timeout * self.config.segment_retries;
        loop {
            match timeout(window_timeout, rx.recv()).await {
                Ok(Some(ServerEvent::Request(segment))) if segment.segmented => {
                    let seq = segment.sequence_number.unwrap_or(0);
                    let window = receiver.actual_window_size();
                    match receiver.receive(seq, &segment.service_data, segment.more_follows) {
                        (SegmentAction::Continue, _) => {}
                        (SegmentAction::SendAck, ack_seq)
                        | (SegmentAction::ResendLastAck, ack_seq) => {
                            if self
                                .send_segment_ack(peer, invoke_id, ack_seq, window, false, true)
                                .is_err()
                            {
                                return None;
                            }
                        }
                        (SegmentAction::Complete, ack_seq) => {
                            let _ = self
                                .send_segment_ack(peer, invoke_id, ack_seq, window, false, true);
                            return receiver.reassemble().ok();
                        }
                        (SegmentAction::Abort, _) => {
                            self.send_abort(
                                peer,
                                invoke_id,
                                AbortReason::InvalidApduInThisState,
                                true,
                            );
                            return None;
                        }
                    }
                }
                Ok(Some(ServerEvent::Abort(reason))) => {
                    debug!("client aborted transaction {}: {}", invoke_id, reason);
                    return None;
                }
                Ok(Some(_)) => {}
                Ok(None) => return None,
                Err(_) => {
                    self.send_abort(peer, invoke_id, AbortReason::TsmTimeout, true);
                    return None;
                }
            }
        }
    }

    /// SegmentedResponse: stream Complex-ACK segments, gated on the
    /// client's Segment-ACKs.
    #[allow(clippy::too_many_arguments)]
    async fn send_segmented_response(
        self: &Arc<Self>,
        peer: &BacnetAddress,
        invoke_id: u8,
        service_choice: u8,
        result_data: &[u8],
        peer_max_segments: Option<u32>,
        peer_max_apdu: usize,
        rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let mut sender = match SegmentSender::new(
            result_data,
            invoke_id,
            service_choice,
            peer_max_apdu,
            SegmentKind::ComplexAck,
            self.config.proposed_window_size,
            peer_max_segments,
        ) {
            Ok(sender) => sender,
            Err(e) => {
                self.send_abort(peer, invoke_id, e.abort_reason, true);
                return;
            }
        };

        loop {
            let window: Vec<(u8, Vec<u8>, bool)> = sender
                .fill_window()
                .into_iter()
                .map(|(seq, data, more)| (seq, data.to_vec(), more))
                .collect();
            for (sequence_number, data, more_follows) in &window {
                let segment = Apdu::ComplexAck(ComplexAck {
                    segmented: true,
                    more_follows: *more_follows,
                    invoke_id,
                    sequence_number: Some(*sequence_number),
                    proposed_window_size: Some(sender.proposed_window_size()),
                    service_choice,
                    service_data: data.clone(),
                });
                if self
                    .router
                    .send(&segment.encode(), peer, true, NetworkPriority::Normal)
                    .is_err()
                {
                    return;
                }
            }

            let mut attempts = 0u32;
            loop {
                match timeout(self.config.segment_timeout, rx.recv()).await {
                    Ok(Some(ServerEvent::SegmentAck {
                        sequence_number,
                        actual_window_size,
                        negative,
                    })) => {
                        if sender.handle_segment_ack(sequence_number, actual_window_size, negative)
                        {
                            return;
                        }
                        break;
                    }
                    Ok(Some(ServerEvent::Abort(reason))) => {
                        debug!("client aborted segmented response: {}", reason);
                        return;
                    }
                    Ok(Some(_)) => continue,
                    Ok(None) => return,
                    Err(_) => {
                        attempts += 1;
                        if attempts >= self.config.segment_retries {
                            self.send_abort(peer, invoke_id, AbortReason::TsmTimeout, true);
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    // -- PDU send helpers ---------------------------------------------------

    fn send_segment_ack(
        &self,
        peer: &BacnetAddress,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
        negative_ack: bool,
        server: bool,
    ) -> Result<()> {
        let ack = Apdu::SegmentAck {
            negative_ack,
            server,
            invoke_id,
            sequence_number,
            actual_window_size,
        };
        self.router
            .send(&ack.encode(), peer, false, NetworkPriority::Normal)
            .map_err(TransactionError::Network)
    }

    fn send_abort(&self, peer: &BacnetAddress, invoke_id: u8, reason: AbortReason, server: bool) {
        let abort = Apdu::Abort {
            server,
            invoke_id,
            reason,
        };
        if let Err(e) = self
            .router
            .send(&abort.encode(), peer, false, NetworkPriority::Normal)
        {
            debug!("failed to send abort to {}: {}", peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::{ReceiveCallback, TransportPort};
    use crate::network::router::RouterPort;
    use crate::network::Npdu;
    use async_trait::async_trait;

    #[derive(Default)]
    struct MockPort {
        sent: Mutex<Vec<Vec<u8>>>,
        callback: Mutex<Option<ReceiveCallback>>,
    }

    impl MockPort {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        /// Drain captured frames, unwrapping the NPDU down to the APDU
        fn take_apdus(&self) -> Vec<Apdu> {
            std::mem::take(&mut *self.sent.lock().unwrap())
                .iter()
                .map(|frame| {
                    let npdu = Npdu::decode(frame).unwrap();
                    Apdu::decode(&npdu.apdu).unwrap()
                })
                .collect()
        }
    }

    #[async_trait]
    impl TransportPort for MockPort {
        async fn start(&self) -> crate::datalink::Result<()> {
            Ok(())
        }

        async fn stop(&self) -> crate::datalink::Result<()> {
            Ok(())
        }

        fn send_unicast(&self, npdu: &[u8], _mac: &[u8]) -> crate::datalink::Result<()> {
            self.sent.lock().unwrap().push(npdu.to_vec());
            Ok(())
        }

        fn send_broadcast(&self, npdu: &[u8]) -> crate::datalink::Result<()> {
            self.sent.lock().unwrap().push(npdu.to_vec());
            Ok(())
        }

        fn on_receive(&self, callback: ReceiveCallback) {
            *self.callback.lock().unwrap() = Some(callback);
        }

        fn local_mac(&self) -> Vec<u8> {
            vec![0x01]
        }

        fn max_npdu_length(&self) -> usize {
            1497
        }
    }

    fn peer() -> BacnetAddress {
        BacnetAddress::local(vec![0x99])
    }

    async fn test_stack(config: TsmConfig) -> (TransactionManager, Arc<MockPort>) {
        let port = MockPort::new();
        let router =
            NetworkRouter::new(vec![RouterPort::new(1, 100, port.clone())], Some(1)).unwrap();
        router.start().await.unwrap();
        let tsm = TransactionManager::new(router.clone(), config);
        router.set_application_callback(tsm.application_callback());
        (tsm, port)
    }

    /// Hand an APDU to the manager as if the router had delivered it
    fn inject(tsm: &TransactionManager, apdu: Apdu) {
        let callback = tsm.application_callback();
        callback(&apdu.encode(), &peer());
    }

    async fn wait_frames(port: &MockPort, n: usize) -> Vec<Apdu> {
        for _ in 0..500 {
            if port.count() >= n {
                return port.take_apdus();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {} frames, saw {}", n, port.count());
    }

    #[tokio::test]
    async fn test_simple_ack_completes_request() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let handle = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 15, vec![0xAA]).await })
        };

        let frames = wait_frames(&port, 1).await;
        let invoke_id = match &frames[0] {
            Apdu::ConfirmedRequest(req) => {
                assert_eq!(req.service_choice, 15);
                assert!(!req.segmented);
                req.invoke_id
            }
            other => panic!("unexpected {:?}", other),
        };

        inject(
            &tsm,
            Apdu::SimpleAck {
                invoke_id,
                service_choice: 15,
            },
        );
        assert_eq!(handle.await.unwrap().unwrap(), ServiceResponse::SimpleAck);
        assert_eq!(tsm.active_client_count(), 0);
    }

    #[tokio::test]
    async fn test_complex_ack_returns_payload() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let handle = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![0x01]).await })
        };

        let frames = wait_frames(&port, 1).await;
        let invoke_id = frames[0].invoke_id().unwrap();
        inject(
            &tsm,
            Apdu::ComplexAck(ComplexAck::new(invoke_id, 12, vec![0xDE, 0xAD])),
        );
        assert_eq!(
            handle.await.unwrap().unwrap(),
            ServiceResponse::ComplexAck(vec![0xDE, 0xAD])
        );
    }

    #[tokio::test]
    async fn test_error_reject_abort_outcomes() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;

        // Error PDU
        let handle = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![]).await })
        };
        let invoke_id = wait_frames(&port, 1).await[0].invoke_id().unwrap();
        inject(
            &tsm,
            Apdu::Error {
                invoke_id,
                service_choice: 12,
                error_data: encode_error_class_code(1, 31),
            },
        );
        assert_eq!(
            handle.await.unwrap().unwrap_err(),
            TransactionError::ErrorPdu {
                error_class: 1,
                error_code: 31
            }
        );

        // Reject PDU
        let handle = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![]).await })
        };
        let invoke_id = wait_frames(&port, 1).await[0].invoke_id().unwrap();
        inject(
            &tsm,
            Apdu::Reject {
                invoke_id,
                reason: RejectReason::MissingRequiredParameter,
            },
        );
        assert_eq!(
            handle.await.unwrap().unwrap_err(),
            TransactionError::Rejected(RejectReason::MissingRequiredParameter)
        );

        // Abort PDU from the server
        let handle = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![]).await })
        };
        let invoke_id = wait_frames(&port, 1).await[0].invoke_id().unwrap();
        inject(
            &tsm,
            Apdu::Abort {
                server: true,
                invoke_id,
                reason: AbortReason::OutOfResources,
            },
        );
        assert_eq!(
            handle.await.unwrap().unwrap_err(),
            TransactionError::Aborted(AbortReason::OutOfResources)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_then_aborts() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let result = tsm.confirmed_request(peer(), 12, vec![0x01]).await;
        assert_eq!(
            result.unwrap_err(),
            TransactionError::Aborted(AbortReason::TsmTimeout)
        );

        // Initial send, three retries, then the abort notification
        let frames = port.take_apdus();
        assert_eq!(frames.len(), 5);
        assert!(frames[..4]
            .iter()
            .all(|f| matches!(f, Apdu::ConfirmedRequest(_))));
        assert!(matches!(
            frames[4],
            Apdu::Abort {
                server: false,
                reason: AbortReason::TsmTimeout,
                ..
            }
        ));
        assert_eq!(tsm.active_client_count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_id_uniqueness_per_peer() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let h1 = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![]).await })
        };
        let h2 = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![]).await })
        };

        let frames = wait_frames(&port, 2).await;
        let id0 = frames[0].invoke_id().unwrap();
        let id1 = frames[1].invoke_id().unwrap();
        assert_ne!(id0, id1);
        assert_eq!(tsm.active_client_count(), 2);

        for id in [id0, id1] {
            inject(
                &tsm,
                Apdu::SimpleAck {
                    invoke_id: id,
                    service_choice: 12,
                },
            );
        }
        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();

        // Terminal transition recycles the IDs
        assert_eq!(tsm.active_client_count(), 0);
        let h3 = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![]).await })
        };
        let frames = wait_frames(&port, 1).await;
        assert_eq!(frames[0].invoke_id().unwrap(), 0);
        drop(h3);
    }

    #[tokio::test]
    async fn test_abort_all_clients_on_communication_loss() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let handle = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![]).await })
        };
        wait_frames(&port, 1).await;

        tsm.abort_all_clients(AbortReason::CommunicationDisabled);
        assert_eq!(
            handle.await.unwrap().unwrap_err(),
            TransactionError::Aborted(AbortReason::CommunicationDisabled)
        );
        assert_eq!(tsm.active_client_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_recycles_and_discards_late_reply() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let handle = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![]).await })
        };
        let invoke_id = wait_frames(&port, 1).await[0].invoke_id().unwrap();

        handle.abort();
        let _ = handle.await;
        assert_eq!(tsm.active_client_count(), 0);

        // The late response hits no transaction and is silently dropped
        inject(
            &tsm,
            Apdu::SimpleAck {
                invoke_id,
                service_choice: 12,
            },
        );
        assert_eq!(port.count(), 0);
    }

    #[tokio::test]
    async fn test_segmented_request_flow() {
        let config = TsmConfig {
            max_apdu: MaxApdu::Octets480,
            proposed_window_size: 4,
            ..Default::default()
        };
        let (tsm, port) = test_stack(config).await;

        let payload = vec![0x5A; 2000];
        let expected = payload.clone();
        let handle = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, payload).await })
        };

        // First window: sequences 0..3, all with more-follows
        let frames = wait_frames(&port, 4).await;
        let mut sent_data = Vec::new();
        let invoke_id = frames[0].invoke_id().unwrap();
        for (i, frame) in frames.iter().enumerate() {
            match frame {
                Apdu::ConfirmedRequest(req) => {
                    assert!(req.segmented);
                    assert!(req.more_follows);
                    assert_eq!(req.sequence_number, Some(i as u8));
                    assert_eq!(req.proposed_window_size, Some(4));
                    sent_data.extend_from_slice(&req.service_data);
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        inject(
            &tsm,
            Apdu::SegmentAck {
                negative_ack: false,
                server: true,
                invoke_id,
                sequence_number: 3,
                actual_window_size: 4,
            },
        );

        // Remaining segment: sequence 4, more-follows clear
        let frames = wait_frames(&port, 1).await;
        match &frames[0] {
            Apdu::ConfirmedRequest(req) => {
                assert_eq!(req.sequence_number, Some(4));
                assert!(!req.more_follows);
                sent_data.extend_from_slice(&req.service_data);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sent_data, expected);

        inject(
            &tsm,
            Apdu::SegmentAck {
                negative_ack: false,
                server: true,
                invoke_id,
                sequence_number: 4,
                actual_window_size: 4,
            },
        );

        // Now in AwaitConfirmation; complete the transaction
        inject(
            &tsm,
            Apdu::SimpleAck {
                invoke_id,
                service_choice: 12,
            },
        );
        assert_eq!(handle.await.unwrap().unwrap(), ServiceResponse::SimpleAck);
    }

    #[tokio::test]
    async fn test_segmented_response_reassembly() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let handle = {
            let tsm = tsm.clone();
            tokio::spawn(async move { tsm.confirmed_request(peer(), 12, vec![0x01]).await })
        };
        let invoke_id = wait_frames(&port, 1).await[0].invoke_id().unwrap();

        let make_segment = |seq: u8, data: &[u8], more: bool| {
            Apdu::ComplexAck(ComplexAck {
                segmented: true,
                more_follows: more,
                invoke_id,
                sequence_number: Some(seq),
                proposed_window_size: Some(2),
                service_choice: 12,
                service_data: data.to_vec(),
            })
        };

        inject(&tsm, make_segment(0, &[0x11, 0x11], true));
        inject(&tsm, make_segment(1, &[0x22, 0x22], true));

        // Window of 2: sequence 1 closes the first window
        let frames = wait_frames(&port, 1).await;
        assert!(matches!(
            frames[0],
            Apdu::SegmentAck {
                server: false,
                negative_ack: false,
                sequence_number: 1,
                actual_window_size: 2,
                ..
            }
        ));

        inject(&tsm, make_segment(2, &[0x33], false));
        let frames = wait_frames(&port, 1).await;
        assert!(matches!(
            frames[0],
            Apdu::SegmentAck {
                server: false,
                sequence_number: 2,
                ..
            }
        ));

        assert_eq!(
            handle.await.unwrap().unwrap(),
            ServiceResponse::ComplexAck(vec![0x11, 0x11, 0x22, 0x22, 0x33])
        );
    }

    #[tokio::test]
    async fn test_server_simple_and_complex_ack() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        tsm.register_handler(
            12,
            Arc::new(|_invoke, data, _source| {
                if data.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(vec![0xB0; 4]))
                }
            }),
        );

        // Empty request: Simple-ACK
        inject(
            &tsm,
            Apdu::ConfirmedRequest(ConfirmedRequest::new(
                7,
                12,
                vec![],
                MaxSegments::Unlimited,
                MaxApdu::Octets1476,
            )),
        );
        let frames = wait_frames(&port, 1).await;
        assert_eq!(
            frames[0],
            Apdu::SimpleAck {
                invoke_id: 7,
                service_choice: 12
            }
        );

        // Non-empty request: Complex-ACK with the handler's result
        inject(
            &tsm,
            Apdu::ConfirmedRequest(ConfirmedRequest::new(
                8,
                12,
                vec![0x01],
                MaxSegments::Unlimited,
                MaxApdu::Octets1476,
            )),
        );
        let frames = wait_frames(&port, 1).await;
        match &frames[0] {
            Apdu::ComplexAck(ack) => {
                assert_eq!(ack.invoke_id, 8);
                assert!(!ack.segmented);
                assert_eq!(ack.service_data, vec![0xB0; 4]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_unknown_service_rejected() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        inject(
            &tsm,
            Apdu::ConfirmedRequest(ConfirmedRequest::new(
                3,
                200,
                vec![],
                MaxSegments::Unlimited,
                MaxApdu::Octets1476,
            )),
        );
        let frames = wait_frames(&port, 1).await;
        assert_eq!(
            frames[0],
            Apdu::Reject {
                invoke_id: 3,
                reason: RejectReason::UnrecognizedService
            }
        );
    }

    #[tokio::test]
    async fn test_server_handler_error_becomes_error_pdu() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        tsm.register_handler(
            12,
            Arc::new(|_invoke, _data, _source| {
                Err(ServiceError::Error {
                    error_class: 1,
                    error_code: 31,
                })
            }),
        );
        inject(
            &tsm,
            Apdu::ConfirmedRequest(ConfirmedRequest::new(
                4,
                12,
                vec![],
                MaxSegments::Unlimited,
                MaxApdu::Octets1476,
            )),
        );
        let frames = wait_frames(&port, 1).await;
        match &frames[0] {
            Apdu::Error {
                invoke_id,
                error_data,
                ..
            } => {
                assert_eq!(*invoke_id, 4);
                assert_eq!(decode_error_class_code(error_data).unwrap(), (1, 31));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_request_resends_response() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        tsm.register_handler(12, Arc::new(|_invoke, _data, _source| Ok(Some(vec![0x42]))));

        let request = Apdu::ConfirmedRequest(ConfirmedRequest::new(
            9,
            12,
            vec![0x01],
            MaxSegments::Unlimited,
            MaxApdu::Octets1476,
        ));
        inject(&tsm, request.clone());
        let first = wait_frames(&port, 1).await;

        // The retry is answered from the stored response without
        // re-running the handler
        inject(&tsm, request);
        let second = wait_frames(&port, 1).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_server_aborts_when_segmentation_not_accepted() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        tsm.register_handler(12, Arc::new(|_invoke, _data, _source| Ok(Some(vec![0xCC; 100]))));

        // Result (100 bytes) cannot fit a 50-octet APDU, and the client
        // did not accept a segmented response.
        let mut request =
            ConfirmedRequest::new(5, 12, vec![], MaxSegments::Unlimited, MaxApdu::Octets50);
        request.segmented_response_accepted = false;
        inject(&tsm, Apdu::ConfirmedRequest(request));

        let frames = wait_frames(&port, 1).await;
        assert_eq!(
            frames[0],
            Apdu::Abort {
                server: true,
                invoke_id: 5,
                reason: AbortReason::SegmentationNotSupported
            }
        );
    }

    #[tokio::test]
    async fn test_server_segmented_response_flow() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let result = vec![0x77u8; 100];
        let expected = result.clone();
        tsm.register_handler(12, Arc::new(move |_invoke, _data, _source| Ok(Some(result.clone()))));

        // Client accepts segmentation but only 50-octet APDUs
        inject(
            &tsm,
            Apdu::ConfirmedRequest(ConfirmedRequest::new(
                6,
                12,
                vec![],
                MaxSegments::Unlimited,
                MaxApdu::Octets50,
            )),
        );

        // 100 bytes at 45 per Complex-ACK segment: 3 segments, all in
        // the first window (proposed 16)
        let frames = wait_frames(&port, 3).await;
        let mut reassembled = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            match frame {
                Apdu::ComplexAck(ack) => {
                    assert!(ack.segmented);
                    assert_eq!(ack.sequence_number, Some(i as u8));
                    assert_eq!(ack.more_follows, i < 2);
                    assert!(ack.service_data.len() <= 45);
                    reassembled.extend_from_slice(&ack.service_data);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(reassembled, expected);

        // Final ACK lets the server transaction finish
        inject(
            &tsm,
            Apdu::SegmentAck {
                negative_ack: false,
                server: false,
                invoke_id: 6,
                sequence_number: 2,
                actual_window_size: 16,
            },
        );
    }

    #[tokio::test]
    async fn test_server_reassembles_segmented_request() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tsm.register_handler(
            12,
            Arc::new(move |_invoke, data, _source| {
                *sink.lock().unwrap() = data.to_vec();
                Ok(None)
            }),
        );

        let make_segment = |seq: u8, data: &[u8], more: bool| {
            Apdu::ConfirmedRequest(ConfirmedRequest {
                segmented: true,
                more_follows: more,
                segmented_response_accepted: true,
                max_segments: MaxSegments::Unlimited,
                max_apdu: MaxApdu::Octets1476,
                invoke_id: 11,
                sequence_number: Some(seq),
                proposed_window_size: Some(2),
                service_choice: 12,
                service_data: data.to_vec(),
            })
        };

        inject(&tsm, make_segment(0, &[0xA1], true));
        inject(&tsm, make_segment(1, &[0xA2], true));

        // Window boundary ACK from the server side
        let frames = wait_frames(&port, 1).await;
        assert!(matches!(
            frames[0],
            Apdu::SegmentAck {
                server: true,
                sequence_number: 1,
                actual_window_size: 2,
                ..
            }
        ));

        inject(&tsm, make_segment(2, &[0xA3], false));
        // Final segment ACK plus the Simple-ACK response
        let frames = wait_frames(&port, 2).await;
        assert!(matches!(
            frames[0],
            Apdu::SegmentAck {
                server: true,
                sequence_number: 2,
                ..
            }
        ));
        assert_eq!(
            frames[1],
            Apdu::SimpleAck {
                invoke_id: 11,
                service_choice: 12
            }
        );
        assert_eq!(*seen.lock().unwrap(), vec![0xA1, 0xA2, 0xA3]);
    }

    #[tokio::test]
    async fn test_unconfirmed_dispatch_and_send() {
        let (tsm, port) = test_stack(TsmConfig::default()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tsm.set_unconfirmed_handler(Arc::new(move |choice, data, _source| {
            sink.lock().unwrap().push((choice, data.to_vec()));
        }));

        inject(
            &tsm,
            Apdu::UnconfirmedRequest {
                service_choice: 8,
                service_data: vec![0x0F],
            },
        );
        assert_eq!(*seen.lock().unwrap(), vec![(8, vec![0x0F])]);

        tsm.unconfirmed_request(
            &BacnetAddress::local_broadcast(),
            8,
            vec![0x0F],
            NetworkPriority::Normal,
        )
        .unwrap();
        let frames = wait_frames(&port, 1).await;
        assert!(matches!(frames[0], Apdu::UnconfirmedRequest { .. }));
    }
}
