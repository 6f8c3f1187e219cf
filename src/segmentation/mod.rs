//! APDU segmentation engine (Clause 5.3 / 5.4.5)
//!
//! Sliding-window fragmentation and reassembly of confirmed service
//! payloads. [`SegmentSender`] slices an oversized payload and releases
//! it window by window as Segment-ACKs arrive; [`SegmentReceiver`]
//! accepts in-order segments, detects duplicates inside the mod-256
//! duplicate window, and reassembles the payload.
//!
//! The per-segment header overheads (6 octets for Confirmed-Request
//! segments, 5 for Complex-ACK segments) are fixed by the APDU layouts;
//! peers negotiate max-APDU assuming them, so they must be used
//! unchanged.
//!
//! Sequence numbers are 8-bit and wrap; window membership is tested
//! with `(a - b) mod 256` arithmetic.

use std::error::Error;
use std::fmt;

use crate::apdu::AbortReason;

/// Header octets of a segmented Confirmed-Request (type/flags,
/// capabilities, invoke ID, sequence number, window size, service choice)
pub const CONFIRMED_REQUEST_SEGMENT_OVERHEAD: usize = 6;
/// Header octets of a segmented Complex-ACK (one less: no capability byte)
pub const COMPLEX_ACK_SEGMENT_OVERHEAD: usize = 5;

/// Result type for segmentation operations
pub type Result<T> = std::result::Result<T, SegmentationError>;

/// A segmentation failure, carrying the abort reason the peer receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationError {
    pub abort_reason: AbortReason,
    message: String,
}

impl SegmentationError {
    fn new(abort_reason: AbortReason, message: impl Into<String>) -> Self {
        Self {
            abort_reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for SegmentationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.abort_reason)
    }
}

impl Error for SegmentationError {}

/// Which PDU carries the segments; selects the header overhead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    ConfirmedRequest,
    ComplexAck,
}

impl SegmentKind {
    pub fn overhead(&self) -> usize {
        match self {
            SegmentKind::ConfirmedRequest => CONFIRMED_REQUEST_SEGMENT_OVERHEAD,
            SegmentKind::ComplexAck => COMPLEX_ACK_SEGMENT_OVERHEAD,
        }
    }
}

/// True when `seq` lies in the reception window starting at `expected`
pub fn in_window(seq: u8, expected: u8, window: u8) -> bool {
    seq.wrapping_sub(expected) < window
}

/// True when `seq` lies in the duplicate window behind `expected`: more
/// than max(actual, proposed) old in mod-256 arithmetic (Clause 5.4.5.3).
pub fn duplicate_in_window(seq: u8, expected: u8, actual_window: u8, proposed_window: u8) -> bool {
    let diff = seq.wrapping_sub(expected);
    diff > actual_window.max(proposed_window)
}

/// Payload bytes available per segment for a given max-APDU
pub fn compute_max_segment_payload(max_apdu_length: usize, kind: SegmentKind) -> usize {
    max_apdu_length.saturating_sub(kind.overhead())
}

/// Split a payload into `segment_size` chunks. An empty payload still
/// yields one (empty) segment so the exchange carries the service choice.
pub fn split_payload(payload: &[u8], segment_size: usize) -> Result<Vec<Vec<u8>>> {
    if segment_size == 0 {
        return Err(SegmentationError::new(
            AbortReason::Other,
            "segment size must be positive",
        ));
    }
    if payload.is_empty() {
        return Ok(vec![Vec::new()]);
    }
    Ok(payload.chunks(segment_size).map(|c| c.to_vec()).collect())
}

/// True when `count` segments fit under the peer's cap. `None` and
/// `Some(0)` both mean unlimited.
pub fn check_segment_count(count: usize, peer_max_segments: Option<u32>) -> bool {
    match peer_max_segments {
        None | Some(0) => true,
        Some(max) => count as u32 <= max,
    }
}

/// Outbound side of a segmented transfer.
///
/// Segments `0..window_start` are acknowledged; `window_start..
/// window_start + window` are in flight.
#[derive(Debug)]
pub struct SegmentSender {
    segments: Vec<Vec<u8>>,
    invoke_id: u8,
    service_choice: u8,
    kind: SegmentKind,
    window_start: usize,
    proposed_window_size: u8,
    actual_window_size: u8,
    complete: bool,
}

impl SegmentSender {
    /// Slice `payload` for transmission. Fails with ApduTooLong when the
    /// segment count exceeds the peer's cap.
    pub fn new(
        payload: &[u8],
        invoke_id: u8,
        service_choice: u8,
        max_apdu_length: usize,
        kind: SegmentKind,
        proposed_window_size: u8,
        peer_max_segments: Option<u32>,
    ) -> Result<Self> {
        let segment_size = compute_max_segment_payload(max_apdu_length, kind);
        let segments = split_payload(payload, segment_size)?;
        if !check_segment_count(segments.len(), peer_max_segments) {
            return Err(SegmentationError::new(
                AbortReason::ApduTooLong,
                format!(
                    "{} segments exceed the peer limit of {}",
                    segments.len(),
                    peer_max_segments.unwrap_or(0)
                ),
            ));
        }
        let proposed_window_size = proposed_window_size.max(1);
        Ok(Self {
            segments,
            invoke_id,
            service_choice,
            kind,
            window_start: 0,
            proposed_window_size,
            actual_window_size: proposed_window_size,
            complete: false,
        })
    }

    pub fn invoke_id(&self) -> u8 {
        self.invoke_id
    }

    pub fn service_choice(&self) -> u8 {
        self.service_choice
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn total_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn proposed_window_size(&self) -> u8 {
        self.proposed_window_size
    }

    pub fn actual_window_size(&self) -> u8 {
        self.actual_window_size
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The raw segment payloads, in order
    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// The unacknowledged segments of the current window as
    /// `(sequence number, payload, more_follows)` triples.
    pub fn fill_window(&self) -> Vec<(u8, &[u8], bool)> {
        let end = self
            .segments
            .len()
            .min(self.window_start + self.actual_window_size as usize);
        (self.window_start..end)
            .map(|idx| {
                (
                    (idx % 256) as u8,
                    self.segments[idx].as_slice(),
                    idx + 1 < self.segments.len(),
                )
            })
            .collect()
    }

    /// Map an acknowledged sequence number back to a segment index near
    /// the current window; unmatched numbers fall back to the window
    /// start so a bogus ACK cannot jump the cursor.
    fn seq_to_idx(&self, seq: u8) -> usize {
        let window = self.actual_window_size as usize;
        let search_start = self.window_start.saturating_sub(window);
        let search_end = self.segments.len().min(self.window_start + window);
        (search_start..search_end)
            .find(|idx| (idx % 256) as u8 == seq)
            .unwrap_or(self.window_start)
    }

    /// Process a Segment-ACK: advance the window past `acked_seq` (a
    /// negative ACK requests retransmission from `acked_seq + 1`), adopt
    /// the peer's window size, and report completion.
    pub fn handle_segment_ack(
        &mut self,
        acked_seq: u8,
        actual_window_size: u8,
        negative: bool,
    ) -> bool {
        self.actual_window_size = actual_window_size
            .min(self.proposed_window_size)
            .max(1);
        let idx = self.seq_to_idx(acked_seq);
        self.window_start = idx + 1;
        if !negative && self.window_start >= self.segments.len() {
            self.complete = true;
        }
        self.complete
    }
}

/// What the receiver wants done with the segment just fed to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentAction {
    /// In-order segment stored; wait for more before acknowledging
    Continue,
    /// In-order segment stored at a window boundary; acknowledge it
    SendAck,
    /// Final segment stored; acknowledge and reassemble
    Complete,
    /// Duplicate inside the duplicate window; re-send the previous
    /// cumulative ACK, state unchanged
    ResendLastAck,
    /// Sequence outside both windows; the transaction cannot recover
    Abort,
}

/// Inbound side of a segmented transfer.
#[derive(Debug)]
pub struct SegmentReceiver {
    segments: Vec<Vec<u8>>,
    expected_seq: u8,
    proposed_window_size: u8,
    actual_window_size: u8,
    last_ack_seq: u8,
    service_choice: u8,
    complete: bool,
    since_ack: u8,
}

impl SegmentReceiver {
    /// Start reassembly from segment zero. The effective window is
    /// `min(proposed, our_window_size)` and is advertised in every ACK.
    pub fn new(
        first_segment: &[u8],
        service_choice: u8,
        proposed_window_size: u8,
        more_follows: bool,
        our_window_size: u8,
    ) -> Self {
        let proposed_window_size = proposed_window_size.max(1);
        Self {
            segments: vec![first_segment.to_vec()],
            expected_seq: 1,
            proposed_window_size,
            actual_window_size: proposed_window_size.min(our_window_size.max(1)),
            last_ack_seq: 0,
            service_choice,
            complete: !more_follows,
            // Segment zero counts toward the first window boundary
            since_ack: 1,
        }
    }

    pub fn service_choice(&self) -> u8 {
        self.service_choice
    }

    pub fn actual_window_size(&self) -> u8 {
        self.actual_window_size
    }

    /// Sequence number of the last segment we acknowledged (cumulative)
    pub fn last_ack_seq(&self) -> u8 {
        self.last_ack_seq
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Feed one received segment. Returns the action plus the sequence
    /// number to acknowledge (for `ResendLastAck`, the previous
    /// cumulative one).
    pub fn receive(&mut self, seq: u8, data: &[u8], more_follows: bool) -> (SegmentAction, u8) {
        if !self.complete && seq == self.expected_seq {
            self.segments.push(data.to_vec());
            self.last_ack_seq = seq;
            self.expected_seq = self.expected_seq.wrapping_add(1);
            if !more_follows {
                self.complete = true;
                return (SegmentAction::Complete, seq);
            }
            self.since_ack += 1;
            if self.since_ack >= self.actual_window_size {
                self.since_ack = 0;
                return (SegmentAction::SendAck, seq);
            }
            return (SegmentAction::Continue, seq);
        }

        if self.complete
            || duplicate_in_window(
                seq,
                self.expected_seq,
                self.actual_window_size,
                self.proposed_window_size,
            )
        {
            return (SegmentAction::ResendLastAck, self.last_ack_seq);
        }

        (SegmentAction::Abort, seq)
    }

    /// Concatenate the segments into the original payload.
    pub fn reassemble(&self) -> Result<Vec<u8>> {
        if !self.complete {
            return Err(SegmentationError::new(
                AbortReason::InvalidApduInThisState,
                "not all segments received",
            ));
        }
        Ok(self.segments.concat())
    }
}
