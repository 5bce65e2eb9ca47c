//! Transfer descriptors and the per-link FIFO they move through.
//!
//! ```text
//!   enqueue ──▶ Queued ──begin──▶ Active ──ok────────▶ Completed(success)
//!                 ▲                 │
//!                 └──── Retrying ◀──┤ retryable error, attempts left
//!                                   └──otherwise──────▶ Completed(failure)
//! ```

use heapless::{Deque, Vec};

use crate::transport::{
    LinkError,
    config::{MAX_BURST_REGISTERS, MAX_TRANSFER_BYTES, QUEUE_DEPTH, REGISTER_COUNT},
    regs::scalar,
};

/// Payload bytes owned by a descriptor.
pub type Payload = Vec<u8, MAX_TRANSFER_BYTES>;

/// Completion callback of an asynchronous transfer.
pub type TransferCallback = fn(&TransferOutcome<'_>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Link-private follow-up steps identified by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalOp {
    InterruptFlags,
    InterruptClear,
}

/// What happens once a descriptor completes.
#[derive(Clone, Copy)]
pub(crate) enum Notify {
    None,
    Callback(TransferCallback),
    /// A synchronous caller is polling for this descriptor.
    Blocking,
    Internal(InternalOp),
}

/// Result handed to a completion callback, exactly once per descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome<'o> {
    pub success: bool,
    /// First register of the transfer.
    pub register: u8,
    /// Little-endian value when the payload is 1 to 4 bytes long, else 0.
    pub value: u32,
    pub length: usize,
    pub data: &'o [u8],
    pub error: Option<LinkError>,
}

/// One queued register transfer.
///
/// Owns its payload: write data before the transfer, read data after it.
/// A verified write carries the written bytes through its read-back stage
/// and compares them with what the device returns.
#[derive(Clone)]
pub struct Transfer {
    pub(crate) seq: u32,
    pub(crate) direction: Direction,
    pub(crate) register: u8,
    pub(crate) sizes: Vec<u16, MAX_BURST_REGISTERS>,
    pub(crate) data: Payload,
    pub(crate) verify: bool,
    pub(crate) read_back: bool,
    pub(crate) notify: Notify,
    pub(crate) attempts: u8,
    pub(crate) success: bool,
    pub(crate) error: Option<LinkError>,
}

impl Transfer {
    pub fn read(register: u8, sizes: &[u16]) -> Result<Self, LinkError> {
        Self::build(Direction::Read, register, sizes, &[])
    }

    pub fn write(register: u8, sizes: &[u16], data: &[u8]) -> Result<Self, LinkError> {
        let transfer = Self::build(Direction::Write, register, sizes, data)?;
        let expected = transfer.len();
        if data.len() != expected {
            return Err(LinkError::SizeMismatch {
                register,
                expected,
                actual: data.len(),
            });
        }
        Ok(transfer)
    }

    fn build(
        direction: Direction,
        register: u8,
        sizes: &[u16],
        data: &[u8],
    ) -> Result<Self, LinkError> {
        if sizes.is_empty() {
            return Err(LinkError::ZeroLength);
        }
        if register as usize + sizes.len() > REGISTER_COUNT {
            return Err(LinkError::RegisterRange);
        }
        if let Some(pos) = sizes.iter().position(|&s| s == 0) {
            return Err(LinkError::InvalidRegister(register.wrapping_add(pos as u8)));
        }
        let total: usize = sizes.iter().map(|&s| s as usize).sum();
        if total > MAX_TRANSFER_BYTES {
            return Err(LinkError::TooLong);
        }

        Ok(Self {
            seq: 0,
            direction,
            register,
            sizes: Vec::from_slice(sizes).map_err(|_| LinkError::TooLong)?,
            data: Vec::from_slice(data).map_err(|_| LinkError::TooLong)?,
            verify: false,
            read_back: false,
            notify: Notify::None,
            attempts: 0,
            success: false,
            error: None,
        })
    }

    /// Turns a write into write-then-read-back-and-compare.
    pub(crate) fn verified(mut self) -> Self {
        self.verify = self.direction == Direction::Write;
        self
    }

    pub(crate) fn with_notify(mut self, notify: Notify) -> Self {
        self.notify = notify;
        self
    }

    pub(crate) fn with_callback(self, callback: Option<TransferCallback>) -> Self {
        match callback {
            Some(cb) => self.with_notify(Notify::Callback(cb)),
            None => self,
        }
    }

    /// Total payload length across all registers.
    pub fn len(&self) -> usize {
        self.sizes.iter().map(|&s| s as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn register(&self) -> u8 {
        self.register
    }

    pub fn sizes(&self) -> &[u16] {
        &self.sizes
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether a successful attempt refreshes the cached register value.
    /// The interrupt clear write does not: it carries a mask, not the flags.
    pub(crate) fn updates_table(&self) -> bool {
        !matches!(self.notify, Notify::Internal(InternalOp::InterruptClear))
    }

    /// Direction of the next hardware operation.
    pub fn wire_direction(&self) -> Direction {
        if self.read_back {
            Direction::Read
        } else {
            self.direction
        }
    }

    pub fn outcome(&self) -> TransferOutcome<'_> {
        TransferOutcome {
            success: self.success,
            register: self.register,
            value: if self.success { scalar(&self.data) } else { 0 },
            length: self.len(),
            data: if self.success { &self.data } else { &[] },
            error: self.error,
        }
    }
}

/// Result of finishing the active descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// No descriptor was active.
    Idle,
    /// Same descriptor goes again from the head of the queue.
    Retry,
    /// Descriptor advanced to its next stage or could not be completed yet.
    Continue,
    Completed(Result<(), LinkError>),
}

/// Pending and completed descriptors of one link.
pub struct TransferQueue {
    pending: Deque<Transfer, QUEUE_DEPTH>,
    completed: Deque<Transfer, QUEUE_DEPTH>,
    active: bool,
    next_seq: u32,
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferQueue {
    pub fn new() -> Self {
        Self {
            pending: Deque::new(),
            completed: Deque::new(),
            active: false,
            next_seq: 1,
        }
    }

    /// Appends a descriptor and returns its sequence number.
    pub fn enqueue(&mut self, mut transfer: Transfer) -> Result<u32, LinkError> {
        if self.pending.is_full() {
            return Err(LinkError::QueueFull);
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        transfer.seq = seq;
        transfer.attempts = 0;
        transfer.success = false;
        transfer.error = None;
        self.pending
            .push_back(transfer)
            .map_err(|_| LinkError::QueueFull)?;
        Ok(seq)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether a descriptor is waiting and none is active.
    pub fn has_startable(&self) -> bool {
        !self.active && !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Marks the head active, counts an attempt and returns a copy to put on the wire.
    pub fn begin(&mut self) -> Option<Transfer> {
        if self.active {
            return None;
        }
        let head = self.pending.front_mut()?;
        head.attempts = head.attempts.saturating_add(1);
        self.active = true;
        Some(head.clone())
    }

    /// Releases the head without consuming the attempt, e.g. when the bus was busy.
    pub fn abandon(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(head) = self.pending.front_mut() {
            head.attempts = head.attempts.saturating_sub(1);
        }
    }

    pub fn active(&self) -> Option<&Transfer> {
        if self.active { self.pending.front() } else { None }
    }

    /// Finishes the active attempt.
    ///
    /// `result` carries the received payload of a read (empty for writes).
    /// A retryable error keeps the descriptor at the head while attempts
    /// remain, so at most `retries + 1` attempts are made.
    pub fn finish(&mut self, result: Result<&[u8], LinkError>, retries: u8) -> Step {
        if !self.active {
            return Step::Idle;
        }
        let Some(head) = self.pending.front_mut() else {
            self.active = false;
            return Step::Idle;
        };

        let outcome = match result {
            Ok(received) => match head.wire_direction() {
                Direction::Write if head.verify => {
                    head.read_back = true;
                    head.attempts = 0;
                    self.active = false;
                    return Step::Continue;
                }
                Direction::Write => Ok(()),
                Direction::Read if head.verify => {
                    if head.data.as_slice() == received {
                        Ok(())
                    } else {
                        Err(LinkError::VerifyMismatch)
                    }
                }
                Direction::Read => match Vec::from_slice(received) {
                    Ok(data) => {
                        head.data = data;
                        Ok(())
                    }
                    Err(_) => Err(LinkError::TooLong),
                },
            },
            Err(err) if err.is_retryable() && head.attempts <= retries => {
                log::debug!(
                    "transfer {} reg {:#04x} attempt {} failed: {}",
                    head.seq,
                    head.register,
                    head.attempts,
                    err
                );
                self.active = false;
                return Step::Retry;
            }
            Err(err) => Err(err),
        };

        self.complete(outcome)
    }

    /// Completes the active descriptor with `error`, regardless of attempts left.
    pub fn force_fail(&mut self, error: LinkError) -> Step {
        if !self.active {
            return Step::Idle;
        }
        self.complete(Err(error))
    }

    fn complete(&mut self, outcome: Result<(), LinkError>) -> Step {
        self.active = false;
        if self.completed.is_full() {
            // no room to hand it over; run it once more instead of dropping it
            log::warn!("completed list full, repeating transfer");
            return Step::Continue;
        }
        let Some(mut done) = self.pending.pop_front() else {
            return Step::Idle;
        };
        done.success = outcome.is_ok();
        done.error = outcome.err();
        // capacity checked above
        let _ = self.completed.push_back(done);
        Step::Completed(outcome)
    }

    pub fn pop_completed(&mut self) -> Option<Transfer> {
        self.completed.pop_front()
    }

    /// Removes the completed descriptor with sequence number `seq`.
    pub fn take_completed(&mut self, seq: u32) -> Option<Transfer> {
        let mut found = None;
        for _ in 0..self.completed.len() {
            let Some(t) = self.completed.pop_front() else {
                break;
            };
            if found.is_none() && t.seq == seq {
                found = Some(t);
            } else {
                let _ = self.completed.push_back(t);
            }
        }
        found
    }

    /// Stops notifying a synchronous caller that gave up on `seq`.
    pub(crate) fn orphan(&mut self, seq: u32) {
        for t in self.pending.iter_mut().chain(self.completed.iter_mut()) {
            if t.seq == seq {
                t.notify = Notify::None;
            }
        }
    }

    /// Whether `seq` is the descriptor currently on the wire.
    pub(crate) fn is_active_seq(&self, seq: u32) -> bool {
        self.active().is_some_and(|t| t.seq == seq)
    }
}
