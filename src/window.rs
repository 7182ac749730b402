//! In-flight window and its backpressure semaphore (spec.md §4.4).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, Semaphore};

use crate::error::ProducerError;
use crate::frame::Frame;
use crate::message::MessageId;

/// One outcome channel per application message carried by a [`SendOperation`].
pub type Outcome = oneshot::Sender<Result<MessageId, ProducerError>>;

/// One on-wire send (spec.md §3). Immutable after creation except for the
/// callbacks, which are taken exactly once on ack/timeout/close.
pub struct SendOperation {
    pub frame: Frame,
    pub sequence_id: u64,
    pub num_messages: u32,
    pub byte_size: usize,
    pub created_at: Instant,
    /// One outcome sender per application message, in submission order —
    /// `callbacks[i]` corresponds to `batch_index == i`.
    pub callbacks: Vec<Outcome>,
}

impl SendOperation {
    pub fn singleton(frame: Frame, sequence_id: u64, byte_size: usize, callback: Outcome) -> Self {
        Self {
            frame,
            sequence_id,
            num_messages: 1,
            byte_size,
            created_at: Instant::now(),
            callbacks: vec![callback],
        }
    }

    pub fn batch(
        frame: Frame,
        sequence_id: u64,
        byte_size: usize,
        callbacks: Vec<Outcome>,
    ) -> Self {
        Self {
            num_messages: callbacks.len() as u32,
            frame,
            sequence_id,
            byte_size,
            created_at: Instant::now(),
            callbacks,
        }
    }

    /// Resolve every callback with the same terminal error (timeout, close).
    pub fn fail_all(self, err: ProducerError) {
        for cb in self.callbacks {
            let _ = cb.send(Err(err.clone()));
        }
    }

    /// Resolve every callback with a `MessageId` derived from the broker's
    /// `(ledger_id, entry_id)`, stamping `batch_index` for batches of >1
    /// (spec.md §3, §4.6 step 3).
    pub fn succeed_all(self, ledger_id: u64, entry_id: u64, partition_index: u32) {
        let is_batch = self.callbacks.len() > 1;
        for (i, cb) in self.callbacks.into_iter().enumerate() {
            let id = if is_batch {
                MessageId::batched(ledger_id, entry_id, partition_index, i as u32)
            } else {
                MessageId::singleton(ledger_id, entry_id, partition_index)
            };
            let _ = cb.send(Ok(id));
        }
    }
}

/// Bounded FIFO of [`SendOperation`]s awaiting acknowledgement, paired with
/// the counting semaphore that enforces `max_pending_messages` (spec.md
/// §4.4). One permit equals one application message regardless of batching;
/// permits are acquired with `acquire_owned().forget()` at admission time
/// and released in bulk (`add_permits`) on ack/timeout/close, because a
/// permit's lifetime spans batch accumulation, not just the semaphore call.
pub struct InFlightWindow {
    entries: VecDeque<SendOperation>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl InFlightWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "max_pending_messages must be >= 1");
        Self {
            entries: VecDeque::new(),
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a send at the tail. Ordering with respect to sequence-id
    /// assignment is the caller's responsibility (both happen under the
    /// producer mutex, spec.md §5).
    pub fn push_back(&mut self, op: SendOperation) {
        self.entries.push_back(op);
    }

    pub fn front(&self) -> Option<&SendOperation> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<SendOperation> {
        self.entries.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendOperation> {
        self.entries.iter()
    }

    /// Release all entries (used by timeout sweep and close), returning
    /// them so the caller can fail/drop their callbacks outside the mutex.
    pub fn drain_all(&mut self) -> VecDeque<SendOperation> {
        std::mem::take(&mut self.entries)
    }

    pub fn release_permits(&self, count: u32) {
        self.semaphore.add_permits(count as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, FrameKind};
    use bytes::Bytes;

    fn dummy_frame() -> Frame {
        Frame {
            kind: FrameKind::Send,
            bytes: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let mut window = InFlightWindow::new(4);
        for seq in 0..3u64 {
            let (tx, _rx) = oneshot::channel();
            window.push_back(SendOperation::singleton(dummy_frame(), seq, 1, tx));
        }
        assert_eq!(window.front().unwrap().sequence_id, 0);
        window.pop_front();
        assert_eq!(window.front().unwrap().sequence_id, 1);
    }

    #[tokio::test]
    async fn batch_ack_fans_out_with_distinct_batch_indices() {
        let mut receivers = Vec::new();
        let mut callbacks = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            callbacks.push(tx);
            receivers.push(rx);
        }
        let op = SendOperation::batch(dummy_frame(), 0, 3, callbacks);
        op.succeed_all(10, 3, 0);

        for (i, rx) in receivers.into_iter().enumerate() {
            let id = rx.await.unwrap().unwrap();
            assert_eq!(id.ledger_id, 10);
            assert_eq!(id.entry_id, 3);
            assert_eq!(id.batch_index, Some(i as u32));
        }
    }

    #[test]
    fn permits_restored_after_release() {
        let window = InFlightWindow::new(2);
        let sem = window.semaphore();
        let p1 = sem.clone().try_acquire_owned().unwrap();
        p1.forget();
        let p2 = sem.clone().try_acquire_owned().unwrap();
        p2.forget();
        assert!(sem.clone().try_acquire_owned().is_err());

        window.release_permits(2);
        assert!(sem.try_acquire_owned().is_ok());
    }
}
