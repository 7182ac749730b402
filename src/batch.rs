//! Batch container: coalesces messages into one on-wire send (spec.md §4.3).

use bytes::{Bytes, BytesMut};
use std::time::Instant;

use crate::compression::CompressionType;
use crate::error::ProducerError;
use crate::frame;
use crate::message::MessageMetadata;
use crate::window::{Outcome, SendOperation};

struct PendingMessage {
    payload: Bytes,
    callback: Outcome,
}

/// Staging area for messages awaiting a batched send. Empty iff no batch is
/// in progress — `flush` always resets it to empty.
pub struct BatchContainer {
    entries: Vec<PendingMessage>,
    accumulated_size: usize,
    first_sequence_id: Option<u64>,
    started_at: Option<Instant>,
    max_messages: usize,
    max_bytes: usize,
}

impl BatchContainer {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            entries: Vec::new(),
            accumulated_size: 0,
            first_sequence_id: None,
            started_at: None,
            max_messages,
            max_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn accumulated_size(&self) -> usize {
        self.accumulated_size
    }

    /// Milliseconds since the oldest currently-pending message was appended;
    /// `0` if the batch is empty. Backs `Producer::get_delay_in_millis`.
    pub fn oldest_pending_age_ms(&self) -> u64 {
        self.started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// True iff appending a message of `payload_len` bytes keeps the batch
    /// within both the count and hard byte-size limits.
    pub fn has_space_for(&self, payload_len: usize) -> bool {
        self.entries.len() + 1 <= self.max_messages
            && self.accumulated_size + payload_len <= self.max_bytes
    }

    /// Append a message. The batch's sequence id is fixed to that of the
    /// first message appended since the last flush (spec.md §4.3).
    pub fn push(&mut self, sequence_id: u64, payload: Bytes, callback: Outcome) {
        if self.first_sequence_id.is_none() {
            self.first_sequence_id = Some(sequence_id);
            self.started_at = Some(Instant::now());
        }
        self.accumulated_size += payload.len();
        self.entries.push(PendingMessage { payload, callback });
    }

    /// Compose the pending messages into a single [`SendOperation`],
    /// computing the checksum and compressing at flush time, and reset the
    /// container to empty. Returns `None` if there was nothing pending.
    pub fn flush(
        &mut self,
        producer_id: u64,
        producer_name: &str,
        compression: CompressionType,
    ) -> Option<SendOperation> {
        if self.entries.is_empty() {
            return None;
        }

        let entries = std::mem::take(&mut self.entries);
        let accumulated_size = self.accumulated_size;
        let sequence_id = self.first_sequence_id.take().expect("non-empty batch has a first sequence id");
        self.accumulated_size = 0;
        self.started_at = None;

        let mut composed = BytesMut::with_capacity(accumulated_size);
        let mut callbacks = Vec::with_capacity(entries.len());
        for entry in entries {
            composed.extend_from_slice(&entry.payload);
            callbacks.push(entry.callback);
        }
        let uncompressed = composed.freeze();
        let checksum = xxhash_rust::xxh3::xxh3_64(&uncompressed);
        let compressed = compression.compress(&uncompressed);

        let metadata = MessageMetadata {
            producer_name: producer_name.to_string(),
            sequence_id,
            publish_time: MessageMetadata::now_millis(),
            checksum,
            compression,
            uncompressed_size: (compression != CompressionType::None)
                .then_some(uncompressed.len() as u32),
            num_messages_in_batch: callbacks.len() as u32,
        };

        let frame = frame::new_send(
            producer_id,
            sequence_id,
            callbacks.len() as u32,
            &metadata,
            &compressed,
        );

        Some(SendOperation::batch(frame, sequence_id, uncompressed.len(), callbacks))
    }

    /// Resolve every pending (not yet flushed) message's callback with `err`
    /// and reset the container to empty, without producing a `SendOperation`.
    /// Used when closing with messages staged but not yet flushed — left
    /// unresolved otherwise, they'd violate "every accepted send resolves
    /// exactly once" (spec.md §3 invariant 4, §8 property 2).
    pub fn fail_all(&mut self, err: ProducerError) {
        self.first_sequence_id = None;
        self.started_at = None;
        self.accumulated_size = 0;
        for entry in std::mem::take(&mut self.entries) {
            let _ = entry.callback.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn has_space_for_respects_count_and_byte_limits() {
        let mut batch = BatchContainer::new(2, 100);
        let (tx, _rx) = oneshot::channel();
        batch.push(0, Bytes::from_static(b"ab"), tx);
        assert!(batch.has_space_for(10));
        let (tx, _rx) = oneshot::channel();
        batch.push(1, Bytes::from_static(b"cd"), tx);
        assert!(!batch.has_space_for(1), "count limit of 2 reached");
    }

    #[test]
    fn has_space_for_respects_hard_byte_cap() {
        let batch = BatchContainer::new(100, 4);
        assert!(batch.has_space_for(4));
        assert!(!batch.has_space_for(5));
    }

    #[tokio::test]
    async fn flush_uses_first_messages_sequence_id_and_resets() {
        let mut batch = BatchContainer::new(10, 1024);
        let (tx_a, _rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();
        batch.push(7, Bytes::from_static(b"a"), tx_a);
        batch.push(8, Bytes::from_static(b"b"), tx_b);

        let op = batch
            .flush(1, "producer-1", CompressionType::None)
            .expect("batch was non-empty");

        assert_eq!(op.sequence_id, 7);
        assert_eq!(op.num_messages, 2);
        assert!(batch.is_empty());
        assert_eq!(batch.flush(1, "producer-1", CompressionType::None).is_none(), true);
    }

    #[tokio::test]
    async fn fail_all_resolves_pending_callbacks_and_resets() {
        let mut batch = BatchContainer::new(10, 1024);
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        batch.push(0, Bytes::from_static(b"a"), tx_a);
        batch.push(1, Bytes::from_static(b"b"), tx_b);

        batch.fail_all(crate::error::ProducerError::AlreadyClosed);

        assert!(matches!(rx_a.await.unwrap(), Err(crate::error::ProducerError::AlreadyClosed)));
        assert!(matches!(rx_b.await.unwrap(), Err(crate::error::ProducerError::AlreadyClosed)));
        assert!(batch.is_empty());
        assert_eq!(batch.accumulated_size(), 0);
    }
}
