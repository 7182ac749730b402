//! Application-facing message types.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::compression::CompressionType;

/// An application message submitted via `send_async`.
///
/// Carries a mutable metadata builder and a payload buffer, matching
/// spec.md §4.2's description of the `send_async` input. Construct with
/// [`ProducerMessage::new`] then optionally chain the builder setters.
#[derive(Debug, Clone)]
pub struct ProducerMessage {
    pub payload: Bytes,
    pub key: Option<String>,
    pub ordering_key: Option<String>,
    pub properties: HashMap<String, String>,
    pub event_time: Option<u64>,
    /// Set only on a replicated copy of a message that already bears
    /// producer metadata (spec.md §4.2 step 4's "reuse check" exception).
    pub replicated: bool,
    pub(crate) metadata: Option<MessageMetadata>,
}

impl ProducerMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            key: None,
            ordering_key: None,
            properties: HashMap::new(),
            event_time: None,
            replicated: false,
            metadata: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_event_time(mut self, event_time: u64) -> Self {
        self.event_time = Some(event_time);
        self
    }

    /// Mark this message as a replicated copy, exempting it from the
    /// single-use check in spec.md §4.2 step 4.
    pub fn as_replicated(mut self) -> Self {
        self.replicated = true;
        self
    }

    /// Attach metadata this message already carries from its origin
    /// producer. A cross-cluster replication path uses this to hand a
    /// message that was already stamped (and sent) elsewhere back into
    /// `send_async` for republishing; pair it with [`as_replicated`] so the
    /// reuse check (spec.md §4.2 step 4) doesn't reject it.
    ///
    /// [`as_replicated`]: ProducerMessage::as_replicated
    pub fn with_origin_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Whether metadata has already been stamped on this message — the
    /// "reuse check" in spec.md §4.2 step 4 looks at this.
    pub fn has_producer_metadata(&self) -> bool {
        self.metadata.is_some()
    }
}

/// Metadata stamped onto a message (or a batch's outer metadata) during the
/// send pipeline (spec.md §4.2 step 5, §4.3).
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub producer_name: String,
    pub sequence_id: u64,
    pub publish_time: u64,
    pub checksum: u64,
    pub compression: CompressionType,
    pub uncompressed_size: Option<u32>,
    pub num_messages_in_batch: u32,
}

impl MessageMetadata {
    pub fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }
}

/// Identifier returned to the user once a send is acknowledged (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition_index: u32,
    /// `None` for a singleton send; `Some(i)` for the i-th message of a batch.
    pub batch_index: Option<u32>,
}

impl MessageId {
    pub fn singleton(ledger_id: u64, entry_id: u64, partition_index: u32) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition_index,
            batch_index: None,
        }
    }

    pub fn batched(ledger_id: u64, entry_id: u64, partition_index: u32, batch_index: u32) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition_index,
            batch_index: Some(batch_index),
        }
    }
}
