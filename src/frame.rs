//! Wire frame construction.
//!
//! The frame codec is an external collaborator (spec.md §1): it builds wire
//! messages from metadata and payload, and is the thing the broker actually
//! parses. Only its interface matters to the producer; this module supplies
//! a minimal concrete codec so the crate is self-contained, and is the only
//! place a different wire format would need to change.

use bytes::{Bytes, BytesMut};

use crate::message::MessageMetadata;

/// A fully-built, ready-to-write wire message.
///
/// Cheaply cloneable: the payload is reference-counted `Bytes`, so replay
/// (spec.md §4.9) never copies the wire bytes, only bumps a refcount.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Send,
    CreateProducer,
    CloseProducer,
    Ack,
}

/// Build a `SEND` frame carrying one or many application messages.
pub fn new_send(
    producer_id: u64,
    sequence_id: u64,
    num_messages: u32,
    metadata: &MessageMetadata,
    payload: &Bytes,
) -> Frame {
    let mut buf = BytesMut::with_capacity(64 + payload.len());
    buf.extend_from_slice(&producer_id.to_be_bytes());
    buf.extend_from_slice(&sequence_id.to_be_bytes());
    buf.extend_from_slice(&num_messages.to_be_bytes());
    buf.extend_from_slice(&metadata.checksum.to_be_bytes());
    buf.extend_from_slice(&(metadata.producer_name.len() as u32).to_be_bytes());
    buf.extend_from_slice(metadata.producer_name.as_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);

    Frame {
        kind: FrameKind::Send,
        bytes: buf.freeze(),
    }
}

/// Build a `CREATE_PRODUCER` request frame.
pub fn new_producer(
    topic: &str,
    producer_id: u64,
    request_id: u64,
    producer_name: Option<&str>,
) -> Frame {
    let mut buf = BytesMut::with_capacity(32 + topic.len());
    buf.extend_from_slice(&producer_id.to_be_bytes());
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(topic.len() as u32).to_be_bytes());
    buf.extend_from_slice(topic.as_bytes());
    let name = producer_name.unwrap_or("");
    buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
    buf.extend_from_slice(name.as_bytes());

    Frame {
        kind: FrameKind::CreateProducer,
        bytes: buf.freeze(),
    }
}

/// Build a `CLOSE_PRODUCER` request frame.
pub fn new_close_producer(producer_id: u64, request_id: u64) -> Frame {
    let mut buf = BytesMut::with_capacity(16);
    buf.extend_from_slice(&producer_id.to_be_bytes());
    buf.extend_from_slice(&request_id.to_be_bytes());

    Frame {
        kind: FrameKind::CloseProducer,
        bytes: buf.freeze(),
    }
}
