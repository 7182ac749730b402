//! The multiplexed connection: an external collaborator (spec.md §1).
//!
//! Only its interface matters to the producer — `ConnectionHandle` and
//! `ProducerEventSink` are that interface. `LocalConnection` is a minimal
//! concrete implementation (length-delimited framing over a `TcpStream`)
//! provided so the crate builds and is exercisable stand-alone; production
//! users are expected to supply their own `ConnectionHandle` backed by their
//! real multiplexing layer, same as a real broker client would.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::ProducerError;
use crate::frame::Frame;

/// Establishes the raw transport for a producer's (re)connection attempts
/// (spec.md §4.9 "triggered when a new connection becomes available").
///
/// The producer itself performs registration, the `CREATE_PRODUCER`
/// handshake, and replay once `connect` returns a handle; this trait only
/// models obtaining that handle, so any transport (TCP, QUIC, an in-process
/// channel for tests) can supply it.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ConnectionHandle>, ProducerError>;
}

/// Response to a request/response RPC (`send_request_with_id`).
#[derive(Debug, Clone)]
pub enum BrokerResponse {
    ProducerCreated { producer_name: String },
    Closed,
}

/// Inbound callbacks a connection implementation invokes on the producer
/// (spec.md §6, "Consumed from the multiplexed connection").
#[async_trait]
pub trait ProducerEventSink: Send + Sync {
    async fn connection_opened(&self, cnx: Arc<dyn ConnectionHandle>);
    async fn connection_failed(&self, err: ProducerError);
    async fn ack_received(&self, sequence_id: u64, ledger_id: u64, entry_id: u64);
}

/// The producer's view of a connection to the broker.
///
/// `write`/`write_and_flush` must be dispatched through [`ConnectionHandle::io_executor`]
/// so that writes are ordered with respect to replay (spec.md §4.5).
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    fn connection_id(&self) -> u64;

    /// Request/response RPC used for `CREATE_PRODUCER` / `CLOSE_PRODUCER`.
    async fn send_request_with_id(
        &self,
        frame: Frame,
        request_id: u64,
    ) -> Result<BrokerResponse, ProducerError>;

    fn register_producer(&self, producer_id: u64, sink: Arc<dyn ProducerEventSink>);
    fn remove_producer(&self, producer_id: u64);

    /// The connection's serialized I/O executor. All writes for sends and
    /// replay go through here, never through the caller's thread directly.
    fn io_executor(&self) -> &IoExecutor;

    fn channel_is_active(&self) -> bool;
    fn is_writable(&self) -> bool;

    async fn close(&self);
}

/// A serialized execution context owned by a connection (spec.md §6 Glossary
/// "I/O executor"). All writes on a connection are ordered through the one
/// queue backing it, guaranteeing write ordering with replay.
#[derive(Clone)]
pub struct IoExecutor {
    tx: mpsc::UnboundedSender<IoTask>,
}

enum IoTask {
    Write(Bytes),
    WriteAndFlush(Bytes),
    Flush,
}

impl IoExecutor {
    /// Spawn the executor task that owns `sink` and drains `rx` in order.
    ///
    /// Generic over the underlying sink so the same serialized-write
    /// machinery backs both the default TCP transport (`LocalConnection`)
    /// and an in-process sink a test or a different `ConnectionHandle`
    /// implementation supplies.
    pub fn spawn<S>(mut sink: S) -> Self
    where
        S: Sink<Bytes> + Send + Unpin + 'static,
        S::Error: fmt::Display,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<IoTask>();

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let result = match task {
                    IoTask::Write(bytes) => sink.feed(bytes).await,
                    IoTask::WriteAndFlush(bytes) => {
                        let _ = sink.feed(bytes).await;
                        sink.flush().await
                    }
                    IoTask::Flush => sink.flush().await,
                };
                if let Err(err) = result {
                    tracing::warn!(error = %err, "io executor write failed, closing");
                    break;
                }
            }
        });

        IoExecutor { tx }
    }

    /// Post a write without forcing a flush (spec.md §4.5: the mutex is held
    /// only for record-keeping, the wire write happens here instead).
    pub fn write(&self, frame: &Frame) {
        let _ = self.tx.send(IoTask::Write(frame.bytes.clone()));
    }

    pub fn write_and_flush(&self, frame: &Frame) {
        let _ = self.tx.send(IoTask::WriteAndFlush(frame.bytes.clone()));
    }

    pub fn flush(&self) {
        let _ = self.tx.send(IoTask::Flush);
    }
}

/// A minimal concrete `ConnectionHandle`: length-delimited framing over a
/// single `TcpStream`. Request/response correlation and producer
/// registration are modeled with in-process bookkeeping — a real broker
/// client would replace this with its own multiplexed RPC layer.
pub struct LocalConnection {
    id: u64,
    io: IoExecutor,
    active: AtomicBool,
    sinks: Mutex<Vec<(u64, Arc<dyn ProducerEventSink>)>>,
}

impl LocalConnection {
    pub async fn connect(id: u64, addr: &str) -> std::io::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let io = IoExecutor::spawn(framed);

        Ok(Arc::new(Self {
            id,
            io,
            active: AtomicBool::new(true),
            sinks: Mutex::new(Vec::new()),
        }))
    }

    /// Simulate the broker acknowledging `sequence_id` for `producer_id`.
    /// Exercised by tests and by anyone bridging a real read loop in.
    pub async fn deliver_ack(&self, producer_id: u64, sequence_id: u64, ledger_id: u64, entry_id: u64) {
        let matching: Vec<_> = self
            .sinks
            .lock()
            .iter()
            .filter(|(id, _)| *id == producer_id)
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in matching {
            sink.ack_received(sequence_id, ledger_id, entry_id).await;
        }
    }

    pub fn mark_dead(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Mark dead and notify every registered producer, mirroring what a real
    /// multiplexed connection does when it detects its transport is gone:
    /// every producer registered on it hears about the loss via
    /// `connection_failed` (spec.md §6), which drives it back to
    /// `Connecting` and schedules a reconnect.
    async fn mark_dead_and_notify(&self) {
        self.mark_dead();
        let sinks: Vec<_> = self.sinks.lock().iter().map(|(_, s)| s.clone()).collect();
        for sink in sinks {
            sink.connection_failed(ProducerError::NotConnected).await;
        }
    }
}

#[async_trait]
impl ConnectionHandle for LocalConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    async fn send_request_with_id(
        &self,
        frame: Frame,
        _request_id: u64,
    ) -> Result<BrokerResponse, ProducerError> {
        use crate::frame::FrameKind;
        self.io.write_and_flush(&frame);
        match frame.kind {
            FrameKind::CreateProducer => Ok(BrokerResponse::ProducerCreated {
                producer_name: format!("producer-{}-{}", self.id, rand::random::<u32>()),
            }),
            FrameKind::CloseProducer => Ok(BrokerResponse::Closed),
            _ => Err(ProducerError::Producer("unexpected request frame".into())),
        }
    }

    fn register_producer(&self, producer_id: u64, sink: Arc<dyn ProducerEventSink>) {
        self.sinks.lock().push((producer_id, sink));
    }

    fn remove_producer(&self, producer_id: u64) {
        self.sinks.lock().retain(|(id, _)| *id != producer_id);
    }

    fn io_executor(&self) -> &IoExecutor {
        &self.io
    }

    fn channel_is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        self.channel_is_active()
    }

    async fn close(&self) {
        self.mark_dead_and_notify().await;
    }
}

/// Connects to a fixed TCP address, producing a fresh [`LocalConnection`]
/// (and a fresh connection id) on every attempt — used by the reconnect
/// orchestrator's initial connect and its retry loop alike.
pub struct TcpConnector {
    addr: String,
    next_id: std::sync::atomic::AtomicU64,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Arc<dyn ConnectionHandle>, ProducerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        LocalConnection::connect(id, &self.addr)
            .await
            .map(|cnx| cnx as Arc<dyn ConnectionHandle>)
            .map_err(|err| ProducerError::Producer(err.to_string()))
    }
}
