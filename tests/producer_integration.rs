//! End-to-end scenarios against an in-process mock connection, covering the
//! seven literal scenarios and the quantified invariants.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Sink;
use parking_lot::Mutex;
use tokio::time::sleep;

use pulseline_producer::{
    BrokerResponse, Client, CompressionType, ConnectionHandle, Connector, FrameKind, IoExecutor,
    ProducerError, ProducerEventSink, ProducerMessage,
};

/// A `Sink<Bytes>` that just records what was written, standing in for a
/// real socket.
struct RecordingSink {
    frames: Arc<StdMutex<Vec<Bytes>>>,
}

impl Sink<Bytes> for RecordingSink {
    type Error = std::convert::Infallible;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        self.frames.lock().unwrap().push(item);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// A minimal in-process `ConnectionHandle`: accepts every `CREATE_PRODUCER`,
/// records every written frame, and lets the test drive acks and forced
/// closes directly.
struct MockConnection {
    id: u64,
    io: IoExecutor,
    frames: Arc<StdMutex<Vec<Bytes>>>,
    active: AtomicBool,
    sinks: Mutex<Vec<(u64, Arc<dyn ProducerEventSink>)>>,
}

impl MockConnection {
    fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    async fn deliver_ack(&self, producer_id: u64, sequence_id: u64, ledger_id: u64, entry_id: u64) {
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
}

#[async_trait]
impl ConnectionHandle for MockConnection {
    fn connection_id(&self) -> u64 {
        self.id
    }

    async fn send_request_with_id(
        &self,
        frame: pulseline_producer::Frame,
        _request_id: u64,
    ) -> Result<BrokerResponse, ProducerError> {
        self.io.write_and_flush(&frame);
        match frame.kind {
            FrameKind::CreateProducer => Ok(BrokerResponse::ProducerCreated {
                producer_name: format!("mock-producer-{}", self.id),
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
        self.active.store(false, Ordering::SeqCst);
        let sinks: Vec<_> = self.sinks.lock().iter().map(|(_, s)| s.clone()).collect();
        for sink in sinks {
            sink.connection_failed(ProducerError::NotConnected).await;
        }
    }
}

/// Hands out a fresh [`MockConnection`] on every `connect()`, keeping every
/// one it has ever produced so a test can reach back into connection `n`.
struct MockConnector {
    next_id: AtomicU64,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            connections: Mutex::new(Vec::new()),
        })
    }

    fn nth(&self, index: usize) -> Arc<MockConnection> {
        self.connections.lock()[index].clone()
    }

    fn count(&self) -> usize {
        self.connections.lock().len()
    }

    fn latest(&self) -> Arc<MockConnection> {
        self.connections.lock().last().expect("at least one connection").clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn ConnectionHandle>, ProducerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let io = IoExecutor::spawn(RecordingSink { frames: frames.clone() });
        let cnx = Arc::new(MockConnection {
            id,
            io,
            frames,
            active: AtomicBool::new(true),
            sinks: Mutex::new(Vec::new()),
        });
        self.connections.lock().push(cnx.clone());
        Ok(cnx as Arc<dyn ConnectionHandle>)
    }
}

async fn wait_until<F: Fn() -> bool>(pred: F) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn simple_send() {
    let client = Client::new();
    let connector = MockConnector::new();
    let producer = client
        .new_producer("orders")
        .max_pending_messages(8)
        .batching_enabled(false)
        .compression_type(CompressionType::None)
        .connector(connector.clone())
        .connect()
        .await
        .expect("connect");

    let p = producer.clone();
    let send = tokio::spawn(async move { p.send_async(ProducerMessage::new("hello")).await });

    wait_until(|| connector.latest().frame_count() == 1).await;
    connector.latest().deliver_ack(producer.producer_id(), 0, 42, 7).await;

    let id = send.await.unwrap().expect("ack resolves send");
    assert_eq!(id.ledger_id, 42);
    assert_eq!(id.entry_id, 7);
    assert_eq!(id.partition_index, 0);
    assert_eq!(id.batch_index, None);
    assert_eq!(producer.get_pending_queue_size(), 0);
}

#[tokio::test]
async fn queue_full_non_blocking() {
    let client = Client::new();
    let connector = MockConnector::new();
    let producer = client
        .new_producer("orders")
        .max_pending_messages(2)
        .block_if_queue_full(false)
        .batching_enabled(false)
        .connector(connector.clone())
        .connect()
        .await
        .expect("connect");

    let p1 = producer.clone();
    let first = tokio::spawn(async move { p1.send_async(ProducerMessage::new("a")).await });
    let p2 = producer.clone();
    let second = tokio::spawn(async move { p2.send_async(ProducerMessage::new("b")).await });

    wait_until(|| connector.latest().frame_count() == 2).await;

    let third = producer.send_async(ProducerMessage::new("c")).await;
    assert!(matches!(third, Err(ProducerError::QueueFull)));

    let cnx = connector.latest();
    cnx.deliver_ack(producer.producer_id(), 0, 1, 1).await;
    cnx.deliver_ack(producer.producer_id(), 1, 1, 2).await;

    first.await.unwrap().expect("first ack resolves");
    second.await.unwrap().expect("second ack resolves");
    assert_eq!(producer.get_pending_queue_size(), 0);
}

#[tokio::test]
async fn batching_by_count() {
    let client = Client::new();
    let connector = MockConnector::new();
    let producer = client
        .new_producer("orders")
        .batching_enabled(true)
        .batching_max_messages(3)
        .batching_max_publish_delay_ms(3_600_000)
        .connector(connector.clone())
        .connect()
        .await
        .expect("connect");

    let pid = producer.producer_id();
    let sends: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|payload| {
            let p = producer.clone();
            tokio::spawn(async move { p.send_async(ProducerMessage::new(payload)).await })
        })
        .collect();

    wait_until(|| connector.latest().frame_count() == 1).await;
    connector.latest().deliver_ack(pid, 0, 10, 3).await;

    for (i, send) in sends.into_iter().enumerate() {
        let id = send.await.unwrap().expect("batch ack resolves");
        assert_eq!(id.ledger_id, 10);
        assert_eq!(id.entry_id, 3);
        assert_eq!(id.batch_index, Some(i as u32));
    }
}

#[tokio::test]
async fn batching_by_timer() {
    let client = Client::new();
    let connector = MockConnector::new();
    let producer = client
        .new_producer("orders")
        .batching_enabled(true)
        .batching_max_messages(100)
        .batching_max_publish_delay_ms(50)
        .connector(connector.clone())
        .connect()
        .await
        .expect("connect");

    let pid = producer.producer_id();
    let p = producer.clone();
    let send = tokio::spawn(async move { p.send_async(ProducerMessage::new("x")).await });

    sleep(Duration::from_millis(120)).await;
    assert_eq!(connector.latest().frame_count(), 1, "flush timer should have fired");

    connector.latest().deliver_ack(pid, 0, 5, 9).await;
    send.await.unwrap().expect("timer-flushed send acks");
}

#[tokio::test]
async fn reconnect_replay() {
    let client = Client::new();
    let connector = MockConnector::new();
    let producer = client
        .new_producer("orders")
        .max_pending_messages(8)
        .batching_enabled(false)
        .connector(connector.clone())
        .connect()
        .await
        .expect("connect");

    let pid = producer.producer_id();
    let sends: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|payload| {
            let p = producer.clone();
            tokio::spawn(async move { p.send_async(ProducerMessage::new(payload)).await })
        })
        .collect();

    wait_until(|| connector.latest().frame_count() == 4).await;

    // Simulate transport loss.
    connector.nth(0).close().await;

    wait_until(|| connector.count() == 2).await;
    wait_until(|| connector.latest().frame_count() == 4).await;

    let cnx = connector.latest();
    for (seq, (ledger, entry)) in [(100, 1), (101, 2), (102, 3), (103, 4)].into_iter().enumerate() {
        cnx.deliver_ack(pid, seq as u64, ledger, entry).await;
    }

    for (i, send) in sends.into_iter().enumerate() {
        let id = send.await.unwrap().expect("replayed send acks");
        assert_eq!(id.ledger_id, (100 + i) as u64);
    }
}

#[tokio::test]
async fn ack_desync_forces_reconnect() {
    let client = Client::new();
    let connector = MockConnector::new();
    let producer = client
        .new_producer("orders")
        .max_pending_messages(8)
        .batching_enabled(false)
        .connector(connector.clone())
        .connect()
        .await
        .expect("connect");

    let pid = producer.producer_id();
    let sends: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|payload| {
            let p = producer.clone();
            tokio::spawn(async move { p.send_async(ProducerMessage::new(payload)).await })
        })
        .collect();

    wait_until(|| connector.latest().frame_count() == 3).await;

    // Ack for seq=1 while seq=0 is still head: desync, forces a reconnect.
    connector.latest().deliver_ack(pid, 1, 1, 1).await;

    wait_until(|| connector.count() == 2).await;
    wait_until(|| connector.latest().frame_count() == 3).await;

    let cnx = connector.latest();
    cnx.deliver_ack(pid, 0, 7, 1).await;
    cnx.deliver_ack(pid, 1, 7, 2).await;
    cnx.deliver_ack(pid, 2, 7, 3).await;

    for send in sends {
        send.await.unwrap().expect("replayed after desync acks");
    }
}

#[tokio::test]
async fn send_timeout_sweep() {
    let client = Client::new();
    let connector = MockConnector::new();
    let producer = client
        .new_producer("orders")
        .max_pending_messages(8)
        .batching_enabled(false)
        .send_timeout_ms(100)
        .connector(connector.clone())
        .connect()
        .await
        .expect("connect");

    let sends: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|payload| {
            let p = producer.clone();
            tokio::spawn(async move { p.send_async(ProducerMessage::new(payload)).await })
        })
        .collect();

    wait_until(|| connector.latest().frame_count() == 3).await;

    for send in sends {
        let result = send.await.unwrap();
        assert!(matches!(result, Err(ProducerError::Timeout)));
    }
    assert_eq!(producer.get_pending_queue_size(), 0);
}

/// A message staged in the batch container but never flushed must still
/// resolve its future when the producer closes — it should not wait on a
/// broker ack that will never arrive.
#[tokio::test]
async fn close_resolves_unflushed_batch() {
    let client = Client::new();
    let connector = MockConnector::new();
    let producer = client
        .new_producer("orders")
        .batching_enabled(true)
        .batching_max_messages(100)
        .batching_max_publish_delay_ms(3_600_000)
        .connector(connector.clone())
        .connect()
        .await
        .expect("connect");

    let p = producer.clone();
    let send = tokio::spawn(async move { p.send_async(ProducerMessage::new("unflushed")).await });

    // Give the send a moment to land in the batch container rather than on
    // the wire — no frame should have gone out yet.
    sleep(Duration::from_millis(20)).await;
    assert_eq!(connector.latest().frame_count(), 0);

    producer.close_async().await.expect("close");

    let result = send.await.unwrap();
    assert!(matches!(result, Err(ProducerError::AlreadyClosed)));
}
