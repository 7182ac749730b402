//! The producer: public API, state machine driver, send pipeline, ack
//! handler, timeout sweeper, batch flush timer, and reconnect orchestrator
//! (spec.md §4).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::batch::BatchContainer;
use crate::client::Client;
use crate::compression::CompressionType;
use crate::connection::{BrokerResponse, ConnectionHandle, Connector, ProducerEventSink};
use crate::error::ProducerError;
use crate::frame;
use crate::message::{MessageId, MessageMetadata, ProducerMessage};
use crate::retry::RetryConfig;
use crate::state::State;
use crate::stats::{ProducerStats, ProducerStatsSnapshot};
use crate::window::{InFlightWindow, SendOperation};

/// Configuration recognized by the producer (spec.md §6).
#[derive(Clone, Debug)]
pub struct ProducerConfig {
    pub max_pending_messages: usize,
    pub block_if_queue_full: bool,
    /// `Duration::ZERO` disables the send-timeout sweeper (spec.md §8).
    pub send_timeout: Duration,
    pub compression_type: CompressionType,
    pub batching_enabled: bool,
    pub batching_max_messages: usize,
    pub batching_max_publish_delay: Duration,
    /// Hard cap on accumulated batch bytes, independent of
    /// `batching_max_messages` (spec.md §4.2 step 6/7).
    pub batching_max_bytes: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: 1000,
            block_if_queue_full: false,
            send_timeout: Duration::from_secs(30),
            compression_type: CompressionType::None,
            batching_enabled: true,
            batching_max_messages: 1000,
            batching_max_publish_delay: Duration::from_millis(10),
            batching_max_bytes: 128 * 1024,
        }
    }
}

/// Builder for a [`Producer`], mirroring the setter-per-option shape of the
/// teacher's `ProducerBuilder`. Ends in [`ProducerBuilder::connect`], which
/// spawns the initial connection attempt and resolves once the broker has
/// accepted (or permanently refused) the producer.
#[must_use = "call `.connect()` to create the producer"]
pub struct ProducerBuilder {
    client: Client,
    topic: String,
    partition_index: u32,
    config: ProducerConfig,
    connector: Option<Arc<dyn Connector>>,
    retry: RetryConfig,
}

impl ProducerBuilder {
    pub(crate) fn new(client: Client, topic: impl Into<String>) -> Self {
        Self {
            client,
            topic: topic.into(),
            partition_index: 0,
            config: ProducerConfig::default(),
            connector: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn partition_index(mut self, index: u32) -> Self {
        self.partition_index = index;
        self
    }

    pub fn max_pending_messages(mut self, n: usize) -> Self {
        self.config.max_pending_messages = n;
        self
    }

    pub fn block_if_queue_full(mut self, enabled: bool) -> Self {
        self.config.block_if_queue_full = enabled;
        self
    }

    pub fn send_timeout_ms(mut self, ms: u64) -> Self {
        self.config.send_timeout = Duration::from_millis(ms);
        self
    }

    pub fn compression_type(mut self, compression: CompressionType) -> Self {
        self.config.compression_type = compression;
        self
    }

    pub fn batching_enabled(mut self, enabled: bool) -> Self {
        self.config.batching_enabled = enabled;
        self
    }

    pub fn batching_max_messages(mut self, n: usize) -> Self {
        self.config.batching_max_messages = n;
        self
    }

    pub fn batching_max_publish_delay_ms(mut self, ms: u64) -> Self {
        self.config.batching_max_publish_delay = Duration::from_millis(ms);
        self
    }

    pub fn batching_max_bytes(mut self, bytes: usize) -> Self {
        self.config.batching_max_bytes = bytes;
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Supply the transport used for the initial connect and every
    /// subsequent reconnect attempt. Required; there is no default because
    /// a default would silently hide which broker the producer talks to.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the producer and drive it to `Ready` (or `Failed`).
    ///
    /// Spawns the reconnect orchestrator's first attempt immediately
    /// (spec.md §3 Lifecycle: "immediately initiates a connection attempt")
    /// and resolves once the broker has accepted the producer or every
    /// retry within `operation_timeout` has been exhausted.
    pub async fn connect(self) -> Result<Arc<Producer>, ProducerError> {
        assert!(
            self.config.max_pending_messages >= 1,
            "max_pending_messages must be >= 1"
        );
        let connector = self
            .connector
            .expect("a Connector must be supplied via .connector(...)");

        let producer_id = self.client.new_producer_id();
        let (created_tx, created_rx) = oneshot::channel();

        let batch = self
            .config
            .batching_enabled
            .then(|| BatchContainer::new(self.config.batching_max_messages, self.config.batching_max_bytes));

        let producer = Arc::new(Producer {
            client: self.client.clone(),
            producer_id,
            topic: self.topic,
            partition_index: self.partition_index,
            config: self.config.clone(),
            connector,
            retry: self.retry,
            stats: ProducerStats::default(),
            inner: Mutex::new(Inner {
                state: State::Uninitialized,
                connection: None,
                producer_name: None,
                next_sequence_id: 0,
                window: InFlightWindow::new(self.config.max_pending_messages),
                batch,
                reconnect_attempt: 0,
            }),
            connected_since: Mutex::new(None),
            first_attempt_at: Instant::now(),
            ready_once: AtomicBool::new(false),
            producer_created: Mutex::new(Some(created_tx)),
            current_backoff: Mutex::new(Duration::ZERO),
            sweeper_handle: Mutex::new(None),
            flush_handle: Mutex::new(None),
            stats_handle: Mutex::new(None),
            self_weak: OnceLock::new(),
        });
        let _ = producer.self_weak.set(Arc::downgrade(&producer));

        self.client.track_producer(producer_id, &producer);

        let kickoff = producer.clone();
        tokio::spawn(async move {
            kickoff.attempt_connect().await;
        });

        match created_rx.await {
            Ok(Ok(())) => Ok(producer),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ProducerError::Producer(
                "producer dropped before a connection was established".into(),
            )),
        }
    }
}

/// Producer-scoped state guarded by the single serialization mutex (spec.md
/// §5): the lifecycle state, the current connection, the sequence counter,
/// the in-flight window, and the batch container.
struct Inner {
    state: State,
    connection: Option<Arc<dyn ConnectionHandle>>,
    producer_name: Option<String>,
    next_sequence_id: u64,
    window: InFlightWindow,
    batch: Option<BatchContainer>,
    reconnect_attempt: u32,
}

/// Client-side producer for one topic partition (spec.md §3).
///
/// Always held behind an `Arc`; background tasks (timeout sweeper, flush
/// timer, reconnect attempts) each hold a clone so the producer outlives any
/// single caller.
pub struct Producer {
    client: Client,
    producer_id: u64,
    topic: String,
    partition_index: u32,
    config: ProducerConfig,
    connector: Arc<dyn Connector>,
    retry: RetryConfig,
    stats: ProducerStats,
    inner: Mutex<Inner>,
    connected_since: Mutex<Option<SystemTime>>,
    first_attempt_at: Instant,
    /// Set once the first `CREATE_PRODUCER` succeeds; after that, every
    /// further disconnect is retried indefinitely rather than bounded by
    /// `operation_timeout` (spec.md §9 open question, resolved in DESIGN.md).
    ready_once: AtomicBool,
    producer_created: Mutex<Option<oneshot::Sender<Result<(), ProducerError>>>>,
    current_backoff: Mutex<Duration>,
    sweeper_handle: Mutex<Option<JoinHandle<()>>>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
    stats_handle: Mutex<Option<JoinHandle<()>>>,
    /// Lets `&self` methods (the [`ProducerEventSink`] impl, invoked by a
    /// `ConnectionHandle` that only has a trait-object reference) recover an
    /// `Arc<Self>` to spawn background work from. Set once, right after
    /// construction.
    self_weak: OnceLock<Weak<Producer>>,
}

impl Producer {
    fn arc(&self) -> Arc<Producer> {
        self.self_weak
            .get()
            .and_then(Weak::upgrade)
            .expect("self_weak is set before the producer is used")
    }

    pub fn producer_id(&self) -> u64 {
        self.producer_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_index(&self) -> u32 {
        self.partition_index
    }

    // ---- Public Send API (spec.md §4.2) -----------------------------------

    /// Submit one application message. Resolves with the broker-assigned
    /// [`MessageId`] on ack, or with exactly one [`ProducerError`] — never
    /// both, never neither (spec.md §8 invariant 2).
    pub async fn send_async(self: &Arc<Self>, message: ProducerMessage) -> Result<MessageId, ProducerError> {
        if message.payload.is_empty() {
            return Err(ProducerError::InvalidMessage(
                "payload must not be empty".into(),
            ));
        }

        // Step 1: state gate.
        {
            let inner = self.inner.lock();
            inner.state.check_send_admission()?;
        }

        // Step 2: admission / backpressure. Acquiring may suspend the caller
        // (block_if_queue_full) or fail fast (QueueFull); either way exactly
        // one permit is taken here and released along exactly one exit path.
        let semaphore = self.inner.lock().window.semaphore();
        let permit = if self.config.block_if_queue_full {
            semaphore
                .acquire_owned()
                .await
                .map_err(|_| ProducerError::Interrupted)?
        } else {
            semaphore
                .try_acquire_owned()
                .map_err(|_| ProducerError::QueueFull)?
        };

        // Step 4: reuse check. Dropping `permit` here releases it back to
        // the semaphore (never released twice, never leaked).
        if message.has_producer_metadata() && !message.replicated {
            return Err(ProducerError::InvalidMessage(
                "cannot reuse the same message".into(),
            ));
        }

        // Step 3: integrity. A replicated message may already carry a
        // checksum from its original producer; otherwise compute one now.
        let checksum = message
            .metadata
            .as_ref()
            .map(|m| m.checksum)
            .unwrap_or_else(|| xxhash_rust::xxh3::xxh3_64(&message.payload));

        let (outcome_tx, outcome_rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock();
            // Re-check admission: the producer may have closed while we
            // were waiting for a permit (§4.1: any observer of
            // Closing/Closed during an async continuation must abort).
            inner.state.check_send_admission()?;

            // Step 5: sequence assignment, inside the same critical section
            // as window insertion and write dispatch, so on-wire order ==
            // submission order == window order (spec.md §5).
            let sequence_id = inner.next_sequence_id;
            inner.next_sequence_id += 1;
            let producer_name = inner.producer_name.clone().unwrap_or_default();

            self.stats.record_sent(message.payload.len() as u64);

            // Step 6: dispatch.
            if self.config.batching_enabled {
                let max_messages = self.config.batching_max_messages;
                let max_bytes = self.config.batching_max_bytes;
                let batch = inner
                    .batch
                    .get_or_insert_with(|| BatchContainer::new(max_messages, max_bytes));

                if !batch.has_space_for(message.payload.len()) {
                    if let Some(op) =
                        batch.flush(self.producer_id, &producer_name, self.config.compression_type)
                    {
                        Self::enqueue_and_dispatch(&mut inner, op);
                    }
                }

                let batch = inner.batch.as_mut().expect("batch re-inserted above");
                batch.push(sequence_id, message.payload.clone(), outcome_tx);

                // Step 7: post-append flush triggers.
                if batch.len() >= self.config.batching_max_messages
                    || batch.accumulated_size() >= self.config.batching_max_bytes
                {
                    if let Some(op) =
                        batch.flush(self.producer_id, &producer_name, self.config.compression_type)
                    {
                        Self::enqueue_and_dispatch(&mut inner, op);
                    }
                }
            } else {
                let compressed = self.config.compression_type.compress(&message.payload);
                let uncompressed_size = (self.config.compression_type != CompressionType::None)
                    .then_some(message.payload.len() as u32);
                let metadata = MessageMetadata {
                    producer_name,
                    sequence_id,
                    publish_time: MessageMetadata::now_millis(),
                    checksum,
                    compression: self.config.compression_type,
                    uncompressed_size,
                    num_messages_in_batch: 1,
                };
                let frame = frame::new_send(self.producer_id, sequence_id, 1, &metadata, &compressed);
                let op = SendOperation::singleton(frame, sequence_id, message.payload.len(), outcome_tx);
                Self::enqueue_and_dispatch(&mut inner, op);
            }

            permit.forget();
        }

        match outcome_rx.await {
            Ok(result) => result,
            Err(_) => Err(ProducerError::Producer(
                "producer closed before this send was acknowledged".into(),
            )),
        }
    }

    /// Push a completed [`SendOperation`] onto the tail of the window and,
    /// if currently connected, post its frame to the connection's I/O
    /// executor (spec.md §4.5). The frame clone here models the "retain one
    /// additional reference" step: the window keeps its own `Bytes` handle
    /// for replay, the dispatched write consumes the clone. The write is
    /// flushed immediately — without it the frame only reaches the codec's
    /// internal buffer, not the socket, until something else flushes it.
    fn enqueue_and_dispatch(inner: &mut Inner, op: SendOperation) {
        let frame_for_write = op.frame.clone();
        inner.window.push_back(op);
        if let Some(cnx) = inner.connection.as_ref() {
            cnx.io_executor().write_and_flush(&frame_for_write);
        }
    }

    // ---- Close (spec.md §4.10) --------------------------------------------

    pub async fn close_async(self: &Arc<Self>) -> Result<(), ProducerError> {
        let cnx = {
            let mut inner = self.inner.lock();
            if inner.state.is_closing_or_closed() {
                return Ok(());
            }
            match inner.connection.clone() {
                None => {
                    inner.state = State::Closed;
                    let ops = inner.window.drain_all();
                    if let Some(batch) = inner.batch.as_mut() {
                        batch.fail_all(ProducerError::AlreadyClosed);
                    }
                    drop(inner);
                    for op in ops {
                        op.fail_all(ProducerError::AlreadyClosed);
                    }
                    self.cancel_timers();
                    self.client.cleanup_producer(self.producer_id);
                    return Ok(());
                }
                Some(cnx) => {
                    inner.state = State::Closing;
                    cnx
                }
            }
        };

        self.cancel_timers();

        let request_id = self.client.new_request_id();
        let frame = frame::new_close_producer(self.producer_id, request_id);
        let result = cnx.send_request_with_id(frame, request_id).await;

        let should_finish_close = matches!(result, Ok(_)) || !cnx.channel_is_active();
        if !should_finish_close {
            return result.map(|_| ());
        }

        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        let ops = inner.window.drain_all();
        if let Some(batch) = inner.batch.as_mut() {
            batch.fail_all(ProducerError::AlreadyClosed);
        }
        drop(inner);
        for op in ops {
            op.fail_all(ProducerError::AlreadyClosed);
        }
        self.client.cleanup_producer(self.producer_id);
        Ok(())
    }

    fn cancel_timers(&self) {
        if let Some(handle) = self.sweeper_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.flush_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.stats_handle.lock().take() {
            handle.abort();
        }
    }

    // ---- Accessors (spec.md §6 Public API) --------------------------------

    pub fn is_connected(&self) -> bool {
        matches!(self.inner.lock().state, State::Ready)
    }

    pub fn is_writable(&self) -> bool {
        self.inner
            .lock()
            .connection
            .as_ref()
            .map(|cnx| cnx.is_writable())
            .unwrap_or(false)
    }

    pub fn get_stats(&self) -> ProducerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn get_producer_name(&self) -> Option<String> {
        self.inner.lock().producer_name.clone()
    }

    pub fn get_connection_id(&self) -> Option<u64> {
        self.inner
            .lock()
            .connection
            .as_ref()
            .map(|cnx| cnx.connection_id())
    }

    /// Human-readable `connected_since` timestamp, formatted fresh on every
    /// call from a plain `SystemTime` rather than through any shared mutable
    /// formatter (spec.md §9 design note: the source's shared
    /// `SimpleDateFormat`-equivalent is a latent thread-safety bug; this
    /// crate does not reproduce it).
    pub fn get_connected_since(&self) -> Option<String> {
        self.connected_since.lock().map(|t| {
            let datetime: DateTime<Utc> = t.into();
            datetime.to_rfc3339()
        })
    }

    pub fn get_pending_queue_size(&self) -> usize {
        self.inner.lock().window.len()
    }

    /// Milliseconds since the oldest message in the current batch was
    /// appended, or `0` if batching is disabled or no batch is pending.
    pub fn get_delay_in_millis(&self) -> u64 {
        self.inner
            .lock()
            .batch
            .as_ref()
            .map(|b| b.oldest_pending_age_ms())
            .unwrap_or(0)
    }

    // ---- Acknowledgement Handler (spec.md §4.6) ---------------------------

    async fn handle_ack(self: &Arc<Self>, sequence_id: u64, ledger_id: u64, entry_id: u64) {
        enum Outcome {
            Dropped,
            Desync,
            Popped(SendOperation),
        }

        let outcome = {
            let mut inner = self.inner.lock();
            match inner.window.front() {
                None => {
                    tracing::debug!(sequence_id, "ack for timed-out message, dropping");
                    Outcome::Dropped
                }
                Some(head) if sequence_id > head.sequence_id => {
                    tracing::warn!(
                        sequence_id,
                        expected = head.sequence_id,
                        "ack desync, forcing reconnect"
                    );
                    Outcome::Desync
                }
                Some(head) if sequence_id < head.sequence_id => {
                    tracing::debug!(sequence_id, expected = head.sequence_id, "stale ack, dropping");
                    Outcome::Dropped
                }
                Some(_) => {
                    let op = inner.window.pop_front().expect("front checked above");
                    inner.window.release_permits(op.num_messages);
                    Outcome::Popped(op)
                }
            }
        };

        match outcome {
            Outcome::Dropped => {}
            Outcome::Desync => {
                let cnx = self.inner.lock().connection.clone();
                if let Some(cnx) = cnx {
                    cnx.close().await;
                }
            }
            Outcome::Popped(op) => {
                self.stats.record_ack();
                // Outcomes are delivered by resolving a oneshot future
                // rather than invoking a user-supplied callback directly
                // (spec.md §9 "coroutine/future control flow"), so no user
                // code runs on this call stack — the "callback panics must
                // be swallowed" requirement has no callback left to panic.
                op.succeed_all(ledger_id, entry_id, self.partition_index);
            }
        }
    }

    // ---- Send-Timeout Sweeper (spec.md §4.7) ------------------------------

    fn arm_timeout_sweeper(self: &Arc<Self>) {
        let producer = self.clone();
        let handle = tokio::spawn(async move { producer.timeout_sweeper_loop().await });
        *self.sweeper_handle.lock() = Some(handle);
    }

    async fn timeout_sweeper_loop(self: Arc<Self>) {
        loop {
            let delay = {
                let inner = self.inner.lock();
                if inner.state.is_terminal() {
                    return;
                }
                match inner.window.front() {
                    None => self.config.send_timeout,
                    Some(head) => self
                        .config
                        .send_timeout
                        .saturating_sub(head.created_at.elapsed()),
                }
            };
            sleep(delay).await;

            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            if let Some(head) = inner.window.front() {
                if head.created_at.elapsed() >= self.config.send_timeout {
                    // Whole-window-on-head-timeout is intentional (spec.md
                    // §4.7, §9 open question 1): once the broker can still
                    // arbitrarily ack earlier sends, declaring the whole
                    // window lost is simpler than tracking partial timeouts
                    // while preserving ordering.
                    let ops = inner.window.drain_all();
                    let released: u32 = ops.iter().map(|op| op.num_messages).sum();
                    inner.window.release_permits(released);
                    drop(inner);
                    for op in ops {
                        self.stats.record_failed();
                        op.fail_all(ProducerError::Timeout);
                    }
                }
            }
        }
    }

    // ---- Batch Flush Timer (spec.md §4.8) ---------------------------------

    fn arm_flush_timer(self: &Arc<Self>) {
        let producer = self.clone();
        let handle = tokio::spawn(async move { producer.flush_timer_loop().await });
        *self.flush_handle.lock() = Some(handle);
    }

    async fn flush_timer_loop(self: Arc<Self>) {
        loop {
            sleep(self.config.batching_max_publish_delay).await;

            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            let producer_name = inner.producer_name.clone().unwrap_or_default();
            let flushed = inner
                .batch
                .as_mut()
                .and_then(|batch| batch.flush(self.producer_id, &producer_name, self.config.compression_type));
            if let Some(op) = flushed {
                Self::enqueue_and_dispatch(&mut inner, op);
            }
        }
    }

    // ---- Periodic stats reporting (spec.md §6 `stats_interval_seconds`) --

    /// Log a snapshot of the counters every `stats_interval`, the same way
    /// the sweeper and flush timer run for the producer's lifetime. The
    /// counters themselves are always maintained (`stats.rs`); this only
    /// controls whether they get logged periodically.
    fn arm_stats_reporter(self: &Arc<Self>) {
        let producer = self.clone();
        let handle = tokio::spawn(async move { producer.stats_reporter_loop().await });
        *self.stats_handle.lock() = Some(handle);
    }

    async fn stats_reporter_loop(self: Arc<Self>) {
        let interval = self.client.stats_interval();
        loop {
            sleep(interval).await;
            if self.inner.lock().state.is_terminal() {
                return;
            }
            let snapshot = self.stats.snapshot();
            tracing::info!(
                producer_id = self.producer_id,
                topic = %self.topic,
                messages_sent = snapshot.messages_sent,
                bytes_sent = snapshot.bytes_sent,
                send_failed = snapshot.send_failed,
                acks_received = snapshot.acks_received,
                "producer stats"
            );
        }
    }

    // ---- Reconnect Orchestrator (spec.md §4.9) ----------------------------

    async fn attempt_connect(self: Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_closing_or_closed() {
                return;
            }
            inner.state = State::Connecting;
        }

        match self.connector.connect().await {
            Ok(cnx) => self.handle_connection_opened(cnx).await,
            Err(err) => self.handle_connection_failed(err).await,
        }
    }

    async fn handle_connection_opened(self: Arc<Self>, cnx: Arc<dyn ConnectionHandle>) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_closing_or_closed() {
                drop(inner);
                tokio::spawn(async move { cnx.close().await });
                return;
            }
            inner.connection = Some(cnx.clone());
        }

        cnx.register_producer(self.producer_id, self.clone());

        let request_id = self.client.new_request_id();
        let producer_name = self.inner.lock().producer_name.clone();
        let frame = frame::new_producer(&self.topic, self.producer_id, request_id, producer_name.as_deref());

        match cnx.send_request_with_id(frame, request_id).await {
            Ok(BrokerResponse::ProducerCreated { producer_name }) => {
                self.on_producer_created(cnx, producer_name).await;
            }
            Ok(BrokerResponse::Closed) => {
                self.on_create_producer_failed(ProducerError::Producer(
                    "broker closed the producer during creation".into(),
                ))
                .await;
            }
            Err(err) => self.on_create_producer_failed(err).await,
        }
    }

    async fn on_producer_created(self: Arc<Self>, cnx: Arc<dyn ConnectionHandle>, granted_name: String) {
        let first_success;
        {
            let mut inner = self.inner.lock();

            if inner.state.is_closing_or_closed() {
                drop(inner);
                let producer_id = self.producer_id;
                let client = self.client.clone();
                tokio::spawn(async move {
                    let request_id = client.new_request_id();
                    let frame = frame::new_close_producer(producer_id, request_id);
                    let _ = cnx.send_request_with_id(frame, request_id).await;
                    cnx.close().await;
                });
                return;
            }

            if inner.producer_name.is_none() {
                inner.producer_name = Some(granted_name);
            }
            inner.reconnect_attempt = 0;
            *self.current_backoff.lock() = Duration::ZERO;
            inner.state = State::Ready;
            *self.connected_since.lock() = Some(SystemTime::now());

            // Replay: every still-unacknowledged send, in window order
            // (spec.md §4.9 step 3).
            for op in inner.window.iter() {
                cnx.io_executor().write(&op.frame);
            }
            if !inner.window.is_empty() {
                cnx.io_executor().flush();
            }

            first_success = !self.ready_once.swap(true, Ordering::SeqCst);
        }

        if first_success {
            if self.config.batching_enabled {
                self.arm_flush_timer();
            }
            if !self.config.send_timeout.is_zero() {
                self.arm_timeout_sweeper();
            }
            if !self.client.stats_interval().is_zero() {
                self.arm_stats_reporter();
            }
            if let Some(tx) = self.producer_created.lock().take() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    async fn on_create_producer_failed(self: Arc<Self>, err: ProducerError) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_closing_or_closed() {
                if let Some(cnx) = inner.connection.take() {
                    drop(inner);
                    tokio::spawn(async move { cnx.close().await });
                }
                return;
            }

            if let ProducerError::BacklogQuotaExceeded { exceeded: true } = err {
                inner.state = State::Failed;
                let ops = inner.window.drain_all();
                drop(inner);
                for op in ops {
                    op.fail_all(err.clone());
                }
                if let Some(tx) = self.producer_created.lock().take() {
                    let _ = tx.send(Err(err));
                }
                return;
            }

            inner.connection = None;
            inner.state = State::Connecting;
        }

        self.retry_or_fail(err).await;
    }

    async fn handle_connection_failed(self: Arc<Self>, err: ProducerError) {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_closing_or_closed() {
                return;
            }
            inner.connection = None;
            inner.state = State::Connecting;
        }

        self.retry_or_fail(err).await;
    }

    /// Shared tail of both failure paths (spec.md §4.9 step 4): retry with
    /// backoff if the producer has already succeeded once, or a blocked
    /// backlog quota is reported; otherwise bound retries by
    /// `operation_timeout` before giving up and failing `producer_created`.
    async fn retry_or_fail(self: Arc<Self>, err: ProducerError) {
        if let ProducerError::BacklogQuotaExceeded { exceeded: false } = err {
            tracing::info!("backlog quota blocked, retrying create-producer");
            self.schedule_reconnect();
            return;
        }

        let already_ready = self.ready_once.load(Ordering::SeqCst);
        let should_retry = already_ready
            || (err.is_retryable() && self.first_attempt_at.elapsed() < self.client.operation_timeout());

        if should_retry {
            self.schedule_reconnect();
        } else {
            let mut inner = self.inner.lock();
            inner.state = State::Failed;
            drop(inner);
            if let Some(tx) = self.producer_created.lock().take() {
                let _ = tx.send(Err(err));
            }
        }
    }

    fn schedule_reconnect(self: Arc<Self>) {
        let attempt = {
            let mut inner = self.inner.lock();
            let attempt = inner.reconnect_attempt;
            inner.reconnect_attempt += 1;
            attempt
        };

        let mut backoff = self.current_backoff.lock();
        let delay = self.retry.next_backoff(attempt, *backoff);
        *backoff = delay;
        drop(backoff);

        tokio::spawn(async move {
            sleep(delay).await;
            self.attempt_connect().await;
        });
    }
}

#[async_trait]
impl ProducerEventSink for Producer {
    async fn connection_opened(&self, cnx: Arc<dyn ConnectionHandle>) {
        self.arc().handle_connection_opened(cnx).await;
    }

    async fn connection_failed(&self, err: ProducerError) {
        self.arc().handle_connection_failed(err).await;
    }

    async fn ack_received(&self, sequence_id: u64, ledger_id: u64, entry_id: u64) {
        self.arc().handle_ack(sequence_id, ledger_id, entry_id).await;
    }
}
