//! Client-wide context shared by every producer.
//!
//! Spec.md §6 "Consumed from the client": id allocators, a shared timer,
//! `operation_timeout_ms`, `cleanup_producer`, `stats_interval_seconds`.
//! Mirrors the shape of the teacher's `Client`/`ClientBuilder` split — a
//! cheaply cloneable handle wrapping shared, atomically-updated state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::producer::{Producer, ProducerBuilder};

/// Client-wide context: producer-id/request-id allocation, the operation
/// timeout applied to reconnect attempts, and the stats reporting interval.
///
/// Cloning a `Client` is cheap — it shares one set of counters and one
/// producer registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    next_producer_id: AtomicU64,
    next_request_id: AtomicU64,
    operation_timeout: Duration,
    stats_interval: Duration,
    producers: Mutex<HashMap<u64, Weak<Producer>>>,
}

impl Client {
    pub fn new() -> Self {
        ClientBuilder::new().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Allocate a fresh, client-lifetime-unique producer id.
    pub fn new_producer_id(&self) -> u64 {
        self.inner.next_producer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a fresh request id for a request/response RPC.
    pub fn new_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start building a producer for `topic` on this client.
    pub fn new_producer(&self, topic: impl Into<String>) -> ProducerBuilder {
        ProducerBuilder::new(self.clone(), topic)
    }

    pub fn operation_timeout(&self) -> Duration {
        self.inner.operation_timeout
    }

    /// `0` disables periodic stats reporting (spec.md §6).
    pub fn stats_interval(&self) -> Duration {
        self.inner.stats_interval
    }

    /// Track a producer so it can be found by id later; holds only a weak
    /// reference so the client never keeps a closed producer alive.
    pub(crate) fn track_producer(&self, producer_id: u64, producer: &Arc<Producer>) {
        self.inner
            .producers
            .lock()
            .insert(producer_id, Arc::downgrade(producer));
    }

    /// Remove a producer from the registry. Called once the producer has
    /// finished closing (spec.md §6 `cleanup_producer`).
    pub fn cleanup_producer(&self, producer_id: u64) {
        self.inner.producers.lock().remove(&producer_id);
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for configuring a [`Client`].
#[must_use = "builders do nothing unless you call .build()"]
pub struct ClientBuilder {
    operation_timeout: Duration,
    stats_interval: Duration,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            stats_interval: Duration::from_secs(60),
        }
    }

    /// How long the reconnect orchestrator (spec.md §4.9) keeps retrying a
    /// retriable `CREATE_PRODUCER` failure before giving up.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// `Duration::ZERO` disables periodic stats reporting.
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                next_producer_id: AtomicU64::new(0),
                next_request_id: AtomicU64::new(0),
                operation_timeout: self.operation_timeout,
                stats_interval: self.stats_interval,
                producers: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
