//! Pulseline Producer
//!
//! Client-side producer for a partitioned, broker-mediated publish/subscribe
//! messaging system: monotonic sequence assignment, optional batching and
//! compression, a bounded in-flight window, ack correlation, a send-timeout
//! sweeper, and reconnect-and-replay.
//!
//! The multiplexed connection, its wire codec, the compression codecs, and
//! topic/partition discovery are external collaborators — only their
//! interfaces ([`ConnectionHandle`], [`Connector`], [`ProducerEventSink`])
//! matter to this crate. [`LocalConnection`] and [`TcpConnector`] are a
//! minimal concrete implementation provided so the crate is exercisable
//! stand-alone; production users are expected to supply their own.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pulseline_producer::{Client, ProducerMessage, TcpConnector};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new();
//!     let producer = client
//!         .new_producer("my-topic")
//!         .connector(Arc::new(TcpConnector::new("broker.internal:6650")))
//!         .connect()
//!         .await?;
//!
//!     let id = producer.send_async(ProducerMessage::new("hello world")).await?;
//!     println!("published {:?}", id);
//!
//!     producer.close_async().await?;
//!     Ok(())
//! }
//! ```

mod batch;
mod client;
mod compression;
mod connection;
mod error;
mod frame;
mod message;
mod producer;
mod retry;
mod state;
mod stats;
mod window;

pub use client::{Client, ClientBuilder};
pub use compression::CompressionType;
pub use connection::{
    BrokerResponse, ConnectionHandle, Connector, IoExecutor, LocalConnection, ProducerEventSink,
    TcpConnector,
};
pub use error::ProducerError;
pub use frame::{Frame, FrameKind};
pub use message::{MessageId, MessageMetadata, ProducerMessage};
pub use producer::{Producer, ProducerBuilder, ProducerConfig};
pub use retry::{JitterMode, RetryConfig};
pub use state::State as ProducerState;
pub use stats::ProducerStatsSnapshot;
