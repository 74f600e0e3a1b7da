//! Broker boundary.
//!
//! The harness only needs three primitives from a broker: publish, subscribe
//! and receive. Publishes are queued locally and pushed by [`Publisher::flush`],
//! which returns one acknowledgement per queued publish. Every connection is
//! owned by exactly one worker.

use std::future::Future;

use bytes::Bytes;
use futures_util::future::try_join_all;

use crate::error::Result;

pub mod memory;
pub mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

/// A message delivered to a subscriber connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

pub trait Broker: Clone + Send + Sync + 'static {
    type Publisher: Publisher;
    type Subscriber: Subscriber;

    fn connect_publisher(&self) -> impl Future<Output = Result<Self::Publisher>> + Send;

    fn connect_subscriber(&self) -> impl Future<Output = Result<Self::Subscriber>> + Send;
}

pub trait Publisher: Send + 'static {
    /// Buffer a publish until the next flush.
    fn queue(&mut self, topic: &str, payload: &[u8]);

    /// Send every queued publish and read back their acknowledgements.
    ///
    /// Each acknowledgement is the number of subscribers the broker delivered
    /// that publish to.
    fn flush(&mut self) -> impl Future<Output = Result<Vec<u64>>> + Send;

    /// Number of connections currently subscribed to `topic`.
    fn subscriber_count(&mut self, topic: &str) -> impl Future<Output = Result<u64>> + Send;
}

pub trait Subscriber: Send + 'static {
    /// Subscribe to `topic`, returning once the broker confirmed it.
    fn subscribe(&mut self, topic: &str) -> impl Future<Output = Result<()>> + Send;

    /// Wait for the next delivery on any subscribed topic.
    fn receive(&mut self) -> impl Future<Output = Result<Delivery>> + Send;
}

/// Open `size` publisher connections, failing if any of them fails.
pub async fn connect_publishers<B: Broker>(broker: &B, size: usize) -> Result<Vec<B::Publisher>> {
    try_join_all((0..size).map(|_| broker.connect_publisher())).await
}

/// Open `size` subscriber connections, failing if any of them fails.
pub async fn connect_subscribers<B: Broker>(
    broker: &B,
    size: usize,
) -> Result<Vec<B::Subscriber>> {
    try_join_all((0..size).map(|_| broker.connect_subscriber())).await
}
