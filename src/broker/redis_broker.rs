use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use url::Url;

use super::{Broker, Delivery, Publisher, Subscriber};
use crate::error::{BenchError, Result};

/// Normalize a `host:port` or `redis://` address into a connection URL.
pub fn broker_url(address: &str) -> Result<Url> {
    let address = address.trim();
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("redis://{address}")
    };

    let url = Url::parse(&candidate).map_err(|e| {
        BenchError::Configuration(format!("invalid broker address {address:?}: {e}"))
    })?;
    if url.scheme() != "redis" {
        return Err(BenchError::Configuration(format!(
            "unsupported broker scheme {:?}, expected redis://",
            url.scheme()
        )));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(BenchError::Configuration(format!(
            "broker address {address:?} has no host"
        ))),
    }
}

/// Redis pub/sub backend.
#[derive(Clone, Debug)]
pub struct RedisBroker {
    client: redis::Client,
    address: String,
}

impl RedisBroker {
    pub fn open(address: &str) -> Result<Self> {
        let url = broker_url(address)?;
        let client = redis::Client::open(url.as_str()).map_err(|e| {
            BenchError::Configuration(format!("invalid broker address {address:?}: {e}"))
        })?;
        Ok(Self {
            client,
            address: address.to_string(),
        })
    }

    fn connection_error(&self, source: redis::RedisError) -> BenchError {
        BenchError::Connection {
            address: self.address.clone(),
            reason: source.to_string(),
        }
    }
}

impl Broker for RedisBroker {
    type Publisher = RedisPublisher;
    type Subscriber = RedisSubscriber;

    async fn connect_publisher(&self) -> Result<RedisPublisher> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| self.connection_error(e))?;
        Ok(RedisPublisher {
            conn,
            pending: redis::pipe(),
            queued: 0,
        })
    }

    async fn connect_subscriber(&self) -> Result<RedisSubscriber> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| self.connection_error(e))?;
        Ok(RedisSubscriber { pubsub })
    }
}

/// Publishes are pipelined: one round trip per flush, one integer reply per
/// `PUBLISH`.
pub struct RedisPublisher {
    conn: MultiplexedConnection,
    pending: redis::Pipeline,
    queued: usize,
}

impl Publisher for RedisPublisher {
    fn queue(&mut self, topic: &str, payload: &[u8]) {
        self.pending.cmd("PUBLISH").arg(topic).arg(payload);
        self.queued += 1;
    }

    async fn flush(&mut self) -> Result<Vec<u64>> {
        if self.queued == 0 {
            return Ok(Vec::new());
        }
        let pipeline = std::mem::replace(&mut self.pending, redis::pipe());
        self.queued = 0;

        let acks: Vec<u64> = pipeline.query_async(&mut self.conn).await?;
        Ok(acks)
    }

    async fn subscriber_count(&mut self, topic: &str) -> Result<u64> {
        let reply: (String, u64) = redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(topic)
            .query_async(&mut self.conn)
            .await?;
        Ok(reply.1)
    }
}

pub struct RedisSubscriber {
    pubsub: PubSub,
}

impl Subscriber for RedisSubscriber {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.pubsub.subscribe(topic).await.map_err(|e| {
            BenchError::Protocol(format!("subscription to topic {topic} was not confirmed: {e}"))
        })
    }

    async fn receive(&mut self) -> Result<Delivery> {
        let msg = self
            .pubsub
            .on_message()
            .next()
            .await
            .ok_or(BenchError::Disconnected)?;
        Ok(Delivery {
            topic: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_port() {
        let url = broker_url("localhost:6379").unwrap();
        assert_eq!(url.scheme(), "redis");
        assert_eq!(url.host_str(), Some("localhost"));
        assert_eq!(url.port(), Some(6379));
    }

    #[test]
    fn test_full_url_passes_through() {
        let url = broker_url("redis://10.0.0.5:7000/0").unwrap();
        assert_eq!(url.host_str(), Some("10.0.0.5"));
        assert_eq!(url.port(), Some(7000));
    }

    #[test]
    fn test_rejects_other_schemes() {
        let err = broker_url("http://localhost:6379").unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(broker_url("redis://").is_err());
        assert!(broker_url("local host:port").is_err());
    }

    #[test]
    fn test_open_does_not_connect() {
        // Nothing listens on port 1; opening only validates the address.
        assert!(RedisBroker::open("127.0.0.1:1").is_ok());
    }
}
