use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Broker, Delivery, Publisher, Subscriber};
use crate::error::{BenchError, Result};

#[derive(Default)]
struct Router {
    routes: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Delivery>)>>,
    next_connection: u64,
}

impl Router {
    fn deliver(&mut self, topic: &str, payload: &Bytes) -> u64 {
        let Some(subscribers) = self.routes.get_mut(topic) else {
            return 0;
        };

        let delivery = Delivery::new(topic, payload.clone());
        subscribers.retain(|(_, tx)| tx.send(delivery.clone()).is_ok());
        subscribers.len() as u64
    }

    fn unregister(&mut self, connection: u64) {
        self.routes.retain(|_, subscribers| {
            subscribers.retain(|(id, _)| *id != connection);
            !subscribers.is_empty()
        });
    }
}

/// In-process broker for loopback runs and tests.
///
/// Fan-out is synchronous: a flush has delivered to every subscriber queue by
/// the time it returns.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    router: Arc<Mutex<Router>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Broker for MemoryBroker {
    type Publisher = MemoryPublisher;
    type Subscriber = MemorySubscriber;

    async fn connect_publisher(&self) -> Result<MemoryPublisher> {
        Ok(MemoryPublisher {
            router: Arc::clone(&self.router),
            pending: Vec::new(),
        })
    }

    async fn connect_subscriber(&self) -> Result<MemorySubscriber> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut router = self.router.lock();
            router.next_connection += 1;
            router.next_connection
        };
        Ok(MemorySubscriber {
            id,
            router: Arc::clone(&self.router),
            tx,
            rx,
        })
    }
}

pub struct MemoryPublisher {
    router: Arc<Mutex<Router>>,
    pending: Vec<(String, Bytes)>,
}

impl Publisher for MemoryPublisher {
    fn queue(&mut self, topic: &str, payload: &[u8]) {
        self.pending
            .push((topic.to_owned(), Bytes::copy_from_slice(payload)));
    }

    async fn flush(&mut self) -> Result<Vec<u64>> {
        let mut router = self.router.lock();
        let acks = self
            .pending
            .drain(..)
            .map(|(topic, payload)| router.deliver(&topic, &payload))
            .collect();
        Ok(acks)
    }

    async fn subscriber_count(&mut self, topic: &str) -> Result<u64> {
        let router = self.router.lock();
        let live = router
            .routes
            .get(topic)
            .map(|subscribers| subscribers.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0);
        Ok(live as u64)
    }
}

pub struct MemorySubscriber {
    id: u64,
    router: Arc<Mutex<Router>>,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscriber for MemorySubscriber {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let mut router = self.router.lock();
        let subscribers = router.routes.entry(topic.to_owned()).or_default();
        if !subscribers.iter().any(|(id, _)| *id == self.id) {
            subscribers.push((self.id, self.tx.clone()));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Delivery> {
        self.rx.recv().await.ok_or(BenchError::Disconnected)
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        self.router.lock().unregister(self.id);
    }
}
