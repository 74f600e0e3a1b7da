use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info};

use crate::broker::{Delivery, Subscriber};
use crate::config::SubscribeSettings;
use crate::error::{BenchError, Result};
use crate::latency::LatencyMeter;
use crate::message::{topic_name, Message, READY_TOPIC};
use crate::report::WorkerTotals;
use crate::shutdown::Shutdown;

/// Topics owned by `worker` when `topics` are dealt round-robin over
/// `workers` connections.
pub fn partition(topics: u32, workers: usize, worker: usize) -> Vec<u32> {
    (0..topics)
        .filter(|topic| *topic as usize % workers == worker)
        .collect()
}

/// Which workers of a pool have seen traffic, and how many of those have
/// stopped receiving since.
///
/// The pool is done with idling once every worker that saw traffic has
/// stopped. Workers that never saw traffic are closed along with it.
#[derive(Debug, Default)]
pub struct PoolActivity {
    state: Mutex<ActivityState>,
}

#[derive(Debug, Default)]
struct ActivityState {
    started: usize,
    stopped: usize,
}

impl PoolActivity {
    pub fn new() -> Self {
        Self::default()
    }

    fn traffic_started(&self) {
        self.state.lock().started += 1;
    }

    /// A started worker went idle. Returns `true` if it was the last one
    /// still receiving.
    fn went_idle(&self) -> bool {
        let mut state = self.state.lock();
        state.stopped += 1;
        state.stopped >= state.started
    }

    /// A started worker failed; it no longer holds the pool open.
    fn withdraw(&self) {
        let mut state = self.state.lock();
        state.started = state.started.saturating_sub(1);
    }
}

/// One subscriber connection and the loop that drains it.
///
/// The worker ends when its pool is closed, when it sees one exit sentinel
/// per expected publisher (and then closes the pool for its siblings), or
/// when its own traffic stops for longer than the idle timeout. An idle
/// worker leaves its siblings running unless it was the last one receiving.
pub struct SubscriberWorker<S> {
    id: usize,
    conn: S,
    topics: Vec<u32>,
    settings: Arc<SubscribeSettings>,
    meter: Option<Arc<LatencyMeter>>,
    activity: Arc<PoolActivity>,
    close: Shutdown,
}

impl<S: Subscriber> SubscriberWorker<S> {
    pub fn new(
        id: usize,
        conn: S,
        settings: Arc<SubscribeSettings>,
        meter: Option<Arc<LatencyMeter>>,
        activity: Arc<PoolActivity>,
        close: Shutdown,
    ) -> Self {
        let topics = partition(settings.topics, settings.subscribers, id);
        Self {
            id,
            conn,
            topics,
            settings,
            meter,
            activity,
            close,
        }
    }

    pub async fn run(mut self) -> Result<WorkerTotals> {
        self.subscribe_all().await?;
        self.poll().await
    }

    async fn subscribe_all(&mut self) -> Result<()> {
        for topic in &self.topics {
            self.conn.subscribe(&topic_name(*topic)).await?;
        }
        // Last, so the ready count only includes fully subscribed workers.
        self.conn.subscribe(READY_TOPIC).await?;
        debug!("Subscriber {} subscribed to {} topics", self.id, self.topics.len());
        Ok(())
    }

    async fn poll(&mut self) -> Result<WorkerTotals> {
        let mut totals = WorkerTotals::default();
        let close = self.close.clone();

        loop {
            // Block indefinitely until traffic starts, then bound each wait.
            let idle = totals.started.map(|_| self.settings.idle_timeout);

            let received = tokio::select! {
                _ = close.cancelled() => {
                    debug!("Subscriber {} closed by sibling", self.id);
                    break;
                }
                received = receive_within(&mut self.conn, idle) => received,
            };

            let delivery = match received {
                Ok(delivery) => delivery,
                Err(BenchError::Timeout(waited)) => {
                    info!(
                        "Subscriber {} idle for {:?}, treating as end of run",
                        self.id, waited
                    );
                    if self.activity.went_idle() {
                        info!("Subscriber {} was the last one receiving, closing", self.id);
                        close.trigger();
                    }
                    break;
                }
                Err(e) => {
                    error!("Subscriber {} receive failed: {}", self.id, e);
                    if totals.started.is_some() {
                        self.activity.withdraw();
                    }
                    return Err(e);
                }
            };

            match Message::classify(&delivery.topic, &delivery.payload) {
                Message::ControlExit => {
                    totals.exit_signals += 1;
                    debug!(
                        "Subscriber {} saw exit {} of {}",
                        self.id, totals.exit_signals, self.settings.publishers
                    );
                    if totals.exit_signals >= self.settings.publishers {
                        info!(
                            "Subscriber {} saw all {} exit signals, closing",
                            self.id, totals.exit_signals
                        );
                        close.trigger();
                        break;
                    }
                }
                Message::Ready => {
                    debug!("Subscriber {} saw publishers start", self.id);
                }
                Message::Data { id, .. } => {
                    if let (Some(id), Some(meter)) = (id, &self.meter) {
                        if !meter.mark_received(id) {
                            debug!("Subscriber {} ignored receipt for unknown id {}", self.id, id);
                        }
                    }
                    if totals.started.is_none() {
                        self.activity.traffic_started();
                    }
                    totals.record(1, Instant::now());
                }
            }
        }

        Ok(totals)
    }
}

async fn receive_within<S: Subscriber>(conn: &mut S, idle: Option<Duration>) -> Result<Delivery> {
    match idle {
        None => conn.receive().await,
        Some(limit) => timeout(limit, conn.receive())
            .await
            .map_err(|_| BenchError::Timeout(limit))?,
    }
}
