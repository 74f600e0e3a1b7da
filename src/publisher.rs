use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info};

use crate::broker::Publisher;
use crate::config::PublishSettings;
use crate::error::{BenchError, Result};
use crate::latency::LatencyMeter;
use crate::limiter::TokenBucket;
use crate::message::{
    new_message_id, pick_topic, topic_name, CONTROL_TOPIC, EXIT_PAYLOAD, FILLER_PAYLOAD,
    READY_PAYLOAD, READY_TOPIC,
};
use crate::report::WorkerTotals;
use crate::shutdown::Shutdown;

/// Interval between subscriber-count polls during the readiness handshake.
pub const READINESS_POLL: Duration = Duration::from_millis(100);

/// Fail unless exactly one acknowledgement came back per flushed publish.
pub fn check_acks(expected: usize, received: usize) -> Result<()> {
    if expected == received {
        return Ok(());
    }
    Err(BenchError::Protocol(format!(
        "flushed {expected} publishes but read {received} acknowledgements"
    )))
}

/// Poll the `ready` topic until `expected` subscriber connections hold it.
///
/// Returns `false` if `shutdown` fired first.
pub async fn await_readiness<P: Publisher>(
    conn: &mut P,
    expected: usize,
    shutdown: &Shutdown,
) -> Result<bool> {
    loop {
        let registered = conn.subscriber_count(READY_TOPIC).await?;
        if registered >= expected as u64 {
            return Ok(true);
        }
        debug!("{} of {} subscribers ready", registered, expected);

        tokio::select! {
            _ = sleep(READINESS_POLL) => {}
            _ = shutdown.cancelled() => return Ok(false),
        }
    }
}

/// One publisher connection and the loop that drives it.
pub struct PublisherWorker<P> {
    id: usize,
    conn: P,
    settings: Arc<PublishSettings>,
    limiter: TokenBucket,
    budget: Option<u64>,
    meter: Option<Arc<LatencyMeter>>,
    shutdown: Shutdown,
    rng: StdRng,
}

impl<P: Publisher> PublisherWorker<P> {
    pub fn new(
        id: usize,
        conn: P,
        settings: Arc<PublishSettings>,
        meter: Option<Arc<LatencyMeter>>,
        shutdown: Shutdown,
        rng: StdRng,
    ) -> Result<Self> {
        let limiter = TokenBucket::new(settings.worker_rate(), settings.worker_burst(), Instant::now())?;
        let budget = settings.worker_count(id);
        Ok(Self {
            id,
            conn,
            settings,
            limiter,
            budget,
            meter,
            shutdown,
            rng,
        })
    }

    /// Run until cancelled or out of message or time budget, then drain and
    /// broadcast one exit sentinel. The time budget counts from the moment
    /// publishing starts, after the readiness handshake.
    pub async fn run(mut self) -> Result<WorkerTotals> {
        let mut totals = WorkerTotals::default();

        let ready = if self.settings.await_subscribers > 0 {
            let expected = self.settings.await_subscribers;
            let ready = await_readiness(&mut self.conn, expected, &self.shutdown).await?;
            if ready && self.id == 0 {
                info!("{} subscribers ready, starting publishers", expected);
                self.conn.queue(READY_TOPIC, READY_PAYLOAD);
                let acks = self.conn.flush().await?;
                check_acks(1, acks.len())?;
            }
            ready
        } else {
            true
        };

        if ready {
            self.publish_loop(&mut totals).await?;
        }

        // Draining: in-flight publishes were flushed by the loop.
        self.conn.queue(CONTROL_TOPIC, EXIT_PAYLOAD);
        let acks = self.conn.flush().await?;
        check_acks(1, acks.len())?;
        totals.exit_signals += 1;

        debug!("Publisher {} drained after {} messages", self.id, totals.messages);
        Ok(totals)
    }

    async fn publish_loop(&mut self, totals: &mut WorkerTotals) -> Result<()> {
        let flush_every = self.settings.flush_every();
        let flush_interval = self.settings.flush_interval;
        let mut queued = 0usize;
        let mut last_flush = Instant::now();
        let deadline = self.settings.duration.map(|duration| last_flush + duration);

        totals.mark_started(last_flush);
        debug!(
            "Publisher {} running at {:.2} msgs/sec",
            self.id,
            self.limiter.rate()
        );

        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
            if let Some(budget) = self.budget {
                if totals.messages + queued as u64 >= budget {
                    break;
                }
            }

            let reservation = self.limiter.reserve(Instant::now());
            if reservation.granted {
                self.queue_message();
                queued += 1;
                if queued >= flush_every {
                    self.flush_batch(queued, totals).await?;
                    queued = 0;
                    last_flush = Instant::now();
                }
            }

            if let Some(interval) = flush_interval {
                if queued > 0 && last_flush.elapsed() >= interval {
                    self.flush_batch(queued, totals).await?;
                    queued = 0;
                    last_flush = Instant::now();
                }
            }

            if !reservation.delay.is_zero() {
                let wake = match deadline {
                    Some(deadline) => deadline.min(Instant::now() + reservation.delay),
                    None => Instant::now() + reservation.delay,
                };
                tokio::select! {
                    _ = sleep_until(wake) => {}
                    _ = self.shutdown.cancelled() => {}
                }
            }
        }

        if queued > 0 {
            self.flush_batch(queued, totals).await?;
        }
        Ok(())
    }

    fn queue_message(&mut self) {
        let topic = topic_name(pick_topic(&mut self.rng, self.settings.topics));
        match &self.meter {
            Some(meter) => {
                let id = new_message_id(&mut self.rng);
                meter.mark_sent(&id);
                self.conn.queue(&topic, id.as_bytes());
            }
            None => self.conn.queue(&topic, FILLER_PAYLOAD),
        }
    }

    async fn flush_batch(&mut self, queued: usize, totals: &mut WorkerTotals) -> Result<()> {
        let acks = self.conn.flush().await?;
        check_acks(queued, acks.len())?;
        totals.record(queued as u64, Instant::now());
        Ok(())
    }
}
