//! Startup ordering, termination and aggregation for worker pools.
//!
//! Workers own their counters for the whole run and hand them back over a
//! results channel when they finish. Nothing is read until every worker has
//! reported, so no counter is shared while traffic flows.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{connect_publishers, connect_subscribers, Broker};
use crate::config::{PublishSettings, SubscribeSettings};
use crate::error::Result;
use crate::latency::LatencyMeter;
use crate::publisher::PublisherWorker;
use crate::report::{RunReport, RunTotals, WorkerTotals};
use crate::shutdown::Shutdown;
use crate::subscriber::{PoolActivity, SubscriberWorker};

type Outcome = (usize, Result<WorkerTotals>);

// =============================================================================
// Publishers
// =============================================================================

/// Run the publisher pool until `shutdown` fires or a budget runs out.
pub async fn run_publishers<B: Broker>(
    broker: &B,
    settings: PublishSettings,
    meter: Option<Arc<LatencyMeter>>,
    shutdown: Shutdown,
) -> Result<RunReport> {
    settings.validate()?;
    let conns = connect_publishers(broker, settings.publishers).await?;
    let settings = Arc::new(settings);

    info!(
        "Starting {} publishers at {:.2} msgs/sec across {} topics",
        settings.publishers, settings.rate, settings.topics
    );

    let (tx, rx) = mpsc::unbounded_channel();
    for (id, conn) in conns.into_iter().enumerate() {
        let rng = StdRng::from_rng(&mut rand::rng());
        let worker = PublisherWorker::new(
            id,
            conn,
            Arc::clone(&settings),
            meter.clone(),
            shutdown.clone(),
            rng,
        )?;
        spawn_reporting(id, tx.clone(), worker.run());
    }
    drop(tx);

    let (parts, error) = collect(rx, settings.publishers, "Publisher").await;

    Ok(RunReport {
        publishers: Some(RunTotals::aggregate(parts.iter())),
        error,
        ..RunReport::default()
    })
}

// =============================================================================
// Subscribers
// =============================================================================

/// Run the subscriber pool until exit quorum, idle timeout or `close`.
pub async fn run_subscribers<B: Broker>(
    broker: &B,
    settings: SubscribeSettings,
    meter: Option<Arc<LatencyMeter>>,
    close: Shutdown,
) -> Result<RunReport> {
    settings.validate()?;
    let conns = connect_subscribers(broker, settings.subscribers).await?;
    let settings = Arc::new(settings);

    info!(
        "Subscribing {} connections to {} topics, expecting {} publishers",
        settings.subscribers, settings.topics, settings.publishers
    );

    let activity = Arc::new(PoolActivity::new());
    let (tx, rx) = mpsc::unbounded_channel();
    for (id, conn) in conns.into_iter().enumerate() {
        let worker = SubscriberWorker::new(
            id,
            conn,
            Arc::clone(&settings),
            meter.clone(),
            Arc::clone(&activity),
            close.clone(),
        );
        spawn_reporting(id, tx.clone(), worker.run());
    }
    drop(tx);

    let (parts, error) = collect(rx, settings.subscribers, "Subscriber").await;

    Ok(RunReport {
        subscribers: Some(RunTotals::aggregate(parts.iter())),
        error,
        ..RunReport::default()
    })
}

// =============================================================================
// Loopback
// =============================================================================

/// Subscribers and publishers in one process, sharing a latency meter.
///
/// Subscribers start first; publishers hold traffic until every local
/// subscriber registered on the ready topic. If the subscriber pool ends
/// first, for instance because a worker failed to subscribe, publishers are
/// stopped through `shutdown`. Both pools are always joined before
/// returning.
pub async fn run_loopback<B: Broker>(
    broker: &B,
    mut publish: PublishSettings,
    subscribe: SubscribeSettings,
    shutdown: Shutdown,
) -> Result<RunReport> {
    let meter = Arc::new(LatencyMeter::new()?);
    let close = Shutdown::new();
    publish.await_subscribers = subscribe.subscribers;

    let mut subscribers: JoinHandle<Result<RunReport>> = {
        let broker = broker.clone();
        let meter = Arc::clone(&meter);
        let close = close.clone();
        tokio::spawn(async move { run_subscribers(&broker, subscribe, Some(meter), close).await })
    };

    let publishing = run_publishers(broker, publish, Some(Arc::clone(&meter)), shutdown.clone());
    tokio::pin!(publishing);

    let (published, joined) = tokio::select! {
        published = &mut publishing => (published, None),
        joined = &mut subscribers => {
            debug!("Subscriber pool finished, stopping publishers");
            shutdown.trigger();
            (publishing.await, Some(joined))
        }
    };

    let failed = match &published {
        Ok(report) => report.error.is_some(),
        Err(_) => true,
    };
    if failed {
        // Failed publishers may never send their exit signal.
        warn!("Publishers failed, closing subscribers");
        close.trigger();
    }

    let received = match joined {
        Some(joined) => joined,
        None => subscribers.await,
    };
    let published = published?;
    let received = received??;

    let undelivered = meter.in_flight();
    if undelivered > 0 {
        warn!("{} sampled messages were never delivered", undelivered);
    }

    Ok(RunReport {
        publishers: published.publishers,
        subscribers: received.subscribers,
        latency: Some(meter.stats()),
        error: published.error.or(received.error),
    })
}

// =============================================================================
// Plumbing
// =============================================================================

fn spawn_reporting<F>(id: usize, tx: mpsc::UnboundedSender<Outcome>, run: F)
where
    F: std::future::Future<Output = Result<WorkerTotals>> + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = run.await;
        let _ = tx.send((id, outcome));
    });
}

/// Wait for every worker to report; keep the totals of those that finished
/// cleanly and the first error of those that did not.
async fn collect(
    mut rx: mpsc::UnboundedReceiver<Outcome>,
    expected: usize,
    role: &str,
) -> (Vec<WorkerTotals>, Option<String>) {
    let mut parts = Vec::with_capacity(expected);
    let mut first_error = None;
    let mut reported = 0;

    while let Some((id, outcome)) = rx.recv().await {
        reported += 1;
        match outcome {
            Ok(totals) => parts.push(totals),
            Err(e) => {
                error!("{} {} failed: {}", role, id, e);
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    if reported < expected {
        let missing = expected - reported;
        error!("{} {} workers exited without reporting", missing, role.to_lowercase());
        first_error.get_or_insert_with(|| format!("{missing} {} workers panicked", role.to_lowercase()));
    }

    (parts, first_error)
}
