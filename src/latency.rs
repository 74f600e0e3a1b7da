use std::collections::HashMap;
use std::fmt;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::Result;

// One hour in milliseconds; slower round trips are clamped.
const HISTOGRAM_HIGH_MS: u64 = 3_600_000;

struct MeterState {
    /// Send time of every id still waiting for its first delivery.
    in_flight: HashMap<String, Instant>,
    round_trips: Histogram<u64>,
}

/// Correlates outbound message ids with their delivery time.
///
/// Publisher and subscriber workers share one meter; every operation takes
/// the same lock, so the three calls are linearizable with respect to each
/// other. An id leaves the table on its first delivery, so the table only
/// holds messages still in flight.
pub struct LatencyMeter {
    state: Mutex<MeterState>,
}

impl LatencyMeter {
    pub fn new() -> Result<Self> {
        let round_trips = Histogram::<u64>::new_with_bounds(1, HISTOGRAM_HIGH_MS, 3)?;
        Ok(Self {
            state: Mutex::new(MeterState {
                in_flight: HashMap::new(),
                round_trips,
            }),
        })
    }

    /// Record the send time of `id`. A repeated id restarts its clock.
    pub fn mark_sent(&self, id: &str) {
        let now = Instant::now();
        self.state.lock().in_flight.insert(id.to_owned(), now);
    }

    /// Record the receive time of `id`.
    ///
    /// Returns `false` without recording anything when `id` is not in flight:
    /// it was never marked as sent by this meter, or its first delivery was
    /// already seen.
    pub fn mark_received(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock();

        let Some(sent_at) = state.in_flight.remove(id) else {
            return false;
        };
        let elapsed = now.duration_since(sent_at).as_millis() as u64;
        state.round_trips.saturating_record(elapsed);
        true
    }

    /// Ids marked as sent whose delivery has not been seen yet.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Min, mean and max round trip in whole milliseconds over completed
    /// records. With no completed record every field is zero.
    pub fn stats(&self) -> LatencyStats {
        let state = self.state.lock();
        let histogram = &state.round_trips;
        if histogram.is_empty() {
            return LatencyStats::default();
        }

        LatencyStats {
            samples: histogram.len(),
            min_ms: histogram.min(),
            mean_ms: histogram.mean() as u64,
            max_ms: histogram.max(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub min_ms: u64,
    pub mean_ms: u64,
    pub max_ms: u64,
}

impl LatencyStats {
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "latency (ms): no data");
        }
        write!(
            f,
            "latency (ms): min {}, mean {}, max {} over {} samples",
            self.min_ms, self.mean_ms, self.max_ms, self.samples
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_receipt_before_send_is_ignored() {
        let meter = LatencyMeter::new().unwrap();

        assert!(!meter.mark_received("abc"));
        assert_eq!(meter.in_flight(), 0);

        meter.mark_sent("abc");
        assert_eq!(meter.in_flight(), 1);
        assert!(meter.stats().is_empty());
    }

    #[test]
    fn test_empty_stats_are_zero() {
        let meter = LatencyMeter::new().unwrap();
        meter.mark_sent("never-delivered");

        let stats = meter.stats();
        assert!(stats.is_empty());
        assert_eq!(stats, LatencyStats::default());
        assert_eq!(stats.to_string(), "latency (ms): no data");
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_matches_elapsed() {
        let meter = LatencyMeter::new().unwrap();

        meter.mark_sent("a1");
        tokio::time::advance(Duration::from_millis(25)).await;
        assert!(meter.mark_received("a1"));

        let stats = meter.stats();
        assert_eq!(stats.samples, 1);
        assert_eq!((stats.min_ms, stats.mean_ms, stats.max_ms), (25, 25, 25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_delivery_keeps_first_receipt() {
        let meter = LatencyMeter::new().unwrap();

        meter.mark_sent("dup");
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(meter.mark_received("dup"));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!meter.mark_received("dup"));

        let stats = meter.stats();
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.max_ms, 5);
        assert_eq!(meter.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_truncate_mean() {
        let meter = LatencyMeter::new().unwrap();

        meter.mark_sent("x");
        meter.mark_sent("y");
        tokio::time::advance(Duration::from_millis(10)).await;
        meter.mark_received("x");
        tokio::time::advance(Duration::from_millis(11)).await;
        meter.mark_received("y");

        let stats = meter.stats();
        assert_eq!(stats.min_ms, 10);
        assert_eq!(stats.max_ms, 21);
        // (10 + 21) / 2 = 15.5
        assert_eq!(stats.mean_ms, 15);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers() {
        let meter = Arc::new(LatencyMeter::new().unwrap());

        let mut handles = Vec::new();
        for worker in 0..8 {
            let meter = Arc::clone(&meter);
            handles.push(tokio::spawn(async move {
                for i in 0..500 {
                    let id = format!("{worker}-{i}");
                    meter.mark_sent(&id);
                    meter.mark_received(&id);
                    meter.mark_received(&format!("foreign-{worker}-{i}"));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(meter.in_flight(), 0);
        assert_eq!(meter.stats().samples, 4_000);
    }
}
