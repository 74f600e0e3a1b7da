use std::fmt;

use serde::Serialize;
use tokio::time::Instant;

use crate::latency::LatencyStats;

/// Counters private to one worker for the duration of a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerTotals {
    pub messages: u64,
    /// Exit sentinels sent (publishers) or observed (subscribers).
    pub exit_signals: usize,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
}

impl WorkerTotals {
    pub fn mark_started(&mut self, at: Instant) {
        self.started.get_or_insert(at);
    }

    pub fn record(&mut self, messages: u64, at: Instant) {
        self.messages += messages;
        self.mark_started(at);
        self.finished = Some(at);
    }
}

/// Process-wide totals, summed over workers after they all joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunTotals {
    pub workers: usize,
    pub messages: u64,
    pub exit_signals: usize,
    pub elapsed_secs: f64,
    pub rate: f64,
}

impl RunTotals {
    /// Sum counts and span from the earliest start to the latest finish.
    pub fn aggregate<'a>(parts: impl IntoIterator<Item = &'a WorkerTotals>) -> Self {
        let mut totals = RunTotals::default();
        let mut started: Option<Instant> = None;
        let mut finished: Option<Instant> = None;

        for part in parts {
            totals.workers += 1;
            totals.messages += part.messages;
            totals.exit_signals += part.exit_signals;
            if let Some(at) = part.started {
                started = Some(started.map_or(at, |s| s.min(at)));
            }
            if let Some(at) = part.finished {
                finished = Some(finished.map_or(at, |f| f.max(at)));
            }
        }

        if let (Some(started), Some(finished)) = (started, finished) {
            totals.elapsed_secs = finished.saturating_duration_since(started).as_secs_f64();
        }
        if totals.elapsed_secs > 0.0 {
            totals.rate = totals.messages as f64 / totals.elapsed_secs;
        }
        totals
    }
}

impl fmt::Display for RunTotals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total msgs processed: {}, achieved rate: {:.2} msgs/sec",
            self.messages, self.rate
        )
    }
}

/// Everything a run prints when it ends.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publishers: Option<RunTotals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<RunTotals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<LatencyStats>,
    /// First fatal worker error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn to_json(&self) -> Result<String, sonic_rs::Error> {
        sonic_rs::to_string(self)
    }

    /// Summary lines for standard output.
    pub fn lines(&self) -> Vec<String> {
        let labelled = self.publishers.is_some() && self.subscribers.is_some();
        let mut lines = Vec::new();
        if let Some(totals) = &self.publishers {
            lines.push(if labelled {
                format!("publishers: {totals}")
            } else {
                totals.to_string()
            });
        }
        if let Some(totals) = &self.subscribers {
            lines.push(if labelled {
                format!("subscribers: {totals}")
            } else {
                totals.to_string()
            });
        }
        if let Some(latency) = &self.latency {
            lines.push(latency.to_string());
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_aggregate_sums_and_spans() {
        let base = Instant::now();
        let mut a = WorkerTotals::default();
        a.record(10, base + Duration::from_secs(1));
        a.record(10, base + Duration::from_secs(2));
        let mut b = WorkerTotals::default();
        b.record(30, base + Duration::from_secs(3));
        b.exit_signals = 2;

        let totals = RunTotals::aggregate([&a, &b]);
        assert_eq!(totals.workers, 2);
        assert_eq!(totals.messages, 50);
        assert_eq!(totals.exit_signals, 2);
        assert_eq!(totals.elapsed_secs, 2.0);
        assert_eq!(totals.rate, 25.0);
    }

    #[test]
    fn test_explicit_start_wins_over_first_record() {
        let base = Instant::now();
        let mut totals = WorkerTotals::default();
        totals.mark_started(base);
        totals.record(4, base + Duration::from_secs(2));
        assert_eq!(totals.started, Some(base));
    }

    #[test]
    fn test_empty_run_has_zero_rate() {
        let totals = RunTotals::aggregate([&WorkerTotals::default()]);
        assert_eq!(totals.messages, 0);
        assert_eq!(totals.rate, 0.0);
        assert_eq!(
            totals.to_string(),
            "total msgs processed: 0, achieved rate: 0.00 msgs/sec"
        );
    }

    #[test]
    fn test_loopback_lines_are_labelled() {
        let report = RunReport {
            publishers: Some(RunTotals::default()),
            subscribers: Some(RunTotals::default()),
            latency: Some(LatencyStats::default()),
            error: None,
        };
        let lines = report.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("publishers: total msgs processed"));
        assert!(lines[1].starts_with("subscribers: total msgs processed"));
        assert_eq!(lines[2], "latency (ms): no data");
    }

    #[test]
    fn test_json_omits_missing_sections() {
        let report = RunReport {
            publishers: Some(RunTotals {
                workers: 1,
                messages: 3,
                exit_signals: 1,
                elapsed_secs: 1.5,
                rate: 2.0,
            }),
            ..RunReport::default()
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("\"publishers\""));
        assert!(json.contains("\"messages\":3"));
        assert!(!json.contains("subscribers"));
        assert!(!json.contains("latency"));
    }
}
