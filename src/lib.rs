//! Load generation and measurement harness for publish/subscribe brokers.
//!
//! Publishers draw permits from a per-connection token bucket and publish to
//! uniformly random topics; subscribers spread the same topics over a pool of
//! connections and count deliveries. A readiness handshake holds publishers
//! until subscribers are attached, and each draining publisher broadcasts
//! one `exit` sentinel on topic `0` so subscribers know when to stop.

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod latency;
pub mod limiter;
pub mod message;
pub mod publisher;
pub mod report;
pub mod shutdown;
pub mod subscriber;

pub use config::{Config, Plan, PublishSettings, SubscribeSettings, Target};
pub use coordinator::{run_loopback, run_publishers, run_subscribers};
pub use error::{BenchError, Result};
pub use latency::{LatencyMeter, LatencyStats};
pub use limiter::{Reservation, TokenBucket};
pub use report::{RunReport, RunTotals, WorkerTotals};
pub use shutdown::Shutdown;
