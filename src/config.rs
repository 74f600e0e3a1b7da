use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::error::{BenchError, Result};
use crate::limiter::DEFAULT_BURST;

// =============================================================================
// Command line
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "pubsub-bench")]
#[command(about = "Publish/subscribe throughput and latency benchmark", long_about = None)]
pub struct Config {
    /// Broker address (host:port or redis:// URL)
    #[arg(long, env = "REDIS_HOST_ADDRESS", global = true)]
    pub address: Option<String>,

    /// Print the run summary as one JSON object
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub role: Role,
}

#[derive(Subcommand, Debug)]
pub enum Role {
    /// Publish messages at rate R randomly across N topics
    Publish {
        #[command(flatten)]
        topics: TopicArgs,

        #[command(flatten)]
        publish: PublishArgs,
    },

    /// Subscribe to N topics and count deliveries
    Subscribe {
        #[command(flatten)]
        topics: TopicArgs,

        #[command(flatten)]
        subscribe: SubscribeArgs,

        /// Publisher workers whose exit signals end the run
        #[arg(short = 'p', long = "publishers", default_value = "4")]
        publishers: usize,
    },

    /// Publish and subscribe in one process, sampling end-to-end latency
    Loopback {
        #[command(flatten)]
        topics: TopicArgs,

        #[command(flatten)]
        publish: PublishArgs,

        #[command(flatten)]
        subscribe: SubscribeArgs,

        /// Broker to run against
        #[arg(long, value_enum, default_value_t = BrokerKind::Redis)]
        broker: BrokerKind,
    },
}

#[derive(Args, Debug, Clone)]
pub struct TopicArgs {
    /// Number of topics
    #[arg(short = 'n', long = "topics", default_value = "0")]
    pub topics: u32,
}

#[derive(Args, Debug, Clone)]
pub struct PublishArgs {
    /// Target publish rate across all publishers (messages per second)
    #[arg(short = 'r', long, default_value = "0")]
    pub rate: f64,

    /// Publisher connections
    #[arg(short = 'p', long, default_value = "4")]
    pub publishers: usize,

    /// Publishes per flush (0 flushes every message)
    #[arg(short = 'b', long, default_value = "0")]
    pub batch: usize,

    /// Flush a partial batch after this many milliseconds (0 disables)
    #[arg(short = 'f', long = "flush-interval", default_value = "0")]
    pub flush_interval_ms: u64,

    /// Rate limiter burst capacity, split across publishers
    #[arg(long, default_value_t = DEFAULT_BURST)]
    pub burst: u32,

    /// Stop publishing after this many seconds (0 runs until interrupted)
    #[arg(short = 'd', long = "duration", default_value = "0")]
    pub duration_secs: u64,

    /// Stop publishing after this many messages in total (0 is unlimited)
    #[arg(long, default_value = "0")]
    pub count: u64,

    /// Wait until this many subscriber connections are ready (0 skips)
    #[arg(long, default_value = "0")]
    pub await_subscribers: usize,
}

#[derive(Args, Debug, Clone)]
pub struct SubscribeArgs {
    /// Subscriber connections; topics are spread round-robin across them
    #[arg(short = 's', long, default_value = "16")]
    pub subscribers: usize,

    /// Stop after this many idle seconds once traffic has started
    #[arg(long = "idle-timeout", default_value = "2")]
    pub idle_timeout_secs: u64,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Redis,
    Memory,
}

// =============================================================================
// Validated settings
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PublishSettings {
    pub topics: u32,
    pub rate: f64,
    pub publishers: usize,
    pub batch: usize,
    pub flush_interval: Option<Duration>,
    pub burst: u32,
    pub duration: Option<Duration>,
    pub count: Option<u64>,
    pub await_subscribers: usize,
}

impl PublishSettings {
    pub fn new(topics: u32, rate: f64) -> Self {
        Self {
            topics,
            rate,
            publishers: 4,
            batch: 0,
            flush_interval: None,
            burst: DEFAULT_BURST,
            duration: None,
            count: None,
            await_subscribers: 0,
        }
    }

    pub fn from_args(topics: &TopicArgs, args: &PublishArgs) -> Result<Self> {
        let settings = Self {
            topics: topics.topics,
            rate: args.rate,
            publishers: args.publishers,
            batch: args.batch,
            flush_interval: nonzero_millis(args.flush_interval_ms),
            burst: args.burst,
            duration: nonzero_secs(args.duration_secs),
            count: (args.count > 0).then_some(args.count),
            await_subscribers: args.await_subscribers,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topics == 0 {
            return Err(config_error("number of topics (-n) must be greater than zero"));
        }
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(config_error("publish rate (-r) must be greater than zero"));
        }
        if self.publishers == 0 {
            return Err(config_error("publisher count (-p) must be greater than zero"));
        }
        if self.burst == 0 {
            return Err(config_error("burst must be greater than zero"));
        }
        Ok(())
    }

    /// Publishes queued before each flush.
    pub fn flush_every(&self) -> usize {
        self.batch.max(1)
    }

    pub fn worker_rate(&self) -> f64 {
        self.rate / self.publishers as f64
    }

    pub fn worker_burst(&self) -> u32 {
        (self.burst / self.publishers as u32).max(1)
    }

    /// Message budget of one worker; the remainder goes to the lowest ids.
    pub fn worker_count(&self, worker: usize) -> Option<u64> {
        self.count.map(|total| {
            let workers = self.publishers as u64;
            let base = total / workers;
            if (worker as u64) < total % workers {
                base + 1
            } else {
                base
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeSettings {
    pub topics: u32,
    pub subscribers: usize,
    /// Exit sentinels that end the run, one per publisher worker.
    pub publishers: usize,
    pub idle_timeout: Duration,
}

impl SubscribeSettings {
    pub fn new(topics: u32, subscribers: usize, publishers: usize) -> Self {
        Self {
            topics,
            subscribers,
            publishers,
            idle_timeout: Duration::from_secs(2),
        }
    }

    pub fn from_args(topics: &TopicArgs, args: &SubscribeArgs, publishers: usize) -> Result<Self> {
        let settings = Self {
            topics: topics.topics,
            subscribers: args.subscribers,
            publishers,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topics == 0 {
            return Err(config_error("number of topics (-n) must be greater than zero"));
        }
        if self.subscribers == 0 {
            return Err(config_error("subscriber count (-s) must be greater than zero"));
        }
        if self.publishers == 0 {
            return Err(config_error("expected publisher count (-p) must be greater than zero"));
        }
        if self.idle_timeout.is_zero() {
            return Err(config_error("idle timeout must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Redis(String),
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Publish(PublishSettings),
    Subscribe(SubscribeSettings),
    Loopback {
        publish: PublishSettings,
        subscribe: SubscribeSettings,
    },
}

impl Config {
    /// Validate the command line into a run plan and its broker target.
    pub fn plan(&self) -> Result<(Plan, Target)> {
        let (plan, kind) = match &self.role {
            Role::Publish { topics, publish } => (
                Plan::Publish(PublishSettings::from_args(topics, publish)?),
                BrokerKind::Redis,
            ),
            Role::Subscribe {
                topics,
                subscribe,
                publishers,
            } => (
                Plan::Subscribe(SubscribeSettings::from_args(topics, subscribe, *publishers)?),
                BrokerKind::Redis,
            ),
            Role::Loopback {
                topics,
                publish,
                subscribe,
                broker,
            } => {
                let mut publish = PublishSettings::from_args(topics, publish)?;
                let subscribe = SubscribeSettings::from_args(topics, subscribe, publish.publishers)?;
                publish.await_subscribers = subscribe.subscribers;
                (Plan::Loopback { publish, subscribe }, *broker)
            }
        };

        let target = match kind {
            BrokerKind::Memory => Target::Memory,
            BrokerKind::Redis => match self.address.as_deref().map(str::trim) {
                Some(address) if !address.is_empty() => Target::Redis(address.to_string()),
                _ => return Err(config_error("REDIS_HOST_ADDRESS must be set!")),
            },
        };
        Ok((plan, target))
    }
}

fn config_error(message: &str) -> BenchError {
    BenchError::Configuration(message.to_string())
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn nonzero_millis(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}
