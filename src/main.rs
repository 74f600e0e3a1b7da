use anyhow::{anyhow, Result};
use clap::{CommandFactory, Parser};
use tracing::info;

use pubsub_bench::broker::{Broker, MemoryBroker, RedisBroker};
use pubsub_bench::{
    run_loopback, run_publishers, run_subscribers, BenchError, Config, Plan, Shutdown, Target,
};

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries only the summary.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) => {
            // Help, version and usage errors all end here without error status.
            e.print()?;
            return Ok(());
        }
    };

    let (plan, target) = match config.plan() {
        Ok(planned) => planned,
        Err(BenchError::Configuration(message)) => {
            println!("{message}");
            println!();
            Config::command().print_help()?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    print_banner(&plan, &target);

    match target {
        Target::Memory => execute(MemoryBroker::new(), plan, config.json).await,
        Target::Redis(address) => execute(RedisBroker::open(&address)?, plan, config.json).await,
    }
}

fn print_banner(plan: &Plan, target: &Target) {
    info!("════════════════════════════════════════════════════════════");
    info!("           PUB/SUB BENCHMARK");
    info!("════════════════════════════════════════════════════════════");
    match target {
        Target::Redis(address) => info!("Broker: redis at {}", address),
        Target::Memory => info!("Broker: in-process"),
    }
    match plan {
        Plan::Publish(publish) => {
            info!("Role: publish");
            info!("Topics: {}", publish.topics);
            info!("Rate: {:.2} msgs/sec over {} publishers", publish.rate, publish.publishers);
            info!("Batch: {}", publish.flush_every());
        }
        Plan::Subscribe(subscribe) => {
            info!("Role: subscribe");
            info!("Topics: {}", subscribe.topics);
            info!("Subscribers: {}", subscribe.subscribers);
            info!("Expected publishers: {}", subscribe.publishers);
        }
        Plan::Loopback { publish, subscribe } => {
            info!("Role: loopback");
            info!("Topics: {}", publish.topics);
            info!("Rate: {:.2} msgs/sec over {} publishers", publish.rate, publish.publishers);
            info!("Batch: {}", publish.flush_every());
            info!("Subscribers: {}", subscribe.subscribers);
        }
    }
    info!("════════════════════════════════════════════════════════════");
}

async fn execute<B: Broker>(broker: B, plan: Plan, json: bool) -> Result<()> {
    let shutdown = Shutdown::new();

    // Interrupts take the same path as a natural stop: publishers drain and
    // the summary is still printed.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping");
                shutdown.trigger();
            }
        });
    }

    let report = match plan {
        Plan::Publish(settings) => run_publishers(&broker, settings, None, shutdown).await?,
        Plan::Subscribe(settings) => run_subscribers(&broker, settings, None, shutdown).await?,
        Plan::Loopback { publish, subscribe } => {
            run_loopback(&broker, publish, subscribe, shutdown).await?
        }
    };

    if json {
        println!("{}", report.to_json()?);
    } else {
        for line in report.lines() {
            println!("{line}");
        }
    }

    match report.error {
        Some(error) => Err(anyhow!("run finished with a failed worker: {error}")),
        None => Ok(()),
    }
}
