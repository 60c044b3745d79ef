//! Ten concurrent calls through one rate-limited key, once per executor shape.
//!
//! Run with `cargo run --example orchestration`.

use pacegate::{
    EntityHub, HostContext, InMemoryEntityStore, KeyedGate, Limit, LiveHost, RateLimitedExecutor,
    ReplayDetector, RequestLog, SerializationGate,
};
use std::sync::Arc;
use std::time::Duration;

const REQUESTS: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(true).init();

    let limit = Limit::new(2, Duration::from_secs(1))?;
    let host = Arc::new(LiveHost::new());
    let log = RequestLog::new();

    let in_process =
        RateLimitedExecutor::builder(KeyedGate::new(limit)).hosted_by(host.clone()).build();
    run("in-process", &in_process, &host, &log).await?;

    let durable = RateLimitedExecutor::builder(EntityHub::new(limit, InMemoryEntityStore::new()))
        .hosted_by(host.clone())
        .build();
    run("durable", &durable, &host, &log).await?;

    Ok(())
}

async fn run<G: SerializationGate>(
    label: &str,
    executor: &RateLimitedExecutor<G>,
    host: &Arc<LiveHost>,
    log: &RequestLog,
) -> Result<(), Box<dyn std::error::Error>> {
    if !host.is_replaying() {
        log.reset();
    }
    let started = host.current_time();

    let mut tasks = Vec::with_capacity(REQUESTS);
    for i in 1..=REQUESTS {
        let executor = executor.clone();
        let host = host.clone();
        let log = log.clone();
        tasks.push(tokio::spawn(async move {
            executor
                .execute("downstream", || async move {
                    log.record(host.current_time());
                    tracing::info!(iteration = i, "calling downstream");
                    Ok::<_, std::io::Error>(())
                })
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    let took = host.current_time().duration_since(started)?;
    println!("\n[{label}] took {:.1}s in total", took.as_secs_f64());
    println!("[{label}] total requests: {}", log.len());
    let sorted = log.sorted();
    for (i, at) in sorted.iter().enumerate() {
        let gap = match i.checked_sub(1) {
            Some(prev) => at.duration_since(sorted[prev])?,
            None => Duration::ZERO,
        };
        println!("[{label}] request {i} happened {:.3}s after previous request", gap.as_secs_f64());
    }
    log.reset();
    Ok(())
}
