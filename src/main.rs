use anyhow::Result;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use rpc_admission::{
    AcquireContext, AdmissionController, AdmissionError, Outcome, Settings, StatsReporter,
};

const SIM_POOLS: [&str; 3] = ["solana-rpc", "dexscreener", "proxy-1"];
const WORKERS_PER_POOL: usize = 8;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_PERIOD: Duration = Duration::from_secs(5);

// Chance the simulated upstream answers 429.
const THROTTLE_PROBABILITY: f64 = 0.05;

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level()));

    if settings.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Stands in for the real RPC call: random latency, occasional throttling.
async fn simulated_upstream_call() -> Outcome {
    let latency_ms = rand::random_range(20..200);
    tokio::time::sleep(Duration::from_millis(latency_ms)).await;

    let roll: f64 = rand::random();
    if roll < THROTTLE_PROBABILITY {
        Outcome::RateLimited
    } else if roll < THROTTLE_PROBABILITY * 1.5 {
        Outcome::OtherError
    } else {
        Outcome::Success
    }
}

async fn run_worker(controller: AdmissionController, pool: &'static str, worker_id: usize) {
    loop {
        let ctx = AcquireContext::with_timeout(ACQUIRE_TIMEOUT);
        match controller.acquire(pool, &ctx).await {
            Ok(lease) => {
                let outcome = simulated_upstream_call().await;
                debug!(pool, worker_id, ?outcome, "Call finished");
                lease.release(outcome);
            }
            Err(AdmissionError::ShuttingDown) => break,
            Err(AdmissionError::PoolDegraded { retry_after, .. }) => {
                // Back off from the pool entirely until the circuit may close.
                let wait = retry_after.unwrap_or(Duration::from_millis(250));
                tokio::time::sleep(wait).await;
            }
            Err(e) if e.is_retryable() => {
                warn!(pool, worker_id, "Admission failed: {}", e);
            }
            Err(e) => {
                error!(pool, worker_id, "Worker stopping: {}", e);
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    init_tracing(&settings);

    info!("Starting admission simulator...");
    info!(
        "Global cap {} concurrent, {}ms dispatch spacing. Default pool: {} req/{}ms, {} conns, {}ms spacing",
        settings.global.max_concurrent,
        settings.pacing.request_delay_ms,
        settings.default_pool.max_requests_per_window,
        settings.default_pool.window_ms,
        settings.default_pool.max_concurrent_connections,
        settings.default_pool.min_delay_ms
    );

    let controller = AdmissionController::from_settings(&settings);
    let reaper = controller.spawn_reaper();
    let stats = StatsReporter::new(controller.clone()).spawn(STATS_PERIOD);

    let mut workers = Vec::new();
    for pool in SIM_POOLS {
        for worker_id in 0..WORKERS_PER_POOL {
            workers.push(tokio::spawn(run_worker(controller.clone(), pool, worker_id)));
        }
    }
    info!("{} workers started.", workers.len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    controller.shutdown();

    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker task failed: {}", e);
        }
    }
    let _ = reaper.await;
    let _ = stats.await;

    StatsReporter::new(controller).log_stats();
    Ok(())
}
