// examples/simulated_crawl.rs
//
// Crawls a fake site of PAGE_COUNT pages. Every page takes a little while to
// "download" and every RATE_LIMIT_EVERY-th request is pushed back by the server,
// which feeds the client error signal and makes the pool back off.
//
// RUST_LOG=autoscaled_pool=debug cargo run --example simulated_crawl

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use autoscaled_pool::{
    Error as CrateError,
    autoscaling::{
        AutoscaleConfig, AutoscaledPool, ConcurrencySettings,
        events::EventBus,
        monitor::{MonitorConfig, SystemMonitor},
        snapshotter::{ClientErrorCounter, Snapshotter, SnapshotterConfig},
        system_status::{LoadEvaluator, LoadEvaluatorConfig},
    },
};
use tokio::time::sleep;
use tracing::info;

// --- Configuration ---
const PAGE_COUNT: usize = 500;
const PAGE_LATENCY_MS: u64 = 40;
const RATE_LIMIT_EVERY: usize = 37;

/// Hands out page numbers until the site is exhausted.
#[derive(Clone, Default)]
struct Frontier {
    next: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
}

impl Frontier {
    fn take(&self) -> Option<usize> {
        let page = self.next.fetch_add(1, Ordering::SeqCst);
        (page < PAGE_COUNT).then_some(page)
    }

    fn has_pending(&self) -> bool {
        self.next.load(Ordering::SeqCst) < PAGE_COUNT
    }

    fn is_finished(&self) -> bool {
        self.done.load(Ordering::SeqCst) >= PAGE_COUNT
    }
}

async fn fetch(page: usize, frontier: Frontier, errors: ClientErrorCounter) -> Result<(), CrateError> {
    sleep(Duration::from_millis(PAGE_LATENCY_MS)).await;
    if page % RATE_LIMIT_EVERY == 0 {
        // 429: the server asked us to slow down. The page is still counted as done
        // so the demo terminates.
        errors.record_error();
        info!(page, "Rate limited");
    }
    frontier.done.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), CrateError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let bus = Arc::new(EventBus::default());
    let monitor = SystemMonitor::new(Arc::clone(&bus), MonitorConfig::default());

    let errors = ClientErrorCounter::new();
    let snapshotter = Arc::new(
        Snapshotter::new(Arc::clone(&bus), SnapshotterConfig::default())
            .with_client_load(errors.clone()),
    );
    let evaluator = LoadEvaluator::new(Arc::clone(&snapshotter), LoadEvaluatorConfig::default());

    let settings = ConcurrencySettings::builder()
        .min_concurrency(2)
        .max_concurrency(50)
        .max_tasks_per_minute(6_000.0)
        .build()?;
    let config = AutoscaleConfig::builder()
        .autoscale_interval(Duration::from_secs(1))
        .logging_interval(Duration::from_secs(5))
        .build()?;

    let frontier = Frontier::default();
    let pool = AutoscaledPool::new(
        evaluator,
        settings,
        {
            let frontier = frontier.clone();
            move || {
                let frontier = frontier.clone();
                let errors = errors.clone();
                async move {
                    match frontier.take() {
                        Some(page) => fetch(page, frontier, errors).await,
                        None => Ok(()),
                    }
                }
            }
        },
        {
            let frontier = frontier.clone();
            move || std::future::ready(frontier.has_pending())
        },
        {
            let frontier = frontier.clone();
            move || std::future::ready(frontier.is_finished())
        },
    )
    .with_config(config);

    monitor.start();
    snapshotter.start()?;

    let outcome = pool.run().await;

    snapshotter.stop().await;
    monitor.stop().await;

    outcome?;
    info!(
        pages = frontier.done.load(Ordering::SeqCst),
        "Crawl finished"
    );
    Ok(())
}
