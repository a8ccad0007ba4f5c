use std::sync::Arc;

use argh::FromArgs;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use scrape_operator::cluster::{
    FeedHub, ImmediateScaler, MemoryBundleSink, MemorySliceStore, StaticNodes, StaticRouting,
};
use scrape_operator::config::Config;
use scrape_operator::discover::Labels;
use scrape_operator::operator::{ControlEvent, MonitorEvent, Operator};
use scrape_operator::shutdown::ShutdownCoordinator;

/// Scrape target discovery and dispatch operator.
#[derive(FromArgs)]
struct Options {
    /// path to the operator configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// log bundle operations instead of persisting them
    #[argh(switch)]
    dry_run: bool,
}

fn main() {
    let opts: Options = argh::from_env();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("operator-worker")
        .enable_io()
        .enable_time()
        .build()
        .unwrap();

    runtime.block_on(async move {
        let filter = EnvFilter::try_from_env("OPERATOR_LOG")
            .unwrap_or_else(|_err| EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();

        let mut config = match &opts.config {
            Some(path) => match Config::load(path) {
                Ok(config) => config,
                Err(err) => {
                    error!(message = "failed to load configuration", ?err, path);
                    std::process::exit(1);
                }
            },
            None => Config::default(),
        };
        if opts.dry_run {
            config.dry_run = true;
        }

        info!(
            message = "starting operator",
            monitors = config.monitors.len(),
            dry_run = config.dry_run
        );

        // In-process collaborators; the embedding deployment replaces these
        // with implementations backed by its orchestrator.
        let feeds = Arc::new(FeedHub::new());
        let nodes = Arc::new(StaticNodes::new(Vec::new(), Vec::new()));
        let sink = if config.dry_run {
            Arc::new(MemoryBundleSink::dry_run())
        } else {
            Arc::new(MemoryBundleSink::new())
        };
        let scaler = Arc::new(ImmediateScaler::new(config.workers.replicas));
        let slices = Arc::new(MemorySliceStore::new());
        let routing = Arc::new(StaticRouting {
            id: 0,
            labels: Labels::new(),
        });

        let monitors = config.monitors.clone();
        let operator = Arc::new(Operator::new(
            config, nodes, sink, scaler, slices, routing, feeds,
        ));

        let (events_tx, events_rx) = mpsc::channel(16);
        let coordinator = ShutdownCoordinator::new();
        let handle = tokio::spawn(Arc::clone(&operator).run(events_rx, coordinator.register()));

        for monitor in monitors {
            if events_tx
                .send(ControlEvent::Monitor(MonitorEvent::Apply(monitor)))
                .await
                .is_err()
            {
                break;
            }
        }

        wait_for_signal().await;
        info!(message = "shutting down");
        drop(events_tx);
        coordinator.shutdown().await;
        let _ = handle.await;
        info!(message = "operator stopped");
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(message = "failed to install SIGTERM handler", ?err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
