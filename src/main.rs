// src/main.rs
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use anchor_watch_lib::{
    AnchorStore, CycleOutcome, LogDisplaySink, LogNotificationSink, MovementWatcher,
    ThingSpeakFeed, WatchConfig, WatcherOptions,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum RunMode {
    /// Poll until interrupted
    Watch,
    /// Poll one cycle, print the snapshot and exit
    Once,
    /// Poll one cycle and save the sample as the anchor
    SaveAnchor,
    ClearAnchor,
}

fn parse_args() -> Result<RunMode> {
    let mut mode = RunMode::Watch;
    for arg in std::env::args().skip(1) {
        let next = match arg.as_str() {
            "--once" => RunMode::Once,
            "--save-anchor" => RunMode::SaveAnchor,
            "--clear-anchor" => RunMode::ClearAnchor,
            "-h" | "--help" => {
                println!("Usage: anchor_watch [--once | --save-anchor | --clear-anchor]");
                std::process::exit(0);
            }
            other => bail!("Unknown argument: {}", other),
        };
        if mode != RunMode::Watch && mode != next {
            bail!("Only one of --once, --save-anchor, --clear-anchor may be given");
        }
        mode = next;
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let mode = parse_args()?;
    let config = WatchConfig::from_env().context("Failed to load watcher configuration")?;

    // Holds the anchor file's lock until the process exits
    let store = Arc::new(
        AnchorStore::open(&config.anchor_file).context("Failed to open anchor store")?,
    );

    if mode == RunMode::ClearAnchor {
        store.clear().await.context("Failed to clear anchor")?;
        info!("Anchor cleared");
        return Ok(());
    }

    let feed = Arc::new(ThingSpeakFeed::from_config(&config)?);
    let mut watcher = MovementWatcher::new(
        feed,
        store,
        Arc::new(LogDisplaySink),
        Arc::new(LogNotificationSink),
        WatcherOptions::from(&config),
    );

    match mode {
        RunMode::Once => {
            let start = Instant::now();
            let outcome = watcher.poll_once().await;
            info!("Poll finished in {:.2?}: {:?}", start.elapsed(), outcome);
            println!("{}", serde_json::to_string_pretty(&watcher.snapshot())?);
            watcher.finish().await;
            if let CycleOutcome::FetchFailed(e) = outcome {
                return Err(anyhow!(e).context("Position poll failed"));
            }
        }
        RunMode::SaveAnchor => {
            let controls = watcher.controls();
            let outcome = watcher.poll_once().await;
            watcher.finish().await;
            if let CycleOutcome::FetchFailed(e) = outcome {
                return Err(anyhow!(e).context("Could not fetch a position to anchor"));
            }
            let anchor = controls
                .save_current_as_anchor()
                .await
                .context("Failed to save anchor")?;
            println!("{}", serde_json::to_string_pretty(&anchor)?);
        }
        RunMode::Watch => {
            let cancel = CancellationToken::new();
            let handle = watcher.start(cancel);

            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received, stopping watcher"),
                Err(e) => warn!("Failed to listen for interrupt, stopping watcher: {}", e),
            }

            let stats = handle.snapshot().stats;
            handle.shutdown().await;
            info!(
                "Watcher stopped after {} polls ({} failed), {} alerts raised, {} suppressed",
                stats.polls, stats.failed_polls, stats.alerts_raised, stats.alerts_suppressed
            );
        }
        // Handled before the feed is built
        RunMode::ClearAnchor => {}
    }

    Ok(())
}
