//! Signal Monitor
//!
//! Headless consumer of the signal server: keeps the connection alive, folds every
//! update into a `SignalAggregator` and periodically logs per-market verdicts, the
//! focus market's regime and its downsampled score history.
//!
//! Environment:
//! - `SIGNAL_ENV`: `local` or `production` (default)
//! - `SIGNAL_SECURE`: use `wss://` for production when `true`/`1`
//! - `SIGNAL_WS_URL`: explicit endpoint, overrides the two above
//! - `FOCUS_MARKET`: market feeding the score history (default `NQ`)
//! - `HISTORY_GRANULARITY`: `Raw`, `1min`, `5min`, `10min`, `15min`, `30min`, `1h` (default `1min`)

use chrono::Utc;
use rustls::crypto::ring::default_provider;
use signal_engine::{
    AggregatorConfig, ConnectionManager, ConnectionPhase, DashboardView, Environment,
    Granularity, SignalAggregator, SignalError, WebSocketConfig,
};
use std::{error::Error, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{info, warn};

const REPORT_INTERVAL: Duration = Duration::from_secs(10);

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Resolve the endpoint from SIGNAL_WS_URL, or SIGNAL_ENV + SIGNAL_SECURE
fn get_ws_config() -> WebSocketConfig {
    if let Ok(url) = std::env::var("SIGNAL_WS_URL") {
        return WebSocketConfig::new(url);
    }

    let environment = match std::env::var("SIGNAL_ENV") {
        Ok(label) => Environment::from_label(&label).unwrap_or_else(|| {
            warn!(%label, "Unknown SIGNAL_ENV, using production");
            Environment::Production
        }),
        Err(_) => Environment::default(),
    };
    let secure = std::env::var("SIGNAL_SECURE")
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    WebSocketConfig::for_environment(environment, secure)
}

fn get_focus_market() -> String {
    std::env::var("FOCUS_MARKET")
        .map(|market| market.trim().to_uppercase())
        .ok()
        .filter(|market| !market.is_empty())
        .unwrap_or_else(|| signal_engine::shared::state::DEFAULT_FOCUS_MARKET.to_string())
}

fn get_granularity() -> Result<Granularity, SignalError> {
    std::env::var("HISTORY_GRANULARITY")
        .map(|value| value.parse())
        .unwrap_or(Ok(Granularity::Min1))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logging();
    let _ = default_provider().install_default();

    let granularity = get_granularity()?;
    let config = get_ws_config();
    info!(url = %config.url, %granularity, "Starting signal monitor");

    let aggregator = Arc::new(Mutex::new(SignalAggregator::new(
        AggregatorConfig::default().with_focus_market(get_focus_market()),
    )));

    let (mut manager, mut message_rx) = ConnectionManager::start(config)?;

    {
        let agg = Arc::clone(&aggregator);
        tokio::spawn(async move {
            while let Some(message) = message_rx.recv().await {
                let mut guard = agg.lock().await;
                let update = guard.process_message(message, Utc::now());
                for (market, shift) in &update.shifts {
                    let kind = if shift.is_upgrade() { "upgrade" } else { "downgrade" };
                    info!(%market, %shift, kind, "REGIME SHIFT");
                }
            }
        });
    }

    {
        let mut status_rx = manager.subscribe();
        tokio::spawn(async move {
            let mut last_phase = ConnectionPhase::Disconnected;
            while status_rx.changed().await.is_ok() {
                let status = status_rx.borrow_and_update().clone();
                if status.state.phase == last_phase {
                    continue;
                }
                last_phase = status.state.phase;
                info!(
                    phase = %status.state.phase,
                    attempts = status.state.attempt_count,
                    last_error = status.state.last_error.as_deref().unwrap_or("-"),
                    malformed = status.counters.malformed_messages,
                    "Connection status changed"
                );
            }
        });
    }

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = report.tick() => {
                let now = Utc::now();
                let view = {
                    let mut guard = aggregator.lock().await;
                    guard.expire_shifts(now);
                    guard.view(granularity, now)
                };
                report_view(&view, manager.status().state.is_connected());
            }
            result = &mut shutdown => {
                if let Err(error) = result {
                    warn!(%error, "Failed to listen for shutdown signal");
                }
                info!("Shutdown requested");
                break;
            }
        }
    }

    manager.dispose().await;
    info!("Signal monitor stopped");
    Ok(())
}

fn report_view(view: &DashboardView, connected: bool) {
    let Some(last_update) = view.last_update else {
        info!(connected, "Waiting for first signal snapshot");
        return;
    };

    info!(
        connected,
        markets = view.summary.markets,
        total = view.summary.total_signals,
        long = view.summary.long_signals,
        short = view.summary.short_signals,
        age_secs = (Utc::now() - last_update).num_seconds(),
        "MARKET SUMMARY"
    );

    for (market, aggregate) in &view.snapshot.markets {
        let verdict = aggregate.verdict();
        info!(
            %market,
            long = %format!("{:.2}", aggregate.long.final_score),
            short = %format!("{:.2}", aggregate.short.final_score),
            verdict = verdict.winner.map_or("NEUTRAL", |direction| direction.as_str()),
            strength = %format!("{:.2}", verdict.strength),
            "Market"
        );
    }

    match (view.focus_regime, view.focus_regime_label) {
        (Some(regime), Some(label)) => {
            info!(market = %view.focus_market, regime, %label, "Regime")
        }
        _ => info!(market = %view.focus_market, "Regime unavailable"),
    }
    if let Some(shift) = &view.active_shift {
        info!(market = %view.focus_market, %shift, "Active regime shift");
    }

    if let Some(latest) = view.history.last() {
        info!(
            market = %view.focus_market,
            granularity = %view.granularity,
            buckets = view.history.len(),
            score = %format!("{:.2}", latest.score),
            "Score history"
        );
    }

    for setup in &view.best_setups {
        info!(
            tag = %setup.tag,
            direction = %setup.direction,
            setup = %setup.signal.setup_name,
            market = %setup.signal.market,
            composite = %format!("{:.3}", setup.composite_score),
            "Best setup"
        );
    }
}
