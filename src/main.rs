//! Headless countdown client: follows the device timer and logs what a display would show.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cue_timer_sync::{
    config::AppConfig,
    dao::http::HttpSessionSource,
    services::{
        channel::ChannelManager, engine::SyncEngine, session_coordinator::SessionCoordinator,
        transport::NetworkConnector,
    },
    state::{
        clock::{ClockOffsetEstimator, SystemClock},
        connection::ConnectionState,
        timer::{TimerReconciler, TimerView},
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    info!(
        channel = %config.channel_url,
        api = %config.api_url,
        "starting countdown client"
    );

    let source =
        HttpSessionSource::new(config.http_source()).context("building session source")?;
    let polling_client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("building polling client")?;
    let connector = NetworkConnector::new(polling_client, config.poll_interval);

    let engine = SyncEngine::new(
        ChannelManager::new(Arc::new(connector)),
        ClockOffsetEstimator::new(Arc::new(SystemClock)),
        TimerReconciler::new(config.timer),
        SessionCoordinator::new(Arc::new(source)),
    );
    let handle = engine.start(config.channel_url.clone(), config.channel.clone());
    let reporter = tokio::spawn(report(handle.timer(), handle.connection()));

    shutdown_signal().await;
    info!("shutdown requested");

    reporter.abort();
    handle.shutdown().await.context("joining sync engine")?;
    Ok(())
}

/// Log connectivity changes and every change of the rendered countdown.
async fn report(
    mut timer: watch::Receiver<TimerView>,
    mut connection: watch::Receiver<ConnectionState>,
) {
    let mut last_label = String::new();
    loop {
        tokio::select! {
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connection.borrow_and_update();
                info!(%state, "connectivity");
            }
            changed = timer.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = *timer.borrow_and_update();
                let label = view.label();
                if label != last_label {
                    info!(remaining = %label, status = ?view.status, alarm = view.alarm, "countdown");
                    last_label = label;
                }
            }
        }
    }
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cue_timer_sync=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
