// voicebridge server binary

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use voicebridge::{Endpoint, ServerConfig, ServerEvent};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::from_file(&path) {
            Ok(config) => {
                info!(path, "configuration loaded");
                config
            }
            Err(e) => {
                error!(path, error = %e, "could not load configuration");
                std::process::exit(1);
            }
        },
        None => {
            info!("no configuration file given, using defaults");
            ServerConfig::default()
        }
    };

    let endpoint = match Endpoint::builder().config(config).build().await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(error = %e, "endpoint construction failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = endpoint.clone().start().await {
        error!(error = %e, "endpoint failed to start");
        std::process::exit(1);
    }

    spawn_audit_log(endpoint.clone()).await;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!(error = %e, "signal handler failed"),
    }
    endpoint.stop().await;
}

/// Log lifecycle events and CDRs; the external audit store consumes the
/// same subscription shape.
async fn spawn_audit_log(endpoint: Arc<Endpoint>) {
    let (mut events, dropped) = endpoint.events.subscribe(512).await;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::CallStarted {
                    call_id,
                    from,
                    to,
                    direction,
                } => {
                    info!(%call_id, from, to, direction, "call started");
                }
                ServerEvent::CallEnded { call_id, cdr } => {
                    match serde_json::to_string(&cdr) {
                        Ok(json) => info!(%call_id, cdr = %json, "call ended"),
                        Err(_) => info!(%call_id, "call ended"),
                    }
                }
                ServerEvent::DtmfDetected {
                    call_id,
                    digit,
                    method,
                } => {
                    info!(%call_id, %digit, method, "dtmf");
                }
                ServerEvent::SmsReceived { from, to, .. } => {
                    info!(from, to, "message received");
                }
                _ => {}
            }
        }
        let lost = dropped.load(std::sync::atomic::Ordering::Relaxed);
        if lost > 0 {
            info!(lost, "audit subscriber dropped events");
        }
    });
}
