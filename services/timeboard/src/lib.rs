//! Timeboard - server time and request counter display
//!
//! Polls backend time endpoints through a keyed query cache and renders
//! their answers as text frames on stdout and on an optional web dashboard.

pub mod api;
pub mod app;
pub mod config;
pub mod dashboard;
pub mod devtools;
pub mod display;
pub mod error;
pub mod io;
pub mod query;

pub use app::{App, AppCommand};
pub use config::{load_config, Config};
pub use error::{Result, TimeboardError};

use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::io::{HttpClient, ReqwestHttpClient};

/// Run the timeboard with the given configuration
pub async fn run(config: Config) -> Result<()> {
    config.validate()?;

    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(Duration::from_secs(
        config.http.timeout_seconds,
    ))?);
    let cancel = CancellationToken::new();

    let app = App::new(&config, http)?;

    // Setup shutdown handler
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        cancel_for_signal.cancel();
    });

    // Stdin is read on a plain thread so a pending read never holds up runtime shutdown
    let (command_tx, command_rx) = mpsc::channel(8);
    std::thread::spawn(move || read_commands(std::io::stdin().lock(), command_tx));

    // Start dashboard if enabled
    if config.dashboard.enabled {
        let dashboard_port = config.dashboard.port;
        let router = dashboard::build_router(app.frames(), app.cache().clone());
        let cancel_for_dashboard = cancel.clone();

        tokio::spawn(async move {
            let addr = SocketAddr::from(([0, 0, 0, 0], dashboard_port));
            tracing::info!("Dashboard listening on http://{}", addr);

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(
                        "Failed to bind dashboard to port {}: {}. Continuing without dashboard.",
                        dashboard_port,
                        e
                    );
                    return;
                }
            };

            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    cancel_for_dashboard.cancelled().await;
                })
                .await
                .ok();

            tracing::debug!("Dashboard stopped");
        });
    }

    tracing::info!(
        "Timeboard started: {} endpoints against {}",
        config.endpoints.len(),
        config.base_url
    );

    // Run the app (blocks until cancelled or quit)
    let result = app.run(cancel.clone(), command_rx, std::io::stdout()).await;

    // Stop the dashboard as well when the app quit on its own
    cancel.cancel();
    tracing::info!("Timeboard stopped");

    result
}

/// Forward recognised command lines until input ends or the app stops listening
pub fn read_commands<R: BufRead>(input: R, commands: mpsc::Sender<AppCommand>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("Stopped reading commands: {}", e);
                break;
            }
        };
        match AppCommand::parse(&line) {
            Some(command) => {
                if commands.blocking_send(command).is_err() {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => tracing::warn!(
                "Unknown command {:?} (d = toggle devtools, r = refetch, q = quit)",
                line.trim()
            ),
        }
    }
}
