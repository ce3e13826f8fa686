use std::sync::Arc;

use clap::Parser;
use nodeflow::config::{Cli, Commands};
use nodeflow::metrics::Metrics;
use nodeflow::{http, server};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => {
            setup_subscriber();

            let metrics = Arc::new(Metrics::new(&args.metric)?);
            let cancel = tokio_util::sync::CancellationToken::new();

            // without --metrics-server the metrics task just waits for
            // shutdown so the select below stays uniform
            let mut metrics_handle = match args.metrics_server {
                Some(addr) => {
                    let state = Arc::new(http::State::new(metrics.clone()));
                    tokio::spawn(http::serve_metrics(addr, state, cancel.child_token()))
                }
                None => {
                    let idle = cancel.child_token();
                    tokio::spawn(async move {
                        idle.cancelled().await;
                        Ok::<(), nodeflow::Error>(())
                    })
                }
            };
            let mut server_handle = tokio::spawn(server::start(args, metrics, cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });

            // watch for shutdown and errors
            tokio::select! {
                h = &mut server_handle => {
                    cancel.cancel();
                    if let Err(e) = metrics_handle.await {
                        error!("metrics exited with error: {}", e.to_string());
                    }
                    return exit("observer", h);
                }
                h = &mut metrics_handle => {
                    cancel.cancel();
                    let observer = server_handle.await;
                    exit("metrics", h)?;
                    exit("observer", observer)?;
                }
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    let (metrics, observer) = tokio::join!(metrics_handle, server_handle);
                    if let Err(m) = metrics {
                        error!("metrics exited with error: {}", m.to_string());
                    }
                    exit("observer", observer)?;
                }
            };
            info!("Exiting...");
        }
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nodeflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<nodeflow::Result<()>, JoinError>) -> anyhow::Result<()> {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}");
            Err(e.into())
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}");
            Err(e.into())
        }
    }
}
