//! Operator CLI for streams, consumers, publishing and consuming over NATS JetStream.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod args;
mod commands;

use clap::Parser;
use courier_pubsub::JetStreamManager;
use courier_pubsub_nats::{NatsBroker, connect};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::args::Args;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection or broker error
    #[error(transparent)]
    Nats(#[from] courier_pubsub_nats::Error),

    /// Manager error
    #[error(transparent)]
    PubSub(#[from] courier_pubsub::Error<courier_pubsub_nats::Error>),

    /// Output serialization error
    #[error("failed to render output: {0}")]
    Output(#[from] serde_json::Error),

    /// Malformed header argument
    #[error("invalid header `{0}`, expected KEY=VALUE")]
    InvalidHeader(String),
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    let connection = connect(&args.connection_config()).await?;
    let broker = NatsBroker::new(connection.client().clone(), args.broker_options());
    let manager = JetStreamManager::new(broker, args.manager_config());

    let shutdown_token = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown_token.clone()));

    let result = commands::run(&manager, args.command, shutdown_token).await;

    connection.close().await;

    if let Err(e) = &result {
        error!(error = %e, "command failed");
    }

    result
}

async fn wait_for_signal(shutdown_token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received interrupt signal");
    }

    info!("shutting down");
    shutdown_token.cancel();
}
