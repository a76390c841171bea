mod app;
mod args;

use std::{io::Write, sync::Arc};

use anyhow::{bail, Context, Result};
use app::{AppState, JobStatus, RunRequest};
use args::Args;
use clap::Parser;
use plume_core::{loader_for_model, HubFetcher, JobHandler, S3Connector, Session};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    let loader = loader_for_model(&args.model, &args.cache_dir, args.device_map())?;
    let mut session = Session::new(loader, Arc::new(HubFetcher::new(&args.cache_dir)));
    if let Some(adapter) = args.default_adapter() {
        tracing::info!(%adapter, "default adapter configured");
        session = session.with_default_adapter(adapter);
    }
    let handler = JobHandler::new(session, Arc::new(S3Connector));

    if args.eager_load {
        handler.session().lock().await.ensure_base_loaded().await?;
    }

    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(handler, shutdown.clone()));

    if let Some(path) = &args.test_input {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read test input {}", path.display()))?;
        let request: RunRequest =
            serde_json::from_str(&raw).context("test input is not a job request")?;

        let response = state.execute(request).await;
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, &response.output)?;
        writeln!(stdout)?;

        if response.status == JobStatus::Failed {
            bail!("test job {} failed", response.id);
        }
        return Ok(());
    }

    let addr = args.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, model = %args.model, "worker listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    axum::serve(listener, app::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
