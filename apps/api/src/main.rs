mod config;
mod embedder;
mod errors;
mod feedback;
mod routes;
mod state;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::embedder::{Embedder, HashEmbedder, HttpEmbedder};
use crate::feedback::FeedbackServices;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting feedback API v{}", env!("CARGO_PKG_VERSION"));

    let embedder = build_embedder(&config);
    info!(
        embedder = embedder.name(),
        dimension = embedder.dimension(),
        "Embedder initialized"
    );

    // Opening may rebuild the derived stores; nothing is served until it returns.
    let feedback = FeedbackServices::open(&config.data_dir, embedder, config.fsync_ledger)
        .await
        .with_context(|| format!("Failed to open feedback store at {}", config.data_dir.display()))?;

    if std::env::args().nth(1).as_deref() == Some("rebuild") {
        let report = feedback.rebuild.rebuild().await?;
        info!(
            generation = report.generation,
            replayed = report.replayed,
            indexed = report.indexed,
            embed_failures = report.embed_failures,
            "Operator rebuild finished"
        );
        feedback.shutdown().await;
        return Ok(());
    }

    let flusher = feedback.spawn_index_flusher(config.index_flush_interval);

    let state = AppState {
        feedback: feedback.clone(),
        config: config.clone(),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    flusher.abort();
    feedback.shutdown().await;
    info!("Server stopped gracefully");
    Ok(())
}

/// Uses the configured embeddings server, or the offline hash embedder when none is set.
fn build_embedder(config: &Config) -> Arc<dyn Embedder> {
    match &config.embedder_url {
        Some(url) => Arc::new(HttpEmbedder::new(
            url,
            config.embedder_model.clone(),
            config.embedder_api_key.clone(),
            config.embedding_dim,
        )),
        None => Arc::new(HashEmbedder::new(config.embedding_dim)),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
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
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal, draining connections...");
}
