//! Tokyo Anomaly Monitoring System.
//!
//! The client side keeps an entity store of anomalies consistent across an
//! initial fetch, optimistic capture mutations with rollback, and a
//! server-sent events push channel. The crate also ships the reference
//! server those clients talk to.

pub mod api;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod gateway;
pub mod model;
pub mod mutation;
pub mod notify;
pub mod push;
pub mod store;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::api::state::AppState;
use crate::config::ServerConfig;

/// Start the reference server: REST routes, push stream and threat mutator.
pub async fn serve(config: &ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_address))?;
    serve_listener(listener, config).await
}

/// Run the reference server on an already bound listener.
pub async fn serve_listener(listener: TcpListener, config: &ServerConfig) -> Result<()> {
    let state = AppState::from_config(config);

    let mutator = tokio::spawn(api::mutator::run_threat_mutator(
        state.clone(),
        config.push_interval(),
    ));

    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Tokyo anomaly monitor listening");
    let app = api::router(state);
    let served = axum::serve(listener, app).await;

    mutator.abort();
    served.context("server terminated")?;
    Ok(())
}
