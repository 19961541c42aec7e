// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! HTTP scrape endpoint serving the shared registry.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Error;

/// Content type of the OpenMetrics text exposition.
pub const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Builds the router exposing `/metrics` and `/healthz`.
pub fn router(registry: Arc<Registry,>,) -> Router
{
    Router::new()
        .route("/metrics", get(metrics_handler,),)
        .route("/healthz", get(|| async { "ok" },),)
        .with_state(registry,)
}

async fn metrics_handler(State(registry,): State<Arc<Registry,>,>,) -> Response
{
    let mut buffer = String::new();
    match encode(&mut buffer, &registry,) {
        Ok((),) => ([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE,)], buffer,).into_response(),
        Err(error,) => {
            error!(%error, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves the router on `addr` until `cancel` fires.
///
/// # Errors
///
/// Returns [`Error::Service`] when the listener cannot be bound or the
/// server fails.
pub async fn serve(addr: SocketAddr, registry: Arc<Registry,>, cancel: CancellationToken,) -> Result<(), Error,>
{
    let listener = TcpListener::bind(addr,)
        .await
        .map_err(|error| Error::service(format!("failed to bind {addr}: {error}"),),)?;
    info!(%addr, "serving metrics");

    axum::serve(listener, router(registry,),)
        .with_graceful_shutdown(async move { cancel.cancelled().await },)
        .await
        .map_err(|error| Error::service(format!("metrics server failed: {error}"),),)
}
