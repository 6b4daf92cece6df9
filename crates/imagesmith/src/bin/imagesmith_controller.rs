/*
 * Imagesmith - Kubernetes controller for container image builds
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Controller Service - Kubernetes controller for `Build` and `BuildRun` CRDs
//!
//! - Validates and registers `Build` resources
//! - Drives each `BuildRun` through an execution job to a classified outcome
//! - Serves health endpoints and the `Build` validating admission webhook

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use imagesmith::admission;
use imagesmith::store::{KubeStore, ObjectStore};
use imagesmith::tasks::{load_controller_config, run_controllers};
use imagesmith::validate::Scheme;
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "imagesmith-controller", version, about = "Imagesmith build controller")]
struct Args {
    /// Path of the controller configuration file
    #[arg(long, env = "IMAGESMITH_CONFIG_PATH")]
    config: Option<String>,

    /// Namespace to watch; overrides the configuration file, empty watches all
    #[arg(long, env = "IMAGESMITH_NAMESPACE")]
    namespace: Option<String>,

    /// HTTP port for health and admission endpoints
    #[arg(long, env = "IMAGESMITH_PORT")]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    store: Arc<KubeStore>,
    scheme: Scheme,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,imagesmith=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    info!(
        "Starting Imagesmith Controller Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config_path = imagesmith::ControllerConfig::resolve_path(args.config.as_deref());
    let mut config = load_controller_config(&config_path)?;
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let port = config.server.port;

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let state = AppState {
        store: Arc::new(KubeStore::new(client.clone())),
        scheme: Scheme::default(),
    };

    let controller_handle = {
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = run_controllers(client, config).await {
                error!("Controller error: {}", e);
            }
        })
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/validate/build", post(validate_build))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Controller HTTP server listening on 0.0.0.0:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("Controller service stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "imagesmith-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check() -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "imagesmith-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn validate_build(
    State(state): State<AppState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(admission::review(review, state.store.reader(), &state.scheme).await)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
