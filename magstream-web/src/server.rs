//! Router assembly and server lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::get;
use magstream_core::config::MagstreamConfig;
use magstream_core::{ContentEngine, MediaStreamer};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::{api_health, stream_media};

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Pipeline entry point
    pub streamer: Arc<MediaStreamer>,
    /// When the server started, for uptime reporting
    pub server_started_at: Instant,
}

impl AppState {
    /// Creates state around a streamer.
    pub fn new(streamer: Arc<MediaStreamer>) -> Self {
        Self {
            streamer,
            server_started_at: Instant::now(),
        }
    }
}

/// Builds the application router.
///
/// With `cors_origin` set only that origin is allowed; otherwise CORS is
/// permissive. An origin that is not a valid header value falls back to
/// permissive CORS with a warning.
pub fn build_router(state: AppState, cors_origin: Option<&str>) -> Router {
    Router::new()
        .route("/api/streaming", get(stream_media))
        .route("/api/health", get(api_health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(cors_origin)),
        )
        .with_state(state)
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let Some(origin) = origin else {
        return CorsLayer::permissive();
    };

    match HeaderValue::from_str(origin.trim()) {
        Ok(value) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(value))
            .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
            .allow_headers([header::RANGE, header::CONTENT_TYPE])
            .expose_headers([
                header::CONTENT_RANGE,
                header::ACCEPT_RANGES,
                header::CONTENT_LENGTH,
            ]),
        Err(_) => {
            warn!("Ignoring invalid CORS origin {:?}, allowing all origins", origin);
            CorsLayer::permissive()
        }
    }
}

/// Runs the HTTP server until ctrl-c or SIGTERM.
///
/// On shutdown every registered source is released and the engine is
/// stopped.
///
/// # Errors
///
/// - `std::io::Error` - The address could not be bound or serving failed
pub async fn run_server(
    config: MagstreamConfig,
    engine: Arc<dyn ContentEngine>,
) -> Result<(), std::io::Error> {
    let streamer = Arc::new(MediaStreamer::from_config(engine, &config));
    let resolver = Arc::clone(streamer.resolver());
    let state = AppState::new(streamer);
    let app = build_router(state, config.server.cors_origin.as_deref());

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    let local: SocketAddr = listener.local_addr()?;
    info!("Magstream streaming server running on http://{}", local);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down, releasing sources");
    resolver.destroy().await;
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
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
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
