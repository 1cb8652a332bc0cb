pub mod api;
pub mod auth;
pub mod chunker;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod storage;

use api::{AppState, create_api_router};
use auth::TokenStore;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use config::Config;
use engine::UploadEngine;
use error::ResultIoExt;
use session::SessionStore;
use std::io::IsTerminal;
use std::sync::Arc;
use storage::{BlobStore, LocalStore};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa_rapidoc::RapiDoc;

/// Initialize the tracing subscriber for logging
/// Uses journald when running as a service (no terminal), fmt when running interactively
pub fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "rill=info,tower_http=warn".into());

    if std::io::stdout().is_terminal() {
        // Running in a terminal, use formatted output
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        // Running as a service, use journald
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_journald::layer().expect("Failed to connect to journald"))
            .init();
    }
}

/// Build the full application router from shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let (api_router, api_doc) = create_api_router(state.clone()).split_for_parts();

    let doc_routes = Router::new()
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", api_doc).path("/api-docs"));

    let mut app = Router::new().merge(api_router).merge(doc_routes);

    // Static web UI, when configured and present
    if let Some(webui_dir) = state.config.server.webui_dir() {
        if webui_dir.is_dir() {
            app = app.fallback_service(ServeDir::new(webui_dir));
        } else {
            tracing::warn!(
                dir = %webui_dir.display(),
                "Web UI directory does not exist; UI disabled"
            );
        }
    }

    let body_limit = usize::try_from(state.config.server.max_payload_size.as_u64())
        .unwrap_or(usize::MAX);

    app.layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Run the file transfer service
pub async fn run_service(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    tracing::info!("rill version {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(config_path)?;
    tracing::info!("Starting server with config: {:?}", config);

    // Blob storage root
    tokio::fs::create_dir_all(&config.server.storage_dir)
        .await
        .map_io_err(&config.server.storage_dir)?;
    let storage: Arc<dyn BlobStore> = Arc::new(LocalStore::new(&config.server.storage_dir));

    // Durable session store; recovers in-flight uploads from disk
    let sessions = SessionStore::open(&config.server.meta_dir).await?;

    if let Some(ttl_secs) = config.server.session_ttl_secs {
        tracing::info!(ttl_secs, "Session expiry enabled");
        session::spawn_reaper(sessions.clone(), ttl_secs);
    }

    // Token store; absent tokens file disables authentication
    let tokens = match config.server.tokens_file() {
        Some(path) => Some(TokenStore::load(path)?),
        None => {
            tracing::warn!("No tokens file configured; authentication is disabled");
            None
        }
    };

    let engine = UploadEngine::new(sessions.clone(), Arc::clone(&storage));

    let state = Arc::new(AppState {
        engine,
        sessions,
        storage,
        config: config.clone(),
        tokens,
    });

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.address).await?;

    tracing::info!("Server listening on {}", config.server.address);
    tracing::info!(
        "API documentation available at http://{}/api-docs",
        config.server.address
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
