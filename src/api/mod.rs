mod files;
mod upload;

pub use files::{download, list_entries};
pub use upload::{ChunkUploadRequest, UploadStatusResponse, receive_chunk, upload_status};

use crate::auth::TokenStore;
use crate::config::Config;
use crate::engine::UploadEngine;
use crate::session::SessionStore;
use crate::storage::BlobStore;
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

pub struct AppState {
    pub engine: UploadEngine,
    pub sessions: SessionStore,
    pub storage: Arc<dyn BlobStore>,
    pub config: Config,
    /// `None` means authentication is disabled and every permission passes.
    pub tokens: Option<TokenStore>,
}

#[derive(OpenApi)]
#[openapi(
    components(
        schemas(
            upload::ChunkUploadRequest,
            upload::UploadStatusResponse
        )
    ),
    tags(
        (name = "transfer", description = "Chunked upload, download and listing")
    )
)]
pub struct ApiDoc;

/// Create the API router with all routes
pub fn create_api_router(state: Arc<AppState>) -> OpenApiRouter {
    OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(upload::receive_chunk))
        .routes(routes!(upload::upload_status))
        .routes(routes!(files::download))
        .routes(routes!(files::list_entries))
        .with_state(state)
}
