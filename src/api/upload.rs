use crate::api::AppState;
use crate::auth::AuthenticatedUser;
use crate::engine::IncomingChunk;
use crate::error::{Error, Result};
use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

/// Serde adapter carrying raw chunk bytes as standard (padded) base64.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One chunk of an upload as it travels on the wire.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChunkUploadRequest {
    /// Destination path of the file being uploaded
    pub path: String,
    /// Zero-based index of this chunk
    pub chunk_id: usize,
    /// Chunk payload, base64-encoded
    #[serde(with = "base64_bytes")]
    #[schema(value_type = String, format = Byte)]
    pub data: Vec<u8>,
    /// Lowercase hex SHA-256 of the payload
    pub checksum: String,
    /// Declared chunk count of the whole upload
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub path: String,
}

/// Per-path upload progress as reported to clients.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadStatusResponse {
    pub exists: bool,
    pub total_chunks: usize,
    pub received_map: Vec<bool>,
    pub missing_chunks: Vec<usize>,
    pub completed: bool,
}

impl UploadStatusResponse {
    fn absent() -> Self {
        Self {
            exists: false,
            total_chunks: 0,
            received_map: Vec::new(),
            missing_chunks: Vec::new(),
            completed: false,
        }
    }
}

/// Receive one chunk of a resumable upload
#[utoipa::path(
    post,
    path = "/upload",
    request_body = ChunkUploadRequest,
    responses(
        (status = 200, description = "Chunk accepted", body = String),
        (status = 400, description = "Invalid chunk"),
        (status = 401, description = "Authentication required"),
        (status = 403, description = "Missing upload permission"),
        (status = 409, description = "Session total mismatch"),
        (status = 500, description = "Internal server error")
    ),
    tag = "transfer"
)]
pub async fn receive_chunk(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Json(req): Json<ChunkUploadRequest>,
) -> Result<impl IntoResponse> {
    user.require("upload")?;

    if req.path.is_empty() {
        return Err(Error::BadRequest {
            msg: "path is required".to_string(),
        });
    }

    let receipt = state
        .engine
        .handle_chunk(IncomingChunk {
            path: req.path,
            chunk_id: req.chunk_id,
            payload: req.data,
            checksum: req.checksum,
            total: req.total,
        })
        .await?;

    Ok((
        StatusCode::OK,
        format!("chunk {}/{} received", receipt.chunk_id + 1, receipt.total),
    ))
}

/// Query the progress of an in-flight upload
#[utoipa::path(
    get,
    path = "/upload/status",
    params(
        ("path" = String, Query, description = "Destination path of the upload")
    ),
    responses(
        (status = 200, description = "Session state; exists=false when no session is known", body = UploadStatusResponse),
        (status = 401, description = "Authentication required"),
        (status = 403, description = "Missing upload permission")
    ),
    tag = "transfer"
)]
pub async fn upload_status(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Query(query): Query<StatusQuery>,
) -> Result<Json<UploadStatusResponse>> {
    user.require("upload")?;

    let response = match state.sessions.get(&query.path).await {
        Some(session) => UploadStatusResponse {
            exists: true,
            total_chunks: session.total_chunks,
            missing_chunks: session.missing_chunks(),
            received_map: session.received_map,
            completed: session.completed,
        },
        None => UploadStatusResponse::absent(),
    };

    Ok(Json(response))
}
