use crate::api::AppState;
use crate::auth::AuthenticatedUser;
use crate::error::Result;
use axum::{
    Json,
    extract::{Query, State},
    http::header,
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub path: Option<String>,
}

/// Download a stored file
#[utoipa::path(
    get,
    path = "/download",
    params(
        ("path" = String, Query, description = "Path of the file to download")
    ),
    responses(
        (status = 200, description = "File contents", content_type = "application/octet-stream"),
        (status = 401, description = "Authentication required"),
        (status = 403, description = "Missing download permission"),
        (status = 404, description = "No file at that path"),
        (status = 500, description = "Internal server error")
    ),
    tag = "transfer"
)]
pub async fn download(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse> {
    user.require("download")?;

    let data = state.storage.get(&query.path).await?;

    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    ))
}

/// List the entries directly under a path
#[utoipa::path(
    get,
    path = "/list",
    params(
        ("path" = Option<String>, Query, description = "Directory to list; defaults to /")
    ),
    responses(
        (status = 200, description = "Entry names", body = Vec<String>),
        (status = 401, description = "Authentication required"),
        (status = 403, description = "Missing list permission"),
        (status = 404, description = "No directory at that path"),
        (status = 500, description = "Internal server error")
    ),
    tag = "transfer"
)]
pub async fn list_entries(
    State(state): State<Arc<AppState>>,
    user: AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<String>>> {
    user.require("list")?;

    let path = query.path.as_deref().unwrap_or("/");
    let names = state.storage.list(path).await?;

    Ok(Json(names))
}
