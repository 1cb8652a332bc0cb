use derive_more::Display;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display)]
pub enum Error {
    #[display("IO error at {path}: {error}")]
    Io { error: std::io::Error, path: String },

    #[display("Bad request: {msg}")]
    BadRequest { msg: String },

    #[display("Checksum mismatch for chunk {chunk_id}: declared {declared}, computed {computed}")]
    BadChecksum {
        chunk_id: usize,
        declared: String,
        computed: String,
    },

    #[display("Chunk id {chunk_id} out of range (total {total})")]
    OutOfRange { chunk_id: usize, total: usize },

    #[display("Invalid chunk total: {total}")]
    BadTotal { total: usize },

    #[display("Chunk {chunk_id} of {path} already accepted with a different payload")]
    ChunkConflict { path: String, chunk_id: usize },

    #[display("Session for {path} has total {existing}, request declared {requested}")]
    SessionConflict {
        path: String,
        existing: usize,
        requested: usize,
    },

    #[display("Chunk sequence broken at index {index}")]
    ChunkOrdering { index: usize },

    #[display("Invalid path: {path}")]
    InvalidPath { path: String },

    #[display("Not found: {path}")]
    NotFound { path: String },

    #[display("Authentication required")]
    Unauthorized,

    #[display("Permission denied: {permission}")]
    Forbidden { permission: String },

    #[display("Configuration error: {msg}")]
    Config { msg: String },

    #[display("Internal error: {msg}")]
    Internal { msg: String },
}

impl std::error::Error for Error {}

// Implement From<std::io::Error> for cases where path context is not available
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io {
            error,
            path: "<unknown>".to_string(),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, message) = match &self {
            Error::BadRequest { .. }
            | Error::BadChecksum { .. }
            | Error::OutOfRange { .. }
            | Error::BadTotal { .. }
            | Error::InvalidPath { .. } => (StatusCode::BAD_REQUEST, self.to_string()),

            Error::ChunkConflict { path, chunk_id } => {
                tracing::warn!(path, chunk_id, "Replayed chunk carries a different payload");
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            Error::SessionConflict { .. } => (StatusCode::CONFLICT, self.to_string()),

            Error::NotFound { .. } => (StatusCode::NOT_FOUND, self.to_string()),

            Error::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),

            Error::Forbidden { .. } => (StatusCode::FORBIDDEN, self.to_string()),

            Error::Io { error, path } => {
                // Log full error with path internally; never expose file paths
                tracing::error!("IO error at path {}: {}", path, error);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }

            Error::ChunkOrdering { index } => {
                tracing::error!(index, "Assembled chunk sequence inconsistent");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }

            Error::Config { msg } => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Configuration error".to_string(),
                )
            }

            Error::Internal { msg } => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = axum::Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

/// Extension trait for converting I/O errors to custom errors with path context
pub trait ResultIoExt<T> {
    /// Map I/O errors with path context
    fn map_io_err(self, path: &std::path::Path) -> Result<T>;
}

impl<T> ResultIoExt<T> for std::result::Result<T, std::io::Error> {
    fn map_io_err(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|error| Error::Io {
            error,
            path: path.display().to_string(),
        })
    }
}
