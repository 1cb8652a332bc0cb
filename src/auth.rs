use crate::api::AppState;
use crate::error::{Error, Result, ResultIoExt};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Lowercase hex SHA-256 of a bearer token, the form stored on disk.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// One entry of the tokens file. Only the hash of the token is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: String,
    pub token_hash: String,
    pub user: String,
    pub permissions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

impl TokenRecord {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// On-disk tokens file: `{"tokens": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenFile {
    #[serde(default)]
    pub tokens: Vec<TokenRecord>,
}

impl TokenFile {
    /// Load the tokens file; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => Ok(Self::default()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| Error::Config {
                msg: format!("failed to parse tokens file {}: {e}", path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Io {
                error: e,
                path: path.display().to_string(),
            }),
        }
    }

    /// Save the tokens file with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json).map_io_err(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_io_err(path)?;
        }

        Ok(())
    }
}

/// In-memory token index, keyed by token hash.
pub struct TokenStore {
    by_hash: HashMap<String, TokenRecord>,
}

impl TokenStore {
    pub fn load(path: &Path) -> Result<Self> {
        let file = TokenFile::load(path)?;
        tracing::info!(
            tokens = file.tokens.len(),
            file = %path.display(),
            "Loaded token store"
        );
        Ok(Self::from_records(file.tokens))
    }

    pub fn from_records(records: Vec<TokenRecord>) -> Self {
        let by_hash = records
            .into_iter()
            .map(|r| (r.token_hash.clone(), r))
            .collect();
        Self { by_hash }
    }

    /// Resolve a presented bearer token to its user and permission set.
    /// Unknown, revoked and expired tokens are all indistinguishable 401s.
    pub fn validate(&self, token: &str) -> Result<AuthenticatedUser> {
        let record = self
            .by_hash
            .get(&hash_token(token))
            .ok_or(Error::Unauthorized)?;

        if record.revoked || record.is_expired() {
            return Err(Error::Unauthorized);
        }

        Ok(AuthenticatedUser {
            user: record.user.clone(),
            permissions: Some(record.permissions.clone()),
        })
    }
}

/// The principal a request runs as. `permissions: None` means auth is
/// disabled at startup and every permission implicitly passes.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user: String,
    permissions: Option<Vec<String>>,
}

impl AuthenticatedUser {
    pub fn anonymous() -> Self {
        Self {
            user: "<anonymous>".to_string(),
            permissions: None,
        }
    }

    /// The permission hook: every handler names the operation it performs.
    pub fn require(&self, permission: &str) -> Result<()> {
        match &self.permissions {
            None => Ok(()),
            Some(perms) if perms.iter().any(|p| p == permission) => Ok(()),
            Some(_) => Err(Error::Forbidden {
                permission: permission.to_string(),
            }),
        }
    }
}

impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        // Auth not configured, allow all requests through
        let Some(tokens) = &state.tokens else {
            return Ok(AuthenticatedUser::anonymous());
        };

        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::Unauthorized)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(Error::Unauthorized)?;

        tokens.validate(token)
    }
}
