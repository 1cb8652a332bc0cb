use crate::error::{Error, Result};
use byte_unit::Byte;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,

    /// Directory of the static web UI; empty disables it.
    #[serde(default)]
    pub webui_dir: PathBuf,

    /// Tokens file; empty disables authentication entirely.
    #[serde(default)]
    pub tokens_file: PathBuf,

    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: Byte,

    /// Idle sessions older than this are reaped. Absent means sessions
    /// are retained indefinitely.
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,
}

#[derive(Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Bearer token sent with every request; empty sends none.
    #[serde(default)]
    pub token: String,
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from(".rill-meta")
}

fn default_max_payload_size() -> Byte {
    Byte::from_u64_with_unit(64, byte_unit::Unit::MiB).unwrap()
}

fn default_server_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_chunk_size() -> usize {
    crate::chunker::DEFAULT_CHUNK_SIZE
}

impl ServerConfig {
    pub fn webui_dir(&self) -> Option<&Path> {
        (!self.webui_dir.as_os_str().is_empty()).then_some(self.webui_dir.as_path())
    }

    pub fn tokens_file(&self) -> Option<&Path> {
        (!self.tokens_file.as_os_str().is_empty()).then_some(self.tokens_file.as_path())
    }
}

impl Config {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Default config file next to the working directory, if present
        if config_path.is_none() {
            builder = builder.add_source(
                config::File::with_name("rill")
                    .format(config::FileFormat::Json)
                    .required(false),
            );
        }

        // Custom config path (if specified via --config)
        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .required(true)
                    .format(config::FileFormat::Json),
            );
        }

        // Environment variables (highest precedence)
        builder = builder.add_source(config::Environment::with_prefix("RILL"));

        let config = builder.build().map_err(|e| Error::Config {
            msg: format!("Failed to load configuration: {}", e),
        })?;

        let mut config: Self = config.try_deserialize().map_err(|e| Error::Config {
            msg: format!("Failed to deserialize configuration: {}", e),
        })?;

        config.server.storage_dir = absolutize(config.server.storage_dir)?;
        config.server.meta_dir = absolutize(config.server.meta_dir)?;

        Ok(config)
    }
}

/// Convert a relative path to absolute against the CWD and clean it up.
/// If canonicalize fails (e.g. the path doesn't exist yet), the absolute
/// form is kept as-is.
fn absolutize(mut path: PathBuf) -> Result<PathBuf> {
    if !path.is_absolute() {
        let cwd = std::env::current_dir().map_err(|e| Error::Config {
            msg: format!("Failed to get current directory: {}", e),
        })?;
        path = cwd.join(path);
    }

    if let Ok(canonical) = path.canonicalize() {
        path = canonical;
    }

    Ok(path)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            storage_dir: absolutize(default_storage_dir()).unwrap_or_else(|_| default_storage_dir()),
            meta_dir: absolutize(default_meta_dir()).unwrap_or_else(|_| default_meta_dir()),
            webui_dir: PathBuf::new(),
            tokens_file: PathBuf::new(),
            max_payload_size: default_max_payload_size(),
            session_ttl_secs: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            chunk_size: default_chunk_size(),
            token: String::new(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("address", &self.address)
            .field("storage_dir", &self.storage_dir)
            .field("meta_dir", &self.meta_dir)
            .field("webui_dir", &self.webui_dir)
            .field("tokens_file", &self.tokens_file)
            .field(
                "max_payload_size",
                &format!(
                    "{}",
                    self.max_payload_size
                        .get_appropriate_unit(byte_unit::UnitType::Binary)
                ),
            )
            .field("session_ttl_secs", &self.session_ttl_secs)
            .finish()
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("chunk_size", &self.chunk_size)
            .field("token", &if self.token.is_empty() { "<none>" } else { "<redacted>" })
            .finish()
    }
}
