use byte_unit::{Byte, UnitType};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::process;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rill::api::{ChunkUploadRequest, UploadStatusResponse};
use rill::chunker::{Chunk, Chunker};
use rill::config::Config;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BIN_NAME: &str = env!("CARGO_BIN_NAME");

#[derive(Parser, Debug)]
#[command(name = BIN_NAME)]
#[command(about = "Resumable file transfer client", long_about = None)]
#[command(version = VERSION)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Server URL (overrides config)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Chunk size in bytes (overrides config)
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Bearer token (overrides config)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Color output mode (also respects NO_COLOR and FORCE_COLOR env vars)
    #[arg(
        long,
        visible_alias = "colour",
        value_enum,
        default_value = "auto",
        global = true
    )]
    color: ColorMode,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorMode {
    /// Auto-detect based on terminal
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upload a file, resuming an interrupted transfer where possible
    Put {
        /// Local file to upload
        local_file: String,
        /// Destination path on the server
        remote_path: String,
    },
    /// Download a file
    Get {
        /// Path on the server
        remote_path: String,
        /// Local file to write
        local_file: String,
    },
    /// List entries under a path
    Ls {
        /// Directory to list (defaults to /)
        path: Option<String>,
    },
}

struct Client {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl Client {
    fn request(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.token))
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{BIN_NAME}=info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    configure_colors(args.color);

    let config = Config::load(args.config.as_deref()).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
        process::exit(1);
    });

    let base_url = args
        .server
        .unwrap_or_else(|| config.client.server_url.clone());
    let chunk_size = args.chunk_size.unwrap_or(config.client.chunk_size);
    let token = args.token.unwrap_or_else(|| config.client.token.clone());

    let client = Client {
        http: reqwest::Client::new(),
        base_url: base_url.trim_end_matches('/').to_string(),
        token,
    };

    let result = match args.command {
        Commands::Put {
            local_file,
            remote_path,
        } => do_put(&client, chunk_size, &local_file, &remote_path).await,
        Commands::Get {
            remote_path,
            local_file,
        } => do_get(&client, &remote_path, &local_file).await,
        Commands::Ls { path } => do_list(&client, path.as_deref().unwrap_or("/")).await,
    };

    if let Err(e) = result {
        tracing::error!("{e}");
        process::exit(1);
    }
}

async fn do_put(
    client: &Client,
    chunk_size: usize,
    local_file: &str,
    remote_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(local_file);
    if !path.exists() {
        return Err(format!("file '{local_file}' does not exist").into());
    }

    let data = tokio::fs::read(path).await?;
    let chunks = Chunker::new(chunk_size).split(&data);
    let total = chunks.len();

    if total == 0 {
        return Err("refusing to upload an empty file".into());
    }

    // A surviving session for this path lets us skip chunks that already
    // arrived
    let status = fetch_status(client, remote_path).await?;
    let pending: Vec<&Chunk> = if status.exists && status.total_chunks == total {
        println!(
            "{} {} of {} chunks already on server",
            "Resuming:".yellow().bold(),
            total - status.missing_chunks.len(),
            total
        );
        chunks
            .iter()
            .filter(|c| status.missing_chunks.contains(&c.id))
            .collect()
    } else {
        chunks.iter().collect()
    };

    println!(
        "Uploading {} ({}, {} chunks, {} to send)...",
        local_file,
        format_size(data.len() as u64),
        total,
        pending.len()
    );

    let progress = ProgressBar::new(pending.iter().map(|c| c.payload.len() as u64).sum());
    progress.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})"
            )?
            .progress_chars("#>-"),
    );

    for chunk in pending {
        let len = chunk.payload.len();
        upload_chunk_with_retry(client, remote_path, chunk, total, 3).await?;
        progress.inc(len as u64);
    }

    progress.finish_and_clear();

    println!(
        "{} {} {} {}",
        "✓ Upload complete:".green().bold(),
        local_file,
        "→".bright_black(),
        remote_path
    );
    Ok(())
}

async fn fetch_status(
    client: &Client,
    remote_path: &str,
) -> Result<UploadStatusResponse, Box<dyn std::error::Error>> {
    let url = format!("{}/upload/status", client.base_url);
    let response = client
        .request(client.http.get(&url).query(&[("path", remote_path)]))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("status query failed - HTTP {status}: {body}").into());
    }

    Ok(response.json::<UploadStatusResponse>().await?)
}

/// Upload a chunk, retrying server-side and network failures. Client
/// errors (4xx) are not retryable and fail immediately.
async fn upload_chunk_with_retry(
    client: &Client,
    remote_path: &str,
    chunk: &Chunk,
    total: usize,
    max_retries: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/upload", client.base_url);
    let body = ChunkUploadRequest {
        path: remote_path.to_string(),
        chunk_id: chunk.id,
        data: chunk.payload.clone(),
        checksum: chunk.checksum.clone(),
        total,
    };

    let mut retries = 0;

    loop {
        let response = client.request(client.http.post(&url).json(&body)).send().await;

        let retryable = match response {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) if resp.status().is_server_error() => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                format!("HTTP {status}: {body}")
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(format!(
                    "chunk {} rejected - HTTP {status}: {body}",
                    chunk.id
                )
                .into());
            }
            Err(e) => e.to_string(),
        };

        if retries >= max_retries {
            return Err(format!(
                "chunk {} upload failed after {} retries: {}",
                chunk.id, max_retries, retryable
            )
            .into());
        }

        retries += 1;
        let delay = std::time::Duration::from_millis(1000 * retries as u64);
        tracing::warn!(
            "Chunk {} upload failed ({}), retrying in {:?}... ({}/{})",
            chunk.id,
            retryable,
            delay,
            retries,
            max_retries
        );
        tokio::time::sleep(delay).await;
    }
}

async fn do_get(
    client: &Client,
    remote_path: &str,
    local_file: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/download", client.base_url);
    let response = client
        .request(client.http.get(&url).query(&[("path", remote_path)]))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("download failed - HTTP {status}: {body}").into());
    }

    let data = response.bytes().await?;
    tokio::fs::write(local_file, &data).await?;

    println!(
        "{} {} {} {} ({})",
        "✓ Download complete:".green().bold(),
        remote_path,
        "→".bright_black(),
        local_file,
        format_size(data.len() as u64)
    );
    Ok(())
}

async fn do_list(client: &Client, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/list", client.base_url);
    let response = client
        .request(client.http.get(&url).query(&[("path", path)]))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(format!("list failed - HTTP {status}: {body}").into());
    }

    let names = response.json::<Vec<String>>().await?;

    println!("{} {}", "Entries in".cyan().bold(), path);
    for name in &names {
        println!("  {name}");
    }
    println!(
        "{} {} entr{}",
        "Total:".cyan().bold(),
        names.len().to_string().yellow(),
        if names.len() == 1 { "y" } else { "ies" }
    );
    Ok(())
}

fn format_size(bytes: u64) -> String {
    format!(
        "{:.1}",
        Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary)
    )
}

fn configure_colors(mode: ColorMode) {
    // Environment variables take precedence
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
        return;
    }
    if std::env::var("FORCE_COLOR").is_ok() {
        colored::control::set_override(true);
        return;
    }

    match mode {
        ColorMode::Auto => {}
        ColorMode::Always => colored::control::set_override(true),
        ColorMode::Never => colored::control::set_override(false),
    }
}
