use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process;
use uuid::Uuid;

use rill::auth::{TokenFile, TokenRecord, hash_token};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "rill-admin")]
#[command(about = "Token management for the rill server", long_about = None)]
#[command(version = VERSION)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Tokens file path
    #[arg(long, value_name = "FILE", default_value = "tokens.json", global = true)]
    file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new authentication token
    Create {
        /// User the token belongs to
        #[arg(long)]
        user: String,
        /// Comma-separated permissions
        #[arg(long, default_value = "upload,download,list")]
        permissions: String,
        /// Days until expiration
        #[arg(long, default_value_t = 365)]
        days: i64,
    },
    /// List tokens
    List {
        /// Include revoked tokens
        #[arg(long)]
        revoked: bool,
    },
    /// Revoke a token by id
    Revoke {
        /// Token id (tok_...)
        token_id: String,
    },
}

fn main() {
    let args = Args::parse();

    let result = match args.command {
        Commands::Create {
            user,
            permissions,
            days,
        } => create_token(&args.file, &user, &permissions, days),
        Commands::List { revoked } => list_tokens(&args.file, revoked),
        Commands::Revoke { token_id } => revoke_token(&args.file, &token_id),
    };

    if let Err(e) = result {
        eprintln!("{} {e}", "error:".red().bold());
        process::exit(1);
    }
}

fn create_token(
    file: &PathBuf,
    user: &str,
    permissions: &str,
    days: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    // 32 random bytes, shown to the operator exactly once
    let secret = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );

    let permissions: Vec<String> = permissions
        .split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();

    let record = TokenRecord {
        id: format!("tok_{}", &secret[..12]),
        token_hash: hash_token(&secret),
        user: user.to_string(),
        permissions: permissions.clone(),
        created_at: Utc::now(),
        expires_at: Utc::now() + Duration::days(days),
        revoked: false,
    };

    let mut store = TokenFile::load(file)?;
    store.tokens.push(record.clone());
    store.save(file)?;

    println!("{}", "Token created successfully".green().bold());
    println!();
    println!("  {:>12}  {}", "Token ID:".cyan().bold(), record.id);
    println!("  {:>12}  {}", "Token:".cyan().bold(), secret.yellow());
    println!("  {:>12}  {}", "User:".cyan().bold(), record.user);
    println!(
        "  {:>12}  {}",
        "Permissions:".cyan().bold(),
        permissions.join(", ")
    );
    println!(
        "  {:>12}  {}",
        "Expires:".cyan().bold(),
        record.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!();
    println!(
        "{}",
        "Save this token now: it is not stored and cannot be shown again."
            .yellow()
            .bold()
    );
    Ok(())
}

fn list_tokens(file: &PathBuf, show_revoked: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = TokenFile::load(file)?;

    if store.tokens.is_empty() {
        println!("{}", "No tokens found.".yellow());
        return Ok(());
    }

    println!(
        "{:<16} {:<12} {:<28} {:<8} {}",
        "ID".cyan().bold(),
        "USER".cyan().bold(),
        "PERMISSIONS".cyan().bold(),
        "STATUS".cyan().bold(),
        "EXPIRES".cyan().bold(),
    );

    for token in &store.tokens {
        if token.revoked && !show_revoked {
            continue;
        }

        let status = if token.revoked {
            "revoked".red().to_string()
        } else if token.is_expired() {
            "expired".yellow().to_string()
        } else {
            "active".green().to_string()
        };

        let mut perms = token.permissions.join(",");
        if perms.len() > 28 {
            perms.truncate(25);
            perms.push_str("...");
        }

        println!(
            "{:<16} {:<12} {:<28} {:<8} {}",
            token.id,
            token.user,
            perms,
            status,
            token.expires_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

fn revoke_token(file: &PathBuf, token_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut store = TokenFile::load(file)?;

    let token = store
        .tokens
        .iter_mut()
        .find(|t| t.id == token_id)
        .ok_or_else(|| format!("token not found: {token_id}"))?;

    if token.revoked {
        println!("Token {token_id} is already revoked.");
        return Ok(());
    }

    token.revoked = true;
    store.save(file)?;

    println!(
        "{} {}",
        "✓ Revoked token".green().bold(),
        token_id.yellow()
    );
    Ok(())
}
