//! vault-device: keeps a vault database in step with a directory of notes.
//!
//! Imports the vault on start, runs pending migrations, persists the
//! database as a JSON snapshot and, with `--watch`, re-imports whatever
//! changes on disk until interrupted.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vault_db::{ImportConfig, SymmetricKey};
use vault_device::{DeviceHost, HostConfig, VaultWatcher};

#[derive(Parser, Debug)]
#[command(name = "vault-device")]
#[command(about = "Local vault database host")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long)]
    vault: PathBuf,

    /// Vault ID (defaults to the directory name)
    #[arg(long)]
    vault_id: Option<String>,

    /// Where database snapshots are kept
    #[arg(long, default_value = ".vault-db")]
    state_dir: PathBuf,

    /// Treat the vault as remote (encrypted at rest)
    #[arg(long)]
    remote: bool,

    /// File holding the vault's base64 encryption key
    #[arg(long, requires = "remote")]
    key_file: Option<PathBuf>,

    /// Daily notes folder, never imported
    #[arg(long, default_value = "My Day")]
    my_day_folder: String,

    /// Keep running and import changes as they happen
    #[arg(short, long)]
    watch: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn read_key(path: &PathBuf) -> Result<SymmetricKey> {
    let encoded = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    let bytes = STANDARD
        .decode(encoded.trim())
        .context("Key file is not valid base64")?;
    Ok(SymmetricKey::from_bytes(&bytes)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,vault_device=debug,vault_db=debug"
    } else {
        "info,vault_device=info,vault_db=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting vault-device");
    info!("Vault path: {:?}", args.vault);
    info!("State dir: {:?}", args.state_dir);

    let vault_id = match args.vault_id {
        Some(id) => id,
        None => args
            .vault
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("Cannot derive a vault ID from the vault path, pass --vault-id")?,
    };
    let key = args.key_file.as_ref().map(read_key).transpose()?;

    let host = DeviceHost::start(HostConfig {
        vault_path: args.vault,
        vault_id,
        remote: args.remote,
        key,
        state_dir: args.state_dir,
        import: ImportConfig {
            my_day_folder: args.my_day_folder,
            ..ImportConfig::default()
        },
    })
    .await?;

    host.sync_vault().await?;
    host.save()?;

    if !args.watch {
        info!("Done");
        return Ok(());
    }

    let mut watcher = VaultWatcher::new(
        host.vault_path().to_path_buf(),
        host.import_config().clone(),
        host.echoes().clone(),
    )?;
    info!("Watching {:?}. Press Ctrl+C to stop.", watcher.vault_path());

    loop {
        tokio::select! {
            batch = watcher.next_batch() => {
                let Some(events) = batch else {
                    error!("File watcher stopped");
                    break;
                };
                match host.apply_changes(events).await {
                    Ok(summary) => {
                        info!(
                            "Applied changes: {} documents, {} folders, {} deleted",
                            summary.documents, summary.folders, summary.deleted
                        );
                        if let Err(e) = host.save() {
                            error!("Failed to save snapshot: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to apply changes: {}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    host.save()?;
    info!("Shutting down");
    Ok(())
}
