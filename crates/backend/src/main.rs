//! The ImAged secure backend: a sidecar that speaks an encrypted command
//! protocol with its host GUI over stdin/stdout.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

mod channel;
mod commands;
mod config;
mod dispatcher;
mod error;
mod ttl;

use config::AppConfig;
use dispatcher::Dispatcher;
use keys::MasterKey;
use ttl::TtlManager;

#[derive(Parser, Debug)]
#[command(author, version, about = "ImAged secure sidecar backend", long_about = None)]
struct Args {
    /// Path to the shared JSON configuration file
    #[arg(long, default_value = "config/config.json")]
    config: PathBuf,

    /// Path to the master key file
    #[arg(long, default_value = "config/master.key")]
    key_file: PathBuf,

    /// Print the resolved configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    // stdout carries the encrypted protocol; all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .init();

    // Every termination path exits 0: the host surfaces failures through
    // the in-band response channel, and a nonzero exit raises error
    // dialogs on its side.
    if let Err(e) = run() {
        error!("fatal: {e:#}");
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config_path = resource_path(&args.config);
    let key_path = resource_path(&args.key_file);

    if args.print_config {
        let config = AppConfig::load(&config_path)?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let master = MasterKey::load_or_generate(&key_path)
        .context("failed to load master key")?;
    let handler = TtlManager::new(master, config_path);

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();

    let mut dispatcher = Dispatcher::bootstrap(&mut reader, &mut writer, handler)?;
    info!("entering command loop");
    dispatcher.serve(&mut reader, &mut writer)?;
    Ok(())
}

/// Resolves a relative path against the executable's directory, matching
/// the host's bundle layout; absolute paths pass through untouched.
fn resource_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(path)))
        .unwrap_or_else(|| path.to_path_buf())
}
