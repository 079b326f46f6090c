//! # studio-server
//!
//! `studio-server` is the daemon behind the desktop tool. It runs one PHP
//! web server per local WordPress site, hands out their ports, keeps the
//! site list on disk and writes (or restores) site backups, answering
//! requests over a Unix socket.
//!
//! ## Lifecycle
//!
//! 1.  **Startup**: [`run`] installs logging, loads `config.toml` and builds the
//!     [`manager::SiteManager`].
//! 2.  **Restoration**: sites whose directories vanished are dropped and the
//!     remembered ports are seeded into the [`port_finder::PortFinder`].
//! 3.  **Event Loop**: the IPC server answers requests until Ctrl+C or a
//!     `Shutdown` request.
//! 4.  **Shutdown**: every running site is stopped and the socket removed.
//!
//! ## Warning
//!
//! This crate is primarily intended for internal use by the `studio-server`
//! binary. The API is not guaranteed to be stable.

// =========================================================================
//  Strict Lints: Safety, Hygiene, and Documentation
// =========================================================================

// 1. Logic & Safety
#![warn(clippy::await_holding_lock)] // Prevent Async Deadlocks (Critical)
#![warn(clippy::manual_let_else)] // Enforces clean "Guard Clause" style
#![warn(clippy::unwrap_used)] // Force error propagation (no panics)
#![warn(clippy::expect_used)] // Force error propagation
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![warn(clippy::redundant_pattern_matching)] // Catch redundant matches
#![warn(clippy::unused_async)] // Catch async functions that don't await

// 2. Numeric Safety (Critical for PIDs/Ports)
#![warn(clippy::cast_possible_truncation)] // Warn on u64 -> u32 (potential data loss)
#![warn(clippy::cast_possible_wrap)] // Warn on u32 -> i32 (potential overflow)

// 3. Observability
#![warn(clippy::print_stdout)] // Ban println! (Use tracing::info!)

// 4. Import Hygiene
#![warn(clippy::wildcard_imports)] // Ban `use crate::*` (Explicit imports only)

// 5. Documentation
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]

// 6. Other
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::uninlined_format_args)]

pub mod error;
pub mod export;
pub mod import;
pub mod ipc;
pub mod logging;
pub mod manager;
pub mod port_finder;
pub mod progress;
pub mod runtime;
pub mod site_server;
pub mod state;

#[cfg(test)]
mod test_support;

use crate::manager::SiteManager;
use crate::port_finder::ProcPortKiller;
use crate::runtime::PhpRuntime;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use studio_core::StudioConfig;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Capacity of the event bus shared by progress, site state and log events.
const EVENT_BUS_CAPACITY: usize = 1024;

/// Command-line overrides for [`run`]. `None` means "use the configured or
/// default location".
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub socket: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

pub fn run(options: RunOptions) -> Result<()> {
    let (events, _) = tokio::sync::broadcast::channel(EVENT_BUS_CAPACITY);

    let broadcast_layer = logging::BroadcastLayer {
        sender: events.clone(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(broadcast_layer)
        .try_init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(options, events))
}

async fn async_main(
    options: RunOptions,
    events: tokio::sync::broadcast::Sender<studio_core::StudioEvent>,
) -> Result<()> {
    info!("studio-server starting... (version: {})", env!("CARGO_PKG_VERSION"));

    let config_path = options
        .config
        .unwrap_or_else(studio_utils::env::config_file_path);
    let config = StudioConfig::load_from_path(&config_path)
        .await
        .unwrap_or_else(|e| {
            warn!("Failed to load {}: {e:#}. Using defaults.", config_path.display());
            StudioConfig::default()
        });

    let data_dir = match options.data_dir.or_else(|| config.paths.data_dir.clone()) {
        Some(dir) => dir,
        None => studio_utils::env::data_dir()?,
    };
    let socket_path = match options.socket.or_else(|| config.paths.socket.clone()) {
        Some(path) => path,
        None => studio_utils::env::socket_path()?,
    };
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    let runtime = Arc::new(PhpRuntime::new(&config));
    let manager = SiteManager::new(config, data_dir, runtime, Arc::new(ProcPortKiller), events);

    if let Err(e) = manager.restore().await {
        warn!("Failed to restore sites: {e:#}");
    }

    let listener = ipc::bind(&socket_path).await?;
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let ipc_handle = tokio::spawn(ipc::serve(listener, manager.clone(), shutdown_tx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        },
        _ = shutdown_rx.recv() => info!("Shutdown requested over IPC"),
    }

    ipc_handle.abort();
    manager.shutdown().await;
    if let Err(e) = tokio::fs::remove_file(&socket_path).await {
        warn!("Failed to remove socket {}: {}", socket_path.display(), e);
    }

    info!("studio-server stopped");
    Ok(())
}
