//! Launching and supervising the processes that serve a site.

pub mod php;

use crate::error::SiteError;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use studio_core::SiteId;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use php::PhpRuntime;

/// What to serve, and where.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub site_id: SiteId,
    pub document_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub php_version: String,
}

impl LaunchSpec {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where a WP-CLI command runs.
#[derive(Debug, Clone)]
pub struct WpCliSpec {
    pub site_id: SiteId,
    /// The WordPress install, `wordpress/` for nested layouts.
    pub site_root: PathBuf,
    pub php_version: String,
    pub timeout: Duration,
}

/// Result of a WP-CLI command. A failing command is not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WpCliOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl WpCliOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.stderr.trim().is_empty()
    }
}

#[async_trait]
pub trait SiteRuntime: Send + Sync + std::fmt::Debug {
    /// Start serving a site. Returns once the process is spawned, not when
    /// it accepts connections.
    async fn launch(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, SiteError>;

    /// Run a WP-CLI command against a site's files.
    async fn run_wp_cli(&self, spec: &WpCliSpec, args: &[String])
    -> Result<WpCliOutput, SiteError>;
}

/// How a runtime process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeExit {
    pub code: Option<i32>,
    /// `true` when the exit followed a shutdown request.
    pub requested: bool,
}

/// A running runtime process, supervised by a background task.
///
/// Dropping the handle shuts the process down.
#[derive(Debug)]
pub struct RuntimeHandle {
    pid: Option<u32>,
    exit: watch::Receiver<Option<RuntimeExit>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RuntimeHandle {
    /// Supervise `run`, which receives the shutdown signal and resolves with
    /// the exit code once the process is gone.
    pub fn new<F, Fut>(pid: Option<u32>, run: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = RuntimeExit> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let fut = run(shutdown_rx);
        let task = tokio::spawn(async move {
            let exit = fut.await;
            debug!(?exit, "Runtime process exited");
            exit_tx.send_replace(Some(exit));
        });

        Self {
            pid,
            exit: exit_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Supervise a child process. On shutdown the process group gets SIGTERM,
    /// then SIGKILL once `grace` has passed.
    pub fn supervise(mut child: Child, name: String, grace: Duration) -> Self {
        let pid = child.id();
        Self::new(pid, move |shutdown| async move {
            tokio::select! {
                status = child.wait() => RuntimeExit {
                    code: status.ok().and_then(|s| s.code()),
                    requested: false,
                },
                _ = shutdown => {
                    let code = studio_utils::process::terminate_gracefully(
                        &mut child,
                        &name,
                        Signal::SIGTERM,
                        grace,
                    )
                    .await;
                    RuntimeExit { code, requested: true }
                }
            }
        })
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// A receiver that flips to `Some` when the process exits.
    #[must_use]
    pub fn exit_receiver(&self) -> watch::Receiver<Option<RuntimeExit>> {
        self.exit.clone()
    }

    #[must_use]
    pub fn exit_status(&self) -> Option<RuntimeExit> {
        *self.exit.borrow()
    }

    /// Ask the process to stop and wait for the supervisor to finish.
    ///
    /// Safe to call after the process already exited on its own.
    pub async fn shutdown(mut self) -> RuntimeExit {
        if let Some(tx) = self.shutdown.take() {
            // The supervisor is gone if the process already exited
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!("Runtime supervisor failed: {}", e);
        }
        self.exit_status().unwrap_or(RuntimeExit {
            code: None,
            requested: true,
        })
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Wait until `exit` reports a finished process.
pub async fn wait_for_exit(exit: &mut watch::Receiver<Option<RuntimeExit>>) -> RuntimeExit {
    match exit.wait_for(Option::is_some).await {
        Ok(status) => (*status).unwrap_or(RuntimeExit {
            code: None,
            requested: false,
        }),
        // Supervisor dropped without reporting
        Err(_) => RuntimeExit {
            code: None,
            requested: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn shutdown_reports_requested_exit() {
        let child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let handle = RuntimeHandle::supervise(child, "sleep".into(), Duration::from_secs(2));
        assert!(handle.pid().is_some());
        assert!(handle.exit_status().is_none());

        let exit = handle.shutdown().await;
        assert!(exit.requested);
    }

    #[tokio::test]
    async fn natural_exit_is_published() {
        let child = Command::new("sh")
            .args(["-c", "exit 3"])
            .process_group(0)
            .spawn()
            .unwrap();
        let handle = RuntimeHandle::supervise(child, "sh".into(), Duration::from_secs(2));

        let mut exit = handle.exit_receiver();
        let status = wait_for_exit(&mut exit).await;
        assert_eq!(status.code, Some(3));
        assert!(!status.requested);

        // Stopping an exited process is fine
        let again = handle.shutdown().await;
        assert_eq!(again.code, Some(3));
    }
}
