//! Fakes for exercising the daemon without PHP installed.

use crate::error::SiteError;
use crate::manager::SiteManager;
use crate::port_finder::PortKiller;
use crate::runtime::{LaunchSpec, RuntimeExit, RuntimeHandle, SiteRuntime, WpCliOutput, WpCliSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use studio_core::StudioConfig;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DumpFailure {
    #[default]
    None,
    /// `wp sqlite export` prints to stderr but exits 0.
    Stderr,
    /// `wp sqlite export` exits non-zero with empty stderr.
    ExitCode,
}

/// Serves a site by binding a plain TCP listener and answers WP-CLI from
/// canned output. `wp sqlite export` writes a small dump file.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    launches: AtomicUsize,
    pub exit_before_ready: AtomicBool,
    /// `wp plugin list` exits non-zero, failing metadata collection.
    pub fail_plugin_list: AtomicBool,
    dump_failure: Mutex<DumpFailure>,
    crashes: Mutex<Vec<oneshot::Sender<()>>>,
    wp_cli_calls: Mutex<Vec<Vec<String>>>,
    wp_cli_roots: Mutex<Vec<PathBuf>>,
}

impl FakeRuntime {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn fail_dump(&self, failure: DumpFailure) {
        *self.dump_failure.lock().unwrap() = failure;
    }

    pub fn wp_cli_calls(&self) -> Vec<Vec<String>> {
        self.wp_cli_calls.lock().unwrap().clone()
    }

    /// Every directory WP-CLI was pointed at, deduplicated.
    pub fn wp_cli_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.wp_cli_roots.lock().unwrap().clone();
        roots.dedup();
        roots
    }

    /// Make every live fake process exit on its own.
    pub fn crash_all(&self) {
        for tx in self.crashes.lock().unwrap().drain(..) {
            let _ = tx.send(());
        }
    }
}

fn output(stdout: &str) -> WpCliOutput {
    WpCliOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

#[async_trait]
impl SiteRuntime for FakeRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, SiteError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        if self.exit_before_ready.load(Ordering::SeqCst) {
            return Ok(RuntimeHandle::new(None, |_shutdown| async {
                RuntimeExit {
                    code: Some(255),
                    requested: false,
                }
            }));
        }

        let listener = TcpListener::bind(spec.address())
            .await
            .map_err(SiteError::Launch)?;
        let (crash_tx, crash_rx) = oneshot::channel();
        self.crashes.lock().unwrap().push(crash_tx);

        Ok(RuntimeHandle::new(None, move |shutdown| async move {
            let exit = tokio::select! {
                _ = shutdown => RuntimeExit { code: Some(0), requested: true },
                _ = crash_rx => RuntimeExit { code: Some(139), requested: false },
            };
            drop(listener);
            exit
        }))
    }

    async fn run_wp_cli(
        &self,
        spec: &WpCliSpec,
        args: &[String],
    ) -> Result<WpCliOutput, SiteError> {
        self.wp_cli_calls.lock().unwrap().push(args.to_vec());
        self.wp_cli_roots.lock().unwrap().push(spec.site_root.clone());
        let words: Vec<&str> = args.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["sqlite", "export", name, ..] => {
                let failure = *self.dump_failure.lock().unwrap();
                // A real export may leave a partial file behind before failing
                std::fs::write(spec.site_root.join(name), "CREATE TABLE wp_options (x);\n")
                    .map_err(SiteError::WpCli)?;
                Ok(match failure {
                    DumpFailure::None => output(""),
                    DumpFailure::Stderr => WpCliOutput {
                        stdout: String::new(),
                        stderr: "Error: database is locked".to_string(),
                        exit_code: 0,
                    },
                    DumpFailure::ExitCode => WpCliOutput {
                        stdout: String::new(),
                        stderr: String::new(),
                        exit_code: 1,
                    },
                })
            }
            ["sqlite", "import", ..] => Ok(output("Success: Imported")),
            ["core", "version"] => Ok(output("6.5.2\n")),
            ["plugin", "list", ..] if self.fail_plugin_list.load(Ordering::SeqCst) => {
                Ok(WpCliOutput {
                    stdout: String::new(),
                    stderr: "Error: plugin list failed".to_string(),
                    exit_code: 1,
                })
            }
            ["plugin", "list", ..] => Ok(output(
                r#"[{"name":"akismet","version":"5.3","status":"active"}]"#,
            )),
            ["theme", "list", rest @ ..] if rest.contains(&"--status=active") => Ok(output(
                r#"[{"name":"twentytwentyfour","title":"Twenty Twenty-Four","version":"1.1"}]"#,
            )),
            ["theme", "list", ..] => Ok(output(
                r#"[{"name":"twentytwentyfour","version":"1.1","status":"active"}]"#,
            )),
            _ => Ok(output("")),
        }
    }
}

#[derive(Debug, Default)]
pub struct NoopKiller;

#[async_trait]
impl PortKiller for NoopKiller {
    async fn kill_listeners(&self, _port: u16) -> anyhow::Result<usize> {
        Ok(0)
    }
}

pub fn test_config(base_port: u16) -> StudioConfig {
    let mut config = StudioConfig::default();
    config.server.base_port = base_port;
    config.timeouts.start_secs = 5;
    config.timeouts.stop_secs = 2;
    config
}

pub fn test_manager(data_dir: &Path, runtime: Arc<FakeRuntime>, base_port: u16) -> SiteManager {
    let (events, _) = broadcast::channel(1024);
    SiteManager::new(
        test_config(base_port),
        data_dir.to_path_buf(),
        runtime,
        Arc::new(NoopKiller),
        events,
    )
}

/// Lay out a minimal WordPress install under `root`.
pub fn wordpress_site(root: &Path) -> PathBuf {
    for dir in [
        "wp-includes",
        "wp-content/uploads/2024/01",
        "wp-content/plugins/akismet",
        "wp-content/themes/twentytwentyfour",
    ] {
        std::fs::create_dir_all(root.join(dir)).unwrap();
    }
    for (file, content) in [
        ("wp-load.php", "<?php"),
        ("wp-config.php", "<?php define('DB_DIR', __DIR__);"),
        ("wp-content/uploads/2024/01/photo.jpg", "jpg"),
        ("wp-content/plugins/akismet/akismet.php", "<?php"),
        ("wp-content/themes/twentytwentyfour/style.css", "/* theme */"),
    ] {
        std::fs::write(root.join(file), content).unwrap();
    }
    root.to_path_buf()
}
