use super::{LaunchSpec, RuntimeHandle, SiteRuntime, WpCliOutput, WpCliSpec};
use crate::error::SiteError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use studio_core::SiteId;
use studio_core::config::StudioConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Serves sites with PHP's built-in web server and runs WP-CLI through the
/// same PHP binary.
#[derive(Debug, Clone)]
pub struct PhpRuntime {
    php: PathBuf,
    default_version: String,
    router_script: Option<PathBuf>,
    wp_cli_phar: Option<PathBuf>,
    stop_timeout: Duration,
}

impl PhpRuntime {
    #[must_use]
    pub fn new(config: &StudioConfig) -> Self {
        Self {
            php: config.php.binary.clone(),
            default_version: config.php.default_version.clone(),
            router_script: config.php.router_script.clone(),
            wp_cli_phar: config.php.wp_cli_phar.clone(),
            stop_timeout: config.timeouts.stop(),
        }
    }

    fn wp_cli_command(&self) -> Command {
        match &self.wp_cli_phar {
            Some(phar) => {
                let mut cmd = Command::new(&self.php);
                cmd.arg(phar);
                cmd
            }
            None => Command::new("wp"),
        }
    }
}

fn forward_lines<R>(reader: R, site: SiteId, stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stderr {
                warn!(site = %site, "{}", line);
            } else {
                debug!(site = %site, "{}", line);
            }
        }
    });
}

#[async_trait]
impl SiteRuntime for PhpRuntime {
    async fn launch(&self, spec: &LaunchSpec) -> Result<RuntimeHandle, SiteError> {
        if spec.php_version != self.default_version {
            debug!(
                site = %spec.site_id,
                "Site asks for PHP {}, serving with {}",
                spec.php_version,
                self.php.display()
            );
        }

        let mut cmd = Command::new(&self.php);
        cmd.arg("-S")
            .arg(spec.address())
            .arg("-t")
            .arg(&spec.document_root);
        if let Some(router) = &self.router_script {
            cmd.arg(router);
        }
        cmd.current_dir(&spec.document_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(SiteError::Launch)?;
        info!(
            site = %spec.site_id,
            pid = ?child.id(),
            "Started PHP server on {}",
            spec.address()
        );

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, spec.site_id, false);
        }
        if let Some(stderr) = child.stderr.take() {
            // The built-in server writes its access log to stderr
            forward_lines(stderr, spec.site_id, true);
        }

        Ok(RuntimeHandle::supervise(
            child,
            format!("php:{}", spec.site_id),
            self.stop_timeout,
        ))
    }

    async fn run_wp_cli(
        &self,
        spec: &WpCliSpec,
        args: &[String],
    ) -> Result<WpCliOutput, SiteError> {
        let mut cmd = self.wp_cli_command();
        cmd.arg(format!("--path={}", spec.site_root.display()))
            .args(args)
            .current_dir(&spec.site_root)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(site = %spec.site_id, ?args, "Running WP-CLI");
        let output = tokio::time::timeout(spec.timeout, cmd.output())
            .await
            .map_err(|_| SiteError::WpCliTimeout(spec.timeout))?
            .map_err(SiteError::WpCli)?;

        Ok(WpCliOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_php_binary_is_a_launch_error() {
        let mut config = StudioConfig::default();
        config.php.binary = PathBuf::from("/nonexistent/php-binary");
        let runtime = PhpRuntime::new(&config);
        let dir = tempfile::tempdir().unwrap();

        let err = runtime
            .launch(&LaunchSpec {
                site_id: SiteId::new(),
                document_root: dir.path().to_path_buf(),
                host: "127.0.0.1".into(),
                port: 0,
                php_version: "8.3".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SiteError::Launch(_)));
    }

    #[tokio::test]
    async fn wp_cli_failures_are_reported_as_output() {
        // `sh` stands in for php: `sh <script> --path=... args`
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-wp.sh");
        std::fs::write(&script, "echo out; echo oops >&2; exit 4\n").unwrap();

        let mut config = StudioConfig::default();
        config.php.binary = PathBuf::from("sh");
        config.php.wp_cli_phar = Some(script);
        let runtime = PhpRuntime::new(&config);

        let output = runtime
            .run_wp_cli(
                &WpCliSpec {
                    site_id: SiteId::new(),
                    site_root: dir.path().to_path_buf(),
                    php_version: "8.3".into(),
                    timeout: Duration::from_secs(10),
                },
                &["core".to_string(), "version".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, 4);
        assert!(!output.success());
    }
}
