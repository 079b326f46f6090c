use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, read from `config.toml`.
///
/// Every field has a default so a missing or partial file is valid.
///
/// # Example
/// ```toml
/// [server]
/// base_port = 8881
///
/// [php]
/// binary = "/opt/homebrew/bin/php"
/// wp_cli_phar = "/opt/studio/wp-cli.phar"
///
/// [timeouts]
/// start_secs = 30
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudioConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub php: PhpConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// First port handed out, and where the port cursor resets to.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Interface site servers bind to.
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            host: default_host(),
        }
    }
}

pub const DEFAULT_BASE_PORT: u16 = 8881;

const fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhpConfig {
    #[serde(default = "default_php_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_php_version")]
    pub default_version: String,
    /// Path to `wp-cli.phar`. When unset, `wp` is looked up on `PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wp_cli_phar: Option<PathBuf>,
    /// Extra file passed to WP-CLI with `--require`, providing the
    /// `wp sqlite` commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_command: Option<PathBuf>,
    /// Router script for the built-in PHP web server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_script: Option<PathBuf>,
}

impl Default for PhpConfig {
    fn default() -> Self {
        Self {
            binary: default_php_binary(),
            default_version: default_php_version(),
            wp_cli_phar: None,
            sqlite_command: None,
            router_script: None,
        }
    }
}

fn default_php_binary() -> PathBuf {
    PathBuf::from("php")
}

fn default_php_version() -> String {
    crate::site::DEFAULT_PHP_VERSION.to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    #[serde(default = "default_start_secs")]
    pub start_secs: u64,
    #[serde(default = "default_stop_secs")]
    pub stop_secs: u64,
    #[serde(default = "default_probe_millis")]
    pub probe_millis: u64,
    #[serde(default = "default_wp_cli_secs")]
    pub wp_cli_secs: u64,
    #[serde(default = "default_export_secs")]
    pub export_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            start_secs: default_start_secs(),
            stop_secs: default_stop_secs(),
            probe_millis: default_probe_millis(),
            wp_cli_secs: default_wp_cli_secs(),
            export_secs: default_export_secs(),
        }
    }
}

const fn default_start_secs() -> u64 {
    30
}

const fn default_stop_secs() -> u64 {
    10
}

const fn default_probe_millis() -> u64 {
    500
}

const fn default_wp_cli_secs() -> u64 {
    120
}

const fn default_export_secs() -> u64 {
    3600
}

impl TimeoutConfig {
    #[must_use]
    pub const fn start(&self) -> Duration {
        Duration::from_secs(self.start_secs)
    }

    #[must_use]
    pub const fn stop(&self) -> Duration {
        Duration::from_secs(self.stop_secs)
    }

    #[must_use]
    pub const fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_millis)
    }

    #[must_use]
    pub const fn wp_cli(&self) -> Duration {
        Duration::from_secs(self.wp_cli_secs)
    }

    #[must_use]
    pub const fn export(&self) -> Duration {
        Duration::from_secs(self.export_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathsConfig {
    /// WordPress skeleton copied into newly created, empty site directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wordpress_template: Option<PathBuf>,
    /// Overrides the data directory holding `appdata-v1.json` and archives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Overrides the IPC socket path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,
}

impl StudioConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML for this schema.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load the configuration file at `path`, falling back to defaults when
    /// it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load_from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Self::from_toml(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = StudioConfig::from_toml("").unwrap();
        assert_eq!(config, StudioConfig::default());
        assert_eq!(config.server.base_port, 8881);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.timeouts.start(), Duration::from_secs(30));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = StudioConfig::from_toml(
            r#"
[server]
base_port = 9000

[php]
wp_cli_phar = "/opt/studio/wp-cli.phar"

[timeouts]
stop_secs = 3
"#,
        )
        .unwrap();

        assert_eq!(config.server.base_port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.php.binary, PathBuf::from("php"));
        assert_eq!(
            config.php.wp_cli_phar,
            Some(PathBuf::from("/opt/studio/wp-cli.phar"))
        );
        assert_eq!(config.timeouts.stop_secs, 3);
        assert_eq!(config.timeouts.start_secs, 30);
    }

    #[tokio::test]
    async fn missing_file_is_default() {
        let config = StudioConfig::load_from_path(std::path::Path::new(
            "/nonexistent/studio/config.toml",
        ))
        .await
        .unwrap();
        assert_eq!(config, StudioConfig::default());
    }
}
