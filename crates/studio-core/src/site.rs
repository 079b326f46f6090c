use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Stable identity of a site. Generated once and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub Uuid);

impl SiteId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SiteId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Details of the active theme, as reported by WP-CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeDetails {
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub is_block_theme: bool,
}

/// A site known to the daemon.
///
/// `running` is runtime-only and recomputed from the live server on every
/// read. `port` is kept on disk as the last port the site was served on so
/// the next start can prefer it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteDetails {
    pub id: SiteId,
    pub name: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip)]
    pub running: bool,
    #[serde(default = "default_php_version")]
    pub php_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_details: Option<ThemeDetails>,
    /// Base64-encoded admin password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
}

pub const DEFAULT_PHP_VERSION: &str = "8.3";

fn default_php_version() -> String {
    DEFAULT_PHP_VERSION.to_string()
}

impl SiteDetails {
    /// Create a stopped site rooted at `path`. The name defaults to the
    /// directory name.
    #[must_use]
    pub fn new(path: &Path, name: Option<String>) -> Self {
        let name = name.unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "My Site".to_string())
        });

        Self {
            id: SiteId::new(),
            name,
            path: path.to_path_buf(),
            port: None,
            running: false,
            php_version: default_php_version(),
            theme_details: None,
            admin_password: None,
        }
    }

    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.port.map(|port| format!("http://localhost:{port}"))
    }

    pub fn set_admin_password(&mut self, password: &str) {
        self.admin_password = Some(encode_admin_password(password));
    }

    #[must_use]
    pub fn admin_password(&self) -> Option<String> {
        self.admin_password
            .as_deref()
            .and_then(|encoded| decode_admin_password(encoded).ok())
    }
}

#[must_use]
pub fn encode_admin_password(password: &str) -> String {
    STANDARD.encode(password.as_bytes())
}

/// # Errors
///
/// Returns an error if `encoded` is not valid base64 or not UTF-8.
pub fn decode_admin_password(encoded: &str) -> anyhow::Result<String> {
    let bytes = STANDARD.decode(encoded)?;
    Ok(String::from_utf8(bytes)?)
}

/// Lifecycle state of a site server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "reason")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error(String),
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}
