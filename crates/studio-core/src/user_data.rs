use crate::site::{SiteDetails, SiteId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const USER_DATA_VERSION: u32 = 1;
pub const USER_DATA_FILE: &str = "appdata-v1.json";

#[derive(Debug, thiserror::Error)]
pub enum UserDataError {
    #[error("failed to access user data at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse user data at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize user data: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A site snapshot shared from the desktop tool. Kept opaque apart from the
/// fields the daemon needs to clean up when a site goes away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub url: String,
    pub local_site_id: SiteId,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The persisted user-data document (`appdata-v1.json`).
///
/// Keys this crate does not know about are carried through untouched so
/// other consumers of the file don't lose data when the daemon saves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserData {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub sites: Vec<SiteDetails>,
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bump_stats: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

const fn default_version() -> u32 {
    USER_DATA_VERSION
}

impl Default for UserData {
    fn default() -> Self {
        Self {
            version: USER_DATA_VERSION,
            sites: Vec::new(),
            snapshots: Vec::new(),
            auth_token: None,
            locale: None,
            last_bump_stats: None,
            extra: BTreeMap::new(),
        }
    }
}

impl UserData {
    /// Load the document from `path`. A missing or blank file is "no data yet".
    pub async fn load_from_path(path: &Path) -> Result<Self, UserDataError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(UserDataError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&content).map_err(|source| UserDataError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save the document to `path`, replacing the previous file atomically.
    pub async fn save_to_path(&self, path: &Path) -> Result<(), UserDataError> {
        let io_err = |source| UserDataError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }

    #[must_use]
    pub fn site(&self, id: SiteId) -> Option<&SiteDetails> {
        self.sites.iter().find(|s| s.id == id)
    }

    pub fn site_mut(&mut self, id: SiteId) -> Option<&mut SiteDetails> {
        self.sites.iter_mut().find(|s| s.id == id)
    }

    /// Look a site up by its root directory.
    #[must_use]
    pub fn site_by_path(&self, path: &Path) -> Option<&SiteDetails> {
        let path = canonicalize_path(path);
        self.sites
            .iter()
            .find(|s| canonicalize_path(&s.path) == path)
    }

    /// Add a site unless another site already owns its path.
    ///
    /// Returns `false` when the path is taken.
    pub fn insert_site(&mut self, site: SiteDetails) -> bool {
        if self.site_by_path(&site.path).is_some() {
            return false;
        }
        self.sites.push(site);
        true
    }

    /// Remove a site and any snapshots that point at it.
    pub fn remove_site(&mut self, id: SiteId) -> Option<SiteDetails> {
        let index = self.sites.iter().position(|s| s.id == id)?;
        self.snapshots.retain(|s| s.local_site_id != id);
        Some(self.sites.remove(index))
    }

    /// Drop sites whose directory no longer exists on disk.
    ///
    /// Returns the ids of the removed sites.
    pub fn prune_missing_sites(&mut self) -> Vec<SiteId> {
        let missing: Vec<SiteId> = self
            .sites
            .iter()
            .filter(|s| !s.path.exists())
            .map(|s| s.id)
            .collect();

        for id in &missing {
            tracing::info!(site = %id, "Dropping site whose directory no longer exists");
            self.remove_site(*id);
        }
        missing
    }
}

fn canonicalize_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_is_empty_default() {
        let dir = tempdir().unwrap();
        let data = UserData::load_from_path(&dir.path().join("appdata-v1.json"))
            .await
            .unwrap();
        assert_eq!(data, UserData::default());
        assert_eq!(data.version, 1);
    }

    #[tokio::test]
    async fn persistence_keeps_unknown_keys() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join(USER_DATA_FILE);
        let site_path = dir.path().join("my-site");
        std::fs::create_dir(&site_path).unwrap();

        let raw = serde_json::json!({
            "version": 1,
            "sites": [{
                "id": "0b6f5a0e-3f3e-4d7e-9b58-6a1f1fd2a001",
                "name": "My Site",
                "path": site_path,
                "port": 8882,
                "phpVersion": "8.2",
            }],
            "snapshots": [],
            "locale": "fr",
            "promptWindowsSpeedUpResult": { "response": "no" },
        });
        std::fs::write(&file_path, raw.to_string()).unwrap();

        let data = UserData::load_from_path(&file_path).await.unwrap();
        assert_eq!(data.sites.len(), 1);
        assert_eq!(data.sites[0].port, Some(8882));
        assert_eq!(data.locale.as_deref(), Some("fr"));
        assert!(data.extra.contains_key("promptWindowsSpeedUpResult"));

        data.save_to_path(&file_path).await.unwrap();
        let reloaded: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&file_path).unwrap()).unwrap();
        assert_eq!(reloaded["promptWindowsSpeedUpResult"]["response"], "no");
        assert_eq!(reloaded["sites"][0]["phpVersion"], "8.2");
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join(USER_DATA_FILE);
        std::fs::write(&file_path, "{ not json").unwrap();

        let err = UserData::load_from_path(&file_path).await.unwrap_err();
        assert!(matches!(err, UserDataError::Parse { .. }));
    }

    #[test]
    fn insert_rejects_duplicate_paths() {
        let dir = tempdir().unwrap();
        let mut data = UserData::default();

        assert!(data.insert_site(SiteDetails::new(dir.path(), None)));
        assert!(!data.insert_site(SiteDetails::new(dir.path(), Some("Other".into()))));
        assert_eq!(data.sites.len(), 1);
    }

    #[test]
    fn prune_missing_drops_sites_and_their_snapshots() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("exists");
        let missing = dir.path().join("missing");
        std::fs::create_dir(&existing).unwrap();

        let mut data = UserData::default();
        data.insert_site(SiteDetails::new(&existing, None));
        let gone = SiteDetails::new(&missing, None);
        let gone_id = gone.id;
        data.insert_site(gone);
        data.snapshots.push(Snapshot {
            url: "https://example.wp.build".into(),
            local_site_id: gone_id,
            extra: BTreeMap::new(),
        });

        let removed = data.prune_missing_sites();
        assert_eq!(removed, vec![gone_id]);
        assert_eq!(data.sites.len(), 1);
        assert!(data.snapshots.is_empty());
        assert!(data.site_by_path(&existing).is_some());
    }
}
