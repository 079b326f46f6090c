use std::path::{Path, PathBuf};
use studio_core::SiteId;
use studio_core::user_data::{USER_DATA_FILE, UserData, UserDataError};
use tokio::sync::Mutex;
use tracing::info;

/// Serialized access to the user-data file.
///
/// Every mutation is a full load, mutate, save round trip under one lock, so
/// concurrent writers never overwrite each other with stale copies.
#[derive(Debug)]
pub struct UserDataStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl UserDataStore {
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join(USER_DATA_FILE);
        info!("User data location: {:?}", path);
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<UserData, UserDataError> {
        let _guard = self.lock.lock().await;
        UserData::load_from_path(&self.path).await
    }

    /// Apply `f` to a freshly loaded document and save the result.
    pub async fn update<T, F>(&self, f: F) -> Result<T, UserDataError>
    where
        F: FnOnce(&mut UserData) -> T,
    {
        let _guard = self.lock.lock().await;
        let mut data = UserData::load_from_path(&self.path).await?;
        let result = f(&mut data);
        data.save_to_path(&self.path).await?;
        Ok(result)
    }

    /// Drop sites whose directories are gone and persist the result.
    pub async fn prune_missing_sites(&self) -> Result<Vec<SiteId>, UserDataError> {
        let _guard = self.lock.lock().await;
        let mut data = UserData::load_from_path(&self.path).await?;
        let removed = data.prune_missing_sites();
        if !removed.is_empty() {
            data.save_to_path(&self.path).await?;
        }
        Ok(removed)
    }
}
