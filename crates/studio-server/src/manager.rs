//! The daemon's service container. Every IPC request ends up here.

use crate::error::{ExportError, ImportError, SiteError};
use crate::export::{ExportContext, ExportManager, default_exporters};
use crate::import::{ImportManager, default_importers};
use crate::port_finder::{PortFinder, PortKiller};
use crate::progress::OperationTracker;
use crate::runtime::{SiteRuntime, WpCliOutput};
use crate::site_server::{ServerContext, SiteRegistry, SiteServer, WpCliMode, wordpress_root};
use crate::state::UserDataStore;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use studio_core::config::StudioConfig;
use studio_core::ipc::SiteUpdate;
use studio_core::user_data::UserDataError;
use studio_core::{
    ExportEvent, ExportIncludes, ExportOptions, ImportEvent, ImportOptions, OperationKind,
    ProgressUpdate, SiteDetails, SiteId, StudioEvent,
};
use studio_utils::fs::{copy_dir_recursive, is_missing_or_empty, remove_path};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SiteManager {
    config: Arc<StudioConfig>,
    data_dir: PathBuf,
    ports: Arc<PortFinder>,
    registry: Arc<SiteRegistry>,
    store: Arc<UserDataStore>,
    exports: ExportManager,
    imports: ImportManager,
    operations: OperationTracker,
    events: broadcast::Sender<StudioEvent>,
}

/// `<slug>-<timestamp>.zip`, the file name of a one-click site archive.
fn archive_file_name(site_name: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    let slug: String = site_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "site" } else { slug };
    format!("{slug}-{}.zip", now.format("%Y-%m-%d-%H-%M-%S"))
}

impl SiteManager {
    pub fn new(
        config: StudioConfig,
        data_dir: PathBuf,
        runtime: Arc<dyn SiteRuntime>,
        killer: Arc<dyn PortKiller>,
        events: broadcast::Sender<StudioEvent>,
    ) -> Self {
        let config = Arc::new(config);
        let ports = Arc::new(PortFinder::new(&config, killer));
        let store = Arc::new(UserDataStore::new(&data_dir));
        let registry = Arc::new(SiteRegistry::new(ServerContext {
            ports: ports.clone(),
            runtime,
            store: store.clone(),
            config: config.clone(),
            events: events.clone(),
        }));
        let timeout = config.timeouts.export();

        Self {
            exports: ExportManager::new(default_exporters(), timeout),
            imports: ImportManager::new(default_importers(), timeout),
            operations: OperationTracker::new(events.clone()),
            config,
            data_dir,
            ports,
            registry,
            store,
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StudioEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn ports(&self) -> &Arc<PortFinder> {
        &self.ports
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SiteRegistry> {
        &self.registry
    }

    /// Startup: drop sites whose directories are gone, seed the port finder
    /// with remembered ports and create a server for every site.
    pub async fn restore(&self) -> Result<()> {
        let removed = self
            .store
            .prune_missing_sites()
            .await
            .context("Failed to prune missing sites")?;
        if !removed.is_empty() {
            info!("Dropped {} sites with missing directories", removed.len());
        }

        let data = self.store.load().await.context("Failed to load user data")?;
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for mut site in data.sites {
            if let Some(port) = site.port {
                if seen.insert(port) {
                    self.ports.add_unavailable_port(port).await;
                } else {
                    warn!(site = %site.id, port, "Port already remembered by another site");
                    site.port = None;
                    duplicates.push(site.id);
                }
            }
            self.registry.create(site).await;
        }

        if !duplicates.is_empty() {
            self.store
                .update(|data| {
                    for id in &duplicates {
                        if let Some(site) = data.site_mut(*id) {
                            site.port = None;
                        }
                    }
                })
                .await
                .context("Failed to clear duplicate ports")?;
        }

        let restored = self.registry.all().await.len();
        info!("Restored {} sites", restored);
        Ok(())
    }

    /// The server for `id`, created from the persisted record on first use.
    async fn server(&self, id: SiteId) -> Result<Option<Arc<SiteServer>>, UserDataError> {
        if let Some(server) = self.registry.get(id).await {
            return Ok(Some(server));
        }
        let data = self.store.load().await?;
        Ok(match data.site(id) {
            Some(site) => Some(self.registry.create(site.clone()).await),
            None => None,
        })
    }

    /// Every persisted site with its live running state. Sites whose
    /// directories are gone are dropped, and the drop is persisted.
    pub async fn get_site_details(&self) -> Result<Vec<SiteDetails>, UserDataError> {
        for id in self.store.prune_missing_sites().await? {
            info!(site = %id, "Site directory is gone, dropping site");
            if let Some(server) = self.registry.remove(id).await
                && let Err(e) = server.stop().await
            {
                warn!(site = %id, "Failed to stop removed site: {}", e);
            }
        }

        let data = self.store.load().await?;
        let mut sites = Vec::with_capacity(data.sites.len());
        for site in data.sites {
            let server = self.registry.create(site).await;
            sites.push(server.details().await);
        }
        Ok(sites)
    }

    /// Add the site at `path` and return the updated site list.
    ///
    /// A path that already belongs to a site, or a directory that cannot be
    /// set up, leaves the list unchanged.
    pub async fn create_site(
        &self,
        path: &Path,
        name: Option<String>,
    ) -> Result<Vec<SiteDetails>, UserDataError> {
        match self.add_site(path, name).await {
            Ok(Some(site)) => info!(site = %site.id, path = %path.display(), "Created site"),
            Ok(None) => info!(path = %path.display(), "A site already exists at this path"),
            Err(e) => error!(path = %path.display(), "Failed to create site: {:#}", e),
        }
        self.get_site_details().await
    }

    async fn add_site(&self, path: &Path, name: Option<String>) -> Result<Option<SiteDetails>> {
        if self.store.load().await?.site_by_path(path).is_some() {
            return Ok(None);
        }

        if is_missing_or_empty(path).await? {
            tokio::fs::create_dir_all(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            if let Some(template) = self.config.paths.wordpress_template.clone() {
                let target = path.to_path_buf();
                let copied =
                    tokio::task::spawn_blocking(move || copy_dir_recursive(&template, &target))
                        .await??;
                debug!(path = %path.display(), "Seeded {} files from template", copied);
            }
        } else if wordpress_root(path).is_none() {
            anyhow::bail!("{} is not empty and holds no WordPress site", path.display());
        }

        let mut site = SiteDetails::new(path, name);
        site.php_version.clone_from(&self.config.php.default_version);
        let record = site.clone();
        if !self.store.update(move |data| data.insert_site(record)).await? {
            // Lost a race against another create for the same path
            return Ok(None);
        }
        self.registry.create(site.clone()).await;
        Ok(Some(site))
    }

    /// Apply `update` and persist it. A running site whose PHP version
    /// changed is restarted. Returns `None` for unknown ids.
    pub async fn update_site(
        &self,
        id: SiteId,
        update: SiteUpdate,
    ) -> Result<Option<SiteDetails>, SiteError> {
        let Some(server) = self.server(id).await? else {
            return Ok(None);
        };

        let before = server.details().await;
        let php_changed = update
            .php_version
            .as_ref()
            .is_some_and(|v| *v != before.php_version);

        let apply = |site: &mut SiteDetails| {
            if let Some(name) = &update.name {
                site.name.clone_from(name);
            }
            if let Some(version) = &update.php_version {
                site.php_version.clone_from(version);
            }
        };
        server.update_details(apply).await;
        self.store
            .update(|data| {
                if let Some(site) = data.site_mut(id) {
                    apply(site);
                }
            })
            .await?;

        if php_changed && server.is_running().await {
            info!(site = %id, "PHP version changed, restarting");
            server.stop().await?;
            server.start().await?;
        }
        Ok(Some(server.details().await))
    }

    /// Stop and forget the site, optionally deleting its directory.
    /// Returns whether a site was removed.
    pub async fn delete_site(&self, id: SiteId, delete_files: bool) -> Result<bool, SiteError> {
        if let Some(server) = self.registry.get(id).await {
            server.stop().await?;
            self.registry.remove(id).await;
        }

        let Some(site) = self.store.update(|data| data.remove_site(id)).await? else {
            return Ok(false);
        };
        info!(site = %id, "Deleted site");

        if delete_files && let Err(e) = remove_path(&site.path).await {
            warn!(site = %id, "Failed to delete {}: {}", site.path.display(), e);
        }
        Ok(true)
    }

    /// Start the site. `None` for unknown ids; a failed start is logged and
    /// returns the unchanged details.
    pub async fn start_server(&self, id: SiteId) -> Option<SiteDetails> {
        let server = match self.server(id).await {
            Ok(Some(server)) => server,
            Ok(None) => return None,
            Err(e) => {
                error!(site = %id, "Failed to look up site: {}", e);
                return None;
            }
        };

        match server.start().await {
            Ok(details) => {
                let refresh = server.clone();
                tokio::spawn(async move {
                    refresh.refresh_theme_details().await;
                });
                Some(details)
            }
            Err(e) => {
                error!(site = %id, "Failed to start site: {}", e);
                Some(server.details().await)
            }
        }
    }

    pub async fn stop_server(&self, id: SiteId) -> Option<SiteDetails> {
        let server = match self.server(id).await {
            Ok(Some(server)) => server,
            Ok(None) => return None,
            Err(e) => {
                error!(site = %id, "Failed to look up site: {}", e);
                return None;
            }
        };

        match server.stop().await {
            Ok(details) => Some(details),
            Err(e) => {
                error!(site = %id, "Failed to stop site: {}", e);
                Some(server.details().await)
            }
        }
    }

    /// Run `command` (a WP-CLI command line, with or without the leading
    /// `wp`) against a running site.
    pub async fn execute_wp_cli(&self, id: SiteId, command: &str) -> Result<WpCliOutput, SiteError> {
        let server = self.server(id).await?.ok_or(SiteError::NotFound(id))?;
        let mut args =
            shlex::split(command).ok_or_else(|| SiteError::InvalidCommand(command.to_string()))?;
        if args.first().is_some_and(|a| a == "wp") {
            args.remove(0);
        }
        server
            .execute_wp_cli_command(&args, WpCliMode::RequireRunning)
            .await
    }

    /// Full zip backup into `<data dir>/archives`, starting the site first
    /// if needed. Returns `None` when an operation is already in flight.
    pub async fn archive_site(&self, id: SiteId) -> Result<Option<PathBuf>, ExportError> {
        let server = self
            .server(id)
            .await
            .map_err(SiteError::from)?
            .ok_or(SiteError::NotFound(id))?;
        server.start().await?;

        let name = server.details().await.name;
        let backup_file = self
            .data_dir
            .join("archives")
            .join(archive_file_name(&name, chrono::Utc::now()));
        self.export_site(id, backup_file, ExportIncludes::default())
            .await
    }

    /// Export the site to `backup_file`. Returns `Ok(None)` without doing
    /// anything while another export or import runs for the site.
    pub async fn export_site(
        &self,
        id: SiteId,
        backup_file: PathBuf,
        includes: ExportIncludes,
    ) -> Result<Option<PathBuf>, ExportError> {
        let server = self
            .server(id)
            .await
            .map_err(SiteError::from)?
            .ok_or(SiteError::NotFound(id))?;
        let Some(guard) = self.operations.begin(id, OperationKind::Export) else {
            info!(site = %id, "Ignoring export request, one is already in flight");
            return Ok(None);
        };

        let options = ExportOptions::new(server.details().await, backup_file, includes);
        let ctx = ExportContext {
            server,
            config: self.config.clone(),
        };
        let on_event = |event: ExportEvent| {
            if !event.is_progress() {
                info!(site = %id, stage = event.name(), "Export stage");
            }
            guard.export_event(&event);
        };

        let result = self.exports.export_backup(&options, &ctx, &on_event).await;
        if let Err(e @ ExportError::NoSuitableExporter(_)) = &result {
            // Nothing was emitted; close the operation for subscribers
            guard.export_event(&ExportEvent::ExportError {
                message: e.to_string(),
            });
        }
        result.map(Some)
    }

    /// Restore `backup_file` into the site. Returns `Ok(None)` while another
    /// operation runs for the site.
    pub async fn import_site(
        &self,
        id: SiteId,
        backup_file: PathBuf,
    ) -> Result<Option<SiteDetails>, ImportError> {
        let server = self
            .server(id)
            .await
            .map_err(SiteError::from)?
            .ok_or(SiteError::NotFound(id))?;
        let Some(guard) = self.operations.begin(id, OperationKind::Import) else {
            info!(site = %id, "Ignoring import request, one is already in flight");
            return Ok(None);
        };

        let options = ImportOptions {
            site: server.details().await,
            backup_file,
        };
        let ctx = ExportContext {
            server: server.clone(),
            config: self.config.clone(),
        };
        let on_event = |event: ImportEvent| {
            if !event.is_progress() {
                debug!(site = %id, "Import stage {:?}", event);
            }
            guard.import_event(&event);
        };

        let result = self.imports.import_backup(&options, &ctx, &on_event).await;
        if let Err(e @ ImportError::NoSuitableImporter(_)) = &result {
            guard.import_event(&ImportEvent::ImportError {
                message: e.to_string(),
            });
        }
        let meta = result?;

        if let Some(version) = meta
            .map(|m| m.php_version)
            .filter(|v| !v.is_empty() && *v != options.site.php_version)
        {
            info!(site = %id, "Backup asks for PHP {}", version);
            let update = SiteUpdate {
                name: None,
                php_version: Some(version),
            };
            return self.update_site(id, update).await.map_err(ImportError::from);
        }
        Ok(Some(server.details().await))
    }

    /// Progress of the export or import running for `id`, if any.
    #[must_use]
    pub fn progress(&self, id: SiteId) -> Option<ProgressUpdate> {
        self.operations.progress(id)
    }

    /// Stop every running site.
    pub async fn shutdown(&self) {
        let servers = self.registry.all().await;
        let stops = servers.iter().map(|server| async move {
            if let Err(e) = server.stop().await {
                let id = server.id().await;
                error!(site = %id, "Failed to stop site: {}", e);
            }
        });
        futures::future::join_all(stops).await;
        info!("All sites stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn archive_names_are_slugged_and_stamped() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            archive_file_name("My Blog!", now),
            "my-blog-2024-03-09-14-05-07.zip"
        );
        assert_eq!(archive_file_name("***", now), "site-2024-03-09-14-05-07.zip");
    }
}
