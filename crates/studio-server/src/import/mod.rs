//! Restoring sites from backups written by the exporters.

pub mod default_importer;
pub mod sql_importer;

use crate::error::ImportError;
use crate::site_server::{SiteServer, WpCliMode};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use studio_core::export::BackupMeta;
use studio_core::{ImportEvent, ImportOptions};
use tracing::{debug, info, warn};

pub use crate::export::ExportContext as ImportContext;
pub use default_importer::DefaultImporter;
pub use sql_importer::SqlImporter;

pub type ImportSink<'a> = &'a (dyn Fn(ImportEvent) + Send + Sync);

fn file_name_lower(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

#[async_trait]
pub trait Importer: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// File name suffixes this importer reads, lowercase.
    fn extensions(&self) -> &'static [&'static str];

    fn can_handle(&self, backup_file: &Path) -> bool {
        let name = file_name_lower(backup_file);
        self.extensions().iter().any(|ext| name.ends_with(ext))
    }

    /// Restore `options.backup_file` into the site. Returns the backup's
    /// metadata when it carried any.
    async fn import(
        &self,
        options: &ImportOptions,
        ctx: &ImportContext,
        on_event: ImportSink<'_>,
    ) -> Result<Option<BackupMeta>, ImportError>;
}

/// The first importer that reads `backup_file`.
#[must_use]
pub fn select_importer<'a>(
    backup_file: &Path,
    importers: &'a [Arc<dyn Importer>],
) -> Option<&'a Arc<dyn Importer>> {
    importers.iter().find(|importer| importer.can_handle(backup_file))
}

#[must_use]
pub fn default_importers() -> Vec<Arc<dyn Importer>> {
    vec![Arc::new(DefaultImporter), Arc::new(SqlImporter)]
}

#[derive(Debug, Clone)]
pub struct ImportManager {
    importers: Vec<Arc<dyn Importer>>,
    timeout: Duration,
}

impl ImportManager {
    #[must_use]
    pub fn new(importers: Vec<Arc<dyn Importer>>, timeout: Duration) -> Self {
        Self { importers, timeout }
    }

    pub async fn import_backup(
        &self,
        options: &ImportOptions,
        ctx: &ImportContext,
        on_event: ImportSink<'_>,
    ) -> Result<Option<BackupMeta>, ImportError> {
        let Some(importer) = select_importer(&options.backup_file, &self.importers) else {
            return Err(ImportError::NoSuitableImporter(options.backup_file.clone()));
        };

        info!(
            site = %options.site.id,
            importer = importer.name(),
            "Importing {}",
            options.backup_file.display()
        );

        match tokio::time::timeout(self.timeout, importer.import(options, ctx, on_event)).await {
            Ok(result) => result,
            Err(_) => {
                let err = ImportError::Timeout(self.timeout);
                on_event(ImportEvent::ImportError {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

/// Load one SQL file into the site's database with `wp sqlite import`.
///
/// The file is copied next to the site's files under a unique name for the
/// command and removed afterwards.
pub async fn import_sql_file(
    server: &Arc<SiteServer>,
    root: &Path,
    sql_file: &Path,
    sqlite_command: Option<&Path>,
) -> Result<(), ImportError> {
    let file_name = format!("studio-import-{}.sql", uuid::Uuid::new_v4());
    let staged = root.join(&file_name);
    tokio::fs::copy(sql_file, &staged).await?;

    let mut args = vec!["sqlite".to_string(), "import".to_string(), file_name];
    if let Some(command) = sqlite_command {
        args.push(format!("--require={}", command.display()));
    }

    let result = server
        .execute_wp_cli_command(&args, WpCliMode::Ephemeral { leave_running: true })
        .await;

    if let Err(e) = tokio::fs::remove_file(&staged).await {
        warn!("Failed to remove staged dump {}: {}", staged.display(), e);
    }

    let output = result?;
    if !output.stderr.trim().is_empty() || output.exit_code != 0 {
        return Err(ImportError::Database(format!(
            "exit code {}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }
    debug!("Imported {}", sql_file.display());
    Ok(())
}
