//! Backup export: strategy selection and the export manager.
//!
//! An export picks the first registered [`Exporter`] whose capabilities
//! accept the site and destination, then lets it stream the archive while
//! reporting [`ExportEvent`]s.

pub mod archive;
pub mod database;
pub mod default_exporter;
pub mod sql_exporter;

use crate::error::ExportError;
use crate::site_server::{SiteServer, wordpress_root};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use studio_core::config::StudioConfig;
use studio_core::{ArchiveFormat, ExportEvent, ExportIncludes, ExportOptions};
use tracing::{info, warn};

pub use default_exporter::DefaultExporter;
pub use sql_exporter::SqlExporter;

/// Receives export events in emission order.
pub type EventSink<'a> = &'a (dyn Fn(ExportEvent) + Send + Sync);

/// What an export request looks like, computed once before selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportProbe {
    pub format: ArchiveFormat,
    /// Where the WordPress markers were found, if anywhere.
    pub wordpress_root: Option<PathBuf>,
    pub includes: ExportIncludes,
}

impl ExportProbe {
    #[must_use]
    pub fn inspect(options: &ExportOptions) -> Self {
        Self {
            format: options.format(),
            wordpress_root: wordpress_root(&options.site.path),
            includes: options.includes,
        }
    }
}

/// What an exporter can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub formats: &'static [ArchiveFormat],
    pub requires_wordpress: bool,
    pub requires_database: bool,
}

impl Capabilities {
    #[must_use]
    pub fn accepts(&self, probe: &ExportProbe) -> bool {
        self.formats.contains(&probe.format)
            && (!self.requires_wordpress || probe.wordpress_root.is_some())
            && (!self.requires_database || probe.includes.database)
    }
}

/// Collaborators available to a running export.
#[derive(Debug, Clone)]
pub struct ExportContext {
    pub server: Arc<SiteServer>,
    pub config: Arc<StudioConfig>,
}

#[async_trait]
pub trait Exporter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Cheap check run before [`Exporter::export`].
    fn can_handle(&self, probe: &ExportProbe) -> bool {
        self.capabilities().accepts(probe)
    }

    /// Write the backup and return its path.
    ///
    /// On failure the exporter emits [`ExportEvent::ExportError`] and leaves
    /// neither a partial archive nor temporary dumps behind.
    async fn export(
        &self,
        options: &ExportOptions,
        ctx: &ExportContext,
        on_event: EventSink<'_>,
    ) -> Result<PathBuf, ExportError>;
}

/// Index of the first capability set that accepts `probe`.
#[must_use]
pub fn select_index(probe: &ExportProbe, capabilities: &[Capabilities]) -> Option<usize> {
    capabilities.iter().position(|caps| caps.accepts(probe))
}

/// The first exporter that can handle `probe`, in priority order.
#[must_use]
pub fn select_exporter<'a>(
    probe: &ExportProbe,
    exporters: &'a [Arc<dyn Exporter>],
) -> Option<&'a Arc<dyn Exporter>> {
    exporters.iter().find(|exporter| exporter.can_handle(probe))
}

/// The built-in exporters, highest priority first.
#[must_use]
pub fn default_exporters() -> Vec<Arc<dyn Exporter>> {
    vec![Arc::new(DefaultExporter), Arc::new(SqlExporter)]
}

#[derive(Debug, Clone)]
pub struct ExportManager {
    exporters: Vec<Arc<dyn Exporter>>,
    timeout: Duration,
}

impl ExportManager {
    #[must_use]
    pub fn new(exporters: Vec<Arc<dyn Exporter>>, timeout: Duration) -> Self {
        Self { exporters, timeout }
    }

    /// Run the first exporter that accepts `options`.
    ///
    /// Returns [`ExportError::NoSuitableExporter`] without emitting events
    /// when none does.
    pub async fn export_backup(
        &self,
        options: &ExportOptions,
        ctx: &ExportContext,
        on_event: EventSink<'_>,
    ) -> Result<PathBuf, ExportError> {
        let probe = ExportProbe::inspect(options);
        let Some(exporter) = select_exporter(&probe, &self.exporters) else {
            warn!(
                site = %options.site.id,
                "No exporter can handle {}",
                options.backup_file.display()
            );
            return Err(ExportError::NoSuitableExporter(options.backup_file.clone()));
        };

        info!(
            site = %options.site.id,
            exporter = exporter.name(),
            "Exporting to {}",
            options.backup_file.display()
        );

        match tokio::time::timeout(self.timeout, exporter.export(options, ctx, on_event)).await {
            Ok(result) => result,
            Err(_) => {
                // The exporter future was dropped; its guards removed any
                // partial output
                let err = ExportError::Timeout(self.timeout);
                on_event(ExportEvent::ExportError {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(format: ArchiveFormat, wordpress: bool, database: bool) -> ExportProbe {
        ExportProbe {
            format,
            wordpress_root: wordpress.then(|| PathBuf::from("/sites/a")),
            includes: ExportIncludes {
                database,
                ..ExportIncludes::default()
            },
        }
    }

    #[test]
    fn selection_is_first_match_in_priority_order() {
        let caps = [DefaultExporter.capabilities(), SqlExporter.capabilities()];

        assert_eq!(select_index(&probe(ArchiveFormat::Zip, true, true), &caps), Some(0));
        assert_eq!(select_index(&probe(ArchiveFormat::TarGz, true, false), &caps), Some(0));
        assert_eq!(select_index(&probe(ArchiveFormat::Sql, true, true), &caps), Some(1));
        assert_eq!(select_index(&probe(ArchiveFormat::Sql, false, true), &caps), None);
        assert_eq!(select_index(&probe(ArchiveFormat::Zip, false, true), &caps), None);
        assert_eq!(select_index(&probe(ArchiveFormat::Sql, true, false), &caps), None);
    }

    #[test]
    fn select_exporter_uses_can_handle() {
        let exporters = default_exporters();
        let chosen = select_exporter(&probe(ArchiveFormat::Sql, true, true), &exporters).unwrap();
        assert_eq!(chosen.name(), "sql");
        assert!(select_exporter(&probe(ArchiveFormat::TarGz, false, true), &exporters).is_none());
    }
}
