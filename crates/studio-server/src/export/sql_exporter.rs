use super::database::{TempDump, copy_into_place, export_database};
use super::{Capabilities, EventSink, ExportContext, Exporter};
use crate::error::ExportError;
use crate::site_server::wordpress_root;
use async_trait::async_trait;
use std::path::PathBuf;
use studio_core::export::EntryProgress;
use studio_core::{ArchiveFormat, ExportEvent, ExportOptions};
use tracing::info;

/// Database-only exports to a bare `.sql` file.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlExporter;

#[async_trait]
impl Exporter for SqlExporter {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            formats: &[ArchiveFormat::Sql],
            requires_wordpress: true,
            requires_database: true,
        }
    }

    async fn export(
        &self,
        options: &ExportOptions,
        ctx: &ExportContext,
        on_event: EventSink<'_>,
    ) -> Result<PathBuf, ExportError> {
        on_event(ExportEvent::ExportStart);
        on_event(ExportEvent::BackupCreateStart);
        // A bare dump carries no configuration
        on_event(ExportEvent::ConfigExportStart);
        on_event(ExportEvent::ConfigExportComplete);

        let result = async {
            let root = wordpress_root(&options.site.path).ok_or_else(|| {
                ExportError::Metadata(format!(
                    "{} is not a WordPress site",
                    options.site.path.display()
                ))
            })?;
            if let Some(parent) = options.backup_file.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }

            on_event(ExportEvent::DatabaseExportStart);
            let dump = TempDump::new(&root)?;
            let sql_path = dump.file("database.sql");
            export_database(
                &ctx.server,
                &sql_path,
                ctx.config.php.sqlite_command.as_deref(),
            )
            .await?;
            copy_into_place(&sql_path, &options.backup_file).await?;
            Ok::<(), ExportError>(())
        }
        .await;

        if let Err(err) = result {
            on_event(ExportEvent::ExportError {
                message: err.to_string(),
            });
            return Err(err);
        }

        on_event(ExportEvent::BackupCreateProgress {
            entries: EntryProgress {
                processed: 1,
                total: 1,
            },
        });
        on_event(ExportEvent::DatabaseExportComplete);
        on_event(ExportEvent::BackupCreateComplete);
        info!(site = %options.site.id, "Database written to {}", options.backup_file.display());
        on_event(ExportEvent::ExportComplete {
            backup_file: options.backup_file.clone(),
        });
        Ok(options.backup_file.clone())
    }
}
