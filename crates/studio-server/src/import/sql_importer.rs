use super::{ImportContext, ImportSink, Importer, import_sql_file};
use crate::error::ImportError;
use crate::site_server::wordpress_root;
use async_trait::async_trait;
use studio_core::export::BackupMeta;
use studio_core::{ImportEvent, ImportOptions};
use tracing::info;

/// Loads a bare `.sql` dump into the site's database.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlImporter;

#[async_trait]
impl Importer for SqlImporter {
    fn name(&self) -> &'static str {
        "sql"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".sql"]
    }

    async fn import(
        &self,
        options: &ImportOptions,
        ctx: &ImportContext,
        on_event: ImportSink<'_>,
    ) -> Result<Option<BackupMeta>, ImportError> {
        on_event(ImportEvent::ImportStart);

        let result = async {
            let root = wordpress_root(&options.site.path).ok_or_else(|| {
                ImportError::InvalidBackup(format!(
                    "{} is not a WordPress site",
                    options.site.path.display()
                ))
            })?;
            on_event(ImportEvent::DatabaseImportStart);
            import_sql_file(
                &ctx.server,
                &root,
                &options.backup_file,
                ctx.config.php.sqlite_command.as_deref(),
            )
            .await?;
            on_event(ImportEvent::DatabaseImportComplete);
            Ok::<(), ImportError>(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(site = %options.site.id, "Imported {}", options.backup_file.display());
                on_event(ImportEvent::ImportComplete);
                Ok(None)
            }
            Err(err) => {
                on_event(ImportEvent::ImportError {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }
}
