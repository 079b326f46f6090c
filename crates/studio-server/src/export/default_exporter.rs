use super::archive::ArchiveWriter;
use super::database::{TempDump, export_database};
use super::{Capabilities, EventSink, ExportContext, Exporter};
use crate::error::ExportError;
use crate::site_server::{SiteServer, WpCliMode, wordpress_root};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use studio_core::export::{BackupMeta, ContentCategory, EntryProgress, InventoryItem};
use studio_core::{ArchiveFormat, BackupContents, ExportEvent, ExportIncludes, ExportOptions};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Full-site backups as `.zip` or `.tar.gz`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExporter;

/// Removes the file at `path` on drop unless kept.
#[derive(Debug)]
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            keep: false,
        }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial archive {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial archive {}: {}", self.path.display(), e),
        }
    }
}

/// Archive entry name for `path` under `root`, with `/` separators.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>, walkdir::Error> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Walk the site once and list everything the backup will contain.
fn scan_contents(root: &Path, includes: ExportIncludes) -> Result<BackupContents, ExportError> {
    let mut wp_content = BTreeMap::new();
    for category in includes.categories() {
        let dir = root.join("wp-content").join(category.dir_name());
        wp_content.insert(category, collect_files(&dir)?);
    }
    Ok(BackupContents {
        wp_config: root.join("wp-config.php"),
        wp_content,
        sql_files: Vec::new(),
    })
}

fn sql_file_name(options: &ExportOptions) -> String {
    let slug: String = options
        .site
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "database.sql".to_string()
    } else {
        format!("{slug}.sql")
    }
}

async fn wp_cli_json<T: serde::de::DeserializeOwned>(
    server: &Arc<SiteServer>,
    args: &[&str],
) -> Result<T, ExportError> {
    let stdout = wp_cli_stdout(server, args).await?;
    serde_json::from_str(stdout.trim())
        .map_err(|e| ExportError::Metadata(format!("`wp {}`: {e}", args.join(" "))))
}

async fn wp_cli_stdout(server: &Arc<SiteServer>, args: &[&str]) -> Result<String, ExportError> {
    let owned: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
    let output = server
        .execute_wp_cli_command(&owned, WpCliMode::Ephemeral { leave_running: true })
        .await?;
    if output.exit_code != 0 {
        return Err(ExportError::Metadata(format!(
            "`wp {}` exited with {}: {}",
            args.join(" "),
            output.exit_code,
            output.stderr.trim()
        )));
    }
    Ok(output.stdout)
}

async fn collect_meta(options: &ExportOptions, server: &Arc<SiteServer>) -> Result<BackupMeta, ExportError> {
    let wordpress_version = wp_cli_stdout(server, &["core", "version"]).await?;
    let plugins: Vec<InventoryItem> =
        wp_cli_json(server, &["plugin", "list", "--format=json"]).await?;
    let themes: Vec<InventoryItem> =
        wp_cli_json(server, &["theme", "list", "--format=json"]).await?;

    Ok(BackupMeta {
        site_url: server.details().await.url().unwrap_or_default(),
        php_version: options.php_version.clone(),
        wordpress_version: wordpress_version.trim().to_string(),
        plugins,
        themes,
    })
}

impl DefaultExporter {
    async fn write_backup(
        options: &ExportOptions,
        ctx: &ExportContext,
        root: &Path,
        contents: &mut BackupContents,
        dump: &TempDump,
        on_event: EventSink<'_>,
    ) -> Result<(), ExportError> {
        let format = options.format();
        let mut archive = ArchiveWriter::create(&options.backup_file, format).await?;
        on_event(ExportEvent::BackupCreateStart);

        let total = contents.total_entries(options.includes.database);
        let mut processed = 0;
        let progress = |processed: usize| ExportEvent::BackupCreateProgress {
            entries: EntryProgress { processed, total },
        };

        on_event(ExportEvent::ConfigExportStart);
        archive
            .append_file(&contents.wp_config, "wp-config.php")
            .await?;
        processed += 1;
        on_event(ExportEvent::ConfigExportComplete);
        on_event(progress(processed));

        if options.includes.categories().next().is_some() {
            on_event(ExportEvent::WpContentExportStart);
            let content_total = contents.content_file_count();
            let mut content_processed = 0;
            for category in options.includes.categories() {
                let files = contents.wp_content.get(&category).cloned().unwrap_or_default();
                for file in files {
                    let Some(name) = entry_name(root, &file) else {
                        continue;
                    };
                    archive.append_file(&file, &name).await?;
                    processed += 1;
                    content_processed += 1;
                    on_event(ExportEvent::WpContentExportProgress {
                        category,
                        path: file,
                        processed: content_processed,
                        total: content_total,
                    });
                    on_event(progress(processed));
                }
            }
            on_event(ExportEvent::WpContentExportComplete {
                uploads: contents.count(ContentCategory::Uploads),
                plugins: contents.count(ContentCategory::Plugins),
                themes: contents.count(ContentCategory::Themes),
            });
        }

        if options.includes.database {
            on_event(ExportEvent::DatabaseExportStart);
            let file_name = sql_file_name(options);
            let sql_path = dump.file(&file_name);
            export_database(
                &ctx.server,
                &sql_path,
                ctx.config.php.sqlite_command.as_deref(),
            )
            .await?;
            contents.sql_files.push(sql_path.clone());
            archive
                .append_file(&sql_path, &format!("sql/{file_name}"))
                .await?;
            processed += 1;
            on_event(progress(processed));
            on_event(ExportEvent::DatabaseExportComplete);
        }

        let meta = collect_meta(options, &ctx.server).await?;
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| ExportError::Metadata(e.to_string()))?;
        archive.append_bytes("meta.json", meta_json).await?;
        processed += 1;
        on_event(progress(processed));

        archive.finish().await?;
        Ok(())
    }
}

#[async_trait]
impl Exporter for DefaultExporter {
    fn name(&self) -> &'static str {
        "default"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            formats: &[ArchiveFormat::Zip, ArchiveFormat::TarGz],
            requires_wordpress: true,
            requires_database: false,
        }
    }

    async fn export(
        &self,
        options: &ExportOptions,
        ctx: &ExportContext,
        on_event: EventSink<'_>,
    ) -> Result<PathBuf, ExportError> {
        on_event(ExportEvent::ExportStart);

        let fail = |err: ExportError| {
            on_event(ExportEvent::ExportError {
                message: err.to_string(),
            });
            err
        };

        let Some(root) = wordpress_root(&options.site.path) else {
            return Err(fail(ExportError::Metadata(format!(
                "{} is not a WordPress site",
                options.site.path.display()
            ))));
        };

        let scan_root = root.clone();
        let includes = options.includes;
        let mut contents = tokio::task::spawn_blocking(move || scan_contents(&scan_root, includes))
            .await
            .map_err(|e| fail(ExportError::Archive(std::io::Error::other(e))))?
            .map_err(fail)?;
        debug!(
            site = %options.site.id,
            files = contents.content_file_count(),
            "Scanned site contents"
        );

        let dump = TempDump::new(&root).map_err(|e| fail(e.into()))?;
        let partial = PartialFile::new(&options.backup_file);

        Self::write_backup(options, ctx, &root, &mut contents, &dump, on_event)
            .await
            .map_err(fail)?;

        partial.keep();
        drop(dump);
        on_event(ExportEvent::BackupCreateComplete);
        info!(site = %options.site.id, "Backup written to {}", options.backup_file.display());
        on_event(ExportEvent::ExportComplete {
            backup_file: options.backup_file.clone(),
        });
        Ok(options.backup_file.clone())
    }
}
