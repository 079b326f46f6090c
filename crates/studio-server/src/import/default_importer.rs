use super::{ImportContext, ImportSink, Importer, import_sql_file};
use crate::error::ImportError;
use crate::site_server::wordpress_root;
use anyhow::Context;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use studio_core::export::{BackupMeta, ContentCategory};
use studio_core::{ArchiveFormat, ImportEvent, ImportOptions};
use studio_utils::fs::{remove_path, safe_join};
use tracing::{debug, info, warn};

/// Restores `.zip` and `.tar.gz` backups.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultImporter;

fn extract_zip(
    backup: &Path,
    dest: &Path,
    progress: &dyn Fn(usize, usize),
) -> anyhow::Result<usize> {
    let mut archive = zip::ZipArchive::new(File::open(backup)?)?;
    let total = archive.len();

    for index in 0..total {
        let mut entry = archive.by_index(index)?;
        let out = safe_join(dest, entry.name())?;
        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = File::create(&out)?;
            std::io::copy(&mut entry, &mut file)?;
        }
        progress(index + 1, total);
    }
    Ok(total)
}

fn open_tar(backup: &Path) -> anyhow::Result<tar::Archive<GzDecoder<File>>> {
    Ok(tar::Archive::new(GzDecoder::new(File::open(backup)?)))
}

fn extract_tar_gz(
    backup: &Path,
    dest: &Path,
    progress: &dyn Fn(usize, usize),
) -> anyhow::Result<usize> {
    // First pass only counts entries so progress has a denominator
    let total = open_tar(backup)?.entries()?.count();

    let mut archive = open_tar(backup)?;
    let mut processed = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let out = safe_join(dest, &name)?;
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            std::fs::create_dir_all(&out)?;
        } else if kind.is_file() {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            entry
                .unpack(&out)
                .with_context(|| format!("Failed to unpack {name}"))?;
        } else {
            debug!("Skipping non-regular archive entry {}", name);
        }
        processed += 1;
        progress(processed, total);
    }
    Ok(processed)
}

fn sql_files(extracted: &Path) -> std::io::Result<Vec<PathBuf>> {
    let dir = extracted.join("sql");
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    files.sort();
    Ok(files)
}

async fn read_meta(extracted: &Path) -> Option<BackupMeta> {
    let content = tokio::fs::read_to_string(extracted.join("meta.json")).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!("Ignoring unreadable meta.json: {}", e);
            None
        }
    }
}

impl DefaultImporter {
    async fn extract(
        backup: &Path,
        dest: &Path,
        on_event: ImportSink<'_>,
    ) -> Result<usize, ImportError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let backup = backup.to_path_buf();
        let dest = dest.to_path_buf();
        let format = ArchiveFormat::from_path(&backup);

        let task = tokio::task::spawn_blocking(move || {
            let progress = |processed: usize, total: usize| {
                // The receiver outlives the task
                let _ = tx.send((processed, total));
            };
            match format {
                ArchiveFormat::Zip => extract_zip(&backup, &dest, &progress),
                ArchiveFormat::TarGz | ArchiveFormat::Sql => {
                    extract_tar_gz(&backup, &dest, &progress)
                }
            }
        });

        while let Some((processed, total)) = rx.recv().await {
            on_event(ImportEvent::BackupExtractProgress { processed, total });
        }

        let count = task
            .await
            .map_err(|e| ImportError::Archive(std::io::Error::other(e)))??;
        Ok(count)
    }

    async fn restore(
        options: &ImportOptions,
        ctx: &ImportContext,
        root: &Path,
        scratch: &Path,
        on_event: ImportSink<'_>,
    ) -> Result<Option<BackupMeta>, ImportError> {
        on_event(ImportEvent::BackupExtractStart);
        let entries = Self::extract(&options.backup_file, scratch, on_event).await?;
        debug!(site = %options.site.id, entries, "Extracted backup");
        on_event(ImportEvent::BackupExtractComplete);

        on_event(ImportEvent::ConfigValidationStart);
        let dumps = sql_files(scratch)?;
        let content_dir = scratch.join("wp-content");
        if dumps.is_empty() && !content_dir.is_dir() {
            return Err(ImportError::InvalidBackup(
                "backup holds neither wp-content nor a database dump".to_string(),
            ));
        }
        let meta = read_meta(scratch).await;
        on_event(ImportEvent::ConfigValidationComplete);

        if !dumps.is_empty() {
            on_event(ImportEvent::DatabaseImportStart);
            for dump in &dumps {
                import_sql_file(&ctx.server, root, dump, ctx.config.php.sqlite_command.as_deref())
                    .await?;
            }
            on_event(ImportEvent::DatabaseImportComplete);
        }

        if content_dir.is_dir() {
            on_event(ImportEvent::WpContentImportStart);
            for category in ContentCategory::ALL {
                let incoming = content_dir.join(category.dir_name());
                if !incoming.is_dir() {
                    continue;
                }
                let target = root.join("wp-content").join(category.dir_name());
                remove_path(&target).await?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&incoming, &target).await?;
                debug!(site = %options.site.id, "Replaced wp-content/{}", category);
            }
            on_event(ImportEvent::WpContentImportComplete);
        }

        Ok(meta)
    }
}

#[async_trait]
impl Importer for DefaultImporter {
    fn name(&self) -> &'static str {
        "default"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &[".zip", ".tar.gz", ".tgz"]
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
            // Scratch space on the same filesystem so content can be renamed in
            let scratch = tempfile::Builder::new()
                .prefix(".studio-import-")
                .tempdir_in(&root)?;
            Self::restore(options, ctx, &root, scratch.path(), on_event).await
        }
        .await;

        match result {
            Ok(meta) => {
                info!(site = %options.site.id, "Imported {}", options.backup_file.display());
                on_event(ImportEvent::ImportComplete);
                Ok(meta)
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[test]
    fn zip_extraction_reports_every_entry() {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("b.zip");
        let mut zip = zip::ZipWriter::new(File::create(&backup).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("wp-content/plugins/a.php", options).unwrap();
        zip.write_all(b"<?php").unwrap();
        zip.start_file("sql/site.sql", options).unwrap();
        zip.write_all(b"SELECT 1;").unwrap();
        zip.finish().unwrap();

        let seen = Mutex::new(Vec::new());
        let dest = dir.path().join("out");
        let count = extract_zip(&backup, &dest, &|p, t| seen.lock().unwrap().push((p, t))).unwrap();

        assert_eq!(count, 2);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2), (2, 2)]);
        assert!(dest.join("wp-content/plugins/a.php").is_file());
        assert_eq!(sql_files(&dest).unwrap(), vec![dest.join("sql/site.sql")]);
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("evil.zip");
        let mut zip = zip::ZipWriter::new(File::create(&backup).unwrap());
        zip.start_file("../escape.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"x").unwrap();
        zip.finish().unwrap();

        assert!(extract_zip(&backup, &dir.path().join("out"), &|_, _| {}).is_err());
        assert!(!dir.path().join("escape.txt").exists());
    }
}
