//! SQLite database dumps through WP-CLI.

use crate::error::DatabaseExportError;
use crate::site_server::{SiteServer, WpCliMode, wordpress_root};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Scratch directory for database dumps, inside the site root so the dump
/// can be renamed into it. Deleted with its contents on drop.
#[derive(Debug)]
pub struct TempDump {
    dir: tempfile::TempDir,
}

impl TempDump {
    pub fn new(root: &Path) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(".studio-export-")
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn copy_via_sibling(from: &Path, to: &Path) -> std::io::Result<()> {
    let parent = match to.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = tempfile::Builder::new()
        .prefix(".studio-export-")
        .suffix(".part")
        .tempfile_in(parent)?;
    std::io::copy(&mut File::open(from)?, staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(to).map_err(|e| e.error)?;
    Ok(())
}

/// Copy `from` to `to`, which may sit on another filesystem.
///
/// The bytes go to a temp file next to `to` that is renamed over it once
/// complete, so `to` never holds a partial file. The temp file is removed
/// on failure.
pub async fn copy_into_place(from: &Path, to: &Path) -> std::io::Result<()> {
    let (from, to) = (from.to_path_buf(), to.to_path_buf());
    tokio::task::spawn_blocking(move || copy_via_sibling(&from, &to))
        .await
        .map_err(std::io::Error::other)?
}

/// Dump the site's database to `destination`.
///
/// The dump is written next to the site's files under a unique name, then
/// renamed into place. A failed rename is returned as is, never retried as a
/// copy.
pub async fn export_database(
    server: &Arc<SiteServer>,
    destination: &Path,
    sqlite_command: Option<&Path>,
) -> Result<(), DatabaseExportError> {
    let site_path = server.details().await.path;
    let root = wordpress_root(&site_path).unwrap_or(site_path);
    let file_name = format!("studio-export-{}.sql", uuid::Uuid::new_v4());
    let temp_path = root.join(&file_name);

    let mut args = vec!["sqlite".to_string(), "export".to_string(), file_name];
    if let Some(command) = sqlite_command {
        args.push(format!("--require={}", command.display()));
    }

    let result = run_export(server, &args, &temp_path, destination).await;
    if result.is_err() {
        remove_leftover(&temp_path).await;
    }
    result
}

async fn run_export(
    server: &Arc<SiteServer>,
    args: &[String],
    temp_path: &Path,
    destination: &Path,
) -> Result<(), DatabaseExportError> {
    let output = server
        .execute_wp_cli_command(args, WpCliMode::Ephemeral { leave_running: true })
        .await?;

    if !output.stderr.trim().is_empty() {
        return Err(DatabaseExportError::Stderr {
            stderr: output.stderr,
        });
    }
    if output.exit_code != 0 {
        return Err(DatabaseExportError::ExitCode {
            code: output.exit_code,
            stderr: output.stderr,
        });
    }

    tokio::fs::rename(temp_path, destination)
        .await
        .map_err(|source| DatabaseExportError::Rename {
            from: temp_path.to_path_buf(),
            to: destination.to_path_buf(),
            source,
        })?;
    debug!("Database dump written to {}", destination.display());
    Ok(())
}

async fn remove_leftover(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial dump {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial dump {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dump_dir_is_removed_on_drop() {
        let dir = tempdir().unwrap();
        let dump = TempDump::new(dir.path()).unwrap();
        std::fs::write(dump.file("site.sql"), "SELECT 1;").unwrap();
        drop(dump);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn copies_replace_the_destination_without_staging_leftovers() {
        let src = tempdir().unwrap();
        let dest = tempdir().unwrap();
        let dump = src.path().join("site.sql");
        std::fs::write(&dump, "CREATE TABLE t (x);").unwrap();
        let target = dest.path().join("backup.sql");
        std::fs::write(&target, "stale").unwrap();

        copy_into_place(&dump, &target).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "CREATE TABLE t (x);");
        assert!(dump.exists());
        let names: Vec<_> = std::fs::read_dir(dest.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("backup.sql")]);
    }

    #[tokio::test]
    async fn a_missing_source_leaves_no_staged_file() {
        let dest = tempdir().unwrap();
        let target = dest.path().join("backup.sql");

        assert!(copy_into_place(&dest.path().join("nope.sql"), &target).await.is_err());
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }
}
