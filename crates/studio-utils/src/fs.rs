use anyhow::{Context, Result, anyhow};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Joins a path to a root and ensures the result is inside the root.
/// Prevents directory traversal (e.g. "../../../etc/passwd") when unpacking
/// archive entries.
///
/// # Errors
///
/// Returns an error if the path attempts to traverse above the root directory
/// or if it contains unsupported components (like Windows prefixes).
pub fn safe_join(root: &Path, path: &str) -> Result<PathBuf> {
    let mut result = root.to_path_buf();

    for component in Path::new(path).components() {
        match component {
            Component::Normal(p) => result.push(p),
            // Leading `/` and `.` are treated as relative to the root
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !result.pop() || !result.starts_with(root) {
                    return Err(anyhow!("Path traversal detected: {path}"));
                }
            }
            Component::Prefix(_) => {
                return Err(anyhow!("Windows prefixes not supported: {path}"));
            }
        }
    }

    Ok(result)
}

/// Returns true if `path` is missing or an empty directory.
pub async fn is_missing_or_empty(path: &Path) -> Result<bool> {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => Ok(entries.next_entry().await?.is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Copies the contents of `from` into `to`, creating `to` if needed.
///
/// Symlinks are recreated, not followed. Returns the number of files copied.
pub fn copy_dir_recursive(from: &Path, to: &Path) -> Result<usize> {
    let mut copied = 0;
    std::fs::create_dir_all(to).with_context(|| format!("Failed to create {}", to.display()))?;

    for entry in WalkDir::new(from).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from)?;
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("Failed to link {}", target.display()))?;
        } else {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
    }

    debug!(
        "Copied {} files from {} to {}",
        copied,
        from.display(),
        to.display()
    );
    Ok(copied)
}

/// Removes a file or directory tree, treating a missing path as success.
pub async fn remove_path(path: &Path) -> std::io::Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}
