//! Environment variable and path utilities.

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Errors related to environment overrides.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    /// `STUDIO_SOCKET` is set but `STUDIO_SANDBOX_ACTIVE` is not.
    #[error("STUDIO_SOCKET is not allowed without STUDIO_SANDBOX_ACTIVE")]
    SocketEnvNotAllowed,
    /// `STUDIO_DATA_DIR` is set but `STUDIO_SANDBOX_ACTIVE` is not.
    #[error("STUDIO_DATA_DIR is not allowed without STUDIO_SANDBOX_ACTIVE")]
    DataDirEnvNotAllowed,
}

/// Returns true if the sandbox mode is active.
///
/// This is determined by the `STUDIO_SANDBOX_ACTIVE` environment variable.
pub fn is_sandbox_active() -> bool {
    std::env::var("STUDIO_SANDBOX_ACTIVE").is_ok()
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "studio", "studio")
}

/// Returns the XDG data directory for studio.
///
/// Defaults to `~/.local/share/studio` on Linux.
pub fn get_xdg_data_home() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from(".studio"),
        |proj_dirs| proj_dirs.data_dir().to_path_buf(),
    )
}

/// Returns the XDG config directory for studio.
///
/// Defaults to `~/.config/studio` on Linux.
pub fn get_xdg_config_home() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from(".studio"),
        |proj_dirs| proj_dirs.config_dir().to_path_buf(),
    )
}

/// Returns the default path of `config.toml`.
pub fn config_file_path() -> PathBuf {
    get_xdg_config_home().join("config.toml")
}

/// Returns the directory holding the user-data file and archives.
///
/// # Errors
///
/// Returns `EnvError::DataDirEnvNotAllowed` if `STUDIO_DATA_DIR` is set
/// outside a sandbox.
pub fn data_dir() -> Result<PathBuf, EnvError> {
    let data_env = std::env::var("STUDIO_DATA_DIR");

    if data_env.is_ok() && !is_sandbox_active() {
        return Err(EnvError::DataDirEnvNotAllowed);
    }

    Ok(data_env.map_or_else(|_| get_xdg_data_home(), PathBuf::from))
}

/// Returns the path to the studio IPC socket.
///
/// # Errors
///
/// Returns `EnvError::SocketEnvNotAllowed` if `STUDIO_SOCKET` is set but `STUDIO_SANDBOX_ACTIVE` is not.
pub fn socket_path() -> Result<PathBuf, EnvError> {
    let socket_env = std::env::var("STUDIO_SOCKET");

    if socket_env.is_ok() && !is_sandbox_active() {
        return Err(EnvError::SocketEnvNotAllowed);
    }

    socket_env.map_or_else(
        |_| Ok(PathBuf::from("/tmp/studio.sock")),
        |path| Ok(PathBuf::from(path)),
    )
}
