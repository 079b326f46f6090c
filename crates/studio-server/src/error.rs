use std::path::PathBuf;
use std::time::Duration;
use studio_core::SiteId;
use studio_core::user_data::UserDataError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port at or above {from}")]
    Exhausted { from: u16 },
    #[error("failed to probe port {port}: {source}")]
    Probe {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("site {0} not found")]
    NotFound(SiteId),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("failed to launch PHP runtime: {0}")]
    Launch(#[source] std::io::Error),
    #[error("PHP runtime exited before accepting connections (exit code {code:?})")]
    ExitedBeforeReady { code: Option<i32> },
    #[error("PHP runtime did not accept connections within {0:?}")]
    StartTimeout(Duration),
    #[error("PHP runtime did not stop within {0:?}")]
    StopTimeout(Duration),
    #[error("site server is not running")]
    NotRunning,
    #[error("PHP runtime crashed (exit code {code:?})")]
    Crashed { code: Option<i32> },
    #[error("failed to run WP-CLI: {0}")]
    WpCli(#[source] std::io::Error),
    #[error("WP-CLI did not finish within {0:?}")]
    WpCliTimeout(Duration),
    #[error("cannot parse WP-CLI command `{0}`")]
    InvalidCommand(String),
    #[error(transparent)]
    Persistence(#[from] UserDataError),
}

#[derive(Debug, Error)]
pub enum DatabaseExportError {
    #[error("database export wrote to stderr: {stderr}")]
    Stderr { stderr: String },
    #[error("database export exited with code {code}: {stderr}")]
    ExitCode { code: i32, stderr: String },
    #[error("failed to move database dump from {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Command(#[from] SiteError),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no exporter can handle {0}")]
    NoSuitableExporter(PathBuf),
    #[error("failed to write archive: {0}")]
    Archive(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] DatabaseExportError),
    #[error(transparent)]
    Site(#[from] SiteError),
    #[error("failed to collect site metadata: {0}")]
    Metadata(String),
    #[error("export did not finish within {0:?}")]
    Timeout(Duration),
    #[error("failed to scan site files: {0}")]
    Walk(#[from] walkdir::Error),
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("no importer can handle {0}")]
    NoSuitableImporter(PathBuf),
    #[error("invalid backup: {0}")]
    InvalidBackup(String),
    #[error("failed to read archive: {0}")]
    Archive(#[from] std::io::Error),
    #[error("database import failed: {0}")]
    Database(String),
    #[error(transparent)]
    Site(#[from] SiteError),
    #[error("import did not finish within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
