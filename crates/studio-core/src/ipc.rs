use crate::export::ExportIncludes;
use crate::progress::{OperationKind, ProgressUpdate};
use crate::site::{ServerState, SiteDetails, SiteId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpcRequest {
    Ping,
    GetSiteDetails,
    CreateSite {
        path: PathBuf,
        #[serde(default)]
        name: Option<String>,
    },
    UpdateSite {
        id: SiteId,
        update: SiteUpdate,
    },
    DeleteSite {
        id: SiteId,
        #[serde(default)]
        delete_files: bool,
    },
    StartServer {
        id: SiteId,
    },
    StopServer {
        id: SiteId,
    },
    /// `command` is a WP-CLI command line without the leading `wp`,
    /// e.g. `plugin list --format=json`.
    ExecuteWpCli {
        id: SiteId,
        command: String,
    },
    ArchiveSite {
        id: SiteId,
    },
    ExportSite {
        id: SiteId,
        backup_file: PathBuf,
        #[serde(default)]
        includes: ExportIncludes,
    },
    ImportSite {
        id: SiteId,
        backup_file: PathBuf,
    },
    GetProgress {
        id: SiteId,
    },
    /// Turn the connection into a stream of [`StudioEvent`] lines.
    Subscribe,
    Shutdown,
}

/// Editable site fields. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub php_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IpcResponse {
    Pong,
    Ok,
    Sites(Vec<SiteDetails>),
    /// `None` when the site id is unknown or the operation failed.
    Site(Option<SiteDetails>),
    WpCli {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// Path of a finished archive, or `None` when the request was ignored.
    Archive(Option<PathBuf>),
    Progress(Option<ProgressUpdate>),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A log line from the daemon or from one site's PHP runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// `None` for daemon logs.
    pub site: Option<SiteId>,
    pub message: String,
    pub stream: LogStream,
    pub timestamp: i64,
}

/// Everything published on the daemon's event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StudioEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        site_id: SiteId,
        kind: OperationKind,
        #[serde(flatten)]
        update: ProgressUpdate,
        /// Set on the last event of an operation.
        #[serde(default)]
        finished: bool,
    },
    #[serde(rename_all = "camelCase")]
    Site { site_id: SiteId, state: ServerState },
    Log(LogEntry),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_as_json_lines() {
        let id = SiteId::new();
        let request = IpcRequest::ExportSite {
            id,
            backup_file: "/tmp/backup.zip".into(),
            includes: ExportIncludes::default(),
        };
        let line = serde_json::to_string(&request).unwrap();
        assert!(!line.contains('\n'));
        let back: IpcRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn progress_event_is_flat() {
        let event = StudioEvent::Progress {
            site_id: SiteId::new(),
            kind: OperationKind::Export,
            update: ProgressUpdate::new("Creating backup…", 10.0),
            finished: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["kind"], "export");
        assert_eq!(json["statusMessage"], "Creating backup…");
        assert_eq!(json["progress"], 10.0);
    }
}
