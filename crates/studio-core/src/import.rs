use crate::site::SiteDetails;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Input of one import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    pub site: SiteDetails,
    pub backup_file: PathBuf,
}

/// Stage events emitted by an importer, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "SCREAMING_SNAKE_CASE"
)]
pub enum ImportEvent {
    ImportStart,
    BackupExtractStart,
    BackupExtractProgress { processed: usize, total: usize },
    BackupExtractComplete,
    ConfigValidationStart,
    ConfigValidationComplete,
    DatabaseImportStart,
    DatabaseImportComplete,
    WpContentImportStart,
    WpContentImportComplete,
    ImportComplete,
    ImportError { message: String },
}

impl ImportEvent {
    #[must_use]
    pub const fn is_progress(&self) -> bool {
        matches!(self, Self::BackupExtractProgress { .. })
    }
}
