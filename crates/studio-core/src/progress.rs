//! Mapping from exporter and importer events to user-facing progress.
//!
//! The percentages are fixed so every client renders the same bar for the
//! same stage.

use crate::export::ExportEvent;
use crate::import::ImportEvent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Export,
    Import,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Export => write!(f, "export"),
            Self::Import => write!(f, "import"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub status_message: String,
    /// Percentage in `0.0..=100.0`.
    pub progress: f64,
}

impl ProgressUpdate {
    #[must_use]
    pub fn new(status_message: impl Into<String>, progress: f64) -> Self {
        Self {
            status_message: status_message.into(),
            progress: progress.clamp(0.0, 100.0),
        }
    }

    /// State of an operation that was accepted but emitted nothing yet.
    #[must_use]
    pub fn initial(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Export => Self::new("Starting export…", 0.0),
            OperationKind::Import => Self::new("Starting import…", 0.0),
        }
    }
}

fn fraction(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = processed as f64 / total as f64;
    ratio.clamp(0.0, 1.0)
}

/// Progress after `event`, given the progress before it.
///
/// Events without a fixed percentage keep the previous value and only
/// change the status message.
#[must_use]
pub fn export_progress(event: &ExportEvent, previous: &ProgressUpdate) -> ProgressUpdate {
    let keep = previous.progress;
    match event {
        ExportEvent::ExportStart => ProgressUpdate::new("Starting export…", 5.0),
        ExportEvent::BackupCreateStart => ProgressUpdate::new("Creating backup…", 10.0),
        ExportEvent::ConfigExportStart => ProgressUpdate::new("Exporting configuration…", 15.0),
        ExportEvent::ConfigExportComplete => {
            ProgressUpdate::new("Exporting configuration…", 20.0)
        }
        ExportEvent::WpContentExportStart
        | ExportEvent::WpContentExportProgress { .. }
        | ExportEvent::WpContentExportComplete { .. } => {
            ProgressUpdate::new("Exporting files…", keep)
        }
        ExportEvent::DatabaseExportStart | ExportEvent::DatabaseExportComplete => {
            ProgressUpdate::new("Exporting database…", keep)
        }
        ExportEvent::BackupCreateProgress { entries } => ProgressUpdate {
            status_message: previous.status_message.clone(),
            progress: (20.0 + fraction(entries.processed, entries.total) * 80.0).min(100.0),
        },
        ExportEvent::BackupCreateComplete => ProgressUpdate::new("Creating backup…", keep),
        ExportEvent::ExportComplete { .. } => ProgressUpdate::new("Export complete", 100.0),
        ExportEvent::ExportError { .. } => ProgressUpdate::new("Export failed", keep),
    }
}

#[must_use]
pub fn import_progress(event: &ImportEvent, previous: &ProgressUpdate) -> ProgressUpdate {
    let keep = previous.progress;
    match event {
        ImportEvent::ImportStart => ProgressUpdate::new("Starting import…", 5.0),
        ImportEvent::BackupExtractStart => ProgressUpdate::new("Extracting backup…", 10.0),
        ImportEvent::BackupExtractProgress { processed, total } => ProgressUpdate::new(
            "Extracting backup…",
            10.0 + fraction(*processed, *total) * 40.0,
        ),
        ImportEvent::BackupExtractComplete => ProgressUpdate::new("Extracting backup…", 50.0),
        ImportEvent::ConfigValidationStart => ProgressUpdate::new("Validating backup…", 55.0),
        ImportEvent::ConfigValidationComplete => {
            ProgressUpdate::new("Validating backup…", 60.0)
        }
        ImportEvent::DatabaseImportStart => ProgressUpdate::new("Importing database…", 65.0),
        ImportEvent::DatabaseImportComplete => ProgressUpdate::new("Importing database…", 80.0),
        ImportEvent::WpContentImportStart => ProgressUpdate::new("Importing files…", 85.0),
        ImportEvent::WpContentImportComplete => ProgressUpdate::new("Importing files…", 95.0),
        ImportEvent::ImportComplete => ProgressUpdate::new("Import complete", 100.0),
        ImportEvent::ImportError { .. } => ProgressUpdate::new("Import failed", keep),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::EntryProgress;

    fn entries(processed: usize, total: usize) -> ExportEvent {
        ExportEvent::BackupCreateProgress {
            entries: EntryProgress { processed, total },
        }
    }

    #[test]
    fn stage_percentages_are_fixed() {
        let start = ProgressUpdate::initial(OperationKind::Export);
        let cases = [
            (ExportEvent::ExportStart, 5.0),
            (ExportEvent::BackupCreateStart, 10.0),
            (ExportEvent::ConfigExportStart, 15.0),
            (ExportEvent::ConfigExportComplete, 20.0),
            (
                ExportEvent::ExportComplete {
                    backup_file: "/tmp/b.zip".into(),
                },
                100.0,
            ),
        ];
        for (event, expected) in cases {
            assert!((export_progress(&event, &start).progress - expected).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn entry_progress_fills_twenty_to_hundred() {
        let previous = ProgressUpdate::new("Exporting files…", 20.0);
        let values: Vec<f64> = [0, 2, 4]
            .into_iter()
            .map(|n| export_progress(&entries(n, 4), &previous).progress)
            .collect();
        assert_eq!(values, vec![20.0, 60.0, 100.0]);
        assert_eq!(
            export_progress(&entries(2, 4), &previous).status_message,
            "Exporting files…"
        );
    }

    #[test]
    fn entry_progress_is_clamped() {
        let previous = ProgressUpdate::new("", 20.0);
        assert!((export_progress(&entries(9, 4), &previous).progress - 100.0).abs() < f64::EPSILON);
        assert!((export_progress(&entries(0, 0), &previous).progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn stages_without_percentage_keep_previous_value() {
        let previous = ProgressUpdate::new("Creating backup…", 42.0);
        let next = export_progress(&ExportEvent::DatabaseExportStart, &previous);
        assert!((next.progress - 42.0).abs() < f64::EPSILON);
        assert_eq!(next.status_message, "Exporting database…");
    }

    #[test]
    fn import_mapping() {
        let start = ProgressUpdate::initial(OperationKind::Import);
        let half = import_progress(
            &ImportEvent::BackupExtractProgress {
                processed: 1,
                total: 2,
            },
            &start,
        );
        assert!((half.progress - 30.0).abs() < f64::EPSILON);
        let done = import_progress(&ImportEvent::ImportComplete, &half);
        assert!((done.progress - 100.0).abs() < f64::EPSILON);
    }
}
