//! Export option and event types shared by the daemon and its clients.

use crate::site::SiteDetails;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// The `wp-content` subdirectories an export can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    Uploads,
    Plugins,
    Themes,
}

impl ContentCategory {
    pub const ALL: [Self; 3] = [Self::Uploads, Self::Plugins, Self::Themes];

    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Uploads => "uploads",
            Self::Plugins => "plugins",
            Self::Themes => "themes",
        }
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportIncludes {
    #[serde(default = "yes")]
    pub database: bool,
    #[serde(default = "yes")]
    pub uploads: bool,
    #[serde(default = "yes")]
    pub plugins: bool,
    #[serde(default = "yes")]
    pub themes: bool,
}

const fn yes() -> bool {
    true
}

impl Default for ExportIncludes {
    fn default() -> Self {
        Self {
            database: true,
            uploads: true,
            plugins: true,
            themes: true,
        }
    }
}

impl ExportIncludes {
    /// Only the database.
    #[must_use]
    pub const fn database_only() -> Self {
        Self {
            database: true,
            uploads: false,
            plugins: false,
            themes: false,
        }
    }

    #[must_use]
    pub const fn includes(&self, category: ContentCategory) -> bool {
        match category {
            ContentCategory::Uploads => self.uploads,
            ContentCategory::Plugins => self.plugins,
            ContentCategory::Themes => self.themes,
        }
    }

    pub fn categories(&self) -> impl Iterator<Item = ContentCategory> + '_ {
        ContentCategory::ALL
            .into_iter()
            .filter(|category| self.includes(*category))
    }
}

/// Input of one export. Not changed while the export runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    pub site: SiteDetails,
    pub backup_file: PathBuf,
    #[serde(default)]
    pub includes: ExportIncludes,
    pub php_version: String,
}

impl ExportOptions {
    #[must_use]
    pub fn new(site: SiteDetails, backup_file: PathBuf, includes: ExportIncludes) -> Self {
        let php_version = site.php_version.clone();
        Self {
            site,
            backup_file,
            includes,
            php_version,
        }
    }

    #[must_use]
    pub fn format(&self) -> ArchiveFormat {
        ArchiveFormat::from_path(&self.backup_file)
    }
}

/// Container written for a backup, picked from the destination file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    Sql,
}

impl ArchiveFormat {
    /// `.zip` and `.sql` are recognised by extension; everything else is
    /// written as gzip-compressed tar.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match extension.as_deref() {
            Some("zip") => Self::Zip,
            Some("sql") => Self::Sql,
            _ => Self::TarGz,
        }
    }
}

/// Files an export will put into the archive, collected once by scanning
/// the site directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupContents {
    pub wp_config: PathBuf,
    /// Absolute file paths per included category.
    pub wp_content: BTreeMap<ContentCategory, Vec<PathBuf>>,
    /// SQL dumps produced for this export.
    pub sql_files: Vec<PathBuf>,
}

impl BackupContents {
    #[must_use]
    pub fn content_file_count(&self) -> usize {
        self.wp_content.values().map(Vec::len).sum()
    }

    /// Entries the archive will hold: wp-config, content files, SQL dumps
    /// and `meta.json`.
    #[must_use]
    pub fn total_entries(&self, include_database: bool) -> usize {
        let sql = if include_database {
            self.sql_files.len().max(1)
        } else {
            0
        };
        1 + self.content_file_count() + sql + 1
    }

    #[must_use]
    pub fn count(&self, category: ContentCategory) -> usize {
        self.wp_content.get(&category).map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryProgress {
    pub processed: usize,
    pub total: usize,
}

/// Stage events emitted by an exporter, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "SCREAMING_SNAKE_CASE"
)]
pub enum ExportEvent {
    ExportStart,
    BackupCreateStart,
    ConfigExportStart,
    ConfigExportComplete,
    WpContentExportStart,
    WpContentExportProgress {
        category: ContentCategory,
        path: PathBuf,
        processed: usize,
        total: usize,
    },
    WpContentExportComplete {
        uploads: usize,
        plugins: usize,
        themes: usize,
    },
    DatabaseExportStart,
    DatabaseExportComplete,
    BackupCreateProgress {
        entries: EntryProgress,
    },
    BackupCreateComplete,
    ExportComplete {
        backup_file: PathBuf,
    },
    ExportError {
        message: String,
    },
}

impl ExportEvent {
    /// Per-entry progress events, as opposed to stage transitions.
    #[must_use]
    pub const fn is_progress(&self) -> bool {
        matches!(
            self,
            Self::WpContentExportProgress { .. } | Self::BackupCreateProgress { .. }
        )
    }

    /// The wire name of the event, e.g. `EXPORT_START`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ExportStart => "EXPORT_START",
            Self::BackupCreateStart => "BACKUP_CREATE_START",
            Self::ConfigExportStart => "CONFIG_EXPORT_START",
            Self::ConfigExportComplete => "CONFIG_EXPORT_COMPLETE",
            Self::WpContentExportStart => "WP_CONTENT_EXPORT_START",
            Self::WpContentExportProgress { .. } => "WP_CONTENT_EXPORT_PROGRESS",
            Self::WpContentExportComplete { .. } => "WP_CONTENT_EXPORT_COMPLETE",
            Self::DatabaseExportStart => "DATABASE_EXPORT_START",
            Self::DatabaseExportComplete => "DATABASE_EXPORT_COMPLETE",
            Self::BackupCreateProgress { .. } => "BACKUP_CREATE_PROGRESS",
            Self::BackupCreateComplete => "BACKUP_CREATE_COMPLETE",
            Self::ExportComplete { .. } => "EXPORT_COMPLETE",
            Self::ExportError { .. } => "EXPORT_ERROR",
        }
    }
}

/// Site metadata written to `meta.json` inside a full backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMeta {
    #[serde(default)]
    pub site_url: String,
    #[serde(default)]
    pub php_version: String,
    #[serde(default)]
    pub wordpress_version: String,
    #[serde(default)]
    pub plugins: Vec<InventoryItem>,
    #[serde(default)]
    pub themes: Vec<InventoryItem>,
}

/// A plugin or theme as listed by `wp plugin list --format=json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_follows_extension() {
        assert_eq!(ArchiveFormat::from_path(Path::new("/b/site.zip")), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::from_path(Path::new("/b/site.ZIP")), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::from_path(Path::new("/b/site.sql")), ArchiveFormat::Sql);
        assert_eq!(
            ArchiveFormat::from_path(Path::new("/b/site.tar.gz")),
            ArchiveFormat::TarGz
        );
        assert_eq!(ArchiveFormat::from_path(Path::new("/b/site")), ArchiveFormat::TarGz);
    }

    #[test]
    fn events_use_stage_names_on_the_wire() {
        let json = serde_json::to_value(ExportEvent::BackupCreateProgress {
            entries: EntryProgress {
                processed: 2,
                total: 4,
            },
        })
        .unwrap();
        assert_eq!(json["event"], "BACKUP_CREATE_PROGRESS");
        assert_eq!(json["data"]["entries"]["processed"], 2);

        let json = serde_json::to_value(ExportEvent::ExportStart).unwrap();
        assert_eq!(json["event"], ExportEvent::ExportStart.name());
    }

    #[test]
    fn totals_count_config_sql_and_meta() {
        let mut contents = BackupContents::default();
        contents.wp_content.insert(
            ContentCategory::Plugins,
            vec![PathBuf::from("a.php"), PathBuf::from("b.php")],
        );
        assert_eq!(contents.total_entries(false), 4);
        assert_eq!(contents.total_entries(true), 5);
        assert_eq!(contents.count(ContentCategory::Uploads), 0);
    }

    #[test]
    fn includes_filter_categories() {
        let includes = ExportIncludes {
            uploads: false,
            ..ExportIncludes::default()
        };
        let categories: Vec<_> = includes.categories().collect();
        assert_eq!(categories, vec![ContentCategory::Plugins, ContentCategory::Themes]);
        assert_eq!(ExportIncludes::database_only().categories().count(), 0);
    }
}
