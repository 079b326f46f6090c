//! # studio-core
//!
//! `studio-core` holds the data model shared by the `studio-server` daemon and
//! its clients: sites, the persisted user-data document, configuration, the
//! export/import event taxonomy and the IPC protocol.
//!
//! ## Architecture
//!
//! ```mermaid
//! graph TD
//!     Server[studio-server] -->|Uses| Core[studio-core]
//!     UI[desktop UI] -->|IPC| Server
//!
//!     Core --> Site[Sites & State]
//!     Core --> UserData[User Data]
//!     Core --> Export[Export / Import Events]
//!     Core --> IPC[IPC Protocol]
//! ```
//!
//! ## Key Modules
//!
//! *   [`site`]: Site identity, persisted details and server state.
//! *   [`user_data`]: The `appdata-v1.json` document.
//! *   [`config`]: The daemon's `config.toml` schema.
//! *   [`export`] / [`import`]: Backup options and stage events.
//! *   [`progress`]: Event to percentage mapping.
//! *   [`ipc`]: Requests, responses and bus events.

// =========================================================================
//  Strict Lints: Safety, Hygiene, and Documentation
// =========================================================================

// 1. Logic & Safety
#![warn(clippy::manual_let_else)] // Enforces clean "Guard Clause" style
#![warn(clippy::unwrap_used)] // Force error propagation (no panics)
#![warn(clippy::expect_used)] // Force error propagation
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

// 2. Numeric Safety (Critical for Ports)
#![warn(clippy::cast_possible_truncation)] // Warn on u64 -> u32 (potential data loss)
#![warn(clippy::cast_possible_wrap)] // Warn on u32 -> i32 (potential overflow)

// 3. Observability
#![warn(clippy::print_stderr)] // Ban eprintln! (Use tracing::error!)

// 4. Import Hygiene
#![warn(clippy::wildcard_imports)] // Ban `use crate::*` (Explicit imports only)
#![warn(clippy::shadow_unrelated)] // Ban accidental variable shadowing

// 5. Documentation
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]

pub mod config;
#[doc(inline)]
pub use config::StudioConfig;
pub mod export;
#[doc(inline)]
pub use export::{ArchiveFormat, BackupContents, ExportEvent, ExportIncludes, ExportOptions};
pub mod import;
#[doc(inline)]
pub use import::{ImportEvent, ImportOptions};
pub mod ipc;
#[doc(inline)]
pub use ipc::{IpcRequest, IpcResponse, LogEntry, StudioEvent};
pub mod progress;
#[doc(inline)]
pub use progress::{OperationKind, ProgressUpdate};
pub mod site;
#[doc(inline)]
pub use site::{ServerState, SiteDetails, SiteId, ThemeDetails};
pub mod user_data;
#[doc(inline)]
pub use user_data::UserData;
