use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use studio_core::progress::{export_progress, import_progress};
use studio_core::{ExportEvent, ImportEvent, OperationKind, ProgressUpdate, SiteId, StudioEvent};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
struct Operation {
    kind: OperationKind,
    update: ProgressUpdate,
}

/// In-flight export and import operations, at most one per site.
#[derive(Debug, Clone)]
pub struct OperationTracker {
    operations: Arc<Mutex<HashMap<SiteId, Operation>>>,
    events: broadcast::Sender<StudioEvent>,
}

impl OperationTracker {
    #[must_use]
    pub fn new(events: broadcast::Sender<StudioEvent>) -> Self {
        Self {
            operations: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Register an operation for `site`.
    ///
    /// Returns `None` while another operation for the same site is running.
    /// The entry is removed when the returned guard drops.
    #[must_use]
    pub fn begin(&self, site: SiteId, kind: OperationKind) -> Option<OperationGuard> {
        let mut operations = self
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if operations.contains_key(&site) {
            return None;
        }
        operations.insert(
            site,
            Operation {
                kind,
                update: ProgressUpdate::initial(kind),
            },
        );
        Some(OperationGuard {
            tracker: self.clone(),
            site,
            kind,
        })
    }

    #[must_use]
    pub fn progress(&self, site: SiteId) -> Option<ProgressUpdate> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&site)
            .map(|op| op.update.clone())
    }

    #[must_use]
    pub fn kind(&self, site: SiteId) -> Option<OperationKind> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&site)
            .map(|op| op.kind)
    }

    fn apply<F>(&self, site: SiteId, kind: OperationKind, finished: bool, next: F)
    where
        F: FnOnce(&ProgressUpdate) -> ProgressUpdate,
    {
        let update = {
            let mut operations = self
                .operations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(op) = operations.get_mut(&site) else {
                return;
            };
            op.update = next(&op.update);
            op.update.clone()
        };

        // No subscribers is fine
        let _ = self.events.send(StudioEvent::Progress {
            site_id: site,
            kind,
            update,
            finished,
        });
    }

    fn finish(&self, site: SiteId) {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&site);
    }
}

/// Holds a site's operation slot. Relays events while alive and frees the
/// slot on drop, whether the operation finished, failed or panicked.
#[derive(Debug)]
pub struct OperationGuard {
    tracker: OperationTracker,
    site: SiteId,
    kind: OperationKind,
}

impl OperationGuard {
    pub fn export_event(&self, event: &ExportEvent) {
        let finished = matches!(
            event,
            ExportEvent::ExportComplete { .. } | ExportEvent::ExportError { .. }
        );
        self.tracker
            .apply(self.site, self.kind, finished, |prev| export_progress(event, prev));
    }

    pub fn import_event(&self, event: &ImportEvent) {
        let finished = matches!(
            event,
            ImportEvent::ImportComplete | ImportEvent::ImportError { .. }
        );
        self.tracker
            .apply(self.site, self.kind, finished, |prev| import_progress(event, prev));
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.site);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use studio_core::export::EntryProgress;

    #[test]
    fn one_operation_per_site() {
        let (tx, _) = broadcast::channel(16);
        let tracker = OperationTracker::new(tx);
        let site = SiteId::new();

        let guard = tracker.begin(site, OperationKind::Export).unwrap();
        assert!(tracker.begin(site, OperationKind::Import).is_none());
        assert!(tracker.begin(SiteId::new(), OperationKind::Export).is_some());

        drop(guard);
        assert!(tracker.progress(site).is_none());
        assert!(tracker.begin(site, OperationKind::Import).is_some());
    }

    #[tokio::test]
    async fn events_are_relayed_in_order() {
        let (tx, mut rx) = broadcast::channel(16);
        let tracker = OperationTracker::new(tx);
        let site = SiteId::new();
        let guard = tracker.begin(site, OperationKind::Export).unwrap();

        guard.export_event(&ExportEvent::ExportStart);
        guard.export_event(&ExportEvent::BackupCreateProgress {
            entries: EntryProgress {
                processed: 2,
                total: 4,
            },
        });
        assert!((tracker.progress(site).unwrap().progress - 60.0).abs() < f64::EPSILON);

        let mut seen = Vec::new();
        while let Ok(StudioEvent::Progress { update, .. }) = rx.try_recv() {
            seen.push(update.progress);
        }
        assert_eq!(seen, vec![5.0, 60.0]);
    }
}
