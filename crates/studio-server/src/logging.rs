use std::str::FromStr;
use studio_core::ipc::{LogEntry, LogStream};
use studio_core::{SiteId, StudioEvent};
use tokio::sync::broadcast::Sender;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Republishes every log event on the daemon's event bus so IPC subscribers
/// can tail it.
#[derive(Debug)]
pub struct BroadcastLayer {
    pub sender: Sender<StudioEvent>,
}

impl<S> Layer<S> for BroadcastLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Nobody is listening
        if self.sender.receiver_count() == 0 {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let level = *event.metadata().level();
        let stream = if level <= Level::WARN {
            LogStream::Stderr
        } else {
            LogStream::Stdout
        };

        let entry = LogEntry {
            site: visitor.site,
            message: visitor.message,
            stream,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        // Ignore errors (no receivers)
        let _ = self.sender.send(StudioEvent::Log(entry));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    site: Option<SiteId>,
}

impl MessageVisitor {
    fn record_site(&mut self, value: &str) {
        self.site = SiteId::from_str(value).ok();
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "site" => self.record_site(&format!("{value:?}")),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "site" => self.record_site(value),
            _ => {}
        }
    }
}
