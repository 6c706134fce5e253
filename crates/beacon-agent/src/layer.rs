use std::fmt;
use std::sync::Weak;

use beacon_types::{CapturedEvent, ConsoleMethod, EventBody, SourceLocation};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::link::Transport;

/// Targets whose events are never forwarded. The agent's own diagnostics
/// and the websocket stack would otherwise feed back into the connection.
const IGNORED_TARGETS: &[&str] = &["beacon_agent", "tungstenite", "tokio_tungstenite"];

/// Forwards `tracing` events as console events: `ERROR` as `error`, `WARN`
/// as `warn`, `INFO` as `info`, and anything finer as `debug`.
///
/// ```ignore
/// tracing_subscriber::registry()
///     .with(tracing_subscriber::fmt::layer())
///     .with(agent.layer())
///     .init();
/// ```
pub struct CaptureLayer {
    transport: Weak<Transport>,
}

impl CaptureLayer {
    pub(crate) fn new(transport: Weak<Transport>) -> Self {
        Self { transport }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if is_ignored(meta.target()) {
            return;
        }
        let Some(transport) = self.transport.upgrade() else {
            return;
        };

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message.unwrap_or_default();

        let mut args = vec![Value::String(message.clone())];
        if !visitor.fields.is_empty() {
            args.push(Value::Object(visitor.fields));
        }

        let method = match *meta.level() {
            Level::ERROR => ConsoleMethod::Error,
            Level::WARN => ConsoleMethod::Warn,
            Level::INFO => ConsoleMethod::Info,
            _ => ConsoleMethod::Debug,
        };
        let source = meta.file().map(|file| SourceLocation {
            file: file.to_string(),
            line: meta.line(),
            column: None,
        });

        transport.lock().deliver(CapturedEvent::now(EventBody::Console {
            method,
            message,
            args,
            source,
        }));
    }
}

fn is_ignored(target: &str) -> bool {
    IGNORED_TARGETS.iter().any(|prefix| {
        target == *prefix
            || target
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with("::"))
    })
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, Value::String(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_and_transport_targets_are_ignored() {
        assert!(is_ignored("beacon_agent"));
        assert!(is_ignored("beacon_agent::link"));
        assert!(is_ignored("tungstenite::protocol"));
        assert!(!is_ignored("beacon_agent_demo"));
        assert!(!is_ignored("my_app::handlers"));
    }
}
