//! Forwards runtime tracing events into a channel so an editor can surface
//! interpreter warnings next to the program that produced them.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

#[derive(Debug, Clone, Serialize)]
pub struct LogEnvelope {
    pub timestamp_ms: u64,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Tracing layer that sends `rover::*` events at or above `min_level`.
#[derive(Clone)]
pub struct DiagnosticForwardLayer {
    sender: Sender<LogEnvelope>,
    min_level: Level,
}

impl DiagnosticForwardLayer {
    pub fn new(sender: Sender<LogEnvelope>, min_level: Level) -> Self {
        Self { sender, min_level }
    }

    /// Layer plus the receiving end of its channel.
    pub fn channel(min_level: Level) -> (Self, Receiver<LogEnvelope>) {
        let (sender, receiver) = unbounded();
        (Self::new(sender, min_level), receiver)
    }
}

impl<S> Layer<S> for DiagnosticForwardLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // `Level` orders verbosity: TRACE > DEBUG > INFO > WARN > ERROR.
        if *metadata.level() > self.min_level || !metadata.target().starts_with("rover::") {
            return;
        }
        let mut fields = FieldMap::default();
        event.record(&mut fields);
        let mut fields = fields.0;
        let message = match fields.remove("message") {
            Some(serde_json::Value::String(text)) => text,
            _ => metadata.target().to_string(),
        };
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let _ = self.sender.send(LogEnvelope {
            timestamp_ms,
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message,
            fields,
        });
    }
}

/// Event fields as JSON; formatted values become strings.
#[derive(Default)]
struct FieldMap(serde_json::Map<String, serde_json::Value>);

impl Visit for FieldMap {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}").into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }
}
