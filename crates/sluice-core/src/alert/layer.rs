use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{Signal, SignalSender};

/// Substrings that turn a log line into an alert signal by default.
pub const DEFAULT_PATTERNS: &[&str] = &[
    "Error",
    "Logging error",
    "Error creating schedule trigger",
];

/// Notifier output is never matched.
const OWN_TARGET: &str = "sluice_core::alert";

/// Forwards a `LogMatch` signal for every configured pattern found in an
/// event's message or field values.
pub struct ErrorPatternLayer {
    patterns: Vec<String>,
    signals: SignalSender,
}

impl ErrorPatternLayer {
    pub fn new(patterns: Vec<String>, signals: SignalSender) -> Self {
        Self { patterns, signals }
    }

    pub fn with_default_patterns(signals: SignalSender) -> Self {
        Self::new(DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(), signals)
    }
}

/// Flattens message and field values into one line of text.
#[derive(Default)]
struct TextVisitor {
    text: String,
}

impl Visit for TextVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        let _ = write!(self.text, " {}={}", field.name(), value);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.text, " {value:?}");
        } else {
            let _ = write!(self.text, " {}={:?}", field.name(), value);
        }
    }
}

impl<S> Layer<S> for ErrorPatternLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() == OWN_TARGET {
            return;
        }
        let mut visitor = TextVisitor::default();
        event.record(&mut visitor);

        for pattern in &self.patterns {
            if visitor.text.contains(pattern.as_str()) {
                self.signals.emit(Signal::LogMatch {
                    pattern: pattern.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;
    use crate::alert::signal_channel;

    fn matched_patterns(log: impl FnOnce()) -> Vec<String> {
        let (tx, rx) = signal_channel(16);
        let subscriber =
            tracing_subscriber::registry().with(ErrorPatternLayer::with_default_patterns(tx));
        tracing::subscriber::with_default(subscriber, log);
        rx.try_iter()
            .map(|signal| match signal {
                Signal::LogMatch { pattern } => pattern,
                other => panic!("unexpected signal {other:?}"),
            })
            .collect()
    }

    #[test]
    fn matches_message_text() {
        let matched = matched_patterns(|| {
            tracing::error!(
                error_code = "schedule_enqueue_failed",
                "Error creating schedule trigger for daily-ingest"
            );
        });
        assert_eq!(matched, vec!["Error", "Error creating schedule trigger"]);
    }

    #[test]
    fn matches_field_values() {
        let matched = matched_patterns(|| {
            tracing::warn!(detail = "Logging error while flushing", "stage finished");
        });
        assert_eq!(matched, vec!["Logging error"]);
    }

    #[test]
    fn quiet_lines_do_not_match() {
        let matched = matched_patterns(|| {
            tracing::info!(queue = "nlp-queue", "message acknowledged");
        });
        assert!(matched.is_empty());
    }
}
