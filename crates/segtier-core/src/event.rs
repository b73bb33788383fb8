//! Operational events emitted by the archival and retrieval paths.
//!
//! Events are fire-and-forget: the core builds one, hands it to an
//! [`EventSink`] synchronously and never reads it back.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Immutable record of one operational occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Debug-level chatter rather than an operator-facing event.
    pub debug: bool,
    /// Operation that produced the event (e.g. `"purge"`, `"range_read"`).
    pub op: &'static str,
    /// File or object the event concerns; empty when not applicable.
    pub file: String,
    pub msg: Option<String>,
    pub warning: Option<String>,
    pub error: Option<String>,
}

impl Event {
    fn base(op: &'static str, file: impl Into<String>) -> Self {
        Self {
            debug: false,
            op,
            file: file.into(),
            msg: None,
            warning: None,
            error: None,
        }
    }

    #[must_use]
    pub fn debug(op: &'static str, file: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            debug: true,
            msg: Some(msg.into()),
            ..Self::base(op, file)
        }
    }

    #[must_use]
    pub fn info(op: &'static str, file: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            msg: Some(msg.into()),
            ..Self::base(op, file)
        }
    }

    #[must_use]
    pub fn warning(op: &'static str, file: impl Into<String>, warning: impl fmt::Display) -> Self {
        Self {
            warning: Some(warning.to_string()),
            ..Self::base(op, file)
        }
    }

    #[must_use]
    pub fn error(
        op: &'static str,
        file: impl Into<String>,
        error: impl fmt::Display,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            msg: Some(msg.into()),
            error: Some(error.to_string()),
            ..Self::base(op, file)
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.warning.is_some()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.op)?;
        if !self.file.is_empty() {
            write!(f, " {}", self.file)?;
        }
        if let Some(msg) = &self.msg {
            write!(f, ": {msg}")?;
        }
        if let Some(warning) = &self.warning {
            write!(f, " (warning: {warning})")?;
        }
        if let Some(error) = &self.error {
            write!(f, " (error: {error})")?;
        }
        Ok(())
    }
}

/// Receiver of operational events.
///
/// Implementations must return quickly; they are called inline on the
/// archival and retrieval paths.
pub trait EventSink: Send + Sync {
    fn report_event(&self, event: Event);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn report_event(&self, event: Event) {
        (**self).report_event(event);
    }
}

/// Forwards events to `tracing` at a level derived from their contents.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn report_event(&self, event: Event) {
        let Event {
            debug,
            op,
            file,
            msg,
            warning,
            error,
        } = event;
        let msg = msg.unwrap_or_default();

        if let Some(error) = error {
            tracing::error!(op, file = %file, error = %error, "{}", msg);
        } else if let Some(warning) = warning {
            tracing::warn!(op, file = %file, warning = %warning, "{}", msg);
        } else if debug {
            tracing::debug!(op, file = %file, "{}", msg);
        } else {
            tracing::info!(op, file = %file, "{}", msg);
        }
    }
}

/// Collects events in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<Event> {
        self.events.lock().iter().filter(|e| e.is_error()).cloned().collect()
    }

    #[must_use]
    pub fn warnings(&self) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.is_warning())
            .cloned()
            .collect()
    }

    /// Events whose message contains `needle`.
    #[must_use]
    pub fn with_msg(&self, needle: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.msg.as_deref().is_some_and(|m| m.contains(needle)))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemoryEventSink {
    fn report_event(&self, event: Event) {
        self.events.lock().push(event);
    }
}
