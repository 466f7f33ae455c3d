//! Out-of-band status notifications
//!
//! Soft failures (decode anomalies, reconnect attempts, open/close problems)
//! never abort the caller. They are pushed to an injected callback so the
//! hosting device server can reflect them in its own state/status.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Severity of a status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatusLevel {
    /// Informational
    Info,
    /// Recoverable problem
    Warning,
    /// Failure needing attention
    Error,
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusLevel::Info => "INFO",
            StatusLevel::Warning => "WARNING",
            StatusLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Callback receiving status notifications.
pub type StatusCallback = Arc<dyn Fn(StatusLevel, &str) + Send + Sync>;

/// Fan-out point for status notifications; also logs every message.
#[derive(Clone, Default)]
pub struct StatusNotifier {
    callback: Option<StatusCallback>,
}

impl StatusNotifier {
    /// Notifier forwarding to `callback`.
    pub fn new(callback: StatusCallback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    /// A notifier that only logs.
    pub fn silent() -> Self {
        Self { callback: None }
    }

    /// Log `message` and hand it to the callback.
    pub fn push(&self, level: StatusLevel, message: &str) {
        match level {
            StatusLevel::Info => info!("{}", message),
            StatusLevel::Warning => warn!("{}", message),
            StatusLevel::Error => error!("{}", message),
        }

        let Some(callback) = &self.callback else {
            warn!(%level, "No callback to push status: {}", message);
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| callback(level, message))).is_err() {
            error!(%level, "Status callback panicked while pushing: {}", message);
        }
    }

    /// Push at [`StatusLevel::Info`].
    pub fn info(&self, message: &str) {
        self.push(StatusLevel::Info, message);
    }

    /// Push at [`StatusLevel::Warning`].
    pub fn warning(&self, message: &str) {
        self.push(StatusLevel::Warning, message);
    }

    /// Push at [`StatusLevel::Error`].
    pub fn error(&self, message: &str) {
        self.push(StatusLevel::Error, message);
    }
}

impl fmt::Debug for StatusNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusNotifier")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Collects notifications in memory, for tests and diagnostics.
#[derive(Clone, Default)]
pub struct StatusLog {
    entries: Arc<std::sync::Mutex<Vec<(StatusLevel, String)>>>,
}

impl StatusLog {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifier that appends to this log.
    pub fn notifier(&self) -> StatusNotifier {
        let entries = Arc::clone(&self.entries);
        StatusNotifier::new(Arc::new(move |level: StatusLevel, message: &str| {
            if let Ok(mut entries) = entries.lock() {
                entries.push((level, message.to_string()));
            }
        }))
    }

    /// Everything pushed so far, oldest first.
    pub fn entries(&self) -> Vec<(StatusLevel, String)> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// True if any entry at `level` contains `needle`.
    pub fn contains(&self, level: StatusLevel, needle: &str) -> bool {
        self.entries()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }

    /// Forget collected messages.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
