//! Operator notification seam
//!
//! Credential and chat failures are pushed to a `NotificationSink`. Sinks are
//! fire-and-forget: `notify` returns immediately and a sink that fails to
//! deliver must swallow the failure. The service binary plugs in a Discord
//! webhook sink; `LogSink` is the fallback when no webhook is configured.

use std::fmt;

use tracing::{error, info, warn};

/// How loudly an operator should hear about an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One operator-facing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
    /// Subsystem that raised it, e.g. `credential-store` or `chat-supervisor`
    pub component: String,
    /// Underlying error text, if any
    pub detail: Option<String>,
}

impl Notification {
    pub fn new(severity: Severity, component: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            component: component.to_owned(),
            detail: None,
        }
    }

    pub fn warning(component: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, component, message)
    }

    pub fn critical(component: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, component, message)
    }

    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }
}

/// Destination for operator notifications.
pub trait NotificationSink: Send + Sync {
    /// Deliver a notification without blocking the caller.
    fn notify(&self, notification: Notification);
}

/// Count a notification in `notifications_total{severity}`. Sinks call this
/// once per accepted notification.
pub fn record(notification: &Notification) {
    metrics::counter!("notifications_total", "severity" => notification.severity.label())
        .increment(1);
}

/// Sink that only writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notification: Notification) {
        record(&notification);
        let detail = notification.detail.as_deref().unwrap_or("");
        match notification.severity {
            Severity::Info => info!(
                component = %notification.component,
                detail,
                "{}",
                notification.message
            ),
            Severity::Warning => warn!(
                component = %notification.component,
                detail,
                "{}",
                notification.message
            ),
            Severity::Critical => error!(
                component = %notification.component,
                detail,
                "{}",
                notification.message
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_severity_and_component() {
        let n = Notification::critical("chat-supervisor", "reconnect budget exhausted")
            .with_detail("connection refused");
        assert_eq!(n.severity, Severity::Critical);
        assert_eq!(n.component, "chat-supervisor");
        assert_eq!(n.detail.as_deref(), Some("connection refused"));
    }

    #[test]
    fn severity_labels_are_lowercase() {
        assert_eq!(Severity::Warning.to_string(), "warning");
        assert_eq!(Severity::Critical.label(), "critical");
    }

    #[test]
    fn log_sink_accepts_every_severity() {
        let sink = LogSink;
        for severity in [Severity::Info, Severity::Warning, Severity::Critical] {
            sink.notify(Notification::new(severity, "test", "message"));
        }
    }
}
