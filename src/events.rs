//! Notification events delivered to the consuming surface.
//!
//! The connection loop is the single producer; the dashboard drains the
//! receiver from its own event loop. Connection *state* is additionally
//! observable through `MachineChannel::watch_state()` — the events here
//! are the things a surface renders as toasts, console lines, and the
//! passive `attempt/max` reconnect indicator.

// Rust guideline compliant 2026-02

use std::time::Duration;

use tokio::sync::mpsc;

/// Severity carried on log and alert envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs operator attention soon.
    Warning,
    /// Needs operator attention now.
    Error,
}

impl Severity {
    /// Parse a wire `level` string, defaulting to `Info`.
    #[must_use]
    pub fn from_wire(level: Option<&str>) -> Self {
        match level {
            Some("error") => Self::Error,
            Some("warning") => Self::Warning,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Event from the connection loop delivered to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel reached Open.
    Connected {
        /// True when this open follows an earlier one (a recovery
        /// rather than the first connect).
        recovered: bool,
    },
    /// An abnormal closure was observed and a retry is scheduled.
    /// Render as a passive `attempt/max_attempts` indicator.
    Reconnecting {
        /// Attempt counter (1-based).
        attempt: u32,
        /// Configured attempt limit.
        max_attempts: u32,
        /// Delay before the retry fires, jitter included.
        delay: Duration,
    },
    /// The peer closed cleanly; no retry will happen.
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Automatic reconnection gave up. Render an actionable
    /// manual-retry control.
    Fatal {
        /// Attempts made before giving up.
        attempts: u32,
    },
    /// A log line from the machine for the dashboard console.
    Log {
        /// Severity from the envelope level.
        severity: Severity,
        /// Log text.
        message: String,
    },
    /// An operator-facing alert from the machine.
    Alert {
        /// Severity from the envelope type/level.
        severity: Severity,
        /// Alert text.
        message: String,
    },
}

/// Receiving side of a channel's event stream.
#[derive(Debug)]
pub struct ChannelEvents {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelEvents {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<ChannelEvent>) -> Self {
        Self { rx }
    }

    /// Await the next event. Returns `None` once the channel loop has
    /// exited and all queued events are drained.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive for frame-driven UIs.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_from_wire() {
        assert_eq!(Severity::from_wire(Some("error")), Severity::Error);
        assert_eq!(Severity::from_wire(Some("warning")), Severity::Warning);
        assert_eq!(Severity::from_wire(Some("info")), Severity::Info);
        assert_eq!(Severity::from_wire(Some("verbose")), Severity::Info);
        assert_eq!(Severity::from_wire(None), Severity::Info);
    }

    #[tokio::test]
    async fn test_events_drain_after_sender_drop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = ChannelEvents::new(rx);

        tx.send(ChannelEvent::Connected { recovered: false })
            .expect("send");
        drop(tx);

        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Connected { recovered: false })
        );
        assert_eq!(events.recv().await, None);
    }
}
