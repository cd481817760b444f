//! Channel error taxonomy.
//!
//! Transport failures and abnormal closures are handled inside the
//! connection loop (they become state transitions plus notifications);
//! the variants here are what the public API surfaces to callers.

// Rust guideline compliant 2026-02

/// Errors surfaced by channel operations.
#[derive(Debug)]
pub enum ChannelError {
    /// Connect failure or abnormal close reported by the transport.
    Transport(String),
    /// The channel is not Open; commands are rejected synchronously
    /// with no queueing. The caller re-issues after reconnection.
    NotReady,
    /// A malformed inbound frame. The frame is dropped and the
    /// connection stays open.
    Parse(String),
    /// Automatic reconnection gave up after the configured number of
    /// attempts. Only a manual `reconnect()` restarts the channel.
    MaxAttemptsExceeded {
        /// Number of attempts made before giving up.
        attempts: u32,
    },
    /// Failed to encode an outbound command payload.
    Serialization(String),
    /// The channel handle has been closed.
    Closed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::NotReady => write!(f, "Channel not ready"),
            Self::Parse(msg) => write!(f, "Parse error: {msg}"),
            Self::MaxAttemptsExceeded { attempts } => {
                write!(f, "Reconnection gave up after {attempts} attempts")
            }
            Self::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            Self::Closed => write!(f, "Channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {}
