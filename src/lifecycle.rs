//! Connection lifecycle state machine.
//!
//! The machine is pure: [`Lifecycle::handle`] maps an event to a new
//! state plus a list of [`Effect`]s, and performs no I/O itself. The
//! connection loop in [`crate::channel`] owns the socket and timers and
//! interprets the effects; unit tests drive the machine directly with no
//! network.
//!
//! # Epochs
//!
//! Every connect effect carries a monotonically increasing epoch, and
//! every transport event reports the epoch of the socket that produced
//! it. Events whose epoch does not match the machine's current epoch
//! come from a superseded socket and are discarded. This replaces the
//! "is this surface still mounted" checks the dashboards used to carry.
//!
//! # Counter rules
//!
//! The reconnect attempt counter increments exactly once per scheduled
//! retry, before the timer fires. It resets to zero only on a transition
//! into `Open` and on a manual reconnect. Clean closes never touch it.

// Rust guideline compliant 2026-02

use std::time::Duration;

use crate::backoff::ReconnectPolicy;

/// WebSocket close codes treated as clean/no-status.
///
/// 1000 is a normal closure, 1005 is "no status received". Neither
/// drives the reconnect policy.
#[must_use]
pub fn is_clean_close(code: u16) -> bool {
    matches!(code, 1000 | 1005)
}

/// Connection state of a channel handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, `open()` not yet requested.
    Idle,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and ready; heartbeats are running.
    Open,
    /// A handle-initiated close is in progress.
    Closing,
    /// Closed. Reached by a handle close or a clean server close; no
    /// automatic reconnection happens from here.
    Closed,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting {
        /// Attempt counter after the increment for the scheduled retry
        /// (so the first retry reports 1).
        attempt: u32,
        /// Milliseconds until the retry fires, jitter included.
        next_retry_ms: u64,
    },
    /// Automatic reconnection gave up. Requires a manual reconnect.
    Failed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Idle
    }
}

impl ConnectionState {
    /// Whether commands may be sent in this state.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// An event fed into the lifecycle machine.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// The handle requested the initial open.
    OpenRequested,
    /// A connect attempt succeeded.
    Connected {
        /// Epoch of the socket that connected.
        epoch: u64,
    },
    /// A connect attempt failed (handshake error or connect timeout).
    ConnectFailed {
        /// Epoch of the failed attempt.
        epoch: u64,
        /// Failure description for logging.
        reason: String,
    },
    /// The peer closed the connection.
    PeerClosed {
        /// Epoch of the socket that closed.
        epoch: u64,
        /// WebSocket close code.
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
    /// The transport reported a read/write error on an open socket.
    TransportError {
        /// Epoch of the socket that errored.
        epoch: u64,
        /// Error description for logging.
        reason: String,
    },
    /// The scheduled retry timer fired.
    RetryDue,
    /// The caller requested a manual reconnect.
    ManualReconnect,
    /// The handle requested a terminal close.
    CloseRequested,
}

/// A side effect the connection loop must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Start a connect attempt tagged with this epoch.
    Connect {
        /// Epoch to tag the new socket with.
        epoch: u64,
    },
    /// Arm the retry timer.
    ScheduleRetry {
        /// Attempt counter after the increment (1-based for display).
        attempt: u32,
        /// Delay before the retry fires.
        delay: Duration,
    },
    /// Disarm any pending retry timer.
    CancelRetry,
    /// Start the heartbeat interval.
    StartHeartbeat,
    /// Tear down the heartbeat interval.
    StopHeartbeat,
    /// Detach from the socket and close it. Detaching first guarantees
    /// the close is never observed as an abnormal closure.
    CloseSocket,
    /// Surface "connected" to the consumer.
    NotifyOpen {
        /// True when this open follows an earlier one (a recovery).
        recovered: bool,
    },
    /// Surface the passive reconnect indicator.
    NotifyRetrying {
        /// Attempt counter after the increment.
        attempt: u32,
        /// Configured attempt limit.
        max_attempts: u32,
        /// Delay before the retry fires.
        delay: Duration,
    },
    /// Surface a clean close.
    NotifyClosed {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Surface the fatal, user-actionable give-up notification.
    NotifyFatal {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// The lifecycle machine for one channel handle.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempt: u32,
    epoch: u64,
    ever_opened: bool,
}

impl Lifecycle {
    /// Create a machine in `Idle` with the given reconnect policy.
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
            attempt: 0,
            epoch: 0,
            ever_opened: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Current reconnect attempt counter.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current socket epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Apply one event, returning the effects to perform in order.
    pub fn handle(&mut self, event: LifecycleEvent) -> Vec<Effect> {
        match event {
            LifecycleEvent::OpenRequested => self.on_open_requested(),
            LifecycleEvent::Connected { epoch } => self.on_connected(epoch),
            LifecycleEvent::ConnectFailed { epoch, reason } => {
                self.on_connect_failed(epoch, &reason)
            }
            LifecycleEvent::PeerClosed {
                epoch,
                code,
                reason,
            } => self.on_peer_closed(epoch, code, reason),
            LifecycleEvent::TransportError { epoch, reason } => {
                self.on_transport_error(epoch, &reason)
            }
            LifecycleEvent::RetryDue => self.on_retry_due(),
            LifecycleEvent::ManualReconnect => self.on_manual_reconnect(),
            LifecycleEvent::CloseRequested => self.on_close_requested(),
        }
    }

    fn on_open_requested(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Idle {
            log::debug!("[Lifecycle] OpenRequested ignored in {:?}", self.state);
            return Vec::new();
        }
        self.start_connect()
    }

    fn on_connected(&mut self, epoch: u64) -> Vec<Effect> {
        if self.stale(epoch) || self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        let recovered = self.ever_opened;
        self.ever_opened = true;
        // Attempt counter resets only here and on manual reconnect
        self.attempt = 0;
        self.state = ConnectionState::Open;
        vec![Effect::StartHeartbeat, Effect::NotifyOpen { recovered }]
    }

    fn on_connect_failed(&mut self, epoch: u64, reason: &str) -> Vec<Effect> {
        if self.stale(epoch) || self.state != ConnectionState::Connecting {
            return Vec::new();
        }
        log::warn!("[Lifecycle] Connect failed: {reason}");
        self.on_abnormal_closure()
    }

    fn on_peer_closed(&mut self, epoch: u64, code: u16, reason: String) -> Vec<Effect> {
        if self.stale(epoch) || self.state != ConnectionState::Open {
            return Vec::new();
        }
        if is_clean_close(code) {
            log::info!("[Lifecycle] Clean close (code {code})");
            self.state = ConnectionState::Closed;
            return vec![Effect::StopHeartbeat, Effect::NotifyClosed { code, reason }];
        }
        log::warn!("[Lifecycle] Abnormal close (code {code}): {reason}");
        let mut effects = vec![Effect::StopHeartbeat];
        effects.extend(self.on_abnormal_closure());
        effects
    }

    fn on_transport_error(&mut self, epoch: u64, reason: &str) -> Vec<Effect> {
        if self.stale(epoch) {
            return Vec::new();
        }
        match self.state {
            ConnectionState::Open => {
                log::warn!("[Lifecycle] Transport error: {reason}");
                let mut effects = vec![Effect::StopHeartbeat];
                effects.extend(self.on_abnormal_closure());
                effects
            }
            ConnectionState::Connecting => {
                log::warn!("[Lifecycle] Transport error during connect: {reason}");
                self.on_abnormal_closure()
            }
            _ => Vec::new(),
        }
    }

    fn on_retry_due(&mut self) -> Vec<Effect> {
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            // A timer that outlived a close or manual reconnect
            return Vec::new();
        }
        self.start_connect()
    }

    fn on_manual_reconnect(&mut self) -> Vec<Effect> {
        if matches!(self.state, ConnectionState::Closing) {
            return Vec::new();
        }
        let mut effects = vec![Effect::CancelRetry];
        if self.state == ConnectionState::Open {
            effects.push(Effect::StopHeartbeat);
            effects.push(Effect::CloseSocket);
        }
        self.attempt = 0;
        effects.extend(self.start_connect());
        effects
    }

    fn on_close_requested(&mut self) -> Vec<Effect> {
        self.state = ConnectionState::Closing;
        // Order matters: timer, heartbeat, then detach-and-close, so a
        // manual close can never be observed as an abnormal closure.
        let effects = vec![
            Effect::CancelRetry,
            Effect::StopHeartbeat,
            Effect::CloseSocket,
        ];
        self.state = ConnectionState::Closed;
        effects
    }

    /// Shared retry logic for every abnormal closure path.
    fn on_abnormal_closure(&mut self) -> Vec<Effect> {
        if self.policy.allows_attempt(self.attempt) {
            let delay = self.policy.delay_for(self.attempt);
            // Increment exactly once per scheduled retry, before the
            // timer fires
            self.attempt += 1;
            self.state = ConnectionState::Reconnecting {
                attempt: self.attempt,
                next_retry_ms: delay.as_millis().min(u128::from(u64::MAX)) as u64,
            };
            vec![
                Effect::ScheduleRetry {
                    attempt: self.attempt,
                    delay,
                },
                Effect::NotifyRetrying {
                    attempt: self.attempt,
                    max_attempts: self.policy.max_attempts,
                    delay,
                },
            ]
        } else {
            log::error!(
                "[Lifecycle] Giving up after {} reconnect attempts",
                self.attempt
            );
            self.state = ConnectionState::Failed;
            vec![Effect::NotifyFatal {
                attempts: self.attempt,
            }]
        }
    }

    fn start_connect(&mut self) -> Vec<Effect> {
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        vec![Effect::Connect { epoch: self.epoch }]
    }

    fn stale(&self, epoch: u64) -> bool {
        if epoch != self.epoch {
            log::debug!(
                "[Lifecycle] Discarding event from superseded socket (epoch {epoch}, current {})",
                self.epoch
            );
            true
        } else {
            false
        }
    }
}
