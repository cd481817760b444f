//! Machine control channel.
//!
//! One [`MachineChannel`] per dashboard surface per machine. The handle
//! spawns a background connection loop that owns the socket, the
//! lifecycle machine, the heartbeat interval, and the snapshot
//! reconciler; the handle itself only holds channel endpoints, so
//! several machine dashboards coexist safely in one process.
//!
//! # Architecture
//!
//! ```text
//!   MachineChannel                 background loop
//!        │                              │
//!        │  send(kind, payload)         │  ws::connect / reconnect
//!        │ ───────────────────────────► │  heartbeat tick → PING
//!        │  reconnect() / close()       │  frame → demux → reconcile
//!        │ ───────────────────────────► │
//!        │                              ▼
//!   watch_state() / watch_snapshot()  published read-only views
//!   ChannelEvents                     notifications (toasts, console)
//! ```
//!
//! All state mutation happens synchronously on the loop task, so
//! consumers always observe snapshots monotonic with arrival order.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::backoff::ReconnectPolicy;
use crate::config::ChannelConfig;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::ChannelError;
use crate::events::{ChannelEvent, ChannelEvents, Severity};
use crate::lifecycle::{ConnectionState, Effect, Lifecycle, LifecycleEvent};
use crate::reconcile::Reconciler;
use crate::snapshot::DeviceStateSnapshot;
use crate::ws::{self, WsFrame, WsReader, WsWriter};

/// Request from the handle to the connection loop.
#[derive(Debug)]
enum ControlRequest {
    /// Send a pre-encoded text frame.
    Send(String),
    /// Reset the attempt counter and reconnect now.
    Reconnect,
    /// Terminal close for this handle.
    Close,
}

/// Handle to one machine control channel.
///
/// Constructed once per logical connection need. `close()` is terminal:
/// it cancels any pending retry, tears down the heartbeat, detaches from
/// the socket before closing it, and releases the outstanding image
/// resource. Dropping the handle closes it.
#[derive(Debug)]
pub struct MachineChannel {
    control_tx: mpsc::UnboundedSender<ControlRequest>,
    state_rx: watch::Receiver<ConnectionState>,
    snapshot_rx: watch::Receiver<DeviceStateSnapshot>,
    shutdown: Arc<AtomicBool>,
}

impl MachineChannel {
    /// Open a channel and spawn its background connection loop.
    ///
    /// Returns the handle plus the notification event stream. The loop
    /// reconnects with jittered exponential backoff on abnormal
    /// closures until the configured attempt limit, then waits for
    /// [`Self::reconnect`].
    #[must_use]
    pub fn connect(config: ChannelConfig) -> (Self, ChannelEvents) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (snapshot_tx, snapshot_rx) = watch::channel(DeviceStateSnapshot::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let channel_loop = ChannelLoop {
            lifecycle: Lifecycle::new(ReconnectPolicy::from_config(&config)),
            config,
            reconciler: Reconciler::new(),
            socket: None,
            pending_connect: None,
            pending_retry: None,
            control_rx,
            events_tx,
            state_tx,
            snapshot_tx,
            shutdown: Arc::clone(&shutdown),
            handle_closed: false,
        };
        tokio::spawn(channel_loop.run());

        (
            Self {
                control_tx,
                state_rx,
                snapshot_rx,
                shutdown,
            },
            ChannelEvents::new(events_rx),
        )
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Read-only copy of the current device-state snapshot.
    #[must_use]
    pub fn snapshot(&self) -> DeviceStateSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch snapshot updates.
    #[must_use]
    pub fn watch_snapshot(&self) -> watch::Receiver<DeviceStateSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Send a command envelope to the machine.
    ///
    /// Fire-and-forget: the server is authoritative on command
    /// semantics and no acknowledgement is tracked.
    ///
    /// # Errors
    ///
    /// `ChannelError::NotReady` if the channel is not Open (no queueing;
    /// re-issue after reconnection), `ChannelError::Serialization` if
    /// the payload fails to encode, `ChannelError::Closed` if the
    /// handle has been closed.
    pub fn send<P: Serialize>(&self, kind: &str, payload: &P) -> Result<(), ChannelError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        self.send_envelope(&Envelope::new(kind, value))
    }

    /// Send a pre-built envelope. Same readiness rules as [`Self::send`].
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if !self.state_rx.borrow().is_open() {
            return Err(ChannelError::NotReady);
        }
        let text = serde_json::to_string(envelope)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;
        self.control_tx
            .send(ControlRequest::Send(text))
            .map_err(|_| ChannelError::Closed)
    }

    /// Manually reconnect, resetting the attempt counter. Works from
    /// any state, including Failed.
    pub fn reconnect(&self) {
        let _ = self.control_tx.send(ControlRequest::Reconnect);
    }

    /// Close the channel. Terminal for this handle: no further
    /// automatic reconnection, all timers cancelled, socket handlers
    /// detached before the socket closes.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.control_tx.send(ControlRequest::Close);
    }
}

impl Drop for MachineChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Why an open session ended.
#[derive(Debug)]
enum SessionExit {
    /// The peer sent a close frame.
    PeerClosed {
        code: u16,
        reason: String,
    },
    /// Read or write failed, or the stream ended without a close frame.
    TransportError(String),
    /// The handle requested a manual reconnect.
    ManualReconnect,
    /// The handle requested a terminal close.
    Close,
}

/// State owned by the background connection loop.
struct ChannelLoop {
    config: ChannelConfig,
    lifecycle: Lifecycle,
    reconciler: Reconciler,
    socket: Option<(WsWriter, WsReader)>,
    /// Epoch of a connect attempt the loop must start next.
    pending_connect: Option<u64>,
    /// Delay of a scheduled retry not yet slept out.
    pending_retry: Option<Duration>,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    state_tx: watch::Sender<ConnectionState>,
    snapshot_tx: watch::Sender<DeviceStateSnapshot>,
    shutdown: Arc<AtomicBool>,
    handle_closed: bool,
}

impl ChannelLoop {
    async fn run(mut self) {
        let effects = self.lifecycle.handle(LifecycleEvent::OpenRequested);
        self.apply_effects(effects).await;

        loop {
            self.publish_state();

            if self.handle_closed || self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            if let Some(epoch) = self.pending_connect.take() {
                let effects = self.connect_phase(epoch).await;
                self.apply_effects(effects).await;
                continue;
            }

            let effects = match self.lifecycle.state().clone() {
                ConnectionState::Open => {
                    let exit = self.open_session().await;
                    self.exit_to_effects(exit)
                }
                ConnectionState::Reconnecting { .. } => self.retry_phase().await,
                // Closed (clean server close) and Failed wait for a
                // manual reconnect or close; everything else is only
                // ever transient inside a phase.
                _ => self.idle_phase().await,
            };
            self.apply_effects(effects).await;
        }

        // Teardown: detach, close, release the image resource
        self.close_socket().await;
        self.reconciler.teardown();
        self.snapshot_tx
            .send_replace(self.reconciler.snapshot().clone());
        self.publish_state();
        log::info!("[Channel] Connection loop exited");
    }

    fn publish_state(&self) {
        let state = self.lifecycle.state().clone();
        if *self.state_tx.borrow() != state {
            self.state_tx.send_replace(state);
        }
    }

    /// One connect attempt, cancellable by control requests.
    async fn connect_phase(&mut self, epoch: u64) -> Vec<Effect> {
        log::info!(
            "[Channel] Connecting to {} (epoch {epoch})",
            self.config.url
        );
        tokio::select! {
            result = ws::connect(&self.config.url, self.config.connect_timeout) => {
                match result {
                    Ok(pair) => {
                        log::info!("[Channel] Connected");
                        self.socket = Some(pair);
                        self.lifecycle.handle(LifecycleEvent::Connected { epoch })
                    }
                    Err(e) => self.lifecycle.handle(LifecycleEvent::ConnectFailed {
                        epoch,
                        reason: e.to_string(),
                    }),
                }
            }
            req = self.control_rx.recv() => self.control_to_effects(req),
        }
    }

    /// Sleep out the scheduled retry, cancellable by control requests.
    async fn retry_phase(&mut self) -> Vec<Effect> {
        let delay = self.pending_retry.take().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = tokio::time::sleep(delay) => {
                self.lifecycle.handle(LifecycleEvent::RetryDue)
            }
            req = self.control_rx.recv() => self.control_to_effects(req),
        }
    }

    /// Wait for control requests while Closed or Failed.
    async fn idle_phase(&mut self) -> Vec<Effect> {
        let req = self.control_rx.recv().await;
        self.control_to_effects(req)
    }

    fn control_to_effects(&mut self, req: Option<ControlRequest>) -> Vec<Effect> {
        match req {
            Some(ControlRequest::Reconnect) => {
                log::info!("[Channel] Manual reconnect requested");
                self.lifecycle.handle(LifecycleEvent::ManualReconnect)
            }
            Some(ControlRequest::Send(_)) => {
                // The handle rejects sends while not Open; this is the
                // benign race where the state changed underneath it.
                log::debug!("[Channel] Dropping command sent while not open");
                Vec::new()
            }
            Some(ControlRequest::Close) | None => {
                self.handle_closed = true;
                self.lifecycle.handle(LifecycleEvent::CloseRequested)
            }
        }
    }

    /// Pump one open connection until it exits.
    ///
    /// Owns the heartbeat interval, so the liveness timer exists iff
    /// the channel is Open and dies with this function.
    async fn open_session(&mut self) -> SessionExit {
        let Some((writer, reader)) = self.socket.as_mut() else {
            return SessionExit::TransportError("socket missing at session start".into());
        };

        let ping = match serde_json::to_string(&Envelope::ping()) {
            Ok(text) => text,
            Err(e) => return SessionExit::TransportError(e.to_string()),
        };

        let start = tokio::time::Instant::now() + self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(start, self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = reader.recv() => match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        dispatch_text(
                            &text,
                            &mut self.reconciler,
                            &self.events_tx,
                            &self.snapshot_tx,
                        );
                    }
                    Some(Ok(WsFrame::Binary(bytes))) => {
                        // Image frames bypass JSON parsing entirely
                        self.reconciler.apply_image(bytes);
                        self.snapshot_tx
                            .send_replace(self.reconciler.snapshot().clone());
                    }
                    Some(Ok(WsFrame::Ping(data))) => {
                        if let Err(e) = writer.send_pong(data).await {
                            return SessionExit::TransportError(e.to_string());
                        }
                    }
                    Some(Ok(WsFrame::Pong(_))) => {}
                    Some(Ok(WsFrame::Close { code, reason })) => {
                        return SessionExit::PeerClosed { code, reason };
                    }
                    Some(Err(e)) => return SessionExit::TransportError(e.to_string()),
                    None => {
                        return SessionExit::TransportError(
                            "stream ended without close frame".into(),
                        );
                    }
                },
                _ = heartbeat.tick() => {
                    log::trace!("[Channel] Heartbeat");
                    if let Err(e) = writer.send_text(&ping).await {
                        return SessionExit::TransportError(e.to_string());
                    }
                }
                req = self.control_rx.recv() => match req {
                    Some(ControlRequest::Send(text)) => {
                        if let Err(e) = writer.send_text(&text).await {
                            return SessionExit::TransportError(e.to_string());
                        }
                    }
                    Some(ControlRequest::Reconnect) => return SessionExit::ManualReconnect,
                    Some(ControlRequest::Close) | None => return SessionExit::Close,
                },
            }
        }
    }

    fn exit_to_effects(&mut self, exit: SessionExit) -> Vec<Effect> {
        let epoch = self.lifecycle.epoch();
        match exit {
            SessionExit::PeerClosed { code, reason } => {
                self.socket = None;
                self.lifecycle
                    .handle(LifecycleEvent::PeerClosed { epoch, code, reason })
            }
            SessionExit::TransportError(reason) => {
                self.socket = None;
                self.lifecycle
                    .handle(LifecycleEvent::TransportError { epoch, reason })
            }
            SessionExit::ManualReconnect => {
                self.lifecycle.handle(LifecycleEvent::ManualReconnect)
            }
            SessionExit::Close => {
                self.handle_closed = true;
                self.lifecycle.handle(LifecycleEvent::CloseRequested)
            }
        }
    }

    async fn apply_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Connect { epoch } => self.pending_connect = Some(epoch),
                Effect::ScheduleRetry { attempt, delay } => {
                    log::info!(
                        "[Channel] Reconnecting in {delay:?} (attempt {attempt}/{})",
                        self.config.max_reconnect_attempts
                    );
                    self.pending_retry = Some(delay);
                }
                Effect::CancelRetry => self.pending_retry = None,
                // The heartbeat interval is owned by open_session(); it
                // starts and stops with the session itself.
                Effect::StartHeartbeat | Effect::StopHeartbeat => {}
                Effect::CloseSocket => self.close_socket().await,
                Effect::NotifyOpen { recovered } => {
                    let _ = self.events_tx.send(ChannelEvent::Connected { recovered });
                }
                Effect::NotifyRetrying {
                    attempt,
                    max_attempts,
                    delay,
                } => {
                    let _ = self.events_tx.send(ChannelEvent::Reconnecting {
                        attempt,
                        max_attempts,
                        delay,
                    });
                }
                Effect::NotifyClosed { code, reason } => {
                    let _ = self.events_tx.send(ChannelEvent::Closed { code, reason });
                }
                Effect::NotifyFatal { attempts } => {
                    let _ = self.events_tx.send(ChannelEvent::Fatal { attempts });
                }
            }
        }
    }

    /// Detach from the socket before closing it, so the close is never
    /// observed as an abnormal closure.
    async fn close_socket(&mut self) {
        if let Some((mut writer, reader)) = self.socket.take() {
            // Dropping the reader detaches; only then close the sink
            drop(reader);
            let _ = writer.close().await;
        }
    }
}

/// Demultiplex one text frame: parse, then route by envelope type.
///
/// Malformed frames and unknown types are logged and dropped; neither
/// disturbs the connection or subsequent frames.
fn dispatch_text(
    text: &str,
    reconciler: &mut Reconciler,
    events_tx: &mpsc::UnboundedSender<ChannelEvent>,
    snapshot_tx: &watch::Sender<DeviceStateSnapshot>,
) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            let preview = text.get(..120).unwrap_or(text);
            log::warn!("[Channel] Dropping malformed frame: {e} ({preview})");
            return;
        }
    };

    match envelope.classify() {
        EnvelopeKind::Log => {
            let _ = events_tx.send(ChannelEvent::Log {
                severity: Severity::from_wire(envelope.level.as_deref()),
                message: payload_text(&envelope),
            });
        }
        EnvelopeKind::Alert => {
            let _ = events_tx.send(ChannelEvent::Alert {
                severity: Severity::from_wire(envelope.level.as_deref()),
                message: payload_text(&envelope),
            });
        }
        EnvelopeKind::Warning => {
            let _ = events_tx.send(ChannelEvent::Alert {
                severity: Severity::Warning,
                message: payload_text(&envelope),
            });
        }
        EnvelopeKind::Error => {
            let _ = events_tx.send(ChannelEvent::Alert {
                severity: Severity::Error,
                message: payload_text(&envelope),
            });
        }
        _ => {
            if reconciler.apply_envelope(&envelope) {
                snapshot_tx.send_replace(reconciler.snapshot().clone());
            }
        }
    }
}

/// Human-readable text of a log/alert payload.
///
/// Machines send either a bare string or `{message: "..."}`.
fn payload_text(envelope: &Envelope) -> String {
    match &envelope.payload {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Object(obj)) => obj
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| serde_json::Value::Object(obj.clone()).to_string(), String::from),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}
