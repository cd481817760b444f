//! Push-sync document subscription.
//!
//! Unidirectional sibling of the machine channel: same lifecycle and
//! backoff machinery, but over a server-to-client event stream keyed to
//! one logical document (the shared schedule board). The client never
//! sends commands; it reconciles nothing — each event hands the whole
//! document to the consumer.
//!
//! One stream per subscription. Changing the target document requires
//! closing and reopening, which [`DocumentSubscription::retarget`]
//! enforces by consuming the handle.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::backoff::ReconnectPolicy;
use crate::config::ChannelConfig;
use crate::lifecycle::{ConnectionState, Effect, Lifecycle, LifecycleEvent};
use crate::ws::{self, WsFrame};

/// Event delivered to the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The server confirmed a first-time connect for this stream.
    Connected,
    /// The server reports this stream recovered from a drop — surface a
    /// recovery notification rather than a generic "connected" one.
    Recovered {
        /// Server-side reconnect attempt count, when reported.
        attempt: Option<u64>,
    },
    /// The subscribed document changed or was replaced.
    Updated(Value),
    /// The subscribed document was deleted.
    Deleted,
    /// Local connection state changed (for the passive indicator).
    ConnectionChange(ConnectionState),
    /// Automatic reconnection gave up; a manual reconnect is required.
    Fatal {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Receiving side of a subscription's event stream.
#[derive(Debug)]
pub struct SyncEvents {
    rx: mpsc::UnboundedReceiver<SyncEvent>,
}

impl SyncEvents {
    /// Await the next event. Returns `None` once the stream loop has
    /// exited and all queued events are drained.
    pub async fn recv(&mut self) -> Option<SyncEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive for frame-driven UIs.
    pub fn try_recv(&mut self) -> Option<SyncEvent> {
        self.rx.try_recv().ok()
    }
}

/// Request from the handle to the stream loop.
#[derive(Debug)]
enum SyncControl {
    Reconnect,
    Close,
}

/// Handle to one push-sync document stream.
#[derive(Debug)]
pub struct DocumentSubscription {
    document_id: String,
    config: ChannelConfig,
    control_tx: mpsc::UnboundedSender<SyncControl>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: Arc<AtomicBool>,
}

impl DocumentSubscription {
    /// Open one stream for `document_id` and spawn its loop.
    #[must_use]
    pub fn subscribe(config: ChannelConfig, document_id: impl Into<String>) -> (Self, SyncEvents) {
        let document_id = document_id.into();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let shutdown = Arc::new(AtomicBool::new(false));

        let sync_loop = SyncLoop {
            lifecycle: Lifecycle::new(ReconnectPolicy::from_config(&config)),
            config: config.clone(),
            document_id: document_id.clone(),
            socket: None,
            pending_connect: None,
            pending_retry: None,
            control_rx,
            events_tx,
            state_tx,
            shutdown: Arc::clone(&shutdown),
            handle_closed: false,
        };
        tokio::spawn(sync_loop.run());

        (
            Self {
                document_id,
                config,
                control_tx,
                state_rx,
                shutdown,
            },
            SyncEvents { rx: events_rx },
        )
    }

    /// The document id this stream is bound to.
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document_id
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

    /// Manually reconnect, resetting the attempt counter.
    pub fn reconnect(&self) {
        let _ = self.control_tx.send(SyncControl::Reconnect);
    }

    /// Close the stream. Terminal for this handle.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.control_tx.send(SyncControl::Close);
    }

    /// Switch to a different document.
    ///
    /// There is no in-place rebind: the old stream is closed and a
    /// fresh subscription opened, which consuming `self` guarantees.
    #[must_use]
    pub fn retarget(self, document_id: impl Into<String>) -> (Self, SyncEvents) {
        let config = self.config.clone();
        self.close();
        Self::subscribe(config, document_id)
    }
}

impl Drop for DocumentSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Why an open stream session ended.
#[derive(Debug)]
enum SessionExit {
    PeerClosed { code: u16, reason: String },
    TransportError(String),
    ManualReconnect,
    Close,
}

/// State owned by the background stream loop.
struct SyncLoop {
    config: ChannelConfig,
    document_id: String,
    lifecycle: Lifecycle,
    socket: Option<(ws::WsWriter, ws::WsReader)>,
    pending_connect: Option<u64>,
    pending_retry: Option<Duration>,
    control_rx: mpsc::UnboundedReceiver<SyncControl>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Arc<AtomicBool>,
    handle_closed: bool,
}

impl SyncLoop {
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
                    let exit = self.stream_session().await;
                    self.exit_to_effects(exit)
                }
                ConnectionState::Reconnecting { .. } => self.retry_phase().await,
                _ => self.idle_phase().await,
            };
            self.apply_effects(effects).await;
        }

        self.close_socket().await;
        self.publish_state();
        log::info!("[Sync] Stream loop exited (document {})", self.document_id);
    }

    fn publish_state(&self) {
        let state = self.lifecycle.state().clone();
        if *self.state_tx.borrow() != state {
            let _ = self
                .events_tx
                .send(SyncEvent::ConnectionChange(state.clone()));
            self.state_tx.send_replace(state);
        }
    }

    async fn connect_phase(&mut self, epoch: u64) -> Vec<Effect> {
        log::info!(
            "[Sync] Connecting to {} for document {} (epoch {epoch})",
            self.config.url,
            self.document_id
        );
        tokio::select! {
            result = ws::connect(&self.config.url, self.config.connect_timeout) => {
                match result {
                    Ok(pair) => {
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

    async fn retry_phase(&mut self) -> Vec<Effect> {
        let delay = self.pending_retry.take().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = tokio::time::sleep(delay) => {
                self.lifecycle.handle(LifecycleEvent::RetryDue)
            }
            req = self.control_rx.recv() => self.control_to_effects(req),
        }
    }

    async fn idle_phase(&mut self) -> Vec<Effect> {
        let req = self.control_rx.recv().await;
        self.control_to_effects(req)
    }

    fn control_to_effects(&mut self, req: Option<SyncControl>) -> Vec<Effect> {
        match req {
            Some(SyncControl::Reconnect) => {
                self.lifecycle.handle(LifecycleEvent::ManualReconnect)
            }
            Some(SyncControl::Close) | None => {
                self.handle_closed = true;
                self.lifecycle.handle(LifecycleEvent::CloseRequested)
            }
        }
    }

    /// Pump one open stream until it exits. Unidirectional: the only
    /// writes are pong replies.
    async fn stream_session(&mut self) -> SessionExit {
        let Some((writer, reader)) = self.socket.as_mut() else {
            return SessionExit::TransportError("socket missing at session start".into());
        };

        loop {
            tokio::select! {
                frame = reader.recv() => match frame {
                    Some(Ok(WsFrame::Text(text))) => {
                        dispatch_stream_event(&text, &self.document_id, &self.events_tx);
                    }
                    Some(Ok(WsFrame::Binary(_))) => {
                        log::debug!("[Sync] Ignoring binary frame on document stream");
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
                req = self.control_rx.recv() => match req {
                    Some(SyncControl::Reconnect) => return SessionExit::ManualReconnect,
                    Some(SyncControl::Close) | None => return SessionExit::Close,
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
                        "[Sync] Reconnecting in {delay:?} (attempt {attempt}/{})",
                        self.config.max_reconnect_attempts
                    );
                    self.pending_retry = Some(delay);
                }
                Effect::CancelRetry => self.pending_retry = None,
                // No heartbeat on the unidirectional stream; the server
                // pings and we pong inside the session.
                Effect::StartHeartbeat | Effect::StopHeartbeat => {}
                Effect::CloseSocket => self.close_socket().await,
                Effect::NotifyFatal { attempts } => {
                    let _ = self.events_tx.send(SyncEvent::Fatal { attempts });
                }
                // Local connect/close notifications surface through
                // ConnectionChange; the server-sent stream events carry
                // the subscriber-facing connected/recovered semantics.
                Effect::NotifyOpen { .. }
                | Effect::NotifyRetrying { .. }
                | Effect::NotifyClosed { .. } => {}
            }
        }
    }

    async fn close_socket(&mut self) {
        if let Some((mut writer, reader)) = self.socket.take() {
            drop(reader);
            let _ = writer.close().await;
        }
    }
}

/// Route one server stream event to the subscriber.
///
/// Events for other documents and unknown types are ignored; a
/// malformed frame is logged and dropped.
fn dispatch_stream_event(
    text: &str,
    document_id: &str,
    events_tx: &mpsc::UnboundedSender<SyncEvent>,
) {
    let event: Value = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("[Sync] Dropping malformed stream event: {e}");
            return;
        }
    };

    let matches_document = event
        .get("documentId")
        .and_then(Value::as_str)
        .is_some_and(|id| id == document_id);

    match event.get("type").and_then(Value::as_str) {
        Some("connected") => {
            let _ = events_tx.send(SyncEvent::Connected);
        }
        Some("reconnected") => {
            let _ = events_tx.send(SyncEvent::Recovered {
                attempt: event.get("attempt").and_then(Value::as_u64),
            });
        }
        Some("update" | "replace") if matches_document => {
            if let Some(document) = event.get("document") {
                let _ = events_tx.send(SyncEvent::Updated(document.clone()));
            }
        }
        Some("delete") if matches_document => {
            let _ = events_tx.send(SyncEvent::Deleted);
        }
        Some(other) => {
            log::debug!("[Sync] Ignoring stream event type '{other}'");
        }
        None => {
            log::debug!("[Sync] Ignoring stream event without type");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect_events(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_update_and_replace_dispatch_for_matching_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let update =
            json!({"type": "update", "documentId": "board-7", "document": {"rows": 3}});
        dispatch_stream_event(&update.to_string(), "board-7", &tx);
        let replace =
            json!({"type": "replace", "documentId": "board-7", "document": {"rows": 4}});
        dispatch_stream_event(&replace.to_string(), "board-7", &tx);

        assert_eq!(
            collect_events(&mut rx),
            vec![
                SyncEvent::Updated(json!({"rows": 3})),
                SyncEvent::Updated(json!({"rows": 4})),
            ]
        );
    }

    #[test]
    fn test_events_for_other_documents_are_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let update =
            json!({"type": "update", "documentId": "board-9", "document": {"rows": 1}});
        dispatch_stream_event(&update.to_string(), "board-7", &tx);
        let delete = json!({"type": "delete", "documentId": "board-9"});
        dispatch_stream_event(&delete.to_string(), "board-7", &tx);

        assert!(collect_events(&mut rx).is_empty());
    }

    #[test]
    fn test_reconnected_is_distinct_from_connected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_stream_event(r#"{"type":"connected"}"#, "board-7", &tx);
        dispatch_stream_event(r#"{"type":"reconnected","attempt":3}"#, "board-7", &tx);

        assert_eq!(
            collect_events(&mut rx),
            vec![
                SyncEvent::Connected,
                SyncEvent::Recovered { attempt: Some(3) },
            ]
        );
    }

    #[test]
    fn test_delete_dispatches_deletion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_stream_event(
            r#"{"type":"delete","documentId":"board-7"}"#,
            "board-7",
            &tx,
        );
        assert_eq!(collect_events(&mut rx), vec![SyncEvent::Deleted]);
    }

    #[test]
    fn test_malformed_and_unknown_events_are_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_stream_event("{nope", "board-7", &tx);
        dispatch_stream_event(r#"{"type":"presence","documentId":"board-7"}"#, "board-7", &tx);
        dispatch_stream_event(r#"{"documentId":"board-7"}"#, "board-7", &tx);
        assert!(collect_events(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_retarget_closes_old_stream() {
        let config = ChannelConfig::new("ws://127.0.0.1:1/board")
            .reconnect_base_delay(Duration::from_secs(30))
            .reconnect_jitter(Duration::ZERO)
            .connect_timeout(Duration::from_secs(1));
        let (subscription, mut old_events) = DocumentSubscription::subscribe(config, "board-7");
        assert_eq!(subscription.document_id(), "board-7");

        let (subscription, _events) = subscription.retarget("board-8");
        assert_eq!(subscription.document_id(), "board-8");

        // The old loop exits, so its event stream drains to None
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while old_events.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "old stream did not close");
        subscription.close();
    }
}
