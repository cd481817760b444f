//! Envelope-to-snapshot reconciliation.
//!
//! The [`Reconciler`] is the single writer of a channel's
//! [`DeviceStateSnapshot`]. Merge rules:
//!
//! - `state` envelopes shallow-merge: a field present in the payload
//!   replaces the snapshot field, an explicit `null` clears it, an
//!   absent field is untouched. A transition from not-capturing to
//!   capturing nulls the stale derived fields (`currentAnalysis`,
//!   `currentImageMetadata`, `ejectionDecision`) before the merge, so a
//!   new cycle can never render the previous cycle's results.
//! - `analysis_results` wholesale-replaces `currentAnalysis` and clears
//!   `isAnalyzing`.
//! - `ejection_decision` coerces the payload to a boolean; some firmware
//!   sends `1`/`"eject"` where a bool belongs.
//! - Binary frames install a new image, releasing the superseded one.
//! - `settingsUpdate` wholesale-replaces the settings object.
//! - Stat envelopes merge only the fields present in the payload.
//! - Unknown types leave the snapshot untouched and never error.

// Rust guideline compliant 2026-02

use bytes::Bytes;
use serde_json::Value;

use crate::envelope::{Envelope, EnvelopeKind};
use crate::snapshot::{DeviceStateSnapshot, ImageSlot, Position, ReleaseHook};

/// JS-style truthiness, the defensive coercion applied to ejection
/// decisions coming off the wire.
#[must_use]
pub fn coerce_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Single writer of a channel's device-state snapshot.
#[derive(Debug, Default)]
pub struct Reconciler {
    snapshot: DeviceStateSnapshot,
    images: ImageSlot,
}

impl Reconciler {
    /// Fresh reconciler with an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer called once per released image frame.
    pub fn set_image_release_hook(&mut self, hook: ReleaseHook) {
        self.images.set_release_hook(hook);
    }

    /// Read-only view of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> &DeviceStateSnapshot {
        &self.snapshot
    }

    /// Apply a text envelope. Returns true when the snapshot changed.
    ///
    /// Unknown envelope types and non-state types (logs, alerts) leave
    /// the snapshot untouched; those are surfaced as notifications by
    /// the connection loop, not stored here.
    pub fn apply_envelope(&mut self, envelope: &Envelope) -> bool {
        match envelope.classify() {
            EnvelopeKind::State => self.apply_state(envelope.payload.as_ref()),
            EnvelopeKind::Settings => self.apply_settings(envelope.payload.as_ref()),
            EnvelopeKind::AnalysisResults => {
                self.snapshot.current_analysis = non_null(envelope.payload.clone());
                self.snapshot.is_analyzing = false;
                true
            }
            EnvelopeKind::EjectionDecision => {
                let decision = envelope.payload.as_ref().unwrap_or(&Value::Null);
                self.snapshot.ejection_decision = Some(coerce_truthy(decision));
                true
            }
            EnvelopeKind::AnalysisImage => {
                self.snapshot.current_image_metadata = non_null(envelope.payload.clone());
                true
            }
            EnvelopeKind::CycleStats => {
                if let Some(obj) = payload_object(envelope) {
                    self.snapshot.cycle_stats.merge_from(obj);
                    true
                } else {
                    false
                }
            }
            EnvelopeKind::DailyStats => {
                if let Some(obj) = payload_object(envelope) {
                    self.snapshot.daily_stats.merge_from(obj);
                    true
                } else {
                    false
                }
            }
            EnvelopeKind::SystemStats => {
                if let Some(obj) = payload_object(envelope) {
                    self.snapshot.system_stats.merge_from(obj);
                    true
                } else {
                    false
                }
            }
            EnvelopeKind::Log
            | EnvelopeKind::Alert
            | EnvelopeKind::Warning
            | EnvelopeKind::Error
            | EnvelopeKind::Pong => false,
            EnvelopeKind::Unknown => {
                log::debug!(
                    "[Reconcile] Ignoring unknown envelope type '{}'",
                    envelope.kind
                );
                false
            }
        }
    }

    /// Install a binary image frame, releasing the superseded one.
    pub fn apply_image(&mut self, bytes: Bytes) {
        let frame = self.images.install(bytes);
        self.snapshot.image = Some(frame);
    }

    /// Release the outstanding image resource. Called exactly once per
    /// channel, when the connection loop tears down.
    pub fn teardown(&mut self) {
        self.images.clear();
        self.snapshot.image = None;
    }

    fn apply_state(&mut self, payload: Option<&Value>) -> bool {
        let Some(obj) = payload.and_then(Value::as_object) else {
            log::debug!("[Reconcile] Dropping state envelope without object payload");
            return false;
        };

        // A new capture cycle starting invalidates the previous cycle's
        // derived results before any field merges.
        let starting_capture = !self.snapshot.is_capturing
            && obj.get("isCapturing").and_then(Value::as_bool) == Some(true);
        if starting_capture {
            self.snapshot.current_analysis = None;
            self.snapshot.current_image_metadata = None;
            self.snapshot.ejection_decision = None;
        }

        for (key, value) in obj {
            self.apply_state_field(key, value);
        }
        true
    }

    fn apply_state_field(&mut self, key: &str, value: &Value) {
        match key {
            "position" => match value {
                Value::Null => self.snapshot.position = None,
                v => match serde_json::from_value::<Position>(v.clone()) {
                    Ok(position) => self.snapshot.position = Some(position),
                    Err(e) => log::warn!("[Reconcile] Bad position payload: {e}"),
                },
            },
            "sensors" => {
                self.snapshot.sensors = non_null(Some(value.clone()));
            }
            "isCapturing" => {
                self.snapshot.is_capturing = value.as_bool().unwrap_or(false);
            }
            "isAnalyzing" => {
                self.snapshot.is_analyzing = value.as_bool().unwrap_or(false);
            }
            "currentAnalysis" => {
                self.snapshot.current_analysis = non_null(Some(value.clone()));
            }
            "currentImageMetadata" => {
                self.snapshot.current_image_metadata = non_null(Some(value.clone()));
            }
            "ejectionDecision" => {
                self.snapshot.ejection_decision = match value {
                    Value::Null => None,
                    v => Some(coerce_truthy(v)),
                };
            }
            "settings" => {
                if let Some(settings) = value.as_object() {
                    self.snapshot.settings = settings.clone();
                }
            }
            "cycleStats" => {
                // Top-level shallow merge: the lane is replaced wholesale
                self.snapshot.cycle_stats = crate::snapshot::CycleStats::default();
                if let Some(obj) = value.as_object() {
                    self.snapshot.cycle_stats.merge_from(obj);
                }
            }
            "dailyStats" => {
                self.snapshot.daily_stats = crate::snapshot::DailyStats::default();
                if let Some(obj) = value.as_object() {
                    self.snapshot.daily_stats.merge_from(obj);
                }
            }
            "systemStats" => {
                self.snapshot.system_stats = crate::snapshot::SystemStats::default();
                if let Some(obj) = value.as_object() {
                    self.snapshot.system_stats.merge_from(obj);
                }
            }
            _ => {
                // Shallow merge for fields the dashboard doesn't model
                if value.is_null() {
                    self.snapshot.extra.remove(key);
                } else {
                    self.snapshot.extra.insert(key.to_string(), value.clone());
                }
            }
        }
    }

    fn apply_settings(&mut self, payload: Option<&Value>) -> bool {
        let Some(obj) = payload.and_then(Value::as_object) else {
            log::warn!("[Reconcile] Dropping settings envelope without object payload");
            return false;
        };
        // Wholesale replace; the server owns settings after an update
        self.snapshot.settings = obj.clone();
        true
    }
}

fn non_null(value: Option<Value>) -> Option<Value> {
    value.filter(|v| !v.is_null())
}

fn payload_object(envelope: &Envelope) -> Option<&serde_json::Map<String, Value>> {
    envelope.payload.as_ref().and_then(Value::as_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn envelope(kind: &str, payload: Value) -> Envelope {
        Envelope {
            kind: kind.to_string(),
            payload: Some(payload),
            level: None,
        }
    }

    #[test]
    fn test_capture_transition_nulls_stale_derived_fields() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_envelope(&envelope(
            "analysis_results",
            json!({"defects": 2, "confidence": 0.93}),
        ));
        reconciler.apply_envelope(&envelope("analysis_image", json!({"w": 640, "h": 480})));
        reconciler.apply_envelope(&envelope("ejection_decision", json!(true)));
        assert!(reconciler.snapshot().current_analysis.is_some());

        reconciler.apply_envelope(&envelope("state", json!({"isCapturing": true})));

        let snapshot = reconciler.snapshot();
        assert_eq!(snapshot.current_analysis, None);
        assert_eq!(snapshot.current_image_metadata, None);
        assert_eq!(snapshot.ejection_decision, None);
        assert!(snapshot.is_capturing);
    }

    #[test]
    fn test_state_merge_while_already_capturing_keeps_results() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_envelope(&envelope("state", json!({"isCapturing": true})));
        reconciler.apply_envelope(&envelope("analysis_results", json!({"defects": 0})));

        // Still capturing: no false->true transition, results survive
        reconciler.apply_envelope(&envelope(
            "state",
            json!({"isCapturing": true, "sensors": {"vacuum": 0.82}}),
        ));
        assert_eq!(
            reconciler.snapshot().current_analysis,
            Some(json!({"defects": 0}))
        );
    }

    #[test]
    fn test_absent_field_untouched_null_clears() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_envelope(&envelope(
            "state",
            json!({"sensors": {"vacuum": 0.8}, "spindleRpm": 24_000}),
        ));

        // Absent: untouched
        reconciler.apply_envelope(&envelope("state", json!({"isAnalyzing": true})));
        assert_eq!(
            reconciler.snapshot().sensors,
            Some(json!({"vacuum": 0.8}))
        );
        assert_eq!(
            reconciler.snapshot().extra.get("spindleRpm"),
            Some(&json!(24_000))
        );

        // Null: cleared
        reconciler.apply_envelope(&envelope(
            "state",
            json!({"sensors": null, "spindleRpm": null}),
        ));
        assert_eq!(reconciler.snapshot().sensors, None);
        assert!(reconciler.snapshot().extra.get("spindleRpm").is_none());
    }

    #[test]
    fn test_analysis_results_replace_and_clear_analyzing() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_envelope(&envelope("state", json!({"isAnalyzing": true})));
        reconciler.apply_envelope(&envelope("analysis_results", json!({"defects": 1})));

        assert_eq!(
            reconciler.snapshot().current_analysis,
            Some(json!({"defects": 1}))
        );
        assert!(!reconciler.snapshot().is_analyzing);
    }

    #[test]
    fn test_ejection_decision_coerces_wire_values() {
        let cases = [
            (json!(true), true),
            (json!(false), false),
            (json!(1), true),
            (json!(0), false),
            (json!("eject"), true),
            (json!(""), false),
            (json!(null), false),
            (json!({"reason": "chip"}), true),
        ];
        for (payload, expected) in cases {
            let mut reconciler = Reconciler::new();
            reconciler.apply_envelope(&envelope("ejection_decision", payload.clone()));
            assert_eq!(
                reconciler.snapshot().ejection_decision,
                Some(expected),
                "payload {payload}"
            );
        }
    }

    #[test]
    fn test_settings_update_is_wholesale_and_idempotent() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_envelope(&envelope(
            "settingsUpdate",
            json!({"feedOverride": 0.9, "laserPower": 80}),
        ));
        let update = envelope("settingsUpdate", json!({"feedOverride": 1.0}));

        reconciler.apply_envelope(&update);
        let first = reconciler.snapshot().clone();
        // Old keys are gone: replacement, not merge
        assert!(first.settings.get("laserPower").is_none());

        reconciler.apply_envelope(&update);
        assert_eq!(*reconciler.snapshot(), first);
    }

    #[test]
    fn test_unknown_envelope_leaves_snapshot_unchanged() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_envelope(&envelope("state", json!({"isCapturing": true})));
        let before = reconciler.snapshot().clone();

        let changed = reconciler.apply_envelope(&envelope(
            "telemetryV2",
            json!({"isCapturing": false, "anything": 1}),
        ));
        assert!(!changed);
        assert_eq!(*reconciler.snapshot(), before);
    }

    #[test]
    fn test_image_supersession_releases_exactly_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let mut reconciler = Reconciler::new();
        reconciler.set_image_release_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        // Two frames back-to-back before any consumer reads
        reconciler.apply_image(Bytes::from_static(b"frame-1"));
        reconciler.apply_image(Bytes::from_static(b"frame-2"));

        assert_eq!(released.load(Ordering::SeqCst), 1);
        let image = reconciler.snapshot().image.clone().expect("image present");
        assert_eq!(image.bytes.as_ref(), b"frame-2");

        reconciler.teardown();
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert!(reconciler.snapshot().image.is_none());
    }

    #[test]
    fn test_n_frames_release_n_minus_one_before_teardown() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let mut reconciler = Reconciler::new();
        reconciler.set_image_release_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        const N: usize = 7;
        for i in 0..N {
            reconciler.apply_image(Bytes::from(vec![i as u8; 16]));
        }
        assert_eq!(released.load(Ordering::SeqCst), N - 1);

        reconciler.teardown();
        assert_eq!(released.load(Ordering::SeqCst), N);
    }

    #[test]
    fn test_stat_envelopes_merge_fields_present() {
        let mut reconciler = Reconciler::new();
        reconciler.apply_envelope(&envelope(
            "cycle_stats",
            json!({"cycleCount": 100, "passCount": 97, "ejectCount": 3}),
        ));
        reconciler.apply_envelope(&envelope("cycle_stats", json!({"cycleCount": 101})));

        let stats = &reconciler.snapshot().cycle_stats;
        assert_eq!(stats.cycle_count, Some(101));
        assert_eq!(stats.pass_count, Some(97));
        assert_eq!(stats.eject_count, Some(3));
    }

    #[test]
    fn test_log_envelopes_do_not_touch_snapshot() {
        let mut reconciler = Reconciler::new();
        let before = reconciler.snapshot().clone();
        let changed = reconciler.apply_envelope(&Envelope {
            kind: "log".to_string(),
            payload: Some(json!("spindle warmup complete")),
            level: Some("info".to_string()),
        });
        assert!(!changed);
        assert_eq!(*reconciler.snapshot(), before);
    }
}
