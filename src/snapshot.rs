//! Canonical device-state snapshot.
//!
//! One snapshot per channel, mirroring remote machine state. The
//! reconciler in [`crate::reconcile`] is the only writer; everything
//! else sees read-only clones published through a `watch` channel, so
//! consumers always observe snapshots monotonic with arrival order.
//!
//! Wire fields are camelCase (the dashboards and machines already speak
//! it); absent and `null` are distinct everywhere: absent leaves a value
//! untouched, `null` clears it.

// Rust guideline compliant 2026-02

use bytes::Bytes;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Machine head position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// X axis, millimeters.
    #[serde(default)]
    pub x: Option<f64>,
    /// Y axis, millimeters.
    #[serde(default)]
    pub y: Option<f64>,
    /// Z axis, millimeters.
    #[serde(default)]
    pub z: Option<f64>,
    /// Commanded feed rate, mm/min.
    #[serde(default)]
    pub feed_rate: Option<f64>,
}

/// Per-cycle counters reported by the machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleStats {
    /// Cycles completed since power-on.
    pub cycle_count: Option<u64>,
    /// Cycles that passed inspection.
    pub pass_count: Option<u64>,
    /// Cycles ejected by the inspection gate.
    pub eject_count: Option<u64>,
    /// Duration of the most recent cycle, milliseconds.
    pub last_cycle_ms: Option<f64>,
    /// Rolling average cycle duration, milliseconds.
    pub average_cycle_ms: Option<f64>,
}

impl CycleStats {
    /// Merge only the fields present in `payload`; `null` clears.
    pub fn merge_from(&mut self, payload: &Map<String, Value>) {
        merge_u64(&mut self.cycle_count, payload, "cycleCount");
        merge_u64(&mut self.pass_count, payload, "passCount");
        merge_u64(&mut self.eject_count, payload, "ejectCount");
        merge_f64(&mut self.last_cycle_ms, payload, "lastCycleMs");
        merge_f64(&mut self.average_cycle_ms, payload, "averageCycleMs");
    }
}

/// Daily production counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    /// Production date the counters belong to.
    pub date: Option<NaiveDate>,
    /// Units processed today.
    pub units_processed: Option<u64>,
    /// Units ejected today.
    pub units_ejected: Option<u64>,
    /// Seconds the line has been running today.
    pub uptime_seconds: Option<u64>,
}

impl DailyStats {
    /// Merge only the fields present in `payload`; `null` clears.
    pub fn merge_from(&mut self, payload: &Map<String, Value>) {
        if let Some(v) = payload.get("date") {
            self.date = v
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
        }
        merge_u64(&mut self.units_processed, payload, "unitsProcessed");
        merge_u64(&mut self.units_ejected, payload, "unitsEjected");
        merge_u64(&mut self.uptime_seconds, payload, "uptimeSeconds");
    }
}

/// Host machine health.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    /// CPU utilization, percent.
    pub cpu_percent: Option<f64>,
    /// Memory utilization, percent.
    pub memory_percent: Option<f64>,
    /// Disk utilization, percent.
    pub disk_percent: Option<f64>,
    /// Controller temperature, Celsius.
    pub temperature_c: Option<f64>,
    /// Seconds since the controller booted.
    pub uptime_seconds: Option<u64>,
}

impl SystemStats {
    /// Merge only the fields present in `payload`; `null` clears.
    pub fn merge_from(&mut self, payload: &Map<String, Value>) {
        merge_f64(&mut self.cpu_percent, payload, "cpuPercent");
        merge_f64(&mut self.memory_percent, payload, "memoryPercent");
        merge_f64(&mut self.disk_percent, payload, "diskPercent");
        merge_f64(&mut self.temperature_c, payload, "temperatureC");
        merge_u64(&mut self.uptime_seconds, payload, "uptimeSeconds");
    }
}

fn merge_f64(slot: &mut Option<f64>, payload: &Map<String, Value>, key: &str) {
    if let Some(v) = payload.get(key) {
        *slot = v.as_f64();
    }
}

fn merge_u64(slot: &mut Option<u64>, payload: &Map<String, Value>, key: &str) {
    if let Some(v) = payload.get(key) {
        *slot = v.as_u64();
    }
}

/// A published reference to the most recent analysis image.
///
/// Cheap to clone (`Bytes` is reference counted); cloning does not
/// affect the release accounting, which lives in [`ImageSlot`].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    /// Monotonic frame sequence number within this channel.
    pub seq: u64,
    /// Raw image bytes as received.
    pub bytes: Bytes,
}

/// Callback invoked with the frame sequence number when an image
/// resource is released.
pub type ReleaseHook = Box<dyn Fn(u64) + Send>;

/// Owner of the channel's single outstanding image resource.
///
/// Each frame is released exactly once: when superseded by a newer
/// frame, or on teardown. Never more than one unreleased frame exists
/// per channel.
#[derive(Default)]
pub struct ImageSlot {
    current: Option<ImageRef>,
    next_seq: u64,
    release_hook: Option<ReleaseHook>,
}

impl std::fmt::Debug for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSlot")
            .field("current", &self.current.as_ref().map(|i| i.seq))
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

impl ImageSlot {
    /// Empty slot with no release observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer called once per released frame.
    pub fn set_release_hook(&mut self, hook: ReleaseHook) {
        self.release_hook = Some(hook);
    }

    /// Install a new frame, releasing the superseded one.
    pub fn install(&mut self, bytes: Bytes) -> ImageRef {
        if let Some(previous) = self.current.take() {
            self.release(&previous);
        }
        let frame = ImageRef {
            seq: self.next_seq,
            bytes,
        };
        self.next_seq += 1;
        self.current = Some(frame.clone());
        frame
    }

    /// Release the outstanding frame, if any. Called on teardown.
    pub fn clear(&mut self) {
        if let Some(current) = self.current.take() {
            self.release(&current);
        }
    }

    fn release(&self, frame: &ImageRef) {
        log::trace!("[Snapshot] Releasing image frame {}", frame.seq);
        if let Some(hook) = &self.release_hook {
            hook(frame.seq);
        }
    }
}

/// Canonical, reconciled view of remote device state.
///
/// Field-by-field this mirrors what the dashboard surfaces render:
/// motion state, sensor readings, the capture/analysis pipeline, and
/// the stat lanes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStateSnapshot {
    /// Machine head position.
    pub position: Option<Position>,
    /// Free-form sensor readings, as reported.
    pub sensors: Option<Value>,
    /// Whether a capture/analysis cycle is in progress.
    pub is_capturing: bool,
    /// Whether the vision pipeline is currently analyzing.
    pub is_analyzing: bool,
    /// Results of the most recent analysis.
    pub current_analysis: Option<Value>,
    /// Metadata describing the most recent analysis image.
    pub current_image_metadata: Option<Value>,
    /// Eject/keep decision for the current part.
    pub ejection_decision: Option<bool>,
    /// Machine settings. Replaced wholesale on settings updates; the
    /// server is the sole source of truth after an update.
    pub settings: Map<String, Value>,
    /// Per-cycle counters.
    pub cycle_stats: CycleStats,
    /// Daily production counters.
    pub daily_stats: DailyStats,
    /// Host machine health.
    pub system_stats: SystemStats,
    /// Reference to the most recent analysis image frame.
    #[serde(skip)]
    pub image: Option<ImageRef>,
    /// Fields the dashboard doesn't model; kept so newer servers can
    /// ship extra state without a client release.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
