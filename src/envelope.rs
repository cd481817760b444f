//! Wire envelopes and inbound frame classification.
//!
//! Text frames carry a JSON envelope `{type, payload?, level?}`; binary
//! frames carry raw image bytes and never enter JSON parsing. The
//! machines disagree on spelling for several types (the routing line
//! speaks snake_case, the pick-and-place camelCase), so classification
//! accepts both.

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};

/// A typed message wrapper used for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type, the dispatch key.
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form payload. Absent and `null` are distinct on the wire
    /// and stay distinct here (a bare `Option` would collapse both to
    /// `None`).
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload: Option<serde_json::Value>,
    /// Severity hint on log/alert envelopes ("info", "warning", "error").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl Envelope {
    /// Build an outbound envelope.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload: Some(payload),
            level: None,
        }
    }

    /// The heartbeat liveness frame.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            kind: "PING".to_string(),
            payload: None,
            level: None,
        }
    }

    /// Parse a text frame into an envelope.
    ///
    /// # Errors
    ///
    /// Returns the parse failure description; the caller logs and drops
    /// the frame without disturbing the connection.
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }

    /// Classify this envelope for dispatch.
    #[must_use]
    pub fn classify(&self) -> EnvelopeKind {
        EnvelopeKind::from_wire(&self.kind)
    }
}

/// Deserialize a present-but-possibly-null field as `Some(value)`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Known inbound envelope types.
///
/// Unknown types map to [`EnvelopeKind::Unknown`]; the reconciler leaves
/// the snapshot untouched for those and the demux logs them at debug,
/// keeping forward compatibility with server message types this build
/// has not seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Full or partial device state; shallow-merged.
    State,
    /// Settings replacement; the server is the source of truth.
    Settings,
    /// A log line for the dashboard console.
    Log,
    /// An operator-facing alert.
    Alert,
    /// An operator-facing warning.
    Warning,
    /// An operator-facing error report.
    Error,
    /// Vision analysis results for the current cycle.
    AnalysisResults,
    /// The eject/keep decision for the current part.
    EjectionDecision,
    /// Metadata describing the most recent analysis image.
    AnalysisImage,
    /// Per-cycle counters.
    CycleStats,
    /// Daily production counters.
    DailyStats,
    /// Host machine health (CPU, memory, temperature).
    SystemStats,
    /// Reply to our heartbeat; consumed silently.
    Pong,
    /// Anything else. Logged and ignored.
    Unknown,
}

impl EnvelopeKind {
    /// Map a wire type string to its kind, accepting both spellings
    /// where the machines disagree.
    #[must_use]
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "state" | "stateUpdate" => Self::State,
            "settingsUpdate" | "configUpdate" => Self::Settings,
            "log" | "systemLog" => Self::Log,
            "alert" => Self::Alert,
            "warning" => Self::Warning,
            "error" => Self::Error,
            "analysis_results" | "analysisResults" => Self::AnalysisResults,
            "ejection_decision" => Self::EjectionDecision,
            "analysis_image" => Self::AnalysisImage,
            "cycle_stats" => Self::CycleStats,
            "daily_stats" => Self::DailyStats,
            "systemStats" => Self::SystemStats,
            "PONG" | "pong" => Self::Pong,
            _ => Self::Unknown,
        }
    }
}
