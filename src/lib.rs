//! Floorlink - resilient real-time control channel for shop-floor
//! machine dashboards.
//!
//! This crate provides the persistent connection layer the
//! manufacturing dashboards share: one [`MachineChannel`] per machine
//! surface (CNC table, routing/ejection line, pick-and-place, spray
//! rig) and one [`DocumentSubscription`] per shared schedule board.
//!
//! # Architecture
//!
//! The channel follows a background-loop pattern:
//!
//! - **Lifecycle machine** - pure `(state, event) -> effects` transitions
//!   with epoch-tagged sockets, testable without a network
//! - **Transport** - tokio-tungstenite wrapper with bounded connects
//! - **Backoff** - jittered exponential reconnect policy
//! - **Reconciler** - single writer of the canonical device snapshot
//! - **Handle** - command gateway plus read-only published views
//!
//! # Modules
//!
//! - [`channel`] - machine channel handle and connection loop
//! - [`sync`] - push-sync document subscription
//! - [`lifecycle`] - connection state machine
//! - [`reconcile`] - snapshot merge rules
//! - [`snapshot`] - device-state snapshot types
//! - [`config`] - per-channel configuration

// Library modules
pub mod backoff;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod reconcile;
pub mod snapshot;
pub mod sync;
pub mod ws;

// Re-export commonly used types
pub use channel::MachineChannel;
pub use config::ChannelConfig;
pub use envelope::{Envelope, EnvelopeKind};
pub use error::ChannelError;
pub use events::{ChannelEvent, ChannelEvents, Severity};
pub use lifecycle::ConnectionState;
pub use snapshot::DeviceStateSnapshot;
pub use sync::{DocumentSubscription, SyncEvent, SyncEvents};
