//! Continuous combined ping/traceroute with per-hop statistics.
//!
//! The interesting part lives in [`controller`]: a four-state session
//! lifecycle machine driven by a non-blocking poll loop, with exactly one
//! background worker running the blocking probe cycle at a time. Snapshots
//! of the per-hop statistics are taken on a heartbeat cadence, buffered, and
//! flushed to disk in batches by [`history::HistoryBatcher`].

pub mod controller;
pub mod error;
pub mod export;
pub mod history;
pub mod probe;
pub mod snapshot;
pub mod source;

pub use controller::{ControllerConfig, PollOutcome, TraceSessionController, TraceState, Transition};
pub use error::TraceError;
pub use history::HistoryBatcher;
pub use probe::{IcmpProbeEngine, ProbeOptions};
pub use snapshot::{HopRecord, MAX_HOPS, SessionIdentity, Snapshot};
pub use source::{AddressFamily, HopStatsSource};
