use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::error::Result;

/// Address family preference consulted before target resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    V4Only,
    V6Only,
    #[default]
    Any,
}

/// Contract of the external probing engine.
///
/// The controller only ever talks to the engine through this trait: a
/// synchronous resolution pre-check on the poll thread, one blocking
/// `run_probe_cycle` call on the worker thread, and read-only per-hop
/// accessors that are valid to call from the poll thread at any time,
/// including while a cycle is in flight.
pub trait HopStatsSource: Send + Sync {
    /// Must be true before any session starts; a false value is fatal for
    /// session start (the controller refuses with `InitializationFailure`).
    fn initialized(&self) -> bool;

    fn supports_dual_stack(&self) -> bool;

    /// Synchronous address-resolution pre-check. Runs on the poll thread
    /// before the Idle -> Tracing transition.
    fn resolve_and_validate(&self, target: &str, family: AddressFamily) -> Result<IpAddr>;

    /// Runs the full probe cycle to completion. Blocking; executed only on
    /// the worker thread. Cancellation is cooperative: the flag is checked
    /// between probe rounds, never mid-probe.
    fn run_probe_cycle(&self, resolved: IpAddr, cancel: Arc<AtomicBool>);

    /// Number of hops currently known on the path.
    fn hop_count(&self) -> usize;

    /// Display name of hop `i` (hostname or address); empty when the hop
    /// never answered.
    fn hop_name(&self, i: usize) -> String;

    fn hop_address(&self, i: usize) -> Option<IpAddr>;

    /// Loss percentage in 0..=100.
    fn hop_loss_percent(&self, i: usize) -> u32;
    fn hop_sent(&self, i: usize) -> u32;
    fn hop_received(&self, i: usize) -> u32;

    /// Latencies in whole milliseconds.
    fn hop_best(&self, i: usize) -> u32;
    fn hop_avg(&self, i: usize) -> u32;
    fn hop_worst(&self, i: usize) -> u32;
    fn hop_last(&self, i: usize) -> u32;
}
