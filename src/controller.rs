use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{Result, TraceError};
use crate::history::HistoryBatcher;
use crate::snapshot::{SessionIdentity, Snapshot};
use crate::source::{AddressFamily, HopStatsSource};

/// Lifecycle state of a trace session. Exactly one value at any time, owned
/// exclusively by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Idle,
    Tracing,
    Stopping,
    Exiting,
}

/// The nine legal (previous, requested) state pairs. Every other pair is an
/// illegal transition: logged, state unchanged, no side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    IdleToIdle,
    IdleToTracing,
    IdleToExiting,
    TracingToTracing,
    TracingToStopping,
    TracingToExiting,
    StoppingToIdle,
    StoppingToStopping,
    StoppingToExiting,
}

/// What a single `poll` observed, so the driving loop can react without
/// peeking at internal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// No session in flight.
    Idle,
    /// The worker is still running its probe cycle.
    Running,
    /// The worker finished and the session returned to Idle this poll.
    BecameIdle,
    /// Exit was requested and the worker (if any) has wound down; the
    /// process may tear down now.
    ShutdownComplete,
}

/// Cadence and cancellation knobs for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Documented cadence the caller drives `poll` at. The controller never
    /// sleeps on it; it only informs the driving loop.
    pub poll_interval: Duration,
    /// Elapsed-time heartbeat for the periodic redraw/sample while a worker
    /// runs (TracingToTracing / StoppingToStopping). Independent of the poll
    /// cadence.
    pub sample_interval: Duration,
    /// Cancellation is cooperative and has no deadline: if the probe engine
    /// hangs, the session stays in Stopping/Exiting indefinitely. When set,
    /// this watchdog logs one warning per overrun instead of silently
    /// waiting forever. It never force-kills the worker.
    pub stop_grace: Option<Duration>,
    pub family: AddressFamily,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            sample_interval: Duration::from_millis(600),
            stop_grace: None,
            family: AddressFamily::default(),
        }
    }
}

/// The single background worker slot. The completion channel is the worker
/// handoff primitive: the worker owns the sender for the full probe cycle,
/// and the channel resolving (message or disconnect) is the non-blocking
/// completion signal the poll thread reads with `try_recv`.
struct Worker {
    join: JoinHandle<()>,
    done: Receiver<()>,
    cancel: Arc<AtomicBool>,
}

/// Single authority for the session state machine.
///
/// All requests and the poll step run on one interactive thread; only the
/// probe cycle runs on the worker thread. `on_transition` side effects
/// execute synchronously inside the transition call, so they happen-before
/// the next `poll` observes them.
pub struct TraceSessionController {
    source: Arc<dyn HopStatsSource>,
    history: HistoryBatcher,
    config: ControllerConfig,
    identity: SessionIdentity,
    state: TraceState,
    worker: Option<Worker>,
    last_sample: Instant,
    stop_requested_at: Option<Instant>,
    grace_warned: bool,
    latest: Option<Snapshot>,
}

impl TraceSessionController {
    pub fn new(
        source: Arc<dyn HopStatsSource>,
        history: HistoryBatcher,
        config: ControllerConfig,
    ) -> Self {
        Self {
            source,
            history,
            config,
            identity: SessionIdentity::detect(),
            state: TraceState::Idle,
            worker: None,
            last_sample: Instant::now(),
            stop_requested_at: None,
            grace_warned: false,
            latest: None,
        }
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn history(&self) -> &HistoryBatcher {
        &self.history
    }

    /// The most recently sampled snapshot, for display and export.
    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    /// Starts a session. Valid only from Idle; from any other state the
    /// request is an illegal transition and a no-op. Validates the target,
    /// runs the synchronous resolution pre-check, then transitions
    /// Idle -> Tracing and launches exactly one worker. Returns immediately.
    pub fn request_start(&mut self, target: &str) -> Result<()> {
        if self.state != TraceState::Idle {
            warn!(state = ?self.state, "start requested outside Idle, ignoring");
            return Ok(());
        }

        let target = target.trim();
        if target.is_empty() {
            return Err(TraceError::InvalidTarget);
        }
        if !self.source.initialized() {
            return Err(TraceError::InitializationFailure);
        }

        // An engine without dual-stack support narrows "either" to IPv4.
        let mut family = self.config.family;
        if family == AddressFamily::Any && !self.source.supports_dual_stack() {
            family = AddressFamily::V4Only;
        }

        let resolved = self.source.resolve_and_validate(target, family)?;
        info!(host = %target, %resolved, "starting trace session");

        self.transit(TraceState::Tracing);
        self.spawn_worker(resolved)?;
        Ok(())
    }

    /// Requests the running session to stop. Cooperative: the worker observes
    /// the cancel flag between probe rounds. Repeated stops while already
    /// Stopping are idempotent re-asserts. Stop from Idle is illegal.
    pub fn request_stop(&mut self) {
        match self.state {
            TraceState::Tracing | TraceState::Stopping => self.transit(TraceState::Stopping),
            _ => warn!(state = ?self.state, "stop requested outside a session, ignoring"),
        }
    }

    /// Requests process teardown. Legal from every state; the actual
    /// teardown is gated on the worker releasing its handoff, observed by a
    /// later `poll` returning `ShutdownComplete`.
    pub fn request_exit(&mut self) {
        if self.state == TraceState::Exiting {
            debug!("exit requested twice");
            return;
        }
        self.transit(TraceState::Exiting);
    }

    /// Non-blocking poll step, invoked on a fixed external cadence. Never
    /// waits on the worker; completion is read off the handoff channel with
    /// `try_recv`. Also drives the history flush clock.
    pub fn poll(&mut self) -> PollOutcome {
        if let Err(err) = self.history.flush_tick() {
            // Buffer is retained; the flush retries on the next epoch.
            error!(%err, "history flush failed");
        }

        let Some(worker) = self.worker.take() else {
            if self.state == TraceState::Exiting {
                return PollOutcome::ShutdownComplete;
            }
            // An Idle re-assert is the IdleToIdle row of the table.
            if self.state == TraceState::Idle {
                self.transit(TraceState::Idle);
            }
            return PollOutcome::Idle;
        };

        match worker.done.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => {
                if worker.join.join().is_err() {
                    error!("probe worker panicked");
                }
                if self.state == TraceState::Exiting {
                    return PollOutcome::ShutdownComplete;
                }
                // Natural completion out of Tracing routes through Stopping
                // so every observed transition stays within the table.
                if self.state == TraceState::Tracing {
                    self.transit(TraceState::Stopping);
                }
                self.transit(TraceState::Idle);
                PollOutcome::BecameIdle
            }
            Err(TryRecvError::Empty) => {
                self.worker = Some(worker);
                if self.last_sample.elapsed() >= self.config.sample_interval {
                    self.last_sample = Instant::now();
                    match self.state {
                        TraceState::Tracing => self.transit(TraceState::Tracing),
                        TraceState::Stopping => self.transit(TraceState::Stopping),
                        _ => {}
                    }
                }
                self.check_stop_grace();
                PollOutcome::Running
            }
        }
    }

    /// Flushes whatever history is still buffered, regardless of the flush
    /// clock. Called once at teardown.
    pub fn drain_history(&mut self) -> Result<()> {
        self.history.flush()
    }

    fn spawn_worker(&mut self, resolved: std::net::IpAddr) -> Result<()> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let source = Arc::clone(&self.source);
        let worker_cancel = Arc::clone(&cancel);

        let join = thread::Builder::new()
            .name("probe-worker".into())
            .spawn(move || {
                source.run_probe_cycle(resolved, worker_cancel);
                // A panic before this point still resolves the channel via
                // sender drop.
                let _ = done_tx.send(());
            })
            .map_err(TraceError::WorkerSpawn)?;

        self.worker = Some(Worker {
            join,
            done: done_rx,
            cancel,
        });
        self.last_sample = Instant::now();
        self.stop_requested_at = None;
        self.grace_warned = false;
        Ok(())
    }

    fn signal_cancel(&mut self) {
        if let Some(worker) = &self.worker {
            worker.cancel.store(true, Ordering::Relaxed);
            if self.stop_requested_at.is_none() {
                self.stop_requested_at = Some(Instant::now());
            }
        }
    }

    fn check_stop_grace(&mut self) {
        let Some(grace) = self.config.stop_grace else {
            return;
        };
        if self.grace_warned || !matches!(self.state, TraceState::Stopping | TraceState::Exiting) {
            return;
        }
        if let Some(at) = self.stop_requested_at {
            if at.elapsed() > grace {
                warn!(
                    elapsed_ms = at.elapsed().as_millis() as u64,
                    "worker has not observed cancellation within the grace period"
                );
                self.grace_warned = true;
            }
        }
    }

    /// Applies a requested state against the transition table. Illegal pairs
    /// are logged and leave everything untouched.
    fn transit(&mut self, requested: TraceState) {
        use TraceState::*;
        use Transition::*;

        let transition = match (self.state, requested) {
            (Idle, Idle) => IdleToIdle,
            (Idle, Tracing) => IdleToTracing,
            (Idle, Exiting) => IdleToExiting,
            (Tracing, Tracing) => TracingToTracing,
            (Tracing, Stopping) => TracingToStopping,
            (Tracing, Exiting) => TracingToExiting,
            (Stopping, Idle) => StoppingToIdle,
            (Stopping, Stopping) => StoppingToStopping,
            (Stopping, Exiting) => StoppingToExiting,
            (previous, requested) => {
                warn!(?previous, ?requested, "illegal transition, ignoring");
                return;
            }
        };

        self.state = requested;
        debug!(?transition, "state transition");
        self.on_transition(transition);
    }

    /// Side-effect hook run synchronously after every accepted transition.
    fn on_transition(&mut self, transition: Transition) {
        match transition {
            Transition::IdleToIdle => {}
            Transition::IdleToTracing => {
                // Worker launch happens in request_start, which holds the
                // resolved address.
            }
            Transition::TracingToTracing | Transition::StoppingToStopping => {
                self.sample();
            }
            Transition::StoppingToIdle => {
                // Final sample for the session before the status resets.
                self.sample();
                self.stop_requested_at = None;
                self.grace_warned = false;
                info!("trace session finished");
            }
            Transition::TracingToStopping => {
                self.signal_cancel();
                info!("waiting for the current probe round before stopping");
            }
            Transition::TracingToExiting => {
                self.signal_cancel();
            }
            Transition::IdleToExiting | Transition::StoppingToExiting => {
                // Teardown itself is gated on poll observing the handoff.
            }
        }
    }

    /// Takes one snapshot of the source and queues it for persistence.
    fn sample(&mut self) {
        let snapshot = Snapshot::build(self.source.as_ref(), &self.identity);
        self.history.append(snapshot.to_history_line());
        self.latest = Some(snapshot);
    }
}
