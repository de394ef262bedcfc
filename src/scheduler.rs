//! Continuous polling of the selected segment.
//!
//! One scheduler polls at most one segment. Each loop iteration claims the
//! segment's cycle slot, probes, and commits; the next cycle starts as soon
//! as the previous one finishes, so the probe timeout is the only throttle.
//! Cycles that end almost immediately are padded to a small fraction of it.
//! Stopping is cooperative: the cancel token is checked at the top of every
//! iteration and the in-flight cycle is left to finish. Switching segments
//! bumps a generation counter; a cycle only commits while holding the control
//! lock with its generation still current, so nothing is written for a
//! segment once the switch has returned.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::LivenessEngine;
use crate::error::{Error, Result};
use crate::types::{ScanSummary, SegmentId};

/// A cycle shorter than `probe timeout / MIN_CYCLE_DIVISOR` is padded to that
/// length, so a batch that fails instantly does not spin.
pub const MIN_CYCLE_DIVISOR: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Running,
    Paused,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: PollState,
    pub segment_id: Option<SegmentId>,
    pub cycles_completed: u64,
    pub cycles_discarded: u64,
    pub last_error: Option<String>,
    pub last_summary: Option<ScanSummary>,
}

#[derive(Default)]
struct Control {
    selected: Option<SegmentId>,
    generation: u64,
    paused: bool,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl Control {
    fn running(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| !c.is_cancelled())
    }

    fn halt(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

#[derive(Default)]
struct Counters {
    cycles_completed: u64,
    cycles_discarded: u64,
    last_error: Option<String>,
    last_summary: Option<ScanSummary>,
}

struct Inner {
    engine: Arc<LivenessEngine>,
    error_backoff: Duration,
    control: Mutex<Control>,
    counters: StdMutex<Counters>,
}

/// Handle to a polling scheduler; clones share the same state.
#[derive(Clone)]
pub struct PollingScheduler {
    inner: Arc<Inner>,
}

impl PollingScheduler {
    pub fn new(engine: Arc<LivenessEngine>, error_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                error_backoff,
                control: Mutex::new(Control::default()),
                counters: StdMutex::new(Counters::default()),
            }),
        }
    }

    /// Poll `segment_id`. A no-op if it is already being polled; if another
    /// segment was selected, that loop is stopped and its pending results
    /// are discarded first.
    pub async fn start(&self, segment_id: SegmentId) -> Result<()> {
        self.inner.engine.address_space().get_segment(segment_id)?;
        let mut control = self.inner.control.lock().await;
        if control.selected == Some(segment_id) && control.running() {
            debug!(segment_id, "already polling");
            return Ok(());
        }
        if control.selected != Some(segment_id) {
            control.halt();
            control.generation += 1;
            if let Some(old) = control.selected {
                info!(from = old, to = segment_id, "switching polled segment");
            }
            control.selected = Some(segment_id);
        }
        control.paused = false;
        self.spawn_loop(&mut control, segment_id);
        Ok(())
    }

    /// Alias of [`start`](Self::start) used when the operator picks a segment.
    pub async fn select_segment(&self, segment_id: SegmentId) -> Result<()> {
        self.start(segment_id).await
    }

    /// Stop polling `segment_id` after its in-flight cycle. Ignored for any
    /// other segment.
    pub async fn stop(&self, segment_id: SegmentId) {
        let mut control = self.inner.control.lock().await;
        if control.selected != Some(segment_id) {
            return;
        }
        control.halt();
        control.paused = false;
        info!(segment_id, "polling stopped");
    }

    /// Visibility signal: backgrounded pauses, foregrounded resumes the
    /// selected segment. Cached status is untouched either way.
    pub async fn set_visible(&self, visible: bool) {
        let mut control = self.inner.control.lock().await;
        let Some(segment_id) = control.selected else {
            return;
        };
        if !visible && control.running() {
            control.halt();
            control.paused = true;
            info!(segment_id, "polling paused");
        } else if visible && control.paused {
            control.paused = false;
            self.spawn_loop(&mut control, segment_id);
            info!(segment_id, "polling resumed");
        }
    }

    /// Called when a segment is deleted: stop polling it and discard
    /// anything still in flight.
    pub async fn forget(&self, segment_id: SegmentId) {
        let mut control = self.inner.control.lock().await;
        if control.selected == Some(segment_id) {
            control.halt();
            control.generation += 1;
            control.selected = None;
            control.paused = false;
        }
    }

    pub async fn status(&self) -> SchedulerStatus {
        let control = self.inner.control.lock().await;
        let state = if control.paused {
            PollState::Paused
        } else if control.running() {
            PollState::Running
        } else {
            PollState::Idle
        };
        let counters = self.inner.counters();
        SchedulerStatus {
            state,
            segment_id: control.selected,
            cycles_completed: counters.cycles_completed,
            cycles_discarded: counters.cycles_discarded,
            last_error: counters.last_error.clone(),
            last_summary: counters.last_summary.clone(),
        }
    }

    /// Cancel the loop and wait for its in-flight cycle to finish.
    pub async fn shutdown(&self) {
        let task = {
            let mut control = self.inner.control.lock().await;
            control.halt();
            control.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "polling task panicked");
            }
        }
    }

    fn spawn_loop(&self, control: &mut Control, segment_id: SegmentId) {
        control.halt();
        let cancel = CancellationToken::new();
        control.cancel = Some(cancel.clone());
        let inner = self.inner.clone();
        let generation = control.generation;
        control.task = Some(tokio::spawn(poll_loop(inner, segment_id, generation, cancel)));
        info!(segment_id, generation, "polling started");
    }
}

impl Inner {
    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn poll_loop(
    inner: Arc<Inner>,
    segment_id: SegmentId,
    generation: u64,
    cancel: CancellationToken,
) {
    let min_cycle = inner.engine.probe_options().timeout / MIN_CYCLE_DIVISOR;
    let mut sequence: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        // Waits out a cycle still running from a previous loop for this segment.
        let cycle = tokio::select! {
            guard = inner.engine.begin_cycle(segment_id) => guard,
            _ = cancel.cancelled() => break,
        };
        if cancel.is_cancelled() {
            break;
        }
        sequence += 1;
        let started = Instant::now();

        let evaluated = inner.engine.evaluate(segment_id, &cycle).await;
        match evaluated {
            Ok(aggregation) => {
                let control = inner.control.lock().await;
                if control.generation != generation {
                    inner.counters().cycles_discarded += 1;
                    debug!(segment_id, sequence, "segment no longer selected, results dropped");
                    break;
                }
                match inner.engine.commit(segment_id, &aggregation) {
                    Ok(()) => {
                        let mut counters = inner.counters();
                        counters.cycles_completed += 1;
                        counters.last_error = None;
                        counters.last_summary = Some(aggregation.summary.clone());
                        debug!(
                            segment_id,
                            sequence,
                            online = aggregation.summary.online,
                            offline = aggregation.summary.offline,
                            "cycle committed"
                        );
                    }
                    Err(e) => {
                        warn!(segment_id, sequence, error = %e, "cycle result lost");
                        inner.counters().last_error = Some(e.to_string());
                    }
                }
            }
            Err(e @ (Error::SegmentNotFound(_) | Error::ProbeUnavailable(_))) => {
                error!(segment_id, error = %e, "polling halted");
                inner.counters().last_error = Some(e.to_string());
                break;
            }
            Err(e) => {
                warn!(segment_id, sequence, error = %e, "cycle failed");
                inner.counters().last_error = Some(e.to_string());
                drop(cycle);
                tokio::select! {
                    _ = tokio::time::sleep(inner.error_backoff) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            }
        }
        drop(cycle);

        let elapsed = started.elapsed();
        if elapsed < min_cycle {
            debug!(segment_id, sequence, ?elapsed, "cycle finished early, pacing");
            tokio::select! {
                _ = tokio::time::sleep(min_cycle - elapsed) => {}
                _ = cancel.cancelled() => break,
            }
        } else {
            tokio::task::yield_now().await;
        }
    }
    cancel.cancel();
    debug!(segment_id, generation, cycles = sequence, "polling loop exited");
}
