//! Periodic recomputation.
//!
//! The scheduler is either [`SchedulerState::Idle`] or
//! [`SchedulerState::Running`]. Timer ticks and manual triggers both go
//! through the same guard, so at most one cycle runs at a time; a trigger
//! that arrives while a cycle is running is skipped, not queued.
//!
//! Each cycle runs in its own task. A panic inside a cycle ends that
//! task only: it is logged, the state returns to idle, and the timer
//! keeps going.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::engine::{CycleReport, RiskEngine};

/// Whether a recomputation cycle is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// No cycle is running.
    Idle,
    /// A cycle is running.
    Running,
}

/// Result of asking for a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// The cycle ran to completion (or stopped early on request).
    Completed(CycleReport),
    /// Another cycle was already running.
    Skipped,
    /// The cycle panicked; nothing after the panic point was written.
    Failed,
}

/// Resets the running flag when a cycle ends, however it ends.
///
/// Owned by the task running the cycle, so a caller that stops waiting
/// does not release the flag early.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives [`RiskEngine::run_cycle_until`] on a fixed interval.
pub struct RecomputationScheduler {
    engine: Arc<RiskEngine>,
    interval: Duration,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RecomputationScheduler {
    /// Creates an idle scheduler. Nothing runs until [`Self::start`] or
    /// [`Self::recompute_now`].
    #[must_use]
    pub fn new(engine: Arc<RiskEngine>, interval: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            engine,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx,
            timer: Mutex::new(None),
        }
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::Acquire) {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    /// Starts the background timer. The first cycle fires one interval
    /// after this call. Calling `start` on a started scheduler does
    /// nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            log::warn!("Recomputation scheduler already started");
            return;
        }

        self.stop_tx.send_replace(false);
        let engine = Arc::clone(&self.engine);
        let running = Arc::clone(&self.running);
        let interval = self.interval;
        let mut stop_rx = self.stop_tx.subscribe();

        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("Recomputation scheduler started, interval {interval:?}");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_guarded(&engine, &running, stop_rx.clone()).await;
                    }
                    _ = stop_rx.changed() => break,
                }

                if *stop_rx.borrow() {
                    break;
                }
            }

            log::info!("Recomputation scheduler stopped");
        }));
    }

    /// Stops the timer and waits for it to exit.
    ///
    /// A cycle in progress finishes the zone it is writing and then ends;
    /// zones it has not reached keep their previous values.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);

        let handle = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(handle) = handle else {
            return;
        };

        if let Err(e) = handle.await {
            log::error!("Recomputation timer task failed: {e}");
        }
    }

    /// Runs a cycle immediately and waits for it.
    ///
    /// Returns [`CycleOutcome::Skipped`] if a cycle is already running.
    pub async fn recompute_now(&self) -> CycleOutcome {
        run_guarded(&self.engine, &self.running, self.stop_tx.subscribe()).await
    }
}

async fn run_guarded(
    engine: &Arc<RiskEngine>,
    running: &Arc<AtomicBool>,
    stop_rx: watch::Receiver<bool>,
) -> CycleOutcome {
    if running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        log::warn!("Recomputation cycle already running, skipping this trigger");
        return CycleOutcome::Skipped;
    }
    let guard = RunningGuard(Arc::clone(running));

    let engine = Arc::clone(engine);
    let cycle = tokio::spawn(async move {
        let _guard = guard;
        engine.run_cycle_until(move || *stop_rx.borrow()).await
    });

    match cycle.await {
        Ok(report) => CycleOutcome::Completed(report),
        Err(e) => {
            log::error!("Recomputation cycle aborted: {e}");
            CycleOutcome::Failed
        }
    }
}
