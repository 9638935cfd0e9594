//! Cron Scheduler
//!
//! Fires saves from a cron schedule on a dedicated thread.
//!
//! ## Thread Model
//! ```text
//!  set_schedule / stop              scheduler thread
//!  ───────────────────              ──────────────────────────────────
//!  update ScheduleState ──────┐     loop:
//!  send Reschedule/Shutdown ──┼──▶    recv_timeout(until next fire)
//!                             │       Timeout  → fire_pending(now)
//!                             │       Reschedule → recompute wait
//!                             └─▶     Shutdown → exit
//! ```
//!
//! Fires go through the `SaveTrigger`, which calls the same coordinator path
//! as `SAVE`. A `Busy` or `Loading` result is logged and the fire is skipped.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{EmberError, Result};

use super::cron::CronSchedule;

/// Longest single wait, so wall-clock jumps are noticed
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Something that performs a save when the schedule fires
pub trait SaveTrigger: Send + Sync {
    fn trigger(&self) -> Result<()>;
}

impl<F> SaveTrigger for F
where
    F: Fn() -> Result<()> + Send + Sync,
{
    fn trigger(&self) -> Result<()> {
        self()
    }
}

/// Active schedule and its next fire time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleState {
    pub schedule: Option<CronSchedule>,
    pub next_fire: Option<DateTime<Utc>>,
}

impl ScheduleState {
    /// The active expression, if any
    pub fn expr(&self) -> Option<&str> {
        self.schedule.as_ref().map(CronSchedule::expr)
    }
}

/// Control messages for the scheduler thread
enum Control {
    /// The schedule changed; recompute the wait
    Reschedule,
    Shutdown,
}

/// Background save scheduler
pub struct CronScheduler {
    state: Arc<Mutex<ScheduleState>>,
    trigger: Arc<dyn SaveTrigger>,
    control: Sender<Control>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronScheduler {
    /// Start the scheduler thread with an optional initial expression
    pub fn start(expr: Option<&str>, trigger: Arc<dyn SaveTrigger>) -> Result<Self> {
        let state = Arc::new(Mutex::new(build_state(expr, Utc::now())?));
        let (control, rx) = channel::unbounded();

        let handle = {
            let state = Arc::clone(&state);
            let trigger = Arc::clone(&trigger);
            std::thread::Builder::new()
                .name("emberkv-cron".to_string())
                .spawn(move || {
                    loop {
                        let wait = state.lock().next_fire.map(|next| {
                            (next - Utc::now())
                                .to_std()
                                .unwrap_or(Duration::ZERO)
                                .min(MAX_WAIT)
                        });
                        let message = match wait {
                            Some(wait) => rx.recv_timeout(wait),
                            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                        };
                        match message {
                            Ok(Control::Reschedule) => continue,
                            Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                            Err(RecvTimeoutError::Timeout) => {
                                fire_pending(&state, trigger.as_ref(), Utc::now());
                            }
                        }
                    }
                    debug!("Cron scheduler stopped");
                })
                .map_err(|e| EmberError::Config(format!("failed to spawn scheduler thread: {}", e)))?
        };

        if let Some(expr) = state.lock().expr() {
            info!(cron = expr, "Cron scheduler started");
        }

        Ok(Self {
            state,
            trigger,
            control,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Replace the schedule; `None` or an empty expression disables it
    ///
    /// An invalid expression is rejected and the current schedule kept.
    pub fn set_schedule(&self, expr: Option<&str>) -> Result<()> {
        let new_state = build_state(expr, Utc::now())?;
        match new_state.expr() {
            Some(expr) => info!(cron = expr, next = ?new_state.next_fire, "Snapshot schedule updated"),
            None => info!("Snapshot schedule disabled"),
        }
        *self.state.lock() = new_state;
        // The thread only exits on Shutdown, so a failed send means it is gone
        let _ = self.control.send(Control::Reschedule);
        Ok(())
    }

    /// Current schedule
    pub fn schedule(&self) -> ScheduleState {
        self.state.lock().clone()
    }

    /// Fire if the next fire time is at or before `now`
    ///
    /// Returns true if a save was triggered. Used by the scheduler thread;
    /// callable directly to drive the schedule from a chosen clock.
    pub fn fire_pending(&self, now: DateTime<Utc>) -> bool {
        fire_pending(&self.state, self.trigger.as_ref(), now)
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = self.control.send(Control::Shutdown);
            if handle.join().is_err() {
                error!("Cron scheduler thread panicked");
            }
        }
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn build_state(expr: Option<&str>, now: DateTime<Utc>) -> Result<ScheduleState> {
    let expr = match expr.map(str::trim) {
        Some(expr) if !expr.is_empty() => expr,
        _ => return Ok(ScheduleState::default()),
    };

    let schedule = CronSchedule::parse(expr)?;
    let next_fire = schedule.next_after(now);
    if next_fire.is_none() {
        warn!(cron = expr, "Cron expression never fires");
    }
    Ok(ScheduleState {
        schedule: Some(schedule),
        next_fire,
    })
}

/// Re-arm and trigger if due; the trigger runs without the state lock held
fn fire_pending(state: &Mutex<ScheduleState>, trigger: &dyn SaveTrigger, now: DateTime<Utc>) -> bool {
    {
        let mut state = state.lock();
        let next = match state.next_fire {
            Some(next) if next <= now => next,
            _ => return false,
        };
        let following = match &state.schedule {
            Some(schedule) => schedule.next_after(now),
            None => return false,
        };
        debug!(fired = %next, next = ?following, "Cron fire");
        state.next_fire = following;
    }

    match trigger.trigger() {
        Ok(()) => {}
        Err(EmberError::Busy) => warn!("Scheduled save skipped: another save is in progress"),
        Err(EmberError::Loading) => warn!("Scheduled save skipped: a snapshot is loading"),
        Err(e) => error!(error = %e, "Scheduled save failed"),
    }
    true
}
