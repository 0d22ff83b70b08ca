//! Per-run wall-clock timeout

use sandpit_common::RunId;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const DISARMED: u8 = 2;

struct ArmedTimer {
    run_id: RunId,
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

/// Host-side countdown armed once per execution.
///
/// Expiry is reported by sending the run id on the channel returned from
/// [`TimeoutSupervisor::new`]. Expiry and [`TimeoutSupervisor::disarm`] both
/// move the timer out of the armed state with a compare-and-set, so for any
/// run exactly one of them is observed.
pub struct TimeoutSupervisor {
    expirations: mpsc::UnboundedSender<RunId>,
    armed: Option<ArmedTimer>,
}

impl TimeoutSupervisor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                expirations: tx,
                armed: None,
            },
            rx,
        )
    }

    /// Start the countdown for `run_id`, disarming any previous timer
    pub fn arm(&mut self, run_id: RunId, duration: Duration) {
        if let Some(previous) = self.armed.take() {
            Self::cancel(previous);
        }

        let state = Arc::new(AtomicU8::new(ARMED));
        let task_state = state.clone();
        let expirations = self.expirations.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if task_state
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::debug!(
                    run_id = %run_id,
                    timeout_ms = duration.as_millis() as u64,
                    "Timeout fired"
                );
                let _ = expirations.send(run_id);
            }
        });

        self.armed = Some(ArmedTimer {
            run_id,
            state,
            task,
        });
    }

    /// Cancel the timer for `run_id`.
    ///
    /// Returns `false` when no timer for that run is armed or when it already
    /// fired; in the latter case the expiry has been (or is being) delivered.
    pub fn disarm(&mut self, run_id: RunId) -> bool {
        match &self.armed {
            Some(timer) if timer.run_id == run_id => {}
            _ => return false,
        }
        match self.armed.take() {
            Some(timer) => Self::cancel(timer),
            None => false,
        }
    }

    /// Disarm whatever is armed
    pub fn disarm_all(&mut self) {
        if let Some(timer) = self.armed.take() {
            Self::cancel(timer);
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
            .as_ref()
            .map(|t| t.state.load(Ordering::Acquire) == ARMED)
            .unwrap_or(false)
    }

    fn cancel(timer: ArmedTimer) -> bool {
        let won = timer
            .state
            .compare_exchange(ARMED, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            timer.task.abort();
        }
        won
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
