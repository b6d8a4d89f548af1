//! Process-wide scavenge lifecycle: one run at a time.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use uuid::Uuid;

use crate::error::{CancelReason, ScavengeError};

use super::{ScavengeOutcome, Scavenger};

const CANCEL_NONE: u8 = 0;
const CANCEL_STOP: u8 = 1;
const CANCEL_SHUTDOWN: u8 = 2;

/// Cooperative cancellation signal shared between the runner and the
/// pipeline.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    state: Arc<AtomicU8>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        let _ = self.state.compare_exchange(
            CANCEL_NONE,
            CANCEL_STOP,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn request_shutdown(&self) {
        // Shutdown outranks an in-flight stop request.
        self.state.store(CANCEL_SHUTDOWN, Ordering::SeqCst);
    }

    pub fn requested(&self) -> Option<CancelReason> {
        match self.state.load(Ordering::SeqCst) {
            CANCEL_STOP => Some(CancelReason::Stop),
            CANCEL_SHUTDOWN => Some(CancelReason::Shutdown),
            _ => None,
        }
    }

    /// Suspension point: errors out of the pipeline when cancellation
    /// was requested.
    pub fn check(&self) -> crate::Result<()> {
        match self.requested() {
            Some(reason) => Err(ScavengeError::Cancelled { reason }),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
enum RunnerState {
    Idle,
    Running { id: Uuid, token: CancellationToken },
    Cancelling { id: Uuid },
}

/// Result of a start request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { scavenge_id: Uuid },
    /// Another scavenge is already running.
    InProgress,
}

/// Result of a stop request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopping,
    /// The given id does not match the running scavenge.
    InvalidScavengeId,
    NotRunning,
}

struct RunnerInner {
    state: Mutex<RunnerState>,
    handle: Mutex<Option<JoinHandle<ScavengeOutcome>>>,
}

/// Singleton guard around the scavenger: `start` is rejected while a
/// run is active, `stop` must name the running id, and completion
/// restores `Idle`.
#[derive(Clone)]
pub struct ScavengeRunner {
    inner: Arc<RunnerInner>,
}

impl Default for ScavengeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScavengeRunner {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                state: Mutex::new(RunnerState::Idle),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Launch a run on a background thread. Only one run may be
    /// active; repeat requests observe `InProgress`.
    pub fn start(
        &self,
        mut scavenger: Scavenger,
        threads: usize,
        start_from_chunk: Option<u32>,
    ) -> StartOutcome {
        let mut state = self.inner.state.lock().expect("runner state lock");
        if !matches!(*state, RunnerState::Idle) {
            return StartOutcome::InProgress;
        }

        let scavenge_id = Uuid::new_v4();
        let token = CancellationToken::new();
        *state = RunnerState::Running {
            id: scavenge_id,
            token: token.clone(),
        };
        drop(state);

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("scavenger".to_string())
            .spawn(move || {
                let outcome = scavenger.run(scavenge_id, threads, start_from_chunk, &token);
                let mut state = inner.state.lock().expect("runner state lock");
                *state = RunnerState::Idle;
                outcome
            });

        match spawned {
            Ok(handle) => {
                *self.inner.handle.lock().expect("runner handle lock") = Some(handle);
                StartOutcome::Started { scavenge_id }
            }
            Err(err) => {
                let mut state = self.inner.state.lock().expect("runner state lock");
                *state = RunnerState::Idle;
                tracing::error!(error = %err, "failed to spawn scavenger thread");
                StartOutcome::InProgress
            }
        }
    }

    /// Request a cooperative stop of the run with the given id.
    pub fn stop(&self, scavenge_id: Uuid) -> StopOutcome {
        let mut state = self.inner.state.lock().expect("runner state lock");
        let token = match &*state {
            RunnerState::Idle => return StopOutcome::NotRunning,
            RunnerState::Running { id, token } if *id == scavenge_id => token.clone(),
            RunnerState::Cancelling { id } if *id == scavenge_id => return StopOutcome::Stopping,
            RunnerState::Running { .. } | RunnerState::Cancelling { .. } => {
                return StopOutcome::InvalidScavengeId;
            }
        };
        token.request_stop();
        *state = RunnerState::Cancelling { id: scavenge_id };
        StopOutcome::Stopping
    }

    pub fn is_idle(&self) -> bool {
        matches!(
            *self.inner.state.lock().expect("runner state lock"),
            RunnerState::Idle
        )
    }

    /// Wait for the active (or last) run to finish.
    pub fn join(&self) -> Option<ScavengeOutcome> {
        let handle = self.inner.handle.lock().expect("runner handle lock").take()?;
        match handle.join() {
            Ok(outcome) => Some(outcome),
            Err(_) => Some(ScavengeOutcome::Errored {
                error: "scavenger thread panicked".to_string(),
            }),
        }
    }
}
