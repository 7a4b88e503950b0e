//! Coalescing scheduler.
//!
//! Collapses a burst of triggers into few executions of one action: the
//! first trigger of a burst runs immediately (leading edge), later triggers
//! are folded into a single trailing run once `wait` passes without new
//! triggers, and a long burst still runs at least once per `max_wait`.
//!
//! The action reads the latest state when it runs, so a coalesced run always
//! acts on the most recent intent. Triggers must come from inside a Tokio
//! runtime.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

pub type Action = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Timing of a coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescePolicy {
    /// Quiet period that ends a burst
    pub wait: Duration,
    /// Longest a pending trigger may be held during a burst
    pub max_wait: Option<Duration>,
    /// Run on the first trigger of a burst
    pub leading: bool,
}

impl CoalescePolicy {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            max_wait: None,
            leading: true,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait.max(self.wait));
        self
    }

    pub fn trailing_only(mut self) -> Self {
        self.leading = false;
        self
    }
}

#[derive(Default)]
struct CoalesceState {
    /// Bumped by `cancel`; a timer of an older generation exits
    generation: u64,
    /// A burst is open and its timer task is alive
    active: bool,
    /// A trigger arrived that has not been served yet
    pending: bool,
    last_trigger: Option<Instant>,
    last_run: Option<Instant>,
}

pub struct Coalescer {
    name: &'static str,
    policy: CoalescePolicy,
    action: Action,
    state: Arc<Mutex<CoalesceState>>,
}

impl Coalescer {
    pub fn new(name: &'static str, policy: CoalescePolicy, action: Action) -> Self {
        Self {
            name,
            policy,
            action,
            state: Arc::new(Mutex::new(CoalesceState::default())),
        }
    }

    pub fn policy(&self) -> CoalescePolicy {
        self.policy
    }

    /// Request a run of the action.
    pub fn trigger(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_trigger = Some(now);

        if state.active {
            state.pending = true;
            return;
        }

        state.active = true;
        state.last_run = Some(now);
        if self.policy.leading {
            state.pending = false;
            tracing::trace!(coalescer = self.name, "Leading run");
            tokio::spawn((self.action)());
        } else {
            state.pending = true;
        }

        let generation = state.generation;
        drop(state);
        tokio::spawn(run_timer(
            self.name,
            self.policy,
            Arc::clone(&self.action),
            Arc::clone(&self.state),
            generation,
        ));
    }

    /// Drop any pending run and close the current burst.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.generation += 1;
        state.active = false;
        state.pending = false;
    }

    /// Whether a trailing run is waiting.
    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
    }
}

impl Drop for Coalescer {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_timer(
    name: &'static str,
    policy: CoalescePolicy,
    action: Action,
    state: Arc<Mutex<CoalesceState>>,
    generation: u64,
) {
    loop {
        let deadline = {
            let state = state.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation != generation {
                return;
            }
            let now = Instant::now();
            let quiet = state.last_trigger.unwrap_or(now) + policy.wait;
            match policy.max_wait {
                Some(max) => quiet.min(state.last_run.unwrap_or(now) + max),
                None => quiet,
            }
        };

        tokio::time::sleep_until(deadline).await;

        let run = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation != generation {
                return;
            }
            let now = Instant::now();
            let quiet = state
                .last_trigger
                .is_none_or(|t| now >= t + policy.wait);
            let overdue = policy
                .max_wait
                .is_some_and(|max| state.last_run.is_none_or(|t| now >= t + max));
            if !quiet && !overdue {
                continue;
            }

            let run = state.pending;
            if run {
                state.pending = false;
                state.last_run = Some(now);
            }
            if quiet {
                state.active = false;
            }
            (run, quiet)
        };

        match run {
            (true, quiet) => {
                tracing::trace!(coalescer = name, quiet, "Coalesced run");
                action().await;
                if quiet {
                    return;
                }
            }
            (false, true) => return,
            (false, false) => {}
        }
    }
}
