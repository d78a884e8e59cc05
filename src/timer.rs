//! Session watchdog.
//!
//! One countdown per session. Every arming gets a fresh generation number;
//! the expiry callback receives it and the owner confirms through
//! [`SessionTimer::accept_fire`] that it still refers to the live arming.
//! Fires from paused, reset or cleared armings are rejected there, so the
//! session is failed at most once per arming and never after `clear_all`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

pub type ExpireCallback = Arc<dyn Fn(u64) + Send + Sync>;

enum TimerState {
    Idle,
    Running {
        deadline: Instant,
        task: JoinHandle<()>,
    },
    Paused {
        remaining: Duration,
    },
}

pub struct SessionTimer {
    duration: Duration,
    on_expire: ExpireCallback,
    generation: u64,
    state: TimerState,
}

impl SessionTimer {
    pub fn new(duration: Duration, on_expire: ExpireCallback) -> Self {
        Self {
            duration,
            on_expire,
            generation: 0,
            state: TimerState::Idle,
        }
    }

    /// Arms the full duration, replacing any running or paused countdown.
    pub fn start(&mut self) {
        self.arm(self.duration);
    }

    pub fn pause(&mut self) {
        if let TimerState::Running { deadline, task } = &self.state {
            task.abort();
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.generation += 1;
            self.state = TimerState::Paused { remaining };
            trace!(remaining_ms = remaining.as_millis() as u64, "session timer paused");
        }
    }

    pub fn resume(&mut self) {
        if let TimerState::Paused { remaining } = self.state {
            self.arm(remaining);
        }
    }

    /// Restarts the full duration. Does nothing when no countdown exists.
    pub fn reset(&mut self) {
        if !matches!(self.state, TimerState::Idle) {
            self.arm(self.duration);
        }
    }

    pub fn clear_all(&mut self) {
        if let TimerState::Running { task, .. } = &self.state {
            task.abort();
        }
        self.generation += 1;
        self.state = TimerState::Idle;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, TimerState::Running { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, TimerState::Paused { .. })
    }

    /// Confirms a fire reported by the callback. Returns true exactly once,
    /// for the live arming; the timer is idle afterwards.
    pub fn accept_fire(&mut self, generation: u64) -> bool {
        if generation != self.generation || !self.is_running() {
            return false;
        }
        self.generation += 1;
        self.state = TimerState::Idle;
        true
    }

    fn arm(&mut self, after: Duration) {
        if let TimerState::Running { task, .. } = &self.state {
            task.abort();
        }
        self.generation += 1;
        let generation = self.generation;
        let on_expire = self.on_expire.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_expire(generation);
        });
        self.state = TimerState::Running {
            deadline: Instant::now() + after,
            task,
        };
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        if let TimerState::Running { task, .. } = &self.state {
            task.abort();
        }
    }
}
