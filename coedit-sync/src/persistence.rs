//! Save scheduling: debounce, retry, periodic sweep.
//!
//! ```text
//!  mark_dirty ──► debounce_at = now + 1s  (reset on every call)
//!                        │
//!  poll(now) ◄───────────┼──── retry_at (one per failure)
//!      │                 └──── next_sweep (every 10s)
//!      ▼
//!  begin_save ──► SaveTicket ──► storage PUT ──► finish_save(ticket, ok)
//!                                                  ├─ ok: clear pending if no
//!                                                  │      mutation since begin
//!                                                  └─ err: arm one retry
//! ```
//!
//! The scheduler owns no timers of its own. It records deadlines; the session
//! sleeps until [`PersistenceScheduler::next_deadline`] and calls `poll`.

use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use crate::config::RetryPolicy;

/// Tri-state save indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Saving,
    Unsaved,
    Saved,
}

/// Proof that a save was started; hand it back to `finish_save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveTicket {
    generation: u64,
}

#[derive(Debug, Clone)]
pub struct PersistenceScheduler {
    debounce: Duration,
    retry: RetryPolicy,
    sweep_interval: Duration,

    has_pending: bool,
    is_saving: bool,
    last_saved_at: Option<SystemTime>,
    /// Bumped on every mutation; a save only clears `has_pending` if no
    /// mutation happened while it was in flight.
    generation: u64,
    retry_attempt: u32,

    debounce_at: Option<Instant>,
    retry_at: Option<Instant>,
    next_sweep: Option<Instant>,
}

impl PersistenceScheduler {
    pub fn new(debounce: Duration, retry: RetryPolicy, sweep_interval: Duration) -> Self {
        Self {
            debounce,
            retry,
            sweep_interval,
            has_pending: false,
            is_saving: false,
            last_saved_at: None,
            generation: 0,
            retry_attempt: 0,
            debounce_at: None,
            retry_at: None,
            next_sweep: None,
        }
    }

    /// Arm the periodic sweep. A zero interval leaves it off.
    pub fn start(&mut self, now: Instant) {
        self.next_sweep = self.sweep_after(now);
    }

    fn sweep_after(&self, now: Instant) -> Option<Instant> {
        (!self.sweep_interval.is_zero()).then(|| now + self.sweep_interval)
    }

    /// Record a mutation and restart the debounce window.
    pub fn mark_dirty(&mut self, now: Instant) {
        self.has_pending = true;
        self.generation = self.generation.wrapping_add(1);
        self.debounce_at = Some(now + self.debounce);
    }

    /// Fire whichever deadlines have passed. Returns `true` when a save
    /// should start now.
    pub fn poll(&mut self, now: Instant) -> bool {
        let mut due = false;
        if self.debounce_at.is_some_and(|at| at <= now) {
            self.debounce_at = None;
            due = true;
        }
        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            due = true;
        }
        if let Some(at) = self.next_sweep {
            if at <= now {
                self.next_sweep = self.sweep_after(now);
                due = true;
            }
        }
        due && self.has_pending && !self.is_saving
    }

    /// Start a save. `None` when nothing is pending or a save is in flight.
    pub fn begin_save(&mut self) -> Option<SaveTicket> {
        if !self.has_pending || self.is_saving {
            return None;
        }
        Some(self.start_save())
    }

    /// Start the teardown save: proceeds whenever changes are pending. The
    /// caller settles any save in flight first; if that save never reports
    /// back this one still goes out.
    pub fn begin_final_save(&mut self) -> Option<SaveTicket> {
        if !self.has_pending {
            return None;
        }
        Some(self.start_save())
    }

    fn start_save(&mut self) -> SaveTicket {
        self.is_saving = true;
        self.debounce_at = None;
        self.retry_at = None;
        SaveTicket {
            generation: self.generation,
        }
    }

    /// Record the outcome of the save started with `ticket`.
    pub fn finish_save(&mut self, ticket: SaveTicket, ok: bool, now: Instant) {
        self.is_saving = false;
        if ok {
            self.retry_attempt = 0;
            self.retry_at = None;
            self.last_saved_at = Some(SystemTime::now());
            if ticket.generation == self.generation {
                self.has_pending = false;
            } else if self.debounce_at.is_none() {
                // Mutated mid-save and the debounce already fired while we
                // were busy.
                self.debounce_at = Some(now + self.debounce);
            }
            return;
        }

        if self.retry_at.is_none() {
            match self.retry.delay_for(self.retry_attempt) {
                Some(delay) => {
                    self.retry_at = Some(now + delay);
                    self.retry_attempt = self.retry_attempt.saturating_add(1);
                }
                None => {
                    log::warn!(
                        "Save retries exhausted after {} attempts; waiting for the next sweep",
                        self.retry_attempt
                    );
                }
            }
        }
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.debounce_at, self.retry_at, self.next_sweep]
            .into_iter()
            .flatten()
            .min()
    }

    /// Disarm every timer. Pending state is kept.
    pub fn cancel_timers(&mut self) {
        self.debounce_at = None;
        self.retry_at = None;
        self.next_sweep = None;
    }

    pub fn status(&self) -> SaveStatus {
        if self.is_saving {
            SaveStatus::Saving
        } else if self.has_pending {
            SaveStatus::Unsaved
        } else {
            SaveStatus::Saved
        }
    }

    pub fn has_pending(&self) -> bool {
        self.has_pending
    }

    pub fn is_saving(&self) -> bool {
        self.is_saving
    }

    pub fn last_saved_at(&self) -> Option<SystemTime> {
        self.last_saved_at
    }

    pub fn retry_armed(&self) -> bool {
        self.retry_at.is_some()
    }
}
