//! Single-slot scheduler for the proactive token refresh.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Stand-in deadline for delays too large to represent (about 30 years)
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

struct Pending {
    id: u64,
    handle: JoinHandle<()>,
    delay: Duration,
    due: Instant,
    due_at: DateTime<Utc>,
}

/// Holds at most one scheduled task.
///
/// Scheduling aborts whatever is still waiting. A task that has already
/// fired removes itself from the slot first, so it can reschedule without
/// aborting itself.
#[derive(Default)]
pub struct RefreshTimer {
    slot: Arc<Mutex<Option<Pending>>>,
    next_id: AtomicU64,
}

/// Snapshot of the pending schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRefresh {
    /// Delay the task was scheduled with
    pub delay: Duration,
    /// Time left until it fires
    pub remaining: Duration,
    /// Wall-clock time it fires at
    pub due_at: DateTime<Utc>,
}

fn lock(slot: &Mutex<Option<Pending>>) -> MutexGuard<'_, Option<Pending>> {
    // A panic while holding the lock cannot leave the slot half-written
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RefreshTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any pending task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::clone(&self.slot);

        let mut guard = lock(&self.slot);
        if let Some(previous) = guard.take() {
            previous.handle.abort();
            debug!(id = previous.id, "Replaced pending refresh timer");
        }

        // Deadline fixed now, not at the task's first poll
        let now = Instant::now();
        let due = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(due).await;
            {
                let mut guard = lock(&slot);
                match guard.as_ref() {
                    Some(pending) if pending.id == id => *guard = None,
                    _ => return,
                }
            }
            task.await;
        });

        let due_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        *guard = Some(Pending {
            id,
            handle,
            delay,
            due,
            due_at,
        });
        debug!(id, delay_ms = delay.as_millis() as u64, "Scheduled refresh timer");
    }

    /// Abort the pending task, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match lock(&self.slot).take() {
            Some(pending) => {
                pending.handle.abort();
                debug!(id = pending.id, "Cancelled refresh timer");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn scheduled(&self) -> Option<ScheduledRefresh> {
        lock(&self.slot).as_ref().map(|pending| ScheduledRefresh {
            delay: pending.delay,
            remaining: pending.due.saturating_duration_since(Instant::now()),
            due_at: pending.due_at,
        })
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
