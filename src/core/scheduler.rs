use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use super::event::LinkEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TimerKind {
    Poll,
    ResponseDeadline,
}

/// Opaque, never reused handle of one scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl TimerHandle {
    fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Time source for one link. Fired timers arrive as [`LinkEvent::Timer`].
pub trait Scheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, kind: TimerKind) -> TimerHandle;

    /// Cancelling a fired or already cancelled handle is a no-op.
    fn cancel(&self, handle: TimerHandle);
}

/// Scheduler backed by tokio sleep tasks.
pub struct TokioScheduler {
    events: flume::Sender<LinkEvent>,
    pending: Arc<Mutex<HashMap<TimerHandle, tokio::task::AbortHandle>>>,
}

impl TokioScheduler {
    pub fn new(events: flume::Sender<LinkEvent>) -> Self {
        Self {
            events,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, kind: TimerKind) -> TimerHandle {
        let handle = TimerHandle::next();
        let events = self.events.clone();
        let pending = self.pending.clone();

        // hold the lock across spawn so a zero delay cannot remove the entry before insertion
        let mut guard = self.pending.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.lock().remove(&handle);
            if events
                .send_async(LinkEvent::Timer { kind, handle })
                .await
                .is_err()
            {
                log::debug!("Timer {handle:?} fired after its link went away");
            }
        });
        guard.insert(handle, task.abort_handle());
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = self.pending.lock().remove(&handle) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.pending.lock().drain() {
            task.abort();
        }
    }
}

/// Holds at most one live handle per [`TimerKind`].
#[derive(Debug, Default)]
pub struct PollTimers {
    poll: Option<TimerHandle>,
    deadline: Option<TimerHandle>,
}

impl PollTimers {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<TimerHandle> {
        match kind {
            TimerKind::Poll => &mut self.poll,
            TimerKind::ResponseDeadline => &mut self.deadline,
        }
    }

    /// Schedule `kind`, cancelling the previous timer of the same kind.
    pub fn arm(&mut self, scheduler: &dyn Scheduler, kind: TimerKind, delay: Duration) -> TimerHandle {
        if let Some(previous) = self.slot(kind).take() {
            scheduler.cancel(previous);
        }
        let handle = scheduler.schedule_after(delay, kind);
        *self.slot(kind) = Some(handle);
        handle
    }

    pub fn cancel(&mut self, scheduler: &dyn Scheduler, kind: TimerKind) {
        if let Some(handle) = self.slot(kind).take() {
            scheduler.cancel(handle);
        }
    }

    pub fn cancel_all(&mut self, scheduler: &dyn Scheduler) {
        self.cancel(scheduler, TimerKind::Poll);
        self.cancel(scheduler, TimerKind::ResponseDeadline);
    }

    /// Consume a firing. Returns `false` for a handle that is no longer armed,
    /// e.g. one cancelled after its event was already queued.
    pub fn accept(&mut self, kind: TimerKind, handle: TimerHandle) -> bool {
        let slot = self.slot(kind);
        if *slot == Some(handle) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::Poll => self.poll.is_some(),
            TimerKind::ResponseDeadline => self.deadline.is_some(),
        }
    }
}

/// One request recorded by [`ManualScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledTimer {
    pub handle: TimerHandle,
    pub kind: TimerKind,
    pub delay: Duration,
}

/// Scheduler that never fires on its own; tests decide when timers fire.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    scheduled: Mutex<Vec<ScheduledTimer>>,
    cancelled: Mutex<Vec<TimerHandle>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every timer requested so far, in order.
    pub fn scheduled(&self) -> Vec<ScheduledTimer> {
        self.scheduled.lock().clone()
    }

    /// Most recent timer of `kind` that has not been cancelled.
    pub fn armed(&self, kind: TimerKind) -> Option<ScheduledTimer> {
        let cancelled = self.cancelled.lock();
        self.scheduled
            .lock()
            .iter()
            .rev()
            .find(|t| t.kind == kind && !cancelled.contains(&t.handle))
            .copied()
    }

    /// The event a link would receive if the armed timer of `kind` fired now.
    pub fn fire(&self, kind: TimerKind) -> Option<LinkEvent> {
        self.armed(kind).map(|t| {
            self.cancelled.lock().push(t.handle);
            LinkEvent::Timer {
                kind,
                handle: t.handle,
            }
        })
    }

    pub fn is_cancelled(&self, handle: TimerHandle) -> bool {
        self.cancelled.lock().contains(&handle)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_after(&self, delay: Duration, kind: TimerKind) -> TimerHandle {
        let handle = TimerHandle::next();
        self.scheduled.lock().push(ScheduledTimer {
            handle,
            kind,
            delay,
        });
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut cancelled = self.cancelled.lock();
        if !cancelled.contains(&handle) {
            cancelled.push(handle);
        }
    }
}
