use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

use super::dispatcher::{Dispatcher, Task};

/// Delay between teardown and the call-ended/call-failed notification.
pub const SETTLE_DELAY: Duration = Duration::from_millis(300);

/// A task enqueued on the session queue after a delay, unless cancelled
/// first.
pub(crate) struct DeferredTask {
    handle: Option<JoinHandle<()>>,
}

impl DeferredTask {
    pub(crate) fn schedule(delay: Duration, dispatcher: &Dispatcher, task: Task) -> Self {
        let dispatcher = dispatcher.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.enqueue(task);
        });
        Self {
            handle: Some(handle),
        }
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Call-establishment timeout. A fire that raced with `cancel` is still
/// delivered to the queue, so each arming gets a generation and stale fires
/// are rejected by [`TimeoutGuard::take_if_current`].
#[derive(Default)]
pub(crate) struct TimeoutGuard {
    generation: u64,
    pending: Option<DeferredTask>,
}

impl TimeoutGuard {
    pub(crate) fn arm(&mut self, delay: Duration, dispatcher: &Dispatcher) {
        self.cancel();
        let generation = self.generation;
        trace!(target: "call::timer", generation, delay_ms = delay.as_millis() as u64, "arming call timeout");
        self.pending = Some(DeferredTask::schedule(
            delay,
            dispatcher,
            Task::CallTimeoutElapsed { generation },
        ));
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(mut pending) = self.pending.take() {
            pending.cancel();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Consumes the guard if `generation` belongs to the current arming.
    pub(crate) fn take_if_current(&mut self, generation: u64) -> bool {
        if self.pending.is_none() || generation != self.generation {
            return false;
        }
        self.pending = None;
        self.generation = self.generation.wrapping_add(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn armed_guard_fires_once_with_current_generation() {
        let (dispatcher, mut rx) = Dispatcher::new();
        let mut guard = TimeoutGuard::default();
        guard.arm(Duration::from_secs(2), &dispatcher);

        let Some(Task::CallTimeoutElapsed { generation }) = rx.recv().await else {
            panic!("expected timeout task");
        };
        assert!(guard.take_if_current(generation));
        assert!(!guard.take_if_current(generation));
        assert!(!guard.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_invalidates_a_fire_already_queued() {
        let (dispatcher, mut rx) = Dispatcher::new();
        let mut guard = TimeoutGuard::default();
        guard.arm(Duration::from_millis(10), &dispatcher);
        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.cancel();

        let Some(Task::CallTimeoutElapsed { generation }) = rx.recv().await else {
            panic!("expected timeout task");
        };
        assert!(!guard.take_if_current(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_deferred_task_never_enqueues() {
        let (dispatcher, mut rx) = Dispatcher::new();
        let mut deferred = DeferredTask::schedule(SETTLE_DELAY, &dispatcher, Task::SettleElapsed { failed: false });
        deferred.cancel();
        deferred.cancel();
        drop(dispatcher);

        assert!(rx.recv().await.is_none());
    }
}
