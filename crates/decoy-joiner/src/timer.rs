//! Cancellable delayed tasks and single-flight timer slots.
//!
//! `DelayedTask` is the one timing primitive in the system: a future that
//! runs after a delay (or repeatedly on a period) and can be aborted while
//! still pending. `TimerSlot` layers the single-flight discipline on top:
//! a logical slot holds at most one pending task, and installing a new one
//! cancels whatever was there first.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Lifecycle of one scheduled callback, shared between the task and its
/// handle. Transitions to `Running` and to `Cancelled` race for the same
/// lock, so a callback that has not entered `Running` by the time `cancel`
/// returns can never enter it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Running,
    Finished,
    Cancelled,
}

/// A cancellable delayed task.
///
/// Dropping the handle detaches the task (it still fires); use `cancel`
/// or a `TimerSlot` when the firing must be prevented.
#[derive(Debug)]
pub struct DelayedTask {
    handle: JoinHandle<()>,
    state: Arc<Mutex<TaskState>>,
}

impl DelayedTask {
    /// Run `fut` once after `delay`.
    pub fn once<F>(delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(Mutex::new(TaskState::Pending));
        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut s = task_state.lock().unwrap();
                if *s == TaskState::Cancelled {
                    return;
                }
                *s = TaskState::Running;
            }
            fut.await;
            *task_state.lock().unwrap() = TaskState::Finished;
        });
        Self { handle, state }
    }

    /// Run the future produced by `f` every `period`, first firing one
    /// period from now.
    pub fn repeating<F, Fut>(period: Duration, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let state = Arc::new(Mutex::new(TaskState::Pending));
        let task_state = state.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval fires immediately; swallow that so the first real
            // firing lands one period out.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                {
                    let mut s = task_state.lock().unwrap();
                    if *s == TaskState::Cancelled {
                        return;
                    }
                    *s = TaskState::Running;
                }
                f().await;
                {
                    let mut s = task_state.lock().unwrap();
                    if *s == TaskState::Cancelled {
                        return;
                    }
                    *s = TaskState::Pending;
                }
            }
        });
        Self { handle, state }
    }

    /// Cancel the task. A callback that has not started running by the
    /// time this returns will never run, even if its deadline already
    /// passed: the task re-checks the shared state under the lock before
    /// entering the callback, so an abort that lands late cannot let the
    /// callback through.
    pub fn cancel(&self) {
        *self.state.lock().unwrap() = TaskState::Cancelled;
        self.handle.abort();
    }

    /// Whether the task has already run to completion (or been aborted).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// A logical slot holding at most one pending `DelayedTask`.
///
/// `replace` cancels the previously held task before installing the new
/// one, so a later scheduling request for the same slot always supersedes
/// an earlier unfired one.
#[derive(Debug, Default)]
pub struct TimerSlot {
    current: Mutex<Option<DelayedTask>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending task in this slot, then schedule `fut` after
    /// `delay`.
    pub fn replace<F>(&self, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.current.lock().unwrap();
        if let Some(old) = slot.take() {
            old.cancel();
        }
        *slot = Some(DelayedTask::once(delay, fut));
    }

    /// Cancel any pending task without installing a replacement.
    pub fn cancel(&self) {
        if let Some(old) = self.current.lock().unwrap().take() {
            old.cancel();
        }
    }

    /// Whether a task is currently installed and not yet finished.
    pub fn is_pending(&self) -> bool {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}
