//! Single-flight runner for collector refreshes.
//!
//! A `CancellableTaskManager` owns at most one in-flight run. Starting a new
//! run cancels the previous one first (token cancelled, linked helper process
//! killed), then spawns the new one. The spawned task yields once before it
//! starts working, so several `run()` calls made back to back collapse to the
//! last one.
//!
//! Results are committed through [`TaskContext::commit`], which takes the same
//! lock `run()` takes to supersede a run. A run that finishes late after being
//! superseded can therefore never write its results.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{CollectError, CollectResult};

struct CurrentRun {
    generation: u64,
    token: CancellationToken,
    subprocess: Option<Child>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    current: Option<CurrentRun>,
}

impl Slot {
    fn is_current(&self, generation: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| c.generation == generation && !c.token.is_cancelled())
    }
}

fn cancel_run(name: &str, mut run: CurrentRun) {
    run.token.cancel();
    if let Some(mut child) = run.subprocess.take() {
        if let Err(e) = child.start_kill() {
            debug!("{}: failed to kill helper process: {}", name, e);
        }
    }
    trace!("{}: cancelled run #{}", name, run.generation);
}

/// Runs one refresh at a time; a new run supersedes the current one.
pub struct CancellableTaskManager {
    name: &'static str,
    slot: Arc<Mutex<Slot>>,
}

impl CancellableTaskManager {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Cancels any current run and schedules `factory` as the new one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run<T, F, Fut>(&self, factory: F) -> RunHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = CollectResult<T>> + Send + 'static,
    {
        let ctx = {
            let mut slot = self.slot.lock();
            if let Some(previous) = slot.current.take() {
                cancel_run(self.name, previous);
            }
            slot.generation += 1;
            let token = CancellationToken::new();
            slot.current = Some(CurrentRun {
                generation: slot.generation,
                token: token.clone(),
                subprocess: None,
            });
            TaskContext {
                name: self.name,
                generation: slot.generation,
                token,
                slot: self.slot.clone(),
            }
        };

        let inner = tokio::spawn(async move {
            let _release = ReleaseGuard {
                generation: ctx.generation,
                slot: ctx.slot.clone(),
            };
            tokio::task::yield_now().await;

            let token = ctx.token.clone();
            if token.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(CollectError::Cancelled),
                result = factory(ctx) => result,
            }
        });

        RunHandle { inner }
    }

    /// Cancels the current run, if any.
    pub fn cancel(&self) {
        let previous = self.slot.lock().current.take();
        if let Some(run) = previous {
            cancel_run(self.name, run);
        }
    }

    pub fn is_running(&self) -> bool {
        self.slot.lock().current.is_some()
    }
}

impl Drop for CancellableTaskManager {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Clears the slot when the run it belongs to settles, unless superseded.
struct ReleaseGuard {
    generation: u64,
    slot: Arc<Mutex<Slot>>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot
            .current
            .as_ref()
            .is_some_and(|c| c.generation == self.generation)
        {
            slot.current = None;
        }
    }
}

/// Handed to each run: cancellation state, helper linking and the commit gate.
#[derive(Clone)]
pub struct TaskContext {
    name: &'static str,
    generation: u64,
    token: CancellationToken,
    slot: Arc<Mutex<Slot>>,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Runs `f` only while this run is still the current one.
    pub fn commit<R>(&self, f: impl FnOnce() -> R) -> CollectResult<R> {
        let slot = self.slot.lock();
        if !slot.is_current(self.generation) {
            return Err(CollectError::Cancelled);
        }
        Ok(f())
    }

    /// Links a spawned helper process so cancelling this run kills it.
    ///
    /// If the run was already superseded the child is killed right away.
    pub fn set_subprocess(&self, mut child: Child) -> CollectResult<()> {
        let mut slot = self.slot.lock();
        if !slot.is_current(self.generation) {
            drop(slot);
            let _ = child.start_kill();
            return Err(CollectError::Cancelled);
        }
        if let Some(current) = slot.current.as_mut() {
            current.subprocess = Some(child);
        }
        Ok(())
    }

    /// Waits for the linked helper to exit, unlinking it from this run.
    ///
    /// Helpers should be spawned with `kill_on_drop(true)` so a cancellation
    /// that lands while waiting still terminates them.
    pub async fn wait_subprocess(&self) -> CollectResult<ExitStatus> {
        let child = {
            let mut slot = self.slot.lock();
            if !slot.is_current(self.generation) {
                return Err(CollectError::Cancelled);
            }
            slot.current.as_mut().and_then(|c| c.subprocess.take())
        };
        let mut child =
            child.ok_or_else(|| CollectError::Helper(format!("{}: no helper linked", self.name)))?;
        child
            .wait()
            .await
            .map_err(|e| CollectError::Helper(format!("{}: wait failed: {}", self.name, e)))
    }
}

/// Future for the outcome of one run.
pub struct RunHandle<T> {
    inner: JoinHandle<CollectResult<T>>,
}

impl<T> Future for RunHandle<T> {
    type Output = CollectResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) if e.is_cancelled() => Poll::Ready(Err(CollectError::Cancelled)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(CollectError::Task(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
