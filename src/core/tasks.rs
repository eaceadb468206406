//! Parallel/deferred task ordering.
//!
//! Two task classes share one barrier:
//! - [`TaskKind::Parallel`] runs immediately on the worker pool, in no particular order
//! - [`TaskKind::Deferred`] is queued and runs on the thread calling [`TaskController::wait`],
//!   in submission order, only after every parallel task of the cycle has finished
//!
//! Deferred tasks therefore always observe the complete result of the parallel
//! phase. A failing or panicking parallel task never cuts the barrier short:
//! `wait()` collects every outcome first and then reports the failure with the
//! lowest submission index. A failed cycle discards its deferred tasks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, trace};
use thiserror::Error;

use super::workers::Workers;

/// Body of a submitted task.
pub type Task = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Scheduling class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Start now on the worker pool
    Parallel,
    /// Run after the barrier, in submission order, on the waiting thread
    Deferred,
}

/// Failure surfaced by [`TaskController::wait`].
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("parallel task #{index} failed: {source:#}")]
    Failed {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("parallel task #{index} panicked: {message}")]
    Panicked { index: usize, message: String },
    #[error("deferred task #{index} failed: {source:#}")]
    Deferred {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("worker pool stopped before task #{index} reported")]
    PoolUnavailable { index: usize },
}

impl TaskError {
    /// Submission index of the failing task within its class.
    pub fn index(&self) -> usize {
        match self {
            TaskError::Failed { index, .. }
            | TaskError::Panicked { index, .. }
            | TaskError::Deferred { index, .. }
            | TaskError::PoolUnavailable { index } => *index,
        }
    }
}

/// Outcome reported by a parallel task: (submission index, result).
type Outcome = (usize, Result<(), TaskError>);

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Barrier-based controller over a shared [`Workers`] pool.
pub struct TaskController {
    workers: Arc<Workers>,
    tx: Sender<Outcome>,
    rx: Receiver<Outcome>,
    /// Parallel tasks submitted in the current cycle
    outstanding: usize,
    deferred: Vec<Task>,
}

impl TaskController {
    pub fn new(workers: Arc<Workers>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            workers,
            tx,
            rx,
            outstanding: 0,
            deferred: Vec::new(),
        }
    }

    /// Submit a task of the given class.
    pub fn submit<F>(&mut self, kind: TaskKind, task: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        match kind {
            TaskKind::Parallel => {
                let index = self.outstanding;
                self.outstanding += 1;
                let tx = self.tx.clone();
                self.workers.execute(move || {
                    let result = match panic::catch_unwind(AssertUnwindSafe(task)) {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(source)) => Err(TaskError::Failed { index, source }),
                        Err(payload) => Err(TaskError::Panicked {
                            index,
                            message: panic_message(payload),
                        }),
                    };
                    // Receiver lives as long as the controller
                    let _ = tx.send((index, result));
                });
            }
            TaskKind::Deferred => self.deferred.push(Box::new(task)),
        }
    }

    /// Parallel tasks submitted since the last barrier.
    pub fn pending_parallel(&self) -> usize {
        self.outstanding
    }

    /// Deferred tasks queued since the last barrier.
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Barrier: await every parallel task, then run deferred tasks in order.
    ///
    /// Returns the parallel failure with the lowest submission index, if any;
    /// in that case no deferred task runs. Otherwise deferred tasks run one by
    /// one and the first deferred failure stops the rest.
    pub fn wait(&mut self) -> Result<(), TaskError> {
        let expected = std::mem::take(&mut self.outstanding);
        let deferred = std::mem::take(&mut self.deferred);
        trace!("barrier: awaiting {} parallel, {} deferred", expected, deferred.len());

        let mut first_failure: Option<TaskError> = None;
        for received in 0..expected {
            let (index, result) = match self.rx.recv() {
                Ok(outcome) => outcome,
                // Unreachable while `self.tx` is alive; kept as a hard stop
                Err(_) => return Err(TaskError::PoolUnavailable { index: received }),
            };
            if let Err(e) = result {
                debug!("barrier: {}", e);
                let lower = first_failure.as_ref().is_none_or(|f| index < f.index());
                if lower {
                    first_failure = Some(e);
                }
            }
        }

        if let Some(e) = first_failure {
            debug!("barrier: dropping {} deferred tasks after failure", deferred.len());
            return Err(e);
        }

        for (index, task) in deferred.into_iter().enumerate() {
            task().map_err(|source| TaskError::Deferred { index, source })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskController")
            .field("workers", &self.workers)
            .field("outstanding", &self.outstanding)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

impl Drop for TaskController {
    fn drop(&mut self) {
        // Outstanding tasks may still touch shared state; settle them first
        if self.outstanding > 0 {
            self.deferred.clear();
            let _ = self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn controller(threads: usize) -> TaskController {
        TaskController::new(Arc::new(Workers::new(threads).unwrap()))
    }

    #[test]
    fn test_deferred_runs_after_all_parallel_in_order() {
        let mut tasks = controller(4);
        let done = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let done = Arc::clone(&done);
            tasks.submit(TaskKind::Parallel, move || {
                thread::sleep(Duration::from_millis((16 - i) as u64));
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        for m in 0..5 {
            let done = Arc::clone(&done);
            let log = Arc::clone(&log);
            tasks.submit(TaskKind::Deferred, move || {
                // Every parallel task must already be complete
                assert_eq!(done.load(Ordering::SeqCst), 16);
                log.lock().unwrap().push(m);
                Ok(())
            });
        }
        assert_eq!(tasks.pending_parallel(), 16);
        assert_eq!(tasks.pending_deferred(), 5);

        tasks.wait().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(tasks.pending_parallel(), 0);
        assert_eq!(tasks.pending_deferred(), 0);
    }

    #[test]
    fn test_deferred_runs_on_calling_thread() {
        let mut tasks = controller(2);
        let caller = thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        tasks.submit(TaskKind::Deferred, move || {
            *s.lock().unwrap() = Some(thread::current().id());
            Ok(())
        });
        tasks.wait().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(caller));
    }

    #[test]
    fn test_failure_waits_for_siblings_and_skips_deferred() {
        let mut tasks = controller(2);
        let finished = Arc::new(AtomicUsize::new(0));
        let deferred_ran = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let finished = Arc::clone(&finished);
            tasks.submit(TaskKind::Parallel, move || {
                if i == 1 || i == 4 {
                    anyhow::bail!("task {} broke", i);
                }
                thread::sleep(Duration::from_millis(5));
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let d = Arc::clone(&deferred_ran);
        tasks.submit(TaskKind::Deferred, move || {
            d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = tasks.wait().unwrap_err();
        assert!(matches!(err, TaskError::Failed { index: 1, .. }), "got {err}");
        // Siblings all completed before the error surfaced
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        assert_eq!(deferred_ran.load(Ordering::SeqCst), 0);

        // Next cycle starts clean
        tasks.wait().unwrap();
        assert_eq!(deferred_ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_is_reported() {
        let mut tasks = controller(1);
        tasks.submit(TaskKind::Parallel, || panic!("boom"));
        let err = tasks.wait().unwrap_err();
        match err {
            TaskError::Panicked { index, message } => {
                assert_eq!(index, 0);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_deferred_failure_stops_later_deferred() {
        let mut tasks = controller(1);
        let ran = Arc::new(AtomicUsize::new(0));
        tasks.submit(TaskKind::Deferred, || anyhow::bail!("first"));
        let r = Arc::clone(&ran);
        tasks.submit(TaskKind::Deferred, move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(tasks.wait(), Err(TaskError::Deferred { index: 0, .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_without_tasks() {
        let mut tasks = controller(1);
        tasks.wait().unwrap();
    }
}
