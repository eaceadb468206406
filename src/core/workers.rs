//! Fixed-size thread pool executing parallel sync tasks.
//!
//! Uses work-stealing deques:
//! - Submitted jobs go to a global injector
//! - Idle workers drain the injector, then steal from siblings
//! - Zero lock contention between workers
//!
//! The pool has no notion of completion; [`TaskController`] layers the
//! barrier on top of it.
//!
//! [`TaskController`]: super::tasks::TaskController

use crossbeam::deque::{Injector, Worker};
use log::trace;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool with work-stealing.
///
/// # Example
/// ```ignore
/// let workers = Workers::new(4)?;
/// workers.execute(move || {
///     tracker.touch_record(host.as_ref(), object, "", true);
/// });
/// ```
pub struct Workers {
    injector: Arc<Injector<Job>>,          // Global queue for submitted jobs
    handles: Vec<thread::JoinHandle<()>>,  // Thread handles for shutdown
    shutdown: Arc<AtomicBool>,             // Shutdown signal
}

impl Workers {
    /// Spawn `num_threads` workers (at least one).
    ///
    /// Recommended: `num_cpus::get() * 3 / 4` (leave room for the host's main thread).
    pub fn new(num_threads: usize) -> io::Result<Self> {
        let num_threads = num_threads.max(1);
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers_local: Vec<Worker<Job>> = Vec::new();
        let mut stealers = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..num_threads {
            let worker: Worker<Job> = Worker::new_fifo();
            stealers.push(worker.stealer());
            workers_local.push(worker);
        }

        for (worker_id, worker) in workers_local.into_iter().enumerate() {
            let injector = Arc::clone(&injector);
            let worker_shutdown = Arc::clone(&shutdown);
            let stealers = stealers.clone();

            let spawned = thread::Builder::new()
                .name(format!("scenelink-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);

                    loop {
                        // 1. Own queue first
                        if let Some(job) = worker.pop() {
                            job();
                            continue;
                        }

                        // 2. Global injector (moves a batch into the local queue)
                        if let Some(job) = injector.steal_batch_and_pop(&worker).success() {
                            job();
                            continue;
                        }

                        // 3. Siblings
                        if let Some(job) = stealers.iter().find_map(|s| s.steal().success()) {
                            job();
                            continue;
                        }

                        // 4. Drain before honouring shutdown
                        if worker_shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        thread::sleep(Duration::from_millis(1));
                    }

                    trace!("Worker {} stopped", worker_id);
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Stop whatever already started before reporting
                    shutdown.store(true, Ordering::Release);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(e);
                }
            }
        }

        trace!("Workers initialized: {} threads (work-stealing)", num_threads);

        Ok(Self {
            injector,
            handles,
            shutdown,
        })
    }

    /// Queue a closure for execution on some worker thread.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(f));
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::Release);

        for handle in std::mem::take(&mut self.handles) {
            let _ = handle.join();
        }

        trace!("All {} workers stopped", num_threads);
    }
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers").field("threads", &self.handles.len()).finish()
    }
}
