//! Ordered single-worker command queue.
//!
//! Commands run one at a time in submission order on a dedicated named
//! thread. [`SerialTaskQueue::drain`] swaps the backlog for an empty one,
//! so a command that already started is never affected.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use thiserror::Error;

/// A unit of work for the queue.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Errors returned when submitting to a queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The named queue no longer accepts work.
    #[error("task queue '{0}' is shut down")]
    ShutDown(String),
    /// The worker thread for the named queue could not start.
    #[error("failed to spawn worker for '{0}': {1}")]
    Spawn(String, String),
}

struct Backlog {
    tasks: VecDeque<Task>,
    running: bool,
    shutdown: bool,
}

struct Shared {
    name: String,
    backlog: Mutex<Backlog>,
    available: Condvar,
    idle: Condvar,
}

impl Shared {
    fn backlog(&self) -> MutexGuard<'_, Backlog> {
        self.backlog.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// FIFO executor backed by one worker thread.
pub struct SerialTaskQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl SerialTaskQueue {
    /// Starts a queue whose worker thread carries `name`.
    pub fn new(name: impl Into<String>) -> Result<Self, QueueError> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            backlog: Mutex::new(Backlog {
                tasks: VecDeque::new(),
                running: false,
                shutdown: false,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(worker_shared))
            .map_err(|e| QueueError::Spawn(name, e.to_string()))?;
        let worker_id = worker.thread().id();

        Ok(Self {
            shared,
            worker: Some(worker),
            worker_id,
        })
    }

    /// Returns the queue name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Appends a command to the backlog.
    pub fn submit<F>(&self, task: F) -> Result<(), QueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut backlog = self.shared.backlog();
        if backlog.shutdown {
            return Err(QueueError::ShutDown(self.shared.name.clone()));
        }
        backlog.tasks.push_back(Box::new(task));
        drop(backlog);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Discards every command that has not started yet.
    ///
    /// Returns the number of discarded commands. A running command is left
    /// to finish.
    pub fn drain(&self) -> usize {
        let drained = std::mem::take(&mut self.shared.backlog().tasks);
        let count = drained.len();
        // Drop outside the lock: dropping a task may run arbitrary destructors.
        drop(drained);
        if count > 0 {
            tracing::debug!(queue = %self.shared.name, count, "drained pending tasks");
        }
        self.shared.idle.notify_all();
        count
    }

    /// Number of commands waiting to start.
    pub fn pending(&self) -> usize {
        self.shared.backlog().tasks.len()
    }

    /// Returns true while a command is executing.
    pub fn is_busy(&self) -> bool {
        self.shared.backlog().running
    }

    /// Returns true when called from this queue's worker thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Blocks until the backlog is empty and nothing is running, or the
    /// timeout elapses. Returns true if the queue went idle.
    pub fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        let backlog = self.shared.backlog();
        let (_backlog, result) = self
            .shared
            .idle
            .wait_timeout_while(backlog, timeout, |b| b.running || !b.tasks.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        !result.timed_out()
    }
}

impl Drop for SerialTaskQueue {
    fn drop(&mut self) {
        let discarded = {
            let mut backlog = self.shared.backlog();
            backlog.shutdown = true;
            std::mem::take(&mut backlog.tasks)
        };
        if !discarded.is_empty() {
            tracing::debug!(
                queue = %self.shared.name,
                count = discarded.len(),
                "discarding pending tasks on shutdown"
            );
        }
        drop(discarded);
        self.shared.available.notify_all();

        if let Some(worker) = self.worker.take() {
            // Dropped from inside one of our own tasks: the worker exits on
            // its own once that task returns.
            if !self.is_current() && worker.join().is_err() {
                tracing::error!(queue = %self.shared.name, "worker thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for SerialTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTaskQueue")
            .field("name", &self.shared.name)
            .field("pending", &self.pending())
            .finish()
    }
}

fn run_worker(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut backlog = shared.backlog();
            loop {
                if backlog.shutdown {
                    backlog.running = false;
                    shared.idle.notify_all();
                    return;
                }
                if let Some(task) = backlog.tasks.pop_front() {
                    backlog.running = true;
                    break task;
                }
                backlog.running = false;
                shared.idle.notify_all();
                backlog = shared
                    .available
                    .wait(backlog)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            tracing::error!(queue = %shared.name, "task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_runs_in_submission_order() {
        let queue = SerialTaskQueue::new("test-order").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            queue.submit(move || seen.lock().unwrap().push(i)).unwrap();
        }
        assert!(queue.wait_idle(Duration::from_secs(2)));
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_one_task_at_a_time() {
        let queue = SerialTaskQueue::new("test-exclusive").unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));
        for _ in 0..10 {
            let active = Arc::clone(&active);
            let overlap = Arc::clone(&overlap);
            queue
                .submit(move || {
                    if active.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(2));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert!(queue.wait_idle(Duration::from_secs(2)));
        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drain_spares_running_task() {
        let queue = SerialTaskQueue::new("test-drain").unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let finished = Arc::new(AtomicBool::new(false));
        let ran_later = Arc::new(AtomicUsize::new(0));

        let done = Arc::clone(&finished);
        queue
            .submit(move || {
                started_tx.send(()).unwrap();
                resume_rx.recv().unwrap();
                done.store(true, Ordering::SeqCst);
            })
            .unwrap();
        for _ in 0..5 {
            let ran_later = Arc::clone(&ran_later);
            queue
                .submit(move || {
                    ran_later.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(queue.is_busy());
        assert_eq!(queue.drain(), 5);
        assert_eq!(queue.pending(), 0);

        resume_tx.send(()).unwrap();
        assert!(queue.wait_idle(Duration::from_secs(2)));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(ran_later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_task_does_not_stop_worker() {
        let queue = SerialTaskQueue::new("test-panic").unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        queue.submit(|| panic!("boom")).unwrap();
        let flag = Arc::clone(&ran);
        queue.submit(move || flag.store(true, Ordering::SeqCst)).unwrap();
        assert!(queue.wait_idle(Duration::from_secs(2)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_worker_thread_is_named() {
        let queue = SerialTaskQueue::new("camera-op").unwrap();
        let (tx, rx) = mpsc::channel();
        queue
            .submit(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            })
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("camera-op"));
        assert!(!queue.is_current());
    }
}
