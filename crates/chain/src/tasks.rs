//! Background task execution.
//!
//! The engine's critical path (block push, reorg, block application) never
//! yields; everything that may run long or call back into user code is
//! enqueued here and executed by a single worker thread, strictly in
//! submission order.

use std::{
    fmt,
    sync::{mpsc, Arc},
    thread::JoinHandle,
};
use tracing::{debug, error};

/// A type that can run closures off the engine's critical path.
pub trait TaskSpawner: Send + Sync + fmt::Debug {
    /// Enqueues `task` for execution. Tasks run in submission order.
    fn spawn(&self, name: &'static str, task: Box<dyn FnOnce() + Send>);
}

enum Job {
    Run { name: &'static str, task: Box<dyn FnOnce() + Send> },
    Shutdown,
}

/// The default [`TaskSpawner`]: one worker thread draining a queue.
pub struct BackgroundWorker {
    sender: mpsc::Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundWorker").finish_non_exhaustive()
    }
}

impl BackgroundWorker {
    /// Starts the worker thread.
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = std::thread::Builder::new()
            .name("chain-background".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    match job {
                        Job::Run { name, task } => {
                            debug!(target: "tasks", name, "running background task");
                            task();
                        }
                        Job::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn the background worker thread");
        Arc::new(Self { sender, handle: Some(handle) })
    }
}

impl TaskSpawner for BackgroundWorker {
    fn spawn(&self, name: &'static str, task: Box<dyn FnOnce() + Send>) {
        if self.sender.send(Job::Run { name, task }).is_err() {
            error!(target: "tasks", name, "background worker is gone, dropping task");
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(Job::Shutdown);
        if let Some(handle) = self.handle.take() {
            // A queued task may hold the last reference to the engine, in
            // which case this drop runs on the worker thread itself and must
            // not join it.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_in_submission_order() {
        let worker = BackgroundWorker::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        for expected in 0..8usize {
            let counter = counter.clone();
            let done_tx = done_tx.clone();
            worker.spawn(
                "test",
                Box::new(move || {
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(seen, expected);
                    if expected == 7 {
                        done_tx.send(()).unwrap();
                    }
                }),
            );
        }
        done_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
