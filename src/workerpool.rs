//! Bounded pool of worker threads consuming a FIFO task queue (C6).
//!
//! The queue is a `crossbeam_channel` rather than a hand-rolled
//! mutex+condvar queue: a channel receiver is itself a blocking FIFO, and
//! dropping every sender makes every blocked `recv()` return `Err` once
//! the queue drains, which is exactly "workers drain remaining tasks
//! then exit".
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let handles = (0..size)
            .map(|id| {
                let rx = rx.clone();
                thread::spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                            error!(worker = id, panic = ?payload, "worker task panicked");
                        }
                    }
                })
            })
            .collect();
        WorkerPool { sender: Mutex::new(Some(tx)), handles: Mutex::new(handles) }
    }

    /// Enqueues `job`; a no-op once [`WorkerPool::stop`] has been called.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = self.sender.lock().unwrap().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Stops accepting new tasks and joins every worker once it has
    /// drained whatever was already queued.
    pub fn stop(&self) {
        {
            let mut sender = self.sender.lock().unwrap();
            *sender = None;
        }
        let mut handles = self.handles.lock().unwrap();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}
