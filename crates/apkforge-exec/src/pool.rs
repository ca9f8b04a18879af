//! Fixed-width worker pool
//!
//! The pool is constructed explicitly by whoever owns the build and handed
//! down to the executors that need it; there is no process-wide instance.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Returned when submitting to a pool that was shut down.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// A fixed set of threads pulling jobs from a shared queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    width: usize,
}

impl WorkerPool {
    /// Create a pool with `width` threads (at least one).
    pub fn new(width: usize) -> io::Result<Self> {
        let width = width.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(width);
        for index in 0..width {
            let receiver = Arc::clone(&receiver);
            let handle = thread::Builder::new()
                .name(format!("apkforge-worker-{}", index))
                .spawn(move || worker_loop(&receiver))?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            width,
        })
    }

    /// Create a pool sized to the available parallelism.
    pub fn with_default_width() -> io::Result<Self> {
        Self::new(default_width())
    }

    /// Number of worker threads.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Queue a job.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(job)).map_err(|_| PoolClosed),
            None => Err(PoolClosed),
        }
    }

    /// True once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop accepting jobs, let queued jobs drain and join every thread.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("worker thread exited with a panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("width", &self.width)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Available parallelism, or 1 if it cannot be determined.
pub fn default_width() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        match job {
            Ok(job) => {
                // Keep the thread alive if a raw job panics
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::warn!("pool job panicked");
                }
            }
            Err(_) => break,
        }
    }
}
