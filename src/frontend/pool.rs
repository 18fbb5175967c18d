//! Bounded worker pool for deferred flow work
//!
//! Well-known flows push follow-up work here so the bundle path never waits
//! on it. The pool is plain threads over a shared channel; dropping it
//! drains and joins.

use crate::config::MIN_WORKER_THREADS;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(MIN_WORKER_THREADS);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let rx = Arc::clone(&rx);
            workers.push(thread::spawn(move || loop {
                let job = {
                    let Ok(guard) = rx.lock() else {
                        break;
                    };
                    guard.recv()
                };
                match job {
                    Ok(job) => job(),
                    Err(_) => {
                        debug!("worker {} shutting down", index);
                        break;
                    }
                }
            }));
        }

        Self {
            tx: Some(tx),
            workers,
        }
    }

    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Box::new(job));
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
