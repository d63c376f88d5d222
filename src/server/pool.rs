//! A fixed set of worker threads taking jobs from one shared FIFO queue.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
};

use crate::internal;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // A job that panicked never holds the lock, so the queue is intact.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the next job, or `None` once the pool is shutting down.
    fn next(&self) -> Option<Job> {
        let mut queue = self
            .available
            .wait_while(self.lock(), |queue| {
                queue.jobs.is_empty() && !queue.shutdown
            })
            .unwrap_or_else(PoisonError::into_inner);

        if queue.shutdown {
            None
        } else {
            queue.jobs.pop_front()
        }
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers, at least one.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread could not be spawned.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(size.max(1)),
        };

        for id in 0..size.max(1) {
            let shared = Arc::clone(&pool.shared);
            let worker = std::thread::Builder::new()
                .name(format!("spmfilter-worker-{id}"))
                .spawn(move || {
                    internal!("Worker {id} started");
                    while let Some(job) = shared.next() {
                        job();
                    }
                    internal!("Worker {id} stopped");
                });

            match worker {
                Ok(worker) => pool.workers.push(worker),
                Err(err) => {
                    pool.shutdown();
                    return Err(err);
                }
            }
        }

        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Number of jobs waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Queue `job` for the next idle worker.
    ///
    /// Returns `false` if the pool is shutting down and the job was dropped.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        let mut queue = self.shared.lock();
        if queue.shutdown {
            return false;
        }

        queue.jobs.push_back(Box::new(job));
        drop(queue);
        self.shared.available.notify_one();

        true
    }

    /// Stop taking jobs and drop every queued one. Returns how many were
    /// dropped; running jobs are left alone.
    pub fn close(&self) -> usize {
        let mut queue = self.shared.lock();
        queue.shutdown = true;
        let dropped = queue.jobs.len();
        queue.jobs.clear();
        drop(queue);

        if dropped > 0 {
            internal!(level = WARN, "Dropping {dropped} queued connections");
        }
        self.shared.available.notify_all();

        dropped
    }

    /// Drop every queued job and wait for running ones to finish.
    pub fn shutdown(&mut self) {
        self.close();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                internal!(level = ERROR, "Worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}
