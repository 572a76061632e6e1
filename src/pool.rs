use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender, TrySendError};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send>;

/// Fixed pool of worker threads fed from a bounded queue.
///
/// Backpressure is caller-runs: when the queue is full the submitting
/// thread executes the job itself, so producers slow down to the pace
/// of the workers instead of queueing unboundedly.
pub struct WorkerPool {
    name: &'static str,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize, queue_depth: usize) -> WorkerPool {
        let (sender, receiver) = bounded::<Job>(queue_depth);
        let workers = (0..workers.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        WorkerPool {
            name,
            sender: Some(sender),
            workers,
        }
    }

    /// Hand a job to the pool, or run it on the calling thread when the
    /// queue is full.
    pub fn submit(&self, job: Job) {
        let Some(sender) = &self.sender else {
            job();
            return;
        };
        match sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                tracing::debug!(pool = self.name, "queue full, running job on caller");
                job();
            }
            Err(TrySendError::Disconnected(job)) => job(),
        }
    }

    /// Stop accepting work and wait up to `timeout` for queued jobs to
    /// drain and the workers to exit.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        // Closing the channel lets workers finish the queue and exit.
        self.sender.take();
        let deadline = Instant::now() + timeout;
        for worker in &self.workers {
            while !worker.is_finished() {
                if Instant::now() >= deadline {
                    tracing::warn!(pool = self.name, "workers still busy at shutdown deadline");
                    return Err(Error::ShutdownTimeout(self.name));
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
        for worker in self.workers.drain(..) {
            // Worker already finished; join just reaps it.
            let _ = worker.join();
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_on_workers() {
        let mut pool = WorkerPool::new("test", 2, 8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_full_queue_runs_on_caller() {
        let mut pool = WorkerPool::new("test", 1, 1);
        let gate = Arc::new(std::sync::Barrier::new(2));
        let started = Arc::new(std::sync::atomic::AtomicBool::new(false));

        // Park the single worker, and wait until it has actually
        // dequeued the job so the queue is empty again.
        let parked = gate.clone();
        let signal = started.clone();
        pool.submit(Box::new(move || {
            signal.store(true, Ordering::SeqCst);
            parked.wait();
        }));
        while !started.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        // Fill the queue.
        pool.submit(Box::new(|| {}));

        // Queue full: this job must run on the submitting thread.
        let caller = thread::current().id();
        let ran_on = Arc::new(std::sync::Mutex::new(None));
        let observed = ran_on.clone();
        pool.submit(Box::new(move || {
            *observed.lock().unwrap() = Some(thread::current().id());
        }));
        assert_eq!(*ran_on.lock().unwrap(), Some(caller));

        gate.wait();
        pool.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_shutdown_times_out_on_stuck_worker() {
        let mut pool = WorkerPool::new("stuck", 1, 1);
        let gate = Arc::new(std::sync::Barrier::new(2));
        let parked = gate.clone();
        pool.submit(Box::new(move || {
            parked.wait();
        }));

        let err = pool.shutdown(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::ShutdownTimeout("stuck")));

        // Release the worker so drop can reap it.
        gate.wait();
    }
}
