//! Bounded pool of crypto workers. Jobs are pure closures over immutable
//! inputs; results travel back to the logic task over a channel the caller
//! baked into the job. A full queue refuses work - the caller surfaces
//! `Congested` instead of blocking the logic task.

use std::sync::mpsc;
use std::thread;

use umbra_core::Error;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    jobs_tx: mpsc::SyncSender<Job>,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::sync_channel::<Job>(queue_depth.max(1));
        let jobs_rx = std::sync::Arc::new(std::sync::Mutex::new(jobs_rx));
        for i in 0..workers.max(1) {
            let rx = jobs_rx.clone();
            thread::Builder::new()
                .name(format!("umbra-crypto-{i}"))
                .spawn(move || loop {
                    let job = {
                        let guard = match rx.lock() {
                            Ok(guard) => guard,
                            Err(_) => break,
                        };
                        guard.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .expect("spawn crypto worker");
        }
        Self { jobs_tx }
    }

    /// Queue a job; refused with `Congested` when the pool is saturated.
    pub fn submit<F>(&self, job: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs_tx
            .try_send(Box::new(job))
            .map_err(|_| Error::Congested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn jobs_run_and_complete() {
        let pool = WorkerPool::new(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 8 {
            assert!(std::time::Instant::now() < deadline, "jobs stalled");
            thread::yield_now();
        }
    }

    #[test]
    fn saturated_queue_backpressures() {
        let pool = WorkerPool::new(1, 1);
        let (block_tx, block_rx) = mpsc::channel::<()>();
        // occupy the single worker
        pool.submit(move || {
            let _ = block_rx.recv();
        })
        .expect("first job");

        // fill the queue, then expect refusal
        let mut refused = false;
        for _ in 0..8 {
            if pool.submit(|| {}).is_err() {
                refused = true;
                break;
            }
        }
        assert!(refused, "pool never backpressured");
        let _ = block_tx.send(());
    }
}
