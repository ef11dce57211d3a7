// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! A fixed-size worker pool with a blocking `wait` barrier.
//!
//! The pool is owned by whoever drives a module-level analysis and passed
//! by reference; there is no process-wide singleton. With zero workers every
//! job runs inline on the calling thread, which keeps single-threaded runs
//! free of synchronization entirely.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    stop: bool,
    num_running: usize,
}

#[derive(Default)]
struct PoolShared {
    state: Mutex<PoolState>,
    /// Signaled when work arrives or the pool stops.
    work_available: Condvar,
    /// Signaled when the pool drains completely.
    all_idle: Condvar,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(num_workers: usize) -> Self {
        let shared = Arc::new(PoolShared::default());
        let workers = (0..num_workers)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("analysis-worker-{}", i))
                    .spawn(move || worker_loop(&shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        ThreadPool { shared, workers }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Adds a job. Blocks only while acquiring the queue mutex. With no
    /// workers the job runs inline before `enqueue` returns.
    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers.is_empty() {
            run_job(Box::new(job));
            return;
        }
        {
            let mut state = self.shared.state.lock().unwrap();
            assert!(!state.stop, "enqueue on a stopped pool");
            state.queue.push_back(Box::new(job));
        }
        self.shared.work_available.notify_one();
    }

    /// Blocks until the queue is empty and no job is running.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while !(state.queue.is_empty() && state.num_running == 0) {
            state = self.shared.all_idle.wait(state).unwrap();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
        }
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.num_running += 1;
                    break job;
                }
                if state.stop {
                    return;
                }
                state = shared.work_available.wait(state).unwrap();
            }
        };

        run_job(job);

        let mut state = shared.state.lock().unwrap();
        state.num_running -= 1;
        if state.queue.is_empty() && state.num_running == 0 {
            shared.all_idle.notify_all();
        }
    }
}

/// Runs one job, swallowing panics so a failing task cannot take the pool
/// down with it.
fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!("analysis task panicked; continuing with remaining tasks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_jobs_and_waits() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn zero_workers_run_inline() {
        let pool = ThreadPool::new(0);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.enqueue(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.wait();
    }

    #[test]
    fn panicking_job_does_not_kill_the_pool() {
        let pool = ThreadPool::new(2);
        pool.enqueue(|| panic!("boom"));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.enqueue(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
