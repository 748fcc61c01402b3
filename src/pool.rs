//! Long-lived worker pool with per-submission result handles.
//!
//! Tasks run on a fixed set of threads fed from a mutex+condvar queue. Each
//! submission returns a handle; draining handles in submission order is how
//! callers preserve ordering across a fan-out. A panicking task is contained
//! to its own handle.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    stopping: bool,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

/// Result handle for one submitted task. `join` blocks until the task
/// finishes and returns `None` if the task panicked.
pub struct JobHandle<T> {
    rx: mpsc::Receiver<Option<T>>,
}

impl<T> JobHandle<T> {
    pub fn join(self) -> Option<T> {
        self.rx.recv().ok().flatten()
    }
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                stopping: false,
            }),
            available: Condvar::new(),
        });

        let workers = (0..threads.max(1))
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(&shared))
            })
            .collect();

        Self { shared, workers }
    }

    /// Pool sized for process-wide fan-out work.
    pub fn global() -> &'static WorkerPool {
        use std::sync::OnceLock;
        static GLOBAL: OnceLock<WorkerPool> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            WorkerPool::new((cores / 2).max(2))
        })
    }

    pub fn submit<T, F>(&self, task: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(task)).ok();
            let _ = tx.send(result);
        });

        {
            let mut queue = self.shared.queue.lock();
            queue.jobs.push_back(job);
        }
        self.shared.available.notify_one();

        JobHandle { rx }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.stopping = true;
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.stopping {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_submission_order() {
        let pool = WorkerPool::new(4);
        let handles: Vec<_> = (0..32)
            .map(|i| {
                pool.submit(move || {
                    // Jitter completion order; drain order must still hold.
                    if i % 3 == 0 {
                        std::thread::sleep(std::time::Duration::from_millis(2));
                    }
                    i
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_task_yields_none_and_pool_survives() {
        let pool = WorkerPool::new(2);
        let bad = pool.submit(|| -> i32 { panic!("boom") });
        let good = pool.submit(|| 7);
        assert_eq!(bad.join(), None);
        assert_eq!(good.join(), Some(7));
    }

    #[test]
    fn drop_joins_idle_workers() {
        let pool = WorkerPool::new(3);
        let h = pool.submit(|| 1);
        assert_eq!(h.join(), Some(1));
        drop(pool);
    }
}
