//! Two-priority worker pool
//!
//! Workers drain the high queue (query execution) before the low queue
//! (ingestion and expiration). Sized to hardware concurrency by default.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Latency-sensitive: query execution
    High,
    /// Throughput-oriented: ingestion, expiration
    Low,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queues {
    high: VecDeque<Job>,
    low: VecDeque<Job>,
}

struct Shared {
    queues: Mutex<Queues>,
    available: Condvar,
    shutdown: AtomicBool,
}

pub struct TaskPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Pool sized to hardware concurrency
    pub fn new() -> Self {
        Self::with_workers(num_cpus::get())
    }

    pub fn with_workers(n: usize) -> Self {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..n.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("nebula-worker-{}", i))
                    .spawn(move || worker_loop(shared))
                    .expect("spawn worker thread")
            })
            .collect();
        Self { shared, workers }
    }

    /// Queue a job at the given priority
    pub fn submit<F: FnOnce() + Send + 'static>(&self, priority: Priority, job: F) {
        let mut queues = self.shared.queues.lock();
        match priority {
            Priority::High => queues.high.push_back(Box::new(job)),
            Priority::Low => queues.low.push_back(Box::new(job)),
        }
        drop(queues);
        self.shared.available.notify_one();
    }

    /// Run a job on the pool and wait for its result
    pub fn execute<T, F>(&self, priority: Priority, job: F) -> T
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.submit(priority, move || {
            let _ = tx.send(job());
        });
        rx.recv().expect("pool worker dropped the result")
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queues = shared.queues.lock();
            loop {
                if let Some(job) = queues.high.pop_front() {
                    break job;
                }
                if let Some(job) = queues.low.pop_front() {
                    break job;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.available.wait(&mut queues);
            }
        };
        job();
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
