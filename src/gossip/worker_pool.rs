//! Bounded worker pool with drop-oldest overflow.
//!
//! Gossip pushes are queued here by the scheduler ticks. Under sustained
//! overload the oldest pending push is discarded in favor of the newest:
//! a stale membership or data push is worse than a missed one, because the
//! next tick will produce a fresher version of the same payload.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct WorkerPool {
    queue: Mutex<VecDeque<Job>>,
    notify: Notify,
    capacity: usize,
    worker_count: usize,
    running: AtomicBool,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl WorkerPool {
    pub fn new(capacity: usize, worker_count: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            worker_count: worker_count.max(1),
            running: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        })
    }

    /// Spawns the worker tasks. Jobs submitted before `start` stay queued.
    pub fn start(self: Arc<Self>) {
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        if !workers.is_empty() {
            return;
        }
        for _ in 0..self.worker_count {
            let pool = self.clone();
            workers.push(tokio::spawn(async move {
                pool.worker_loop().await;
            }));
        }
    }

    /// Enqueues a push, discarding the oldest pending one when full.
    /// Returns false if the pool is already shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut queue = self.queue.lock().expect("work queue lock poisoned");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Work queue full; discarded oldest pending push");
            }
            queue.push_back(Box::pin(job));
        }
        self.notify.notify_one();
        true
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let job = self
                .queue
                .lock()
                .expect("work queue lock poisoned")
                .pop_front();
            match job {
                Some(job) => job.await,
                None => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    self.notify.notified().await;
                }
            }
        }
    }

    /// Stops accepting work, lets workers drain the queue within `grace`,
    /// then aborts stragglers.
    pub async fn shutdown(&self, grace: Duration) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();

        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker list lock poisoned");
            workers.drain(..).collect()
        };
        let deadline = Instant::now() + grace;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        let leftover = self.queue.lock().expect("work queue lock poisoned").len();
        if leftover > 0 {
            tracing::debug!("Dropping {} queued pushes at pool shutdown", leftover);
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().expect("work queue lock poisoned").len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
