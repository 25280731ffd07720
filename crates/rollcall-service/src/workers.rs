//! Small fixed worker pool and per-key locking used by the section
//! service. Training is CPU-bound, so jobs run on dedicated OS threads
//! with a bounded queue instead of the async runtime.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads with a bounded job queue.
pub struct TaskPool {
    tx: Option<SyncSender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(name: &str, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel::<Job>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers)
            .map(|i| {
                let rx = Arc::clone(&rx);
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(rx))
                    .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"))
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Queue a job; blocks while the queue is full. Returns false once
    /// the pool has shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Closing the sender drains the queue and stops the workers.
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = rx.lock().unwrap_or_else(PoisonError::into_inner);
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

/// One mutex per string key, created on first use. Serializes work on
/// the same key while leaving different keys independent.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn test_pool_runs_all_jobs() {
        let pool = TaskPool::new("test-pool", 2, 8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(pool); // joins workers after the queue drains
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let pool = TaskPool::new("lock-test", 2, 4);
        let spans = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let locks = Arc::clone(&locks);
            let spans = Arc::clone(&spans);
            pool.submit(move || {
                let lock = locks.lock_for("section-1");
                let _guard = lock.lock().unwrap();
                let start = Instant::now();
                thread::sleep(Duration::from_millis(30));
                spans.lock().unwrap().push((start, Instant::now()));
            });
        }
        drop(pool);

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), 2);
        let (a, b) = (&spans[0], &spans[1]);
        // One critical section must end before the other begins.
        assert!(a.1 <= b.0 || b.1 <= a.0);
    }

    #[test]
    fn test_keyed_locks_independent_keys() {
        let locks = KeyedLocks::new();
        let a = locks.lock_for("a");
        let b = locks.lock_for("b");
        let _ga = a.lock().unwrap();
        // A different key must not block.
        let gb = b.try_lock();
        assert!(gb.is_ok());
    }

    #[test]
    fn test_lock_for_returns_same_mutex() {
        let locks = KeyedLocks::new();
        let first = locks.lock_for("x");
        let second = locks.lock_for("x");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
