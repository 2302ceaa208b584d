//! Work queue drained on the engine's main thread.
//!
//! Background threads (the assembly watcher) never touch engine state. They
//! submit a task here, and the owner of the state runs the queue once per
//! frame.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// A deferred task that runs with exclusive access to `T`.
pub type MainThreadTask<T> = Box<dyn FnOnce(&mut T) + Send + 'static>;

/// A cloneable, thread-safe FIFO of [`MainThreadTask`]s.
pub struct MainThreadQueue<T> {
    tasks: Arc<Mutex<VecDeque<MainThreadTask<T>>>>,
}

impl<T> MainThreadQueue<T> {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<MainThreadTask<T>>> {
        self.tasks.lock()
    }

    /// Queue a task. Callable from any thread.
    pub fn submit(&self, task: impl FnOnce(&mut T) + Send + 'static) {
        self.lock().push_back(Box::new(task));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take every queued task, oldest first. Tasks submitted while the
    /// returned ones run wait for the next drain.
    pub fn drain(&self) -> Vec<MainThreadTask<T>> {
        self.lock().drain(..).collect()
    }
}

impl<T> Clone for MainThreadQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tasks: Arc::clone(&self.tasks),
        }
    }
}

impl<T> Default for MainThreadQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for MainThreadQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadQueue")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_run_in_submission_order() {
        let queue: MainThreadQueue<Vec<u32>> = MainThreadQueue::new();
        queue.submit(|log| log.push(1));
        queue.submit(|log| log.push(2));

        let mut log = Vec::new();
        for task in queue.drain() {
            task(&mut log);
        }
        assert_eq!(log, vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn clones_share_one_queue_across_threads() {
        let queue: MainThreadQueue<u32> = MainThreadQueue::new();
        let remote = queue.clone();
        std::thread::spawn(move || remote.submit(|n| *n += 5))
            .join()
            .unwrap();

        let mut n = 0;
        for task in queue.drain() {
            task(&mut n);
        }
        assert_eq!(n, 5);
    }

    #[test]
    fn queue_stays_usable_after_a_panic_under_the_lock() {
        let queue: MainThreadQueue<u32> = MainThreadQueue::new();
        queue.submit(|n| *n += 1);
        let remote = queue.clone();
        let crashed = std::thread::spawn(move || {
            let _guard = remote.lock();
            panic!("watcher thread crashed");
        })
        .join();
        assert!(crashed.is_err());

        queue.submit(|n| *n += 2);
        let mut n = 0;
        for task in queue.drain() {
            task(&mut n);
        }
        assert_eq!(n, 3);
    }
}
