use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;
use tracing::debug;

use crate::network::sender::Sender;

/// Default bound on instances retained by a pool.
pub const MAX_QUEUE_SIZE: usize = 128;

/// An object that can be parked in an [`ObjectPool`].
pub trait Poolable: Default + Send {
    /// Clears per-use state before the object is retained.
    fn reset(&mut self);

    /// Frees the object for good; called instead of retaining it.
    fn release(self);
}

/// Bounded, lock-free pool of reusable objects.
///
/// `rent` and `give_back` may be called from any thread. The retained count is kept
/// with atomics next to the concurrent queue, so it never exceeds `max_queue_size`;
/// anything returned beyond that, or after `dispose`, is released on the spot.
#[derive(Debug)]
pub struct ObjectPool<T: Poolable> {
    queue: SegQueue<T>,
    count: AtomicUsize,
    created: AtomicUsize,
    max_queue_size: usize,
    disposed: AtomicBool,
}

pub type SenderPool = ObjectPool<Sender>;

impl<T: Poolable> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new(MAX_QUEUE_SIZE)
    }
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new(max_queue_size: usize) -> Self {
        ObjectPool {
            queue: SegQueue::new(),
            count: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            max_queue_size,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn rent(&self) -> T {
        if let Some(object) = self.queue.pop() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return object;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        T::default()
    }

    /// Returns a rented object to the pool.
    pub fn give_back(&self, mut object: T) {
        if self.disposed.load(Ordering::Acquire) {
            object.release();
            return;
        }
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current >= self.max_queue_size {
                object.release();
                return;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        object.reset();
        self.queue.push(object);
    }

    /// Number of objects currently retained.
    pub fn retained(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Number of objects constructed because the pool was empty.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut released = 0;
        while let Some(object) = self.queue.pop() {
            self.count.fetch_sub(1, Ordering::AcqRel);
            object.release();
            released += 1;
        }
        debug!("object pool disposed, {} retained objects released", released);
    }
}

impl<T: Poolable> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        self.dispose();
        // a give_back racing with dispose may have slipped in after the drain
        while let Some(object) = self.queue.pop() {
            object.release();
        }
    }
}
