//! Object pools for pressure relief
//!
//! Entries and messages churn at write rates, so both are recycled through
//! a simple bounded free list. When the pool is drained the constructor is
//! invoked instead of blocking; callers reset every object on acquire so a
//! recycled object is indistinguishable from a fresh one.

use parking_lot::Mutex;

/// Bounded free-list pool
///
/// `get` pops a recycled object or constructs a new one; `put` returns an
/// object unless the pool is at capacity, in which case it is dropped.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
    new_fn: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> Pool<T> {
    /// Create a pool holding at most `capacity` recycled objects
    pub fn new(capacity: usize, new_fn: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity.min(1024))),
            capacity,
            new_fn: Box::new(new_fn),
        }
    }

    /// Acquire an object, constructing one if the pool is drained
    pub fn get(&self) -> T {
        if let Some(item) = self.items.lock().pop() {
            return item;
        }
        (self.new_fn)()
    }

    /// Return an object to the pool
    pub fn put(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push(item);
        }
    }

    /// Number of recycled objects currently held
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the pool holds no recycled objects
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_pool_get_falls_back_to_constructor() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructed);
        let pool = Pool::new(4, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            0u64
        });

        assert!(pool.is_empty());
        let _a = pool.get();
        let _b = pool.get();
        assert_eq!(constructed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pool_recycles() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructed);
        let pool = Pool::new(4, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::<u8>::new()
        });

        pool.put(vec![1, 2, 3]);
        assert_eq!(pool.len(), 1);

        let item = pool.get();
        assert_eq!(item, vec![1, 2, 3]);
        assert_eq!(constructed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pool_capacity_bound() {
        let pool = Pool::new(2, || 0u8);
        pool.put(1);
        pool.put(2);
        pool.put(3);
        assert_eq!(pool.len(), 2);
    }
}
