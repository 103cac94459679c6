//! # Spare Page Pool
//!
//! A bounded LIFO pool of page buffers not currently owned by any node.
//! Compaction takes a spare buffer, copies the surviving entries into it,
//! swaps it into the node, and returns the node's old buffer to the pool.
//!
//! `remove` blocks on the pool's condition until a buffer is available;
//! the pool never allocates past its initial population.

use crate::sync::{Latched, LatchCondition};

pub struct SparePagePool {
    pool: Latched<Vec<Box<[u8]>>>,
    available: LatchCondition,
}

impl SparePagePool {
    pub fn new(page_size: usize, count: usize) -> Self {
        let buffers = (0..count)
            .map(|_| vec![0u8; page_size].into_boxed_slice())
            .collect();
        Self {
            pool: Latched::new(buffers),
            available: LatchCondition::new(),
        }
    }

    /// Takes a buffer, waiting for one to be returned if the pool is
    /// empty.
    pub fn remove(&self) -> Box<[u8]> {
        let mut guard = self.pool.write();
        loop {
            if let Some(page) = guard.pop() {
                return page;
            }
            guard.await_condition(&self.available, -1);
        }
    }

    /// Returns a previously removed buffer and wakes one waiter.
    pub fn add(&self, page: Box<[u8]>) {
        let mut guard = self.pool.write();
        guard.push(page);
        drop(guard);
        self.available.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn remove_and_add_cycle() {
        let pool = SparePagePool::new(256, 2);
        let a = pool.remove();
        let b = pool.remove();
        assert_eq!(a.len(), 256);
        pool.add(a);
        pool.add(b);
        let _again = pool.remove();
    }

    #[test]
    fn remove_blocks_until_add() {
        let pool = Arc::new(SparePagePool::new(64, 1));
        let only = pool.remove();

        let p2 = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let page = p2.remove();
            page.len()
        });

        thread::sleep(Duration::from_millis(30));
        pool.add(only);
        assert_eq!(waiter.join().unwrap(), 64);
    }
}
