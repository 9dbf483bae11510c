use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU32, Ordering};

use parking_lot::Mutex;

/// Offset-based concurrent free-list allocator backing row and MVCC item
/// allocations.
///
/// The arena and the `next` chain are shared; each thread owns a private
/// block of `BLOCK_SIZE` cells carved out of the global list and serves
/// allocations from it, refilling when depleted and draining a block back
/// once it accumulates `2 * BLOCK_SIZE` free cells. The global list always
/// keeps two reserved sentinel cells so head and tail never meet.
///
/// A given `tid` must only ever be used from one thread at a time; slot
/// contents are accessed through `slot_ptr` by the single owner of the
/// offset (or under the owning entity's lock once published).
pub struct ConcurrentMemPool<T, const BLOCK_SIZE: u32 = 1024> {
    slots: Box<[UnsafeCell<T>]>,
    next: Box<[AtomicU32]>,
    global: Mutex<GlobalList>,
    threads: Box<[Mutex<ThreadBlock>]>,
    get_counter: AtomicU64,
    free_counter: AtomicU64,
}

unsafe impl<T: Send, const B: u32> Sync for ConcurrentMemPool<T, B> {}
unsafe impl<T: Send, const B: u32> Send for ConcurrentMemPool<T, B> {}

#[derive(Debug)]
struct GlobalList {
    head: u32,
    tail: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct ThreadBlock {
    head: u32,
    tail: u32,
    free_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub gets: u64,
    pub frees: u64,
    pub capacity: u32,
}

impl<T: Default, const BLOCK_SIZE: u32> ConcurrentMemPool<T, BLOCK_SIZE> {
    pub fn new(capacity: u32, nthreads: usize) -> Self {
        assert!(
            capacity > nthreads as u32 * (BLOCK_SIZE + 2) + 2,
            "pool capacity {capacity} too small for {nthreads} threads"
        );
        let slots: Box<[UnsafeCell<T>]> =
            (0..capacity).map(|_| UnsafeCell::new(T::default())).collect();
        let next: Box<[AtomicU32]> = (0..capacity).map(|i| AtomicU32::new(i + 1)).collect();

        let mut global = GlobalList {
            head: 0,
            tail: capacity - 1,
        };
        // pre-charge every thread with one block, as loading-time allocation
        // starts immediately on all threads
        let threads: Box<[Mutex<ThreadBlock>]> = (0..nthreads)
            .map(|_| {
                let mut tb = ThreadBlock {
                    head: global.head,
                    tail: global.head,
                    free_count: BLOCK_SIZE,
                };
                let mut cursor = global.head;
                for _ in 0..BLOCK_SIZE {
                    tb.tail = cursor;
                    cursor = next[cursor as usize].load(Ordering::Relaxed);
                }
                global.head = cursor;
                Mutex::new(tb)
            })
            .collect();

        Self {
            slots,
            next,
            global: Mutex::new(global),
            threads,
            get_counter: AtomicU64::new(0),
            free_counter: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Raw pointer to a slot. The caller must be the unique owner of the
    /// offset, or hold the lock of the entity the offset was published under.
    #[inline]
    pub fn slot_ptr(&self, offset: u32) -> *mut T {
        self.slots[offset as usize].get()
    }

    #[inline]
    fn next_of(&self, offset: u32) -> u32 {
        self.next[offset as usize].load(Ordering::Relaxed)
    }

    #[inline]
    fn link(&self, offset: u32, to: u32) {
        self.next[offset as usize].store(to, Ordering::Relaxed);
    }

    /// Allocates one cell for thread `tid`.
    pub fn get(&self, tid: usize) -> u32 {
        self.get_counter.fetch_add(1, Ordering::Relaxed);
        let mut tb = self.threads[tid].lock();

        // keep 2 cells reserved in the local block
        if tb.free_count < 3 {
            let mut global = self.global.lock();
            let mut cursor = global.head;
            self.link(tb.tail, cursor);
            for _ in 0..BLOCK_SIZE {
                tb.tail = cursor;
                cursor = self.next_of(cursor);
                assert!(
                    cursor != global.tail,
                    "memory pool exhausted (capacity {})",
                    self.capacity()
                );
            }
            global.head = cursor;
            tb.free_count += BLOCK_SIZE;
        }

        let offset = tb.head;
        tb.head = self.next_of(offset);
        tb.free_count -= 1;
        offset
    }

    /// Returns one cell to thread `tid`'s block, draining a contiguous block
    /// back to the global list past the high-water mark.
    pub fn free(&self, offset: u32, tid: usize) {
        self.free_counter.fetch_add(1, Ordering::Relaxed);
        let mut tb = self.threads[tid].lock();

        self.link(tb.tail, offset);
        tb.tail = offset;
        tb.free_count += 1;

        if tb.free_count >= 2 * BLOCK_SIZE {
            let drain = tb.free_count - BLOCK_SIZE;
            let drain_head = tb.head;
            let mut drain_tail = drain_head;
            for _ in 0..drain - 1 {
                drain_tail = self.next_of(drain_tail);
            }
            tb.head = self.next_of(drain_tail);
            tb.free_count -= drain;

            let mut global = self.global.lock();
            let old_tail = global.tail;
            self.link(old_tail, drain_head);
            global.tail = drain_tail;
        }
    }

    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            gets: self.get_counter.load(Ordering::Relaxed),
            frees: self.free_counter.load(Ordering::Relaxed),
            capacity: self.capacity(),
        }
    }

    /// Walks every free chain (global plus thread blocks) and feeds each
    /// reachable offset to `visit`. Test-facing; takes all locks.
    pub fn scan_free_offsets(&self, mut visit: impl FnMut(u32)) {
        let global = self.global.lock();
        let mut cursor = global.head;
        visit(cursor);
        while cursor != global.tail {
            cursor = self.next_of(cursor);
            visit(cursor);
        }
        drop(global);

        for t in self.threads.iter() {
            let tb = t.lock();
            if tb.free_count == 0 {
                continue;
            }
            let mut cursor = tb.head;
            for _ in 0..tb.free_count {
                visit(cursor);
                cursor = self.next_of(cursor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn get_returns_distinct_offsets() {
        let pool: ConcurrentMemPool<u64, 8> = ConcurrentMemPool::new(256, 2);
        let mut seen = HashSet::new();
        for _ in 0..64 {
            assert!(seen.insert(pool.get(0)));
        }
        for _ in 0..64 {
            assert!(seen.insert(pool.get(1)));
        }
    }

    #[test]
    fn free_then_get_reuses_cells() {
        let pool: ConcurrentMemPool<u64, 8> = ConcurrentMemPool::new(256, 1);
        let offsets: Vec<u32> = (0..32).map(|_| pool.get(0)).collect();
        for &off in &offsets {
            pool.free(off, 0);
        }
        let usage = pool.usage();
        assert_eq!(usage.gets, 32);
        assert_eq!(usage.frees, 32);
        // all offsets are reachable from some free chain again
        let mut reachable = HashSet::new();
        pool.scan_free_offsets(|off| {
            reachable.insert(off);
        });
        for &off in &offsets {
            assert!(reachable.contains(&off));
        }
    }

    #[test]
    fn slot_contents_survive_until_freed() {
        let pool: ConcurrentMemPool<u64, 8> = ConcurrentMemPool::new(256, 1);
        let a = pool.get(0);
        let b = pool.get(0);
        unsafe {
            *pool.slot_ptr(a) = 11;
            *pool.slot_ptr(b) = 22;
            assert_eq!(*pool.slot_ptr(a), 11);
            assert_eq!(*pool.slot_ptr(b), 22);
        }
        pool.free(a, 0);
        pool.free(b, 0);
    }
}
