use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::Value;

/// Fixed cell size of the variable-length property payload store.
pub const MEM_ITEM_SIZE: usize = 16;

/// Handle to a stored payload: the first cell offset plus the byte count
/// (content length + 1 type byte). `count == 0` marks a logically deleted
/// property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueHeader {
    pub head_offset: u32,
    pub count: u32,
}

impl ValueHeader {
    pub fn deleted() -> Self {
        ValueHeader::default()
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn cell_count(&self) -> u32 {
        self.count.div_ceil(MEM_ITEM_SIZE as u32)
    }
}

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

/// Chunked free-list store for variable-length property values.
///
/// The first cell of an entry stores a one-byte type tag plus the first 15
/// content bytes; subsequent cells are pure content. Threads carve private
/// blocks of `BLOCK_SIZE` cells from the global list; allocations larger
/// than a block bypass the cache and hit the global list directly.
pub struct MvccValueStore<const BLOCK_SIZE: u32 = 1024> {
    cells: Box<[UnsafeCell<[u8; MEM_ITEM_SIZE]>]>,
    next: Box<[AtomicU32]>,
    global: Mutex<GlobalList>,
    threads: Box<[Mutex<ThreadBlock>]>,
    get_counter: AtomicU64,
    free_counter: AtomicU64,
}

unsafe impl<const B: u32> Sync for MvccValueStore<B> {}
unsafe impl<const B: u32> Send for MvccValueStore<B> {}

impl<const BLOCK_SIZE: u32> MvccValueStore<BLOCK_SIZE> {
    pub fn new(cell_capacity: u32, nthreads: usize) -> Self {
        assert!(
            cell_capacity > nthreads as u32 * (BLOCK_SIZE + 2) + 2,
            "value store capacity {cell_capacity} too small for {nthreads} threads"
        );
        let cells: Box<[UnsafeCell<[u8; MEM_ITEM_SIZE]>]> = (0..cell_capacity)
            .map(|_| UnsafeCell::new([0u8; MEM_ITEM_SIZE]))
            .collect();
        let next: Box<[AtomicU32]> =
            (0..cell_capacity).map(|i| AtomicU32::new(i + 1)).collect();

        let mut global = GlobalList {
            head: 0,
            tail: cell_capacity - 1,
        };
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
            cells,
            next,
            global: Mutex::new(global),
            threads,
            get_counter: AtomicU64::new(0),
            free_counter: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.cells.len() as u32
    }

    #[inline]
    fn next_of(&self, offset: u32) -> u32 {
        self.next[offset as usize].load(Ordering::Relaxed)
    }

    #[inline]
    fn link(&self, offset: u32, to: u32) {
        self.next[offset as usize].store(to, Ordering::Relaxed);
    }

    /// Stores `value` and returns its header.
    pub fn insert(&self, value: &Value, tid: usize) -> ValueHeader {
        let (tag, content) = value.encode();
        let count = content.len() as u32 + 1;
        let header = ValueHeader {
            head_offset: self.get_cells(count.div_ceil(MEM_ITEM_SIZE as u32), tid),
            count,
        };

        let mut offset = header.head_offset;
        let mut written = 0usize;
        for i in 0..header.cell_count() {
            let cell = self.cells[offset as usize].get();
            unsafe {
                let cell = &mut *cell;
                if i == 0 {
                    cell[0] = tag;
                    let take = content.len().min(MEM_ITEM_SIZE - 1);
                    cell[1..1 + take].copy_from_slice(&content[..take]);
                    written += take;
                } else {
                    let take = (content.len() - written).min(MEM_ITEM_SIZE);
                    cell[..take].copy_from_slice(&content[written..written + take]);
                    written += take;
                }
            }
            offset = self.next_of(offset);
        }
        header
    }

    /// Reads the payload addressed by `header` back into a `Value`.
    pub fn read(&self, header: &ValueHeader) -> Result<Value> {
        assert!(!header.is_deleted(), "read of deleted value header");
        let content_len = header.count as usize - 1;
        let mut content = Vec::with_capacity(content_len);
        let mut tag = 0u8;

        let mut offset = header.head_offset;
        for i in 0..header.cell_count() {
            let cell = unsafe { &*self.cells[offset as usize].get() };
            if i == 0 {
                tag = cell[0];
                let take = content_len.min(MEM_ITEM_SIZE - 1);
                content.extend_from_slice(&cell[1..1 + take]);
            } else {
                let take = (content_len - content.len()).min(MEM_ITEM_SIZE);
                content.extend_from_slice(&cell[..take]);
            }
            offset = self.next_of(offset);
        }
        Value::decode(tag, &content)
    }

    pub fn free(&self, header: &ValueHeader, tid: usize) {
        if header.is_deleted() {
            return;
        }
        self.free_cells(header.head_offset, header.cell_count(), tid);
    }

    fn get_cells(&self, count: u32, tid: usize) -> u32 {
        self.get_counter.fetch_add(count as u64, Ordering::Relaxed);
        let mut tb = self.threads[tid].lock();

        // oversize allocations bypass the thread block
        if count > BLOCK_SIZE && tb.free_count < count + 2 {
            let mut global = self.global.lock();
            let head = global.head;
            for _ in 0..count {
                global.head = self.next_of(global.head);
                assert!(
                    global.head != global.tail,
                    "value store exhausted (capacity {})",
                    self.capacity()
                );
            }
            return head;
        }

        if tb.free_count < count + 2 {
            let mut global = self.global.lock();
            let mut cursor = global.head;
            self.link(tb.tail, cursor);
            for _ in 0..BLOCK_SIZE {
                tb.tail = cursor;
                cursor = self.next_of(cursor);
                assert!(
                    cursor != global.tail,
                    "value store exhausted (capacity {})",
                    self.capacity()
                );
            }
            global.head = cursor;
            tb.free_count += BLOCK_SIZE;
        }

        let head = tb.head;
        tb.free_count -= count;
        for _ in 0..count {
            tb.head = self.next_of(tb.head);
        }
        head
    }

    fn free_cells(&self, offset: u32, count: u32, tid: usize) {
        self.free_counter.fetch_add(count as u64, Ordering::Relaxed);

        // oversize frees go straight back to the global list
        if count > 2 * BLOCK_SIZE {
            let mut chain_tail = offset;
            for _ in 0..count - 1 {
                chain_tail = self.next_of(chain_tail);
            }
            let mut global = self.global.lock();
            let old_tail = global.tail;
            self.link(old_tail, offset);
            global.tail = chain_tail;
            return;
        }

        let mut tb = self.threads[tid].lock();
        self.link(tb.tail, offset);
        tb.free_count += count;
        for _ in 0..count {
            tb.tail = self.next_of(tb.tail);
        }

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

    /// `(gets, frees)` cell counters.
    pub fn usage(&self) -> (u64, u64) {
        (
            self.get_counter.load(Ordering::Relaxed),
            self.free_counter.load(Ordering::Relaxed),
        )
    }

    /// Visits every offset reachable from the global chain and the thread
    /// blocks. Test-facing; takes all locks.
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

    #[test]
    fn insert_read_round_trip() {
        let store: MvccValueStore<16> = MvccValueStore::new(1024, 1);
        let values = vec![
            Value::Int(7),
            Value::Double(-1.25),
            Value::Char('q'),
            Value::Str("a string long enough to span multiple sixteen byte cells".into()),
            Value::Str(String::new()),
        ];
        for v in &values {
            let header = store.insert(v, 0);
            assert_eq!(&store.read(&header).unwrap(), v);
        }
    }

    #[test]
    fn free_returns_all_cells() {
        let store: MvccValueStore<16> = MvccValueStore::new(1024, 1);
        let mut headers = Vec::new();
        for i in 0..100 {
            headers.push(store.insert(&Value::Str(format!("value-{i}")), 0));
        }
        for h in &headers {
            store.free(h, 0);
        }
        let (gets, frees) = store.usage();
        assert_eq!(gets, frees);
    }

    #[test]
    fn oversize_allocation_bypasses_thread_block() {
        let store: MvccValueStore<4> = MvccValueStore::new(1024, 1);
        let big = Value::Str("x".repeat(40 * MEM_ITEM_SIZE));
        let header = store.insert(&big, 0);
        assert!(header.cell_count() > 4);
        assert_eq!(store.read(&header).unwrap(), big);
        store.free(&header, 0);
        let (gets, frees) = store.usage();
        assert_eq!(gets, frees);
    }
}
