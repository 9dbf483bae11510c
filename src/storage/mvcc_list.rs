use std::marker::PhantomData;

use parking_lot::Mutex;

use crate::coordinator::MAX_TIME;
use crate::error::ReadStat;
use crate::storage::mem_pool::ConcurrentMemPool;

pub const NIL: u32 = u32::MAX;

/// One version in an append-ordered chain. Committed iff `trx_id == 0` and
/// `begin_time < end_time`; an uncommitted tail carries its owner's trxid.
#[derive(Debug, Clone)]
pub struct MvccItem<V> {
    pub begin_time: u64,
    pub end_time: u64,
    pub trx_id: u64,
    pub value: V,
    pub next: u32,
}

impl<V: Default> Default for MvccItem<V> {
    fn default() -> Self {
        Self {
            begin_time: 0,
            end_time: 0,
            trx_id: 0,
            value: V::default(),
            next: NIL,
        }
    }
}

pub type MvccPool<V> = ConcurrentMemPool<MvccItem<V>>;

#[derive(Debug, Clone, Copy)]
struct Chain {
    head: u32,
    tail: u32,
}

/// Outcome of `append_version`.
#[derive(Debug, PartialEq)]
pub enum AppendOutcome<V> {
    /// A fresh uncommitted tail was linked.
    Appended,
    /// The calling transaction already owned the tail; the previous value is
    /// handed back so owned storage can be released.
    Reused(V),
    /// The tail is uncommitted and owned by another transaction.
    Conflict,
}

/// An entity's or property's version chain. All traversal and mutation
/// happens under the chain lock; items live in the shared per-kind pool.
pub struct MvccList<V> {
    chain: Mutex<Chain>,
    _values: PhantomData<V>,
}

impl<V> Default for MvccList<V> {
    fn default() -> Self {
        Self {
            chain: Mutex::new(Chain { head: NIL, tail: NIL }),
            _values: PhantomData,
        }
    }
}

impl<V: Clone + Default> MvccList<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the first committed version at load time (begin 0, open end).
    pub fn append_initial(&self, pool: &MvccPool<V>, tid: usize, value: V) {
        let offset = pool.get(tid);
        unsafe {
            *pool.slot_ptr(offset) = MvccItem {
                begin_time: 0,
                end_time: MAX_TIME,
                trx_id: 0,
                value,
                next: NIL,
            };
        }
        let mut chain = self.chain.lock();
        debug_assert_eq!(chain.head, NIL, "initial version appended twice");
        chain.head = offset;
        chain.tail = offset;
    }

    /// Attempts to append an uncommitted version for `trx_id`. At most one
    /// uncommitted item may sit at the tail; a second write by the same
    /// transaction overwrites it in place.
    pub fn append_version(
        &self,
        pool: &MvccPool<V>,
        tid: usize,
        trx_id: u64,
        bt: u64,
        value: V,
    ) -> AppendOutcome<V> {
        let mut chain = self.chain.lock();

        if chain.tail != NIL {
            let tail = unsafe { &mut *pool.slot_ptr(chain.tail) };
            if tail.trx_id == trx_id {
                let old = std::mem::replace(&mut tail.value, value);
                return AppendOutcome::Reused(old);
            }
            if tail.trx_id != 0 {
                return AppendOutcome::Conflict;
            }
        }

        let offset = pool.get(tid);
        unsafe {
            *pool.slot_ptr(offset) = MvccItem {
                begin_time: bt,
                end_time: MAX_TIME,
                trx_id,
                value,
                next: NIL,
            };
        }
        if chain.tail == NIL {
            chain.head = offset;
        } else {
            unsafe { (*pool.slot_ptr(chain.tail)).next = offset };
        }
        chain.tail = offset;
        AppendOutcome::Appended
    }

    /// Resolves the version visible to `(trx_id, bt)`.
    ///
    /// The owner of an uncommitted tail always sees it. Other transactions
    /// skip it when read-only and abort otherwise, preserving
    /// serializability of read-write queries.
    pub fn visible_version(
        &self,
        pool: &MvccPool<V>,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<V> {
        let chain = self.chain.lock();
        let mut committed: Option<V> = None;
        let mut cursor = chain.head;
        while cursor != NIL {
            let item = unsafe { &*pool.slot_ptr(cursor) };
            if item.trx_id == 0 {
                if item.begin_time <= bt && bt < item.end_time {
                    committed = Some(item.value.clone());
                }
            } else {
                // uncommitted tail
                if item.trx_id == trx_id {
                    return ReadStat::Success(item.value.clone());
                }
                if !read_only {
                    return ReadStat::Abort;
                }
            }
            cursor = item.next;
        }
        match committed {
            Some(v) => ReadStat::Success(v),
            None => ReadStat::NotFound,
        }
    }

    /// Publishes the uncommitted tail at commit time `ct`: the tail becomes
    /// committed with `begin_time = ct` and the previous committed version is
    /// closed at `ct`. Applying a commit twice is a no-op.
    pub fn commit_version(&self, pool: &MvccPool<V>, trx_id: u64, ct: u64) {
        let chain = self.chain.lock();
        if chain.tail == NIL {
            return;
        }
        let tail = unsafe { &mut *pool.slot_ptr(chain.tail) };
        if tail.trx_id != trx_id {
            // already committed (idempotent re-application) or foreign tail
            return;
        }
        tail.trx_id = 0;
        tail.begin_time = ct;

        let mut cursor = chain.head;
        while cursor != NIL && cursor != chain.tail {
            let item = unsafe { &mut *pool.slot_ptr(cursor) };
            if item.next == chain.tail {
                item.end_time = ct;
                break;
            }
            cursor = item.next;
        }
    }

    /// Unlinks the uncommitted tail owned by `trx_id`, returning its value so
    /// the caller can release owned storage. Idempotent.
    pub fn abort_version(&self, pool: &MvccPool<V>, tid: usize, trx_id: u64) -> Option<V> {
        let mut chain = self.chain.lock();
        if chain.tail == NIL {
            return None;
        }
        let tail_offset = chain.tail;
        let tail = unsafe { &mut *pool.slot_ptr(tail_offset) };
        if tail.trx_id != trx_id {
            return None;
        }
        let value = std::mem::take(&mut tail.value);

        if chain.head == tail_offset {
            chain.head = NIL;
            chain.tail = NIL;
        } else {
            let mut cursor = chain.head;
            loop {
                let item = unsafe { &mut *pool.slot_ptr(cursor) };
                if item.next == tail_offset {
                    item.next = NIL;
                    chain.tail = cursor;
                    break;
                }
                cursor = item.next;
            }
        }
        pool.free(tail_offset, tid);
        Some(value)
    }

    /// Walks every version in chain order. Test-facing.
    pub fn for_each_version(
        &self,
        pool: &MvccPool<V>,
        mut visit: impl FnMut(&MvccItem<V>),
    ) {
        let chain = self.chain.lock();
        let mut cursor = chain.head;
        while cursor != NIL {
            let item = unsafe { &*pool.slot_ptr(cursor) };
            visit(item);
            cursor = item.next;
        }
    }
}
