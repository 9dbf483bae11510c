use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Number of low trxid bits reserved for query indices; `qid = trxid + index`.
pub const QID_BITS: u32 = 8;
/// High bit tags a valid transaction id, so a zeroed MVCC owner field can
/// never collide with a real trxid.
pub const TRX_TAG: u64 = 1 << 63;

pub const MAX_TIME: u64 = u64::MAX;

#[inline]
pub fn is_valid_trx_id(trx_id: u64) -> bool {
    trx_id & TRX_TAG != 0
}

#[inline]
pub fn qid_of(trx_id: u64, query_index: u8) -> u64 {
    trx_id + query_index as u64
}

#[inline]
pub fn trx_of_qid(qid: u64) -> (u64, u8) {
    (qid & !((1 << QID_BITS) - 1), (qid & ((1 << QID_BITS) - 1)) as u8)
}

/// Process-wide allocator for transaction ids and logical timestamps.
///
/// Begin-times and commit-times are drawn from one shared clock so that
/// `bt < ct` comparisons across transactions are meaningful; the allocation
/// entry points stay separate per the coordinator interface.
#[derive(Debug)]
pub struct Coordinator {
    next_trx: AtomicU64,
    clock: AtomicU64,
    active_bts: Mutex<BTreeSet<u64>>,
    trx_home: DashMap<u64, usize>,
    worker_count: usize,
}

impl Coordinator {
    pub fn new(worker_count: usize) -> Self {
        Self {
            next_trx: AtomicU64::new(1),
            clock: AtomicU64::new(1),
            active_bts: Mutex::new(BTreeSet::new()),
            trx_home: DashMap::new(),
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Allocates a fresh trxid and records the registering worker as its
    /// authoritative home.
    pub fn register_trx(&self, worker: usize) -> u64 {
        let seq = self.next_trx.fetch_add(1, Ordering::SeqCst);
        let trx_id = TRX_TAG | (seq << QID_BITS);
        self.trx_home.insert(trx_id, worker);
        trx_id
    }

    pub fn allocate_bt(&self, _trx_id: u64) -> u64 {
        let bt = self.clock.fetch_add(1, Ordering::SeqCst);
        self.active_bts.lock().insert(bt);
        bt
    }

    pub fn allocate_ct(&self, _trx_id: u64) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Called when a transaction leaves the system (committed or aborted).
    pub fn retire_bt(&self, bt: u64) {
        self.active_bts.lock().remove(&bt);
    }

    /// Garbage-collection watermark: no active transaction began earlier.
    pub fn min_active_bt(&self) -> u64 {
        let active = self.active_bts.lock();
        match active.iter().next() {
            Some(&bt) => bt,
            None => self.clock.load(Ordering::SeqCst),
        }
    }

    pub fn worker_of_trx(&self, trx_id: u64) -> Option<usize> {
        self.trx_home.get(&trx_id).map(|e| *e.value())
    }

    pub fn forget_trx(&self, trx_id: u64) {
        self.trx_home.remove(&trx_id);
    }
}
