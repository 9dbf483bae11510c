use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::coordinator::{is_valid_trx_id, Coordinator, QID_BITS};

pub const ASSOCIATIVITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxStatus {
    Processing,
    Validating,
    Committed,
    Aborted,
}

const FLAG_P: u8 = 1 << 0;
const FLAG_V: u8 = 1 << 1;
const FLAG_C: u8 = 1 << 2;
const FLAG_A: u8 = 1 << 3;
const FLAG_OCCUPIED: u8 = 1 << 4;
const FLAG_ERASED: u8 = 1 << 5;

/// One packed table record: trxid, the P/V/C/A/occupied bits and the commit
/// time. Invalid transitions are programming errors and panic.
#[derive(Debug, Clone, Copy, Default)]
pub struct TidStatus {
    pub trx_id: u64,
    flags: u8,
    pub ct: u64,
}

impl TidStatus {
    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_empty_slot(&self) -> bool {
        !self.has(FLAG_OCCUPIED) || self.has(FLAG_ERASED)
    }

    pub fn enter_process(&mut self, trx_id: u64) {
        assert!(
            trx_id != 0 && self.is_empty_slot(),
            "transaction table: P-entry into an occupied slot"
        );
        *self = TidStatus {
            trx_id,
            flags: FLAG_P | FLAG_OCCUPIED,
            ct: 0,
        };
    }

    pub fn enter_validation(&mut self) {
        assert_eq!(
            self.flags,
            FLAG_P | FLAG_OCCUPIED,
            "transaction table: invalid P->V transition"
        );
        self.flags |= FLAG_V;
    }

    pub fn enter_commit_time(&mut self, ct: u64) {
        assert_eq!(
            self.flags,
            FLAG_P | FLAG_V | FLAG_OCCUPIED,
            "transaction table: commit time outside validation"
        );
        self.ct = ct;
    }

    pub fn enter_commit(&mut self) {
        assert_eq!(
            self.flags,
            FLAG_P | FLAG_V | FLAG_OCCUPIED,
            "transaction table: invalid V->C transition"
        );
        self.flags |= FLAG_C;
    }

    pub fn enter_abort(&mut self) {
        assert!(
            self.has(FLAG_P) && !self.has(FLAG_C) && self.has(FLAG_OCCUPIED),
            "transaction table: invalid abort transition"
        );
        self.flags |= FLAG_A;
    }

    pub fn mark_erased(&mut self) {
        self.flags |= FLAG_ERASED;
    }

    pub fn status(&self) -> TrxStatus {
        assert!(
            !(self.has(FLAG_A) && self.has(FLAG_C)),
            "transaction table: C and A both set"
        );
        if self.has(FLAG_A) {
            TrxStatus::Aborted
        } else if self.has(FLAG_C) {
            TrxStatus::Committed
        } else if self.has(FLAG_V) {
            TrxStatus::Validating
        } else {
            TrxStatus::Processing
        }
    }
}

fn trx_hash(trx_id: u64) -> u64 {
    // the low QID bits are zero; shifting avoids clustering
    trx_id >> QID_BITS
}

/// Open-addressed status table with associativity-8 buckets; the last slot
/// of each bucket chains to an indirect bucket when the main bucket fills.
pub struct TransactionTable {
    slots: Vec<RwLock<TidStatus>>,
    main_buckets: usize,
    indirect_buckets: usize,
    next_indirect: AtomicUsize,
    /// Finished transactions pending erasure, `(timestamp, slot)`; readonly
    /// entries carry their BT, writable ones their CT.
    ro_gc: Mutex<VecDeque<(u64, usize)>>,
    nro_gc: Mutex<VecDeque<(u64, usize)>>,
}

impl TransactionTable {
    pub fn new(main_buckets: usize, indirect_buckets: usize) -> Self {
        let total = (main_buckets + indirect_buckets) * ASSOCIATIVITY;
        Self {
            slots: (0..total).map(|_| RwLock::new(TidStatus::default())).collect(),
            main_buckets,
            indirect_buckets,
            next_indirect: AtomicUsize::new(0),
            ro_gc: Mutex::new(VecDeque::new()),
            nro_gc: Mutex::new(VecDeque::new()),
        }
    }

    /// Slot index of `trx_id`, following indirect headers.
    fn find_slot(&self, trx_id: u64) -> Option<usize> {
        assert!(is_valid_trx_id(trx_id));
        let mut bucket = (trx_hash(trx_id) % self.main_buckets as u64) as usize;
        loop {
            let base = bucket * ASSOCIATIVITY;
            for i in 0..ASSOCIATIVITY - 1 {
                let slot = self.slots[base + i].read();
                if slot.trx_id == trx_id && !slot.is_empty_slot() {
                    return Some(base + i);
                }
            }
            let header = self.slots[base + ASSOCIATIVITY - 1].read();
            if header.trx_id == 0 {
                return None;
            }
            bucket = header.trx_id as usize;
        }
    }

    /// Inserts `trx_id` in Processing state. Duplicate insertion and
    /// indirect-region exhaustion are invariant violations.
    pub fn insert(&self, trx_id: u64, bt: u64, readonly: bool) {
        assert!(is_valid_trx_id(trx_id));
        let mut bucket = (trx_hash(trx_id) % self.main_buckets as u64) as usize;
        loop {
            let base = bucket * ASSOCIATIVITY;
            for i in 0..ASSOCIATIVITY - 1 {
                let mut slot = self.slots[base + i].write();
                assert!(
                    !(slot.trx_id == trx_id && !slot.is_empty_slot()),
                    "transaction table: duplicate trxid"
                );
                if slot.is_empty_slot() {
                    slot.enter_process(trx_id);
                    if readonly {
                        self.ro_gc.lock().push_back((bt, base + i));
                    }
                    return;
                }
            }
            let mut header = self.slots[base + ASSOCIATIVITY - 1].write();
            if header.trx_id != 0 {
                bucket = header.trx_id as usize;
                continue;
            }
            let ext = self.next_indirect.fetch_add(1, Ordering::SeqCst);
            assert!(
                ext < self.indirect_buckets,
                "transaction table: out of indirect-header region"
            );
            header.trx_id = (self.main_buckets + ext) as u64;
            bucket = header.trx_id as usize;
        }
    }

    pub fn query_status(&self, trx_id: u64) -> Option<TrxStatus> {
        let idx = self.find_slot(trx_id)?;
        Some(self.slots[idx].read().status())
    }

    pub fn query_ct(&self, trx_id: u64) -> Option<u64> {
        let idx = self.find_slot(trx_id)?;
        Some(self.slots[idx].read().ct)
    }

    pub fn enter_validation(&self, trx_id: u64, ct: u64) {
        if let Some(idx) = self.find_slot(trx_id) {
            let mut slot = self.slots[idx].write();
            slot.enter_validation();
            slot.enter_commit_time(ct);
        }
    }

    /// Finalizes to committed or aborted and queues the slot for GC.
    pub fn finish(&self, trx_id: u64, committed: bool, gc_ts: u64) {
        if let Some(idx) = self.find_slot(trx_id) {
            {
                let mut slot = self.slots[idx].write();
                if committed {
                    slot.enter_commit();
                } else {
                    slot.enter_abort();
                }
            }
            self.nro_gc.lock().push_back((gc_ts, idx));
            debug!(trx_id, committed, "transaction finished");
        }
    }

    /// Aborts while still processing (no validation round).
    pub fn abort_processing(&self, trx_id: u64, gc_ts: u64) {
        if let Some(idx) = self.find_slot(trx_id) {
            self.slots[idx].write().enter_abort();
            self.nro_gc.lock().push_back((gc_ts, idx));
        }
    }

    /// Marks erased every finished slot whose timestamp precedes the minimum
    /// active begin time; erased slots are reusable by later inserts.
    pub fn sweep(&self, min_active_bt: u64) -> usize {
        let mut erased = 0;
        for gc in [&self.ro_gc, &self.nro_gc] {
            let mut queue = gc.lock();
            while let Some(&(ts, idx)) = queue.front() {
                if ts >= min_active_bt {
                    break;
                }
                self.slots[idx].write().mark_erased();
                queue.pop_front();
                erased += 1;
            }
        }
        erased
    }
}

/// Remote-read interface to transaction status. The in-process
/// implementation reads the home worker's table directly, standing in for a
/// one-sided RDMA read; a TCP deployment would do a request-reply round.
pub trait TrxTableStub: Send + Sync {
    fn query_status(&self, trx_id: u64) -> Option<TrxStatus>;
    fn query_ct(&self, trx_id: u64) -> Option<u64>;
}

pub struct ClusterTrxStub {
    pub tables: Vec<Arc<TransactionTable>>,
    pub coordinator: Arc<Coordinator>,
}

impl TrxTableStub for ClusterTrxStub {
    fn query_status(&self, trx_id: u64) -> Option<TrxStatus> {
        let home = self.coordinator.worker_of_trx(trx_id)?;
        self.tables[home].query_status(trx_id)
    }

    fn query_ct(&self, trx_id: u64) -> Option<u64> {
        let home = self.coordinator.worker_of_trx(trx_id)?;
        self.tables[home].query_ct(trx_id)
    }
}

/// Status transitions serialized through a single-consumer queue, applied by
/// an exclusive executor thread.
pub enum TableWrite {
    Insert {
        trx_id: u64,
        bt: u64,
        readonly: bool,
    },
    Validate {
        trx_id: u64,
        ct: u64,
    },
    Finish {
        trx_id: u64,
        committed: bool,
        gc_ts: u64,
    },
    AbortProcessing {
        trx_id: u64,
        gc_ts: u64,
    },
    Sweep {
        min_active_bt: u64,
    },
    Shutdown,
}

pub struct TableWriter {
    tx: Sender<TableWrite>,
    handle: Option<JoinHandle<()>>,
}

impl TableWriter {
    pub fn spawn(table: Arc<TransactionTable>) -> Self {
        let (tx, rx) = unbounded();
        let handle = std::thread::Builder::new()
            .name("trx-table-writer".into())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    match req {
                        TableWrite::Insert {
                            trx_id,
                            bt,
                            readonly,
                        } => table.insert(trx_id, bt, readonly),
                        TableWrite::Validate { trx_id, ct } => {
                            table.enter_validation(trx_id, ct)
                        }
                        TableWrite::Finish {
                            trx_id,
                            committed,
                            gc_ts,
                        } => table.finish(trx_id, committed, gc_ts),
                        TableWrite::AbortProcessing { trx_id, gc_ts } => {
                            table.abort_processing(trx_id, gc_ts)
                        }
                        TableWrite::Sweep { min_active_bt } => {
                            table.sweep(min_active_bt);
                        }
                        TableWrite::Shutdown => break,
                    }
                }
            })
            .expect("spawn trx-table writer");
        Self {
            tx,
            handle: Some(handle),
        }
    }

    pub fn send(&self, req: TableWrite) {
        let _ = self.tx.send(req);
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        let _ = self.tx.send(TableWrite::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TRX_TAG;

    fn trx(n: u64) -> u64 {
        TRX_TAG | (n << QID_BITS)
    }

    #[test]
    fn lifecycle_transitions() {
        let table = TransactionTable::new(4, 2);
        let t = trx(1);
        table.insert(t, 5, false);
        assert_eq!(table.query_status(t), Some(TrxStatus::Processing));
        table.enter_validation(t, 9);
        assert_eq!(table.query_status(t), Some(TrxStatus::Validating));
        assert_eq!(table.query_ct(t), Some(9));
        table.finish(t, true, 9);
        assert_eq!(table.query_status(t), Some(TrxStatus::Committed));
    }

    #[test]
    fn abort_before_validation() {
        let table = TransactionTable::new(4, 2);
        let t = trx(1);
        table.insert(t, 5, false);
        table.abort_processing(t, 5);
        assert_eq!(table.query_status(t), Some(TrxStatus::Aborted));
    }

    #[test]
    #[should_panic(expected = "duplicate trxid")]
    fn duplicate_insert_panics() {
        let table = TransactionTable::new(4, 2);
        let t = trx(1);
        table.insert(t, 5, false);
        table.insert(t, 6, false);
    }

    #[test]
    fn bucket_overflow_uses_indirect_headers() {
        let table = TransactionTable::new(1, 4);
        // all hash to bucket 0; more than one bucket's worth
        let ids: Vec<u64> = (1..=20).map(trx).collect();
        for (i, &t) in ids.iter().enumerate() {
            table.insert(t, i as u64, false);
        }
        for &t in &ids {
            assert_eq!(table.query_status(t), Some(TrxStatus::Processing));
        }
    }

    #[test]
    fn sweep_reclaims_finished_slots() {
        let table = TransactionTable::new(1, 2);
        let a = trx(1);
        let b = trx(2);
        table.insert(a, 1, true);
        table.insert(b, 2, false);
        table.enter_validation(b, 4);
        table.finish(b, true, 4);

        // nothing active before ts 10: both become erasable
        assert_eq!(table.sweep(10), 2);
        assert_eq!(table.query_status(a), None);
        // the slot is reusable
        let c = trx(3);
        table.insert(c, 11, false);
        assert_eq!(table.query_status(c), Some(TrxStatus::Processing));
    }
}
