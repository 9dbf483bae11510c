use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::ReadStat;
use crate::storage::mem_pool::ConcurrentMemPool;
use crate::storage::mvcc_list::{AppendOutcome, MvccList, MvccPool, NIL};
use crate::storage::value_store::{MvccValueStore, ValueHeader};
use crate::types::{LabelId, Value, PKEY_MASK};

/// Cells per property row; rows are chained when a list outgrows one.
pub const PROPERTY_ROW_CELLS: usize = 8;

/// One property slot. `pid` is written before the cell is published through
/// the row list's cell count; afterwards only the version chain mutates.
pub struct PropertyCell {
    pub pid: u64,
    pub mvcc: MvccList<ValueHeader>,
}

impl Default for PropertyCell {
    fn default() -> Self {
        Self {
            pid: u64::MAX,
            mvcc: MvccList::new(),
        }
    }
}

pub struct PropertyRow {
    next: AtomicU32,
    cells: [PropertyCell; PROPERTY_ROW_CELLS],
}

impl Default for PropertyRow {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            cells: Default::default(),
        }
    }
}

pub type PropertyRowPool = ConcurrentMemPool<PropertyRow>;

/// Storage handles a property operation needs, bundled so call sites thread
/// one context value instead of global singletons.
#[derive(Clone, Copy)]
pub struct PropStores<'a> {
    pub rows: &'a PropertyRowPool,
    pub mvcc: &'a MvccPool<ValueHeader>,
    pub values: &'a MvccValueStore,
    pub tid: usize,
}

/// Chained fixed-capacity rows of property cells with an optional pkey map
/// materialized once the list exceeds one row.
///
/// Readers scan the first `cell_count` cells without the lock (the count is
/// published with release ordering after the cell is written); the lock
/// covers allocation and insertion only.
#[derive(Debug)]
pub struct PropertyRowList {
    head: AtomicU32,
    cell_count: AtomicUsize,
    lock: Mutex<()>,
    index: Mutex<Option<HashMap<LabelId, usize>>>,
}

impl Default for PropertyRowList {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyRowList {
    pub fn new() -> Self {
        Self {
            head: AtomicU32::new(NIL),
            cell_count: AtomicUsize::new(0),
            lock: Mutex::new(()),
            index: Mutex::new(None),
        }
    }

    pub fn property_count(&self) -> usize {
        self.cell_count.load(Ordering::Acquire)
    }

    /// Shared reference to the published cell at `slot`.
    fn cell<'a>(&self, stores: &PropStores<'a>, slot: usize) -> &'a PropertyCell {
        let mut row = self.head.load(Ordering::Acquire);
        for _ in 0..slot / PROPERTY_ROW_CELLS {
            row = unsafe { (*stores.rows.slot_ptr(row)).next.load(Ordering::Acquire) };
        }
        unsafe { &(*stores.rows.slot_ptr(row)).cells[slot % PROPERTY_ROW_CELLS] }
    }

    /// Finds the published cell holding `pid`, via the pkey map when
    /// materialized and a bounded scan otherwise.
    fn locate_cell<'a>(&self, stores: &PropStores<'a>, pid: u64) -> Option<&'a PropertyCell> {
        let count = self.property_count();
        if let Some(map) = self.index.lock().as_ref() {
            let slot = *map.get(&((pid & PKEY_MASK) as LabelId))?;
            if slot < count {
                return Some(self.cell(stores, slot));
            }
            return None;
        }
        let mut row = self.head.load(Ordering::Acquire);
        let mut scanned = 0;
        while row != NIL && scanned < count {
            let row_ref = stores.rows.slot_ptr(row);
            let in_row = (count - scanned).min(PROPERTY_ROW_CELLS);
            for i in 0..in_row {
                let cell = unsafe { &(*row_ref).cells[i] };
                if cell.pid == pid {
                    return Some(cell);
                }
            }
            scanned += in_row;
            row = unsafe { (*row_ref).next.load(Ordering::Acquire) };
        }
        None
    }

    /// Locates `pid`'s cell, allocating (and publishing) a fresh one when
    /// absent. At most one cell ever exists per pid: allocation re-checks
    /// under the lock.
    fn locate_or_allocate<'a>(&self, stores: &PropStores<'a>, pid: u64) -> &'a PropertyCell {
        if let Some(cell) = self.locate_cell(stores, pid) {
            return cell;
        }
        let _guard = self.lock.lock();
        // a racing writer may have allocated the cell first
        if let Some(cell) = self.locate_cell(stores, pid) {
            return cell;
        }

        let count = self.cell_count.load(Ordering::Relaxed);
        let slot_in_row = count % PROPERTY_ROW_CELLS;
        let row = if count == 0 {
            let row = stores.rows.get(stores.tid);
            self.head.store(row, Ordering::Release);
            row
        } else {
            // walk to the last row, chaining a new one on a row boundary
            let mut row = self.head.load(Ordering::Acquire);
            for _ in 0..(count - 1) / PROPERTY_ROW_CELLS {
                row = unsafe { (*stores.rows.slot_ptr(row)).next.load(Ordering::Acquire) };
            }
            if slot_in_row == 0 {
                let fresh = stores.rows.get(stores.tid);
                unsafe { (*stores.rows.slot_ptr(row)).next.store(fresh, Ordering::Release) };
                fresh
            } else {
                row
            }
        };

        let row_ptr = stores.rows.slot_ptr(row);
        unsafe { (*row_ptr).cells[slot_in_row].pid = pid };
        self.cell_count.store(count + 1, Ordering::Release);

        let mut index = self.index.lock();
        if let Some(map) = index.as_mut() {
            map.insert((pid & PKEY_MASK) as LabelId, count);
        } else if count + 1 > PROPERTY_ROW_CELLS {
            // convert O(n) scans to O(1) lookups past one row's worth
            let mut map = HashMap::with_capacity(count + 1);
            for slot in 0..count + 1 {
                let cell = self.cell(stores, slot);
                map.insert((cell.pid & PKEY_MASK) as LabelId, slot);
            }
            *index = Some(map);
        }
        drop(index);

        unsafe { &(*row_ptr).cells[slot_in_row] }
    }

    /// Load-time insertion of an already-committed property.
    pub fn insert_initial(&self, stores: &PropStores<'_>, pid: u64, value: &Value) {
        let header = stores.values.insert(value, stores.tid);
        let cell = self.locate_or_allocate(stores, pid);
        cell.mvcc.append_initial(stores.mvcc, stores.tid, header);
    }

    /// Appends an uncommitted property version. Returns `(existed_before,
    /// outcome)`; a `Conflict` leaves the list untouched.
    pub fn modify(
        &self,
        stores: &PropStores<'_>,
        pid: u64,
        value: &Value,
        trx_id: u64,
        bt: u64,
    ) -> (bool, crate::error::WriteStat) {
        let existed = self.locate_cell(stores, pid).is_some();
        let header = stores.values.insert(value, stores.tid);
        let cell = self.locate_or_allocate(stores, pid);
        match cell.mvcc.append_version(stores.mvcc, stores.tid, trx_id, bt, header) {
            AppendOutcome::Appended => (existed, crate::error::WriteStat::Success),
            AppendOutcome::Reused(old) => {
                stores.values.free(&old, stores.tid);
                (existed, crate::error::WriteStat::Success)
            }
            AppendOutcome::Conflict => {
                stores.values.free(&header, stores.tid);
                (existed, crate::error::WriteStat::Conflict)
            }
        }
    }

    /// Appends a logical-delete version for `pid`.
    pub fn drop_property(
        &self,
        stores: &PropStores<'_>,
        pid: u64,
        trx_id: u64,
        bt: u64,
    ) -> crate::error::WriteStat {
        let Some(cell) = self.locate_cell(stores, pid) else {
            return crate::error::WriteStat::NotFound;
        };
        match cell.mvcc.append_version(
            stores.mvcc,
            stores.tid,
            trx_id,
            bt,
            ValueHeader::deleted(),
        ) {
            AppendOutcome::Appended => crate::error::WriteStat::Success,
            AppendOutcome::Reused(old) => {
                stores.values.free(&old, stores.tid);
                crate::error::WriteStat::Success
            }
            AppendOutcome::Conflict => crate::error::WriteStat::Conflict,
        }
    }

    pub fn read(
        &self,
        stores: &PropStores<'_>,
        pid: u64,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Value> {
        let Some(cell) = self.locate_cell(stores, pid) else {
            return ReadStat::NotFound;
        };
        match cell.mvcc.visible_version(stores.mvcc, trx_id, bt, read_only) {
            ReadStat::Success(header) if header.is_deleted() => ReadStat::NotFound,
            ReadStat::Success(header) => match stores.values.read(&header) {
                Ok(v) => ReadStat::Success(v),
                Err(_) => ReadStat::NotFound,
            },
            ReadStat::NotFound => ReadStat::NotFound,
            ReadStat::Abort => ReadStat::Abort,
        }
    }

    /// All visible `(pkey, value)` pairs.
    pub fn read_all(
        &self,
        stores: &PropStores<'_>,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<(LabelId, Value)>> {
        let mut out = Vec::new();
        for slot in 0..self.property_count() {
            let cell = self.cell(stores, slot);
            match cell.mvcc.visible_version(stores.mvcc, trx_id, bt, read_only) {
                ReadStat::Success(header) if header.is_deleted() => {}
                ReadStat::Success(header) => {
                    if let Ok(v) = stores.values.read(&header) {
                        out.push(((cell.pid & PKEY_MASK) as LabelId, v));
                    }
                }
                ReadStat::NotFound => {}
                ReadStat::Abort => return ReadStat::Abort,
            }
        }
        ReadStat::Success(out)
    }

    /// Pids of all currently visible properties.
    pub fn read_pid_list(
        &self,
        stores: &PropStores<'_>,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<u64>> {
        let mut out = Vec::new();
        for slot in 0..self.property_count() {
            let cell = self.cell(stores, slot);
            match cell.mvcc.visible_version(stores.mvcc, trx_id, bt, read_only) {
                ReadStat::Success(header) if header.is_deleted() => {}
                ReadStat::Success(_) => out.push(cell.pid),
                ReadStat::NotFound => {}
                ReadStat::Abort => return ReadStat::Abort,
            }
        }
        ReadStat::Success(out)
    }

    pub fn commit(&self, stores: &PropStores<'_>, pid: u64, trx_id: u64, ct: u64) {
        if let Some(cell) = self.locate_cell(stores, pid) {
            cell.mvcc.commit_version(stores.mvcc, trx_id, ct);
        }
    }

    pub fn abort(&self, stores: &PropStores<'_>, pid: u64, trx_id: u64) {
        if let Some(cell) = self.locate_cell(stores, pid) {
            if let Some(header) = cell.mvcc.abort_version(stores.mvcc, stores.tid, trx_id) {
                stores.values.free(&header, stores.tid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TRX_TAG;

    struct Fixture {
        rows: PropertyRowPool,
        mvcc: MvccPool<ValueHeader>,
        values: MvccValueStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                rows: PropertyRowPool::new(1 << 12, 2),
                mvcc: MvccPool::new(1 << 12, 2),
                values: MvccValueStore::new(1 << 13, 2),
            }
        }

        fn stores(&self) -> PropStores<'_> {
            PropStores {
                rows: &self.rows,
                mvcc: &self.mvcc,
                values: &self.values,
                tid: 0,
            }
        }
    }

    #[test]
    fn initial_insert_and_read() {
        let fx = Fixture::new();
        let stores = fx.stores();
        let list = PropertyRowList::new();
        list.insert_initial(&stores, 0x10, &Value::Str("peter".into()));

        assert_eq!(
            list.read(&stores, 0x10, TRX_TAG, 5, true),
            ReadStat::Success(Value::Str("peter".into()))
        );
        assert_eq!(list.read(&stores, 0x11, TRX_TAG, 5, true), ReadStat::NotFound);
    }

    #[test]
    fn grows_past_one_row_and_materializes_index() {
        let fx = Fixture::new();
        let stores = fx.stores();
        let list = PropertyRowList::new();
        let n = PROPERTY_ROW_CELLS * 3 + 2;
        for pkey in 0..n as u64 {
            list.insert_initial(&stores, pkey, &Value::Int(pkey as i64));
        }
        assert_eq!(list.property_count(), n);
        for pkey in 0..n as u64 {
            assert_eq!(
                list.read(&stores, pkey, TRX_TAG, 5, true),
                ReadStat::Success(Value::Int(pkey as i64))
            );
        }
        let all = match list.read_all(&stores, TRX_TAG, 5, true) {
            ReadStat::Success(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(all.len(), n);
    }

    #[test]
    fn modify_commit_abort_cycle() {
        let fx = Fixture::new();
        let stores = fx.stores();
        let list = PropertyRowList::new();
        list.insert_initial(&stores, 1, &Value::Str("old".into()));

        let t1 = TRX_TAG | 0x100;
        let t2 = TRX_TAG | 0x200;
        let (existed, stat) = list.modify(&stores, 1, &Value::Str("new".into()), t1, 10);
        assert!(existed && stat.ok());

        // conflicting writer
        let (_, stat) = list.modify(&stores, 1, &Value::Str("lost".into()), t2, 11);
        assert_eq!(stat, crate::error::WriteStat::Conflict);

        list.commit(&stores, 1, t1, 12);
        assert_eq!(
            list.read(&stores, 1, t2, 12, true),
            ReadStat::Success(Value::Str("new".into()))
        );

        // abort path frees the uncommitted header
        let (_, stat) = list.modify(&stores, 1, &Value::Str("temp".into()), t2, 13);
        assert!(stat.ok());
        list.abort(&stores, 1, t2);
        assert_eq!(
            list.read(&stores, 1, t2, 13, false),
            ReadStat::Success(Value::Str("new".into()))
        );
    }

    #[test]
    fn logical_delete_hides_property() {
        let fx = Fixture::new();
        let stores = fx.stores();
        let list = PropertyRowList::new();
        list.insert_initial(&stores, 1, &Value::Int(9));

        let t1 = TRX_TAG | 0x100;
        assert!(list.drop_property(&stores, 1, t1, 10).ok());
        list.commit(&stores, 1, t1, 11);
        assert_eq!(list.read(&stores, 1, TRX_TAG | 0x200, 11, true), ReadStat::NotFound);
        assert_eq!(
            list.read(&stores, 1, TRX_TAG | 0x200, 10, true),
            ReadStat::Success(Value::Int(9))
        );
    }
}
