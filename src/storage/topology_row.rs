use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::ReadStat;
use crate::storage::mem_pool::ConcurrentMemPool;
use crate::storage::mvcc_list::{MvccList, MvccPool, NIL};
use crate::storage::property_row::PropertyRowList;
use crate::types::{Direction, Eid, LabelId, Vid};

pub const TOPOLOGY_ROW_CELLS: usize = 8;

/// Wildcard label filter.
pub const ANY_LABEL: i32 = -1;

/// The versioned payload of one edge. The same MVCC list is referenced from
/// the global edge map and from each endpoint's topology rows; the list IS
/// the edge's identity.
#[derive(Debug, Clone, Default)]
pub struct EdgeMvcc {
    pub exists: bool,
    pub label: LabelId,
    pub ep_rows: Option<Arc<PropertyRowList>>,
}

/// One topology slot: direction flag, edge label, neighbor vertex, and the
/// shared edge version chain. Written before publication, read-only after.
pub struct EdgeCell {
    pub is_out: bool,
    pub label: LabelId,
    pub conn_vid: Vid,
    pub mvcc: Option<Arc<MvccList<EdgeMvcc>>>,
}

impl Default for EdgeCell {
    fn default() -> Self {
        Self {
            is_out: false,
            label: 0,
            conn_vid: Vid(0),
            mvcc: None,
        }
    }
}

pub struct TopologyRow {
    next: AtomicU32,
    cells: [EdgeCell; TOPOLOGY_ROW_CELLS],
}

impl Default for TopologyRow {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            cells: Default::default(),
        }
    }
}

pub type TopologyRowPool = ConcurrentMemPool<TopologyRow>;

#[derive(Clone, Copy)]
pub struct TopoStores<'a> {
    pub rows: &'a TopologyRowPool,
    pub mvcc: &'a MvccPool<EdgeMvcc>,
    pub tid: usize,
}

/// Per-vertex chain of fixed-capacity rows of edge headers.
pub struct TopologyRowList {
    my_vid: Vid,
    head: AtomicU32,
    edge_count: AtomicUsize,
    lock: Mutex<()>,
}

impl TopologyRowList {
    pub fn new(my_vid: Vid) -> Self {
        Self {
            my_vid,
            head: AtomicU32::new(NIL),
            edge_count: AtomicUsize::new(0),
            lock: Mutex::new(()),
        }
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count.load(Ordering::Acquire)
    }

    fn cell<'a>(&self, stores: &TopoStores<'a>, slot: usize) -> &'a EdgeCell {
        let mut row = self.head.load(Ordering::Acquire);
        for _ in 0..slot / TOPOLOGY_ROW_CELLS {
            row = unsafe { (*stores.rows.slot_ptr(row)).next.load(Ordering::Acquire) };
        }
        unsafe { &(*stores.rows.slot_ptr(row)).cells[slot % TOPOLOGY_ROW_CELLS] }
    }

    /// Publishes a new edge header. The edge MVCC list must already carry its
    /// first (initial or uncommitted) version.
    pub fn insert_cell(
        &self,
        stores: &TopoStores<'_>,
        is_out: bool,
        edge_label: LabelId,
        conn_vid: Vid,
        mvcc: Arc<MvccList<EdgeMvcc>>,
    ) {
        let _guard = self.lock.lock();
        let count = self.edge_count.load(Ordering::Relaxed);
        let slot_in_row = count % TOPOLOGY_ROW_CELLS;
        let row = if count == 0 {
            let row = stores.rows.get(stores.tid);
            self.head.store(row, Ordering::Release);
            row
        } else {
            let mut row = self.head.load(Ordering::Acquire);
            for _ in 0..(count - 1) / TOPOLOGY_ROW_CELLS {
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
        unsafe {
            (*row_ptr).cells[slot_in_row].is_out = is_out;
            (*row_ptr).cells[slot_in_row].label = edge_label;
            (*row_ptr).cells[slot_in_row].conn_vid = conn_vid;
            (*row_ptr).cells[slot_in_row].mvcc = Some(mvcc);
        }
        self.edge_count.store(count + 1, Ordering::Release);
    }

    fn matches(cell: &EdgeCell, direction: Direction, label: i32) -> bool {
        let dir_ok = match direction {
            Direction::In => !cell.is_out,
            Direction::Out => cell.is_out,
            Direction::Both => true,
        };
        dir_ok && (label == ANY_LABEL || cell.label as i32 == label)
    }

    fn eid_of(&self, cell: &EdgeCell) -> Eid {
        if cell.is_out {
            Eid::new(self.my_vid, cell.conn_vid)
        } else {
            Eid::new(cell.conn_vid, self.my_vid)
        }
    }

    /// Neighbor vertices over visible edges matching `direction`/`label`.
    pub fn read_connected_vertices(
        &self,
        stores: &TopoStores<'_>,
        direction: Direction,
        label: i32,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<Vid>> {
        self.read_matching(stores, direction, label, trx_id, bt, read_only)
            .map(|cells| cells.into_iter().map(|(vid, _)| vid).collect())
    }

    /// Incident visible edge ids matching `direction`/`label`.
    pub fn read_connected_edges(
        &self,
        stores: &TopoStores<'_>,
        direction: Direction,
        label: i32,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<Eid>> {
        self.read_matching(stores, direction, label, trx_id, bt, read_only)
            .map(|cells| cells.into_iter().map(|(_, eid)| eid).collect())
    }

    fn read_matching(
        &self,
        stores: &TopoStores<'_>,
        direction: Direction,
        label: i32,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<(Vid, Eid)>> {
        let mut out = Vec::new();
        for slot in 0..self.edge_count() {
            let cell = self.cell(stores, slot);
            if !Self::matches(cell, direction, label) {
                continue;
            }
            let Some(mvcc) = cell.mvcc.as_ref() else {
                continue;
            };
            match mvcc.visible_version(stores.mvcc, trx_id, bt, read_only) {
                ReadStat::Success(edge) if edge.exists => {
                    out.push((cell.conn_vid, self.eid_of(cell)));
                }
                ReadStat::Success(_) | ReadStat::NotFound => {}
                ReadStat::Abort => return ReadStat::Abort,
            }
        }
        ReadStat::Success(out)
    }

    /// The version chain published for `(is_out, conn_vid)`, if any.
    pub fn find_cell_list(
        &self,
        stores: &TopoStores<'_>,
        is_out: bool,
        conn_vid: Vid,
    ) -> Option<Arc<MvccList<EdgeMvcc>>> {
        for slot in 0..self.edge_count() {
            let cell = self.cell(stores, slot);
            if cell.is_out == is_out && cell.conn_vid == conn_vid {
                return cell.mvcc.clone();
            }
        }
        None
    }

    /// Incident edge chains with headers, for vertex-drop fan-out.
    pub fn visible_edge_lists(
        &self,
        stores: &TopoStores<'_>,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<Eid>> {
        self.read_matching(stores, Direction::Both, ANY_LABEL, trx_id, bt, read_only)
            .map(|cells| cells.into_iter().map(|(_, eid)| eid).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TRX_TAG;

    struct Fixture {
        rows: TopologyRowPool,
        mvcc: MvccPool<EdgeMvcc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                rows: TopologyRowPool::new(1 << 12, 2),
                mvcc: MvccPool::new(1 << 12, 2),
            }
        }

        fn stores(&self) -> TopoStores<'_> {
            TopoStores {
                rows: &self.rows,
                mvcc: &self.mvcc,
                tid: 0,
            }
        }

        fn committed_edge(&self, label: LabelId) -> Arc<MvccList<EdgeMvcc>> {
            let list = Arc::new(MvccList::new());
            list.append_initial(
                &self.mvcc,
                0,
                EdgeMvcc {
                    exists: true,
                    label,
                    ep_rows: None,
                },
            );
            list
        }
    }

    #[test]
    fn direction_and_label_filters() {
        let fx = Fixture::new();
        let stores = fx.stores();
        let list = TopologyRowList::new(Vid(1));
        list.insert_cell(&stores, true, 3, Vid(2), fx.committed_edge(3));
        list.insert_cell(&stores, false, 4, Vid(5), fx.committed_edge(4));

        let out = match list.read_connected_vertices(&stores, Direction::Out, ANY_LABEL, TRX_TAG, 5, true) {
            ReadStat::Success(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(out, vec![Vid(2)]);

        let labelled = match list.read_connected_edges(&stores, Direction::Both, 4, TRX_TAG, 5, true) {
            ReadStat::Success(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(labelled, vec![Eid::new(Vid(5), Vid(1))]);
    }

    #[test]
    fn rows_chain_past_capacity() {
        let fx = Fixture::new();
        let stores = fx.stores();
        let list = TopologyRowList::new(Vid(0));
        let n = TOPOLOGY_ROW_CELLS * 2 + 3;
        for i in 0..n {
            list.insert_cell(&stores, true, 1, Vid(i as u32 + 1), fx.committed_edge(1));
        }
        let out = match list.read_connected_vertices(&stores, Direction::Out, 1, TRX_TAG, 5, true) {
            ReadStat::Success(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(out.len(), n);
    }
}
