pub mod mem_pool;
pub mod mvcc_list;
pub mod property_row;
pub mod topology_row;
pub mod value_store;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::error::{ReadStat, WriteStat};
use crate::schema::SchemaIndex;
use crate::types::{Direction, Eid, Epid, LabelId, Value, Vid, Vpid};

use mvcc_list::{AppendOutcome, MvccList, MvccPool};
use property_row::{PropStores, PropertyRowList, PropertyRowPool};
use topology_row::{EdgeMvcc, TopoStores, TopologyRowList, TopologyRowPool};
use value_store::{MvccValueStore, ValueHeader};

/// A vertex and everything hanging off it. The existence MVCC list makes
/// deletion logical; label is immutable after creation.
pub struct VertexItem {
    pub label: LabelId,
    pub vp_rows: Arc<PropertyRowList>,
    pub topo: TopologyRowList,
    pub mvcc: MvccList<bool>,
}

/// Key of a read or write for validation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RwKey {
    VertexExists(u32),
    EdgeExists(u64),
    VertexProp(u64),
    EdgeProp(u64),
}

/// What a transaction did to one MVCC list, recorded at write time so
/// commit/abort can walk it.
enum ProcessItem {
    AddVertex(Arc<VertexItem>),
    DropVertex(Arc<VertexItem>),
    VertexProp { rows: Arc<PropertyRowList>, pid: u64 },
    EdgeProp { rows: Arc<PropertyRowList>, pid: u64 },
    EdgeVersion(Arc<MvccList<EdgeMvcc>>),
}

#[derive(Default)]
struct TrxRecord {
    process_list: Mutex<Vec<ProcessItem>>,
    read_set: Mutex<HashSet<RwKey>>,
    write_set: Mutex<HashSet<RwKey>>,
}

/// Per-worker MVCC graph store: concurrent vertex/edge/transaction maps on
/// top of pooled rows, version chains and value cells.
pub struct DataStorage {
    worker_rank: usize,
    worker_count: usize,
    pub schema: Arc<SchemaIndex>,

    vertex_map: DashMap<u32, Arc<VertexItem>>,
    edge_map: DashMap<u64, Arc<MvccList<EdgeMvcc>>>,
    trx_map: DashMap<u64, Arc<TrxRecord>>,
    committed_writes: DashMap<u64, Arc<HashSet<RwKey>>>,
    /// Transactions whose abort was already applied here; a straggler write
    /// arriving afterwards must not strand a fresh uncommitted tail.
    aborted_trx: DashMap<u64, ()>,

    vp_rows: PropertyRowPool,
    ep_rows: PropertyRowPool,
    topo_rows: TopologyRowPool,
    prop_mvcc: MvccPool<ValueHeader>,
    vertex_mvcc: MvccPool<bool>,
    edge_mvcc: MvccPool<EdgeMvcc>,
    vp_store: MvccValueStore,
    ep_store: MvccValueStore,

    /// Divided local counter; the next fresh vid is
    /// `counter * worker_count + worker_rank` (globally unique, I6).
    next_local_vid: AtomicU32,
}

impl DataStorage {
    pub fn new(cfg: &Config, worker_rank: usize, schema: Arc<SchemaIndex>) -> Self {
        // expert threads plus the worker's own control thread
        let nthreads = cfg.num_expert_threads + 1;
        Self {
            worker_rank,
            worker_count: cfg.num_workers,
            schema,
            vertex_map: DashMap::new(),
            edge_map: DashMap::new(),
            trx_map: DashMap::new(),
            committed_writes: DashMap::new(),
            aborted_trx: DashMap::new(),
            vp_rows: PropertyRowPool::new(cfg.row_pool_size, nthreads),
            ep_rows: PropertyRowPool::new(cfg.row_pool_size, nthreads),
            topo_rows: TopologyRowPool::new(cfg.row_pool_size, nthreads),
            prop_mvcc: MvccPool::new(cfg.mvcc_pool_size, nthreads),
            vertex_mvcc: MvccPool::new(cfg.mvcc_pool_size, nthreads),
            edge_mvcc: MvccPool::new(cfg.mvcc_pool_size, nthreads),
            vp_store: MvccValueStore::new(cfg.vp_store_cells, nthreads),
            ep_store: MvccValueStore::new(cfg.ep_store_cells, nthreads),
            next_local_vid: AtomicU32::new(0),
        }
    }

    pub fn worker_rank(&self) -> usize {
        self.worker_rank
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn vp_stores(&self, tid: usize) -> PropStores<'_> {
        PropStores {
            rows: &self.vp_rows,
            mvcc: &self.prop_mvcc,
            values: &self.vp_store,
            tid,
        }
    }

    fn ep_stores(&self, tid: usize) -> PropStores<'_> {
        PropStores {
            rows: &self.ep_rows,
            mvcc: &self.prop_mvcc,
            values: &self.ep_store,
            tid,
        }
    }

    fn topo_stores(&self, tid: usize) -> TopoStores<'_> {
        TopoStores {
            rows: &self.topo_rows,
            mvcc: &self.edge_mvcc,
            tid,
        }
    }

    fn trx_record(&self, trx_id: u64) -> Arc<TrxRecord> {
        self.trx_map
            .entry(trx_id)
            .or_insert_with(|| Arc::new(TrxRecord::default()))
            .clone()
    }

    fn record_process(&self, trx_id: u64, item: ProcessItem) {
        self.trx_record(trx_id).process_list.lock().push(item);
    }

    /// Read/write audit feeding validation. Reads are only tracked for
    /// read-write transactions.
    pub fn record_read(&self, trx_id: u64, read_only: bool, key: RwKey) {
        if !read_only {
            self.trx_record(trx_id).read_set.lock().insert(key);
        }
    }

    fn record_write(&self, trx_id: u64, key: RwKey) {
        self.trx_record(trx_id).write_set.lock().insert(key);
    }

    /// True once this transaction's abort was applied here; a late write
    /// message must not strand a fresh uncommitted tail.
    fn trx_aborted(&self, trx_id: u64) -> bool {
        self.aborted_trx.contains_key(&trx_id)
    }

    // ---- bulk load ---------------------------------------------------

    /// Installs an already-committed vertex during loading; vertices not
    /// owned by this worker are skipped by the loader.
    pub fn load_vertex(
        &self,
        tid: usize,
        vid: Vid,
        label: LabelId,
        properties: &[(LabelId, Value)],
    ) {
        let item = Arc::new(VertexItem {
            label,
            vp_rows: Arc::new(PropertyRowList::new()),
            topo: TopologyRowList::new(vid),
            mvcc: MvccList::new(),
        });
        item.mvcc.append_initial(&self.vertex_mvcc, tid, true);
        let stores = self.vp_stores(tid);
        for (pkey, value) in properties {
            item.vp_rows
                .insert_initial(&stores, Vpid::new(vid, *pkey).0, value);
        }
        // keep the divided vid counter ahead of loaded ids
        if vid.owner(self.worker_count) == self.worker_rank {
            let local = vid.0 / self.worker_count as u32 + 1;
            self.next_local_vid.fetch_max(local, Ordering::SeqCst);
        }
        self.vertex_map.insert(vid.0, item);
    }

    /// Installs a committed edge side on this worker. The out side also
    /// registers the authoritative list in the edge map and owns the edge
    /// properties; the in side keeps a topology replica list.
    pub fn load_edge_side(
        &self,
        tid: usize,
        eid: Eid,
        label: LabelId,
        is_out: bool,
        properties: &[(LabelId, Value)],
    ) {
        let my_vid = if is_out { eid.out_v } else { eid.in_v };
        let Some(vertex) = self.vertex_map.get(&my_vid.0).map(|v| v.value().clone()) else {
            return;
        };

        let ep_rows = if is_out {
            let rows = Arc::new(PropertyRowList::new());
            let stores = self.ep_stores(tid);
            for (pkey, value) in properties {
                rows.insert_initial(&stores, Epid::new(eid, *pkey).0, value);
            }
            Some(rows)
        } else {
            None
        };

        let list = Arc::new(MvccList::new());
        list.append_initial(
            &self.edge_mvcc,
            tid,
            EdgeMvcc {
                exists: true,
                label,
                ep_rows,
            },
        );
        if is_out {
            self.edge_map.insert(eid.value(), list.clone());
        }
        let conn = if is_out { eid.in_v } else { eid.out_v };
        vertex
            .topo
            .insert_cell(&self.topo_stores(tid), is_out, label, conn, list);
    }

    // ---- reads -------------------------------------------------------

    pub fn get_vp(
        &self,
        tid: usize,
        pid: Vpid,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Value> {
        let Some(vertex) = self.vertex_map.get(&pid.vid().0).map(|v| v.value().clone()) else {
            return ReadStat::NotFound;
        };
        self.record_read(trx_id, read_only, RwKey::VertexProp(pid.0));
        vertex
            .vp_rows
            .read(&self.vp_stores(tid), pid.0, trx_id, bt, read_only)
    }

    pub fn get_vp_all(
        &self,
        tid: usize,
        vid: Vid,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<(LabelId, Value)>> {
        let Some(vertex) = self.vertex_map.get(&vid.0).map(|v| v.value().clone()) else {
            return ReadStat::NotFound;
        };
        self.record_read(trx_id, read_only, RwKey::VertexExists(vid.0));
        vertex
            .vp_rows
            .read_all(&self.vp_stores(tid), trx_id, bt, read_only)
    }

    pub fn get_vpid_list(
        &self,
        tid: usize,
        vid: Vid,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<u64>> {
        let Some(vertex) = self.vertex_map.get(&vid.0).map(|v| v.value().clone()) else {
            return ReadStat::NotFound;
        };
        vertex
            .vp_rows
            .read_pid_list(&self.vp_stores(tid), trx_id, bt, read_only)
    }

    pub fn get_vertex_label(&self, vid: Vid) -> Option<LabelId> {
        self.vertex_map.get(&vid.0).map(|v| v.label)
    }

    /// Existence check against the vertex MVCC chain.
    pub fn vertex_visible(
        &self,
        vid: Vid,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<bool> {
        let Some(vertex) = self.vertex_map.get(&vid.0).map(|v| v.value().clone()) else {
            return ReadStat::NotFound;
        };
        vertex
            .mvcc
            .visible_version(&self.vertex_mvcc, trx_id, bt, read_only)
    }

    pub fn get_ep(
        &self,
        tid: usize,
        pid: Epid,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Value> {
        let eid = pid.eid();
        let Some(list) = self.edge_map.get(&eid.value()).map(|e| e.value().clone()) else {
            return ReadStat::NotFound;
        };
        self.record_read(trx_id, read_only, RwKey::EdgeProp(pid.0));
        match list.visible_version(&self.edge_mvcc, trx_id, bt, read_only) {
            ReadStat::Success(edge) if edge.exists => match edge.ep_rows {
                Some(rows) => rows.read(&self.ep_stores(tid), pid.0, trx_id, bt, read_only),
                None => ReadStat::NotFound,
            },
            ReadStat::Success(_) | ReadStat::NotFound => ReadStat::NotFound,
            ReadStat::Abort => ReadStat::Abort,
        }
    }

    pub fn get_ep_all(
        &self,
        tid: usize,
        eid: Eid,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<(LabelId, Value)>> {
        let Some(list) = self.edge_map.get(&eid.value()).map(|e| e.value().clone()) else {
            return ReadStat::NotFound;
        };
        self.record_read(trx_id, read_only, RwKey::EdgeExists(eid.value()));
        match list.visible_version(&self.edge_mvcc, trx_id, bt, read_only) {
            ReadStat::Success(edge) if edge.exists => match edge.ep_rows {
                Some(rows) => rows.read_all(&self.ep_stores(tid), trx_id, bt, read_only),
                None => ReadStat::Success(Vec::new()),
            },
            ReadStat::Success(_) | ReadStat::NotFound => ReadStat::NotFound,
            ReadStat::Abort => ReadStat::Abort,
        }
    }

    pub fn get_edge_label(
        &self,
        eid: Eid,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<LabelId> {
        let Some(list) = self.edge_map.get(&eid.value()).map(|e| e.value().clone()) else {
            return ReadStat::NotFound;
        };
        match list.visible_version(&self.edge_mvcc, trx_id, bt, read_only) {
            ReadStat::Success(edge) if edge.exists => ReadStat::Success(edge.label),
            ReadStat::Success(_) | ReadStat::NotFound => ReadStat::NotFound,
            ReadStat::Abort => ReadStat::Abort,
        }
    }

    pub fn get_connected_vertices(
        &self,
        tid: usize,
        vid: Vid,
        label: i32,
        direction: Direction,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<Vid>> {
        let Some(vertex) = self.vertex_map.get(&vid.0).map(|v| v.value().clone()) else {
            return ReadStat::NotFound;
        };
        self.record_read(trx_id, read_only, RwKey::VertexExists(vid.0));
        vertex.topo.read_connected_vertices(
            &self.topo_stores(tid),
            direction,
            label,
            trx_id,
            bt,
            read_only,
        )
    }

    pub fn get_connected_edges(
        &self,
        tid: usize,
        vid: Vid,
        label: i32,
        direction: Direction,
        trx_id: u64,
        bt: u64,
        read_only: bool,
    ) -> ReadStat<Vec<Eid>> {
        let Some(vertex) = self.vertex_map.get(&vid.0).map(|v| v.value().clone()) else {
            return ReadStat::NotFound;
        };
        self.record_read(trx_id, read_only, RwKey::VertexExists(vid.0));
        vertex.topo.read_connected_edges(
            &self.topo_stores(tid),
            direction,
            label,
            trx_id,
            bt,
            read_only,
        )
    }

    /// All locally stored vertices visible to the transaction.
    pub fn get_all_vertices(&self, trx_id: u64, bt: u64, read_only: bool) -> Vec<Vid> {
        let mut out = Vec::new();
        for entry in self.vertex_map.iter() {
            if let ReadStat::Success(true) =
                entry
                    .value()
                    .mvcc
                    .visible_version(&self.vertex_mvcc, trx_id, bt, read_only)
            {
                out.push(Vid(*entry.key()));
            }
        }
        out.sort_unstable();
        out
    }

    /// All locally registered (out-side) edges visible to the transaction.
    pub fn get_all_edges(&self, trx_id: u64, bt: u64, read_only: bool) -> Vec<Eid> {
        let mut out = Vec::new();
        for entry in self.edge_map.iter() {
            if let ReadStat::Success(edge) =
                entry
                    .value()
                    .visible_version(&self.edge_mvcc, trx_id, bt, read_only)
            {
                if edge.exists {
                    out.push(Eid::from_value(*entry.key()));
                }
            }
        }
        out.sort_unstable();
        out
    }

    // ---- writes ------------------------------------------------------

    fn assign_vid(&self) -> Vid {
        let local = self.next_local_vid.fetch_add(1, Ordering::SeqCst);
        Vid(local * self.worker_count as u32 + self.worker_rank as u32)
    }

    /// Creates a vertex with an uncommitted existence version. The fresh vid
    /// is globally unique so this cannot conflict.
    pub fn add_vertex(&self, tid: usize, label: LabelId, trx_id: u64, bt: u64) -> Vid {
        let vid = self.assign_vid();
        let item = Arc::new(VertexItem {
            label,
            vp_rows: Arc::new(PropertyRowList::new()),
            topo: TopologyRowList::new(vid),
            mvcc: MvccList::new(),
        });
        item.mvcc
            .append_version(&self.vertex_mvcc, tid, trx_id, bt, true);
        self.vertex_map.insert(vid.0, item.clone());
        self.record_process(trx_id, ProcessItem::AddVertex(item));
        self.record_write(trx_id, RwKey::VertexExists(vid.0));
        debug!(trx_id, vid = vid.0, "added vertex");
        vid
    }

    pub fn drop_vertex(&self, tid: usize, vid: Vid, trx_id: u64, bt: u64) -> WriteStat {
        if self.trx_aborted(trx_id) {
            return WriteStat::Conflict;
        }
        let Some(vertex) = self.vertex_map.get(&vid.0).map(|v| v.value().clone()) else {
            return WriteStat::NotFound;
        };
        match vertex
            .mvcc
            .append_version(&self.vertex_mvcc, tid, trx_id, bt, false)
        {
            AppendOutcome::Conflict => WriteStat::Conflict,
            _ => {
                self.record_process(trx_id, ProcessItem::DropVertex(vertex));
                self.record_write(trx_id, RwKey::VertexExists(vid.0));
                WriteStat::Success
            }
        }
    }

    /// Out-side edge insertion on the worker owning `eid.out_v`: registers
    /// (or revives) the authoritative edge list and its topology header.
    pub fn add_edge_out(
        &self,
        tid: usize,
        eid: Eid,
        label: LabelId,
        trx_id: u64,
        bt: u64,
    ) -> WriteStat {
        if self.trx_aborted(trx_id) {
            return WriteStat::Conflict;
        }
        let Some(vertex) = self.vertex_map.get(&eid.out_v.0).map(|v| v.value().clone()) else {
            return WriteStat::NotFound;
        };
        let value = EdgeMvcc {
            exists: true,
            label,
            ep_rows: Some(Arc::new(PropertyRowList::new())),
        };
        if let Some(list) = self.edge_map.get(&eid.value()).map(|e| e.value().clone()) {
            match list.append_version(&self.edge_mvcc, tid, trx_id, bt, value) {
                AppendOutcome::Conflict => return WriteStat::Conflict,
                _ => {
                    self.record_process(trx_id, ProcessItem::EdgeVersion(list));
                }
            }
        } else {
            let list = Arc::new(MvccList::new());
            list.append_version(&self.edge_mvcc, tid, trx_id, bt, value);
            self.edge_map.insert(eid.value(), list.clone());
            vertex.topo.insert_cell(
                &self.topo_stores(tid),
                true,
                label,
                eid.in_v,
                list.clone(),
            );
            self.record_process(trx_id, ProcessItem::EdgeVersion(list));
        }
        self.record_write(trx_id, RwKey::EdgeExists(eid.value()));
        WriteStat::Success
    }

    /// In-side mirror insertion on the worker owning `eid.in_v`.
    pub fn add_edge_in(
        &self,
        tid: usize,
        eid: Eid,
        label: LabelId,
        trx_id: u64,
        bt: u64,
    ) -> WriteStat {
        if self.trx_aborted(trx_id) {
            return WriteStat::Conflict;
        }
        let Some(vertex) = self.vertex_map.get(&eid.in_v.0).map(|v| v.value().clone()) else {
            return WriteStat::NotFound;
        };
        let value = EdgeMvcc {
            exists: true,
            label,
            ep_rows: None,
        };
        if let Some(list) = vertex
            .topo
            .find_cell_list(&self.topo_stores(tid), false, eid.out_v)
        {
            match list.append_version(&self.edge_mvcc, tid, trx_id, bt, value) {
                AppendOutcome::Conflict => return WriteStat::Conflict,
                _ => self.record_process(trx_id, ProcessItem::EdgeVersion(list)),
            }
        } else {
            let list = Arc::new(MvccList::new());
            list.append_version(&self.edge_mvcc, tid, trx_id, bt, value);
            vertex.topo.insert_cell(
                &self.topo_stores(tid),
                false,
                label,
                eid.out_v,
                list.clone(),
            );
            self.record_process(trx_id, ProcessItem::EdgeVersion(list));
        }
        WriteStat::Success
    }

    /// Logical edge delete for every side this worker stores.
    pub fn drop_edge_local(&self, tid: usize, eid: Eid, trx_id: u64, bt: u64) -> WriteStat {
        if self.trx_aborted(trx_id) {
            return WriteStat::Conflict;
        }
        let mut any = false;

        if eid.owner(self.worker_count) == self.worker_rank {
            let Some(list) = self.edge_map.get(&eid.value()).map(|e| e.value().clone()) else {
                return WriteStat::NotFound;
            };
            match self.append_edge_tombstone(tid, &list, trx_id, bt) {
                WriteStat::Conflict => return WriteStat::Conflict,
                WriteStat::Success => any = true,
                WriteStat::NotFound => {}
            }
            self.record_write(trx_id, RwKey::EdgeExists(eid.value()));
        }

        if eid.in_v.owner(self.worker_count) == self.worker_rank {
            if let Some(vertex) = self.vertex_map.get(&eid.in_v.0).map(|v| v.value().clone()) {
                if let Some(list) =
                    vertex
                        .topo
                        .find_cell_list(&self.topo_stores(tid), false, eid.out_v)
                {
                    match self.append_edge_tombstone(tid, &list, trx_id, bt) {
                        WriteStat::Conflict => return WriteStat::Conflict,
                        WriteStat::Success => any = true,
                        WriteStat::NotFound => {}
                    }
                }
            }
        }

        if any {
            WriteStat::Success
        } else {
            WriteStat::NotFound
        }
    }

    fn append_edge_tombstone(
        &self,
        tid: usize,
        list: &Arc<MvccList<EdgeMvcc>>,
        trx_id: u64,
        bt: u64,
    ) -> WriteStat {
        // preserve label and property rows so an abort restores nothing
        let current = match list.visible_version(&self.edge_mvcc, trx_id, bt, false) {
            ReadStat::Success(edge) => edge,
            ReadStat::NotFound => return WriteStat::NotFound,
            ReadStat::Abort => return WriteStat::Conflict,
        };
        let value = EdgeMvcc {
            exists: false,
            ..current
        };
        match list.append_version(&self.edge_mvcc, tid, trx_id, bt, value) {
            AppendOutcome::Conflict => WriteStat::Conflict,
            _ => {
                self.record_process(trx_id, ProcessItem::EdgeVersion(list.clone()));
                WriteStat::Success
            }
        }
    }

    pub fn modify_vp(
        &self,
        tid: usize,
        pid: Vpid,
        value: &Value,
        trx_id: u64,
        bt: u64,
    ) -> WriteStat {
        if self.trx_aborted(trx_id) {
            return WriteStat::Conflict;
        }
        let Some(vertex) = self.vertex_map.get(&pid.vid().0).map(|v| v.value().clone()) else {
            return WriteStat::NotFound;
        };
        let (_, stat) = vertex
            .vp_rows
            .modify(&self.vp_stores(tid), pid.0, value, trx_id, bt);
        if stat.ok() {
            self.record_process(
                trx_id,
                ProcessItem::VertexProp {
                    rows: vertex.vp_rows.clone(),
                    pid: pid.0,
                },
            );
            self.record_write(trx_id, RwKey::VertexProp(pid.0));
        }
        stat
    }

    pub fn drop_vp(&self, tid: usize, pid: Vpid, trx_id: u64, bt: u64) -> WriteStat {
        if self.trx_aborted(trx_id) {
            return WriteStat::Conflict;
        }
        let Some(vertex) = self.vertex_map.get(&pid.vid().0).map(|v| v.value().clone()) else {
            return WriteStat::NotFound;
        };
        let stat = vertex
            .vp_rows
            .drop_property(&self.vp_stores(tid), pid.0, trx_id, bt);
        if stat.ok() {
            self.record_process(
                trx_id,
                ProcessItem::VertexProp {
                    rows: vertex.vp_rows.clone(),
                    pid: pid.0,
                },
            );
            self.record_write(trx_id, RwKey::VertexProp(pid.0));
        }
        stat
    }

    pub fn modify_ep(
        &self,
        tid: usize,
        pid: Epid,
        value: &Value,
        trx_id: u64,
        bt: u64,
    ) -> WriteStat {
        if self.trx_aborted(trx_id) {
            return WriteStat::Conflict;
        }
        let Some(rows) = self.visible_ep_rows(pid.eid(), trx_id, bt) else {
            return WriteStat::NotFound;
        };
        let (_, stat) = rows.modify(&self.ep_stores(tid), pid.0, value, trx_id, bt);
        if stat.ok() {
            self.record_process(trx_id, ProcessItem::EdgeProp { rows, pid: pid.0 });
            self.record_write(trx_id, RwKey::EdgeProp(pid.0));
        }
        stat
    }

    pub fn drop_ep(&self, tid: usize, pid: Epid, trx_id: u64, bt: u64) -> WriteStat {
        if self.trx_aborted(trx_id) {
            return WriteStat::Conflict;
        }
        let Some(rows) = self.visible_ep_rows(pid.eid(), trx_id, bt) else {
            return WriteStat::NotFound;
        };
        let stat = rows.drop_property(&self.ep_stores(tid), pid.0, trx_id, bt);
        if stat.ok() {
            self.record_process(trx_id, ProcessItem::EdgeProp { rows, pid: pid.0 });
            self.record_write(trx_id, RwKey::EdgeProp(pid.0));
        }
        stat
    }

    fn visible_ep_rows(
        &self,
        eid: Eid,
        trx_id: u64,
        bt: u64,
    ) -> Option<Arc<PropertyRowList>> {
        let list = self.edge_map.get(&eid.value()).map(|e| e.value().clone())?;
        match list.visible_version(&self.edge_mvcc, trx_id, bt, false) {
            ReadStat::Success(edge) if edge.exists => edge.ep_rows,
            _ => None,
        }
    }

    // ---- transaction finalization ------------------------------------

    /// Applies commit time `ct` to every version this transaction appended
    /// locally, publishes its write set for validators, and drops the
    /// transaction record. Idempotent.
    pub fn commit(&self, tid: usize, trx_id: u64, ct: u64) {
        let Some((_, record)) = self.trx_map.remove(&trx_id) else {
            return;
        };
        for item in record.process_list.lock().iter() {
            match item {
                ProcessItem::AddVertex(v) | ProcessItem::DropVertex(v) => {
                    v.mvcc.commit_version(&self.vertex_mvcc, trx_id, ct);
                }
                ProcessItem::VertexProp { rows, pid } => {
                    rows.commit(&self.vp_stores(tid), *pid, trx_id, ct);
                }
                ProcessItem::EdgeProp { rows, pid } => {
                    rows.commit(&self.ep_stores(tid), *pid, trx_id, ct);
                }
                ProcessItem::EdgeVersion(list) => {
                    list.commit_version(&self.edge_mvcc, trx_id, ct);
                }
            }
        }
        let writes = std::mem::take(&mut *record.write_set.lock());
        if !writes.is_empty() {
            self.committed_writes.insert(trx_id, Arc::new(writes));
        }
        debug!(trx_id, ct, "storage commit applied");
    }

    /// Unlinks every uncommitted version this transaction appended locally
    /// and returns payload storage to the free lists. Idempotent.
    pub fn abort(&self, tid: usize, trx_id: u64) {
        self.aborted_trx.insert(trx_id, ());
        let Some((_, record)) = self.trx_map.remove(&trx_id) else {
            return;
        };
        for item in record.process_list.lock().iter() {
            match item {
                ProcessItem::AddVertex(v) | ProcessItem::DropVertex(v) => {
                    v.mvcc.abort_version(&self.vertex_mvcc, tid, trx_id);
                }
                ProcessItem::VertexProp { rows, pid } => {
                    rows.abort(&self.vp_stores(tid), *pid, trx_id);
                }
                ProcessItem::EdgeProp { rows, pid } => {
                    rows.abort(&self.ep_stores(tid), *pid, trx_id);
                }
                ProcessItem::EdgeVersion(list) => {
                    list.abort_version(&self.edge_mvcc, tid, trx_id);
                }
            }
        }
        debug!(trx_id, "storage abort applied");
    }

    /// This transaction's locally recorded read/write sets.
    pub fn rw_sets(&self, trx_id: u64) -> (HashSet<RwKey>, HashSet<RwKey>) {
        match self.trx_map.get(&trx_id) {
            Some(record) => (
                record.read_set.lock().clone(),
                record.write_set.lock().clone(),
            ),
            None => (HashSet::new(), HashSet::new()),
        }
    }

    /// Published write set of a committed transaction.
    pub fn committed_write_set(&self, trx_id: u64) -> Option<Arc<HashSet<RwKey>>> {
        self.committed_writes.get(&trx_id).map(|e| e.value().clone())
    }

    /// Drops committed write sets no longer needed by any validator.
    pub fn sweep_committed_writes(&self, live: impl Fn(u64) -> bool) {
        self.committed_writes.retain(|trx_id, _| live(*trx_id));
    }

    pub fn pool_usage(&self) -> Vec<(&'static str, mem_pool::PoolUsage)> {
        vec![
            ("vp_rows", self.vp_rows.usage()),
            ("ep_rows", self.ep_rows.usage()),
            ("topo_rows", self.topo_rows.usage()),
            ("prop_mvcc", self.prop_mvcc.usage()),
            ("vertex_mvcc", self.vertex_mvcc.usage()),
            ("edge_mvcc", self.edge_mvcc.usage()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TRX_TAG;
    use crate::schema::SchemaIndex;

    fn storage() -> DataStorage {
        let cfg = Config {
            num_workers: 1,
            num_expert_threads: 2,
            row_pool_size: 1 << 13,
            mvcc_pool_size: 1 << 13,
            vp_store_cells: 1 << 13,
            ep_store_cells: 1 << 13,
            ..Config::default()
        };
        DataStorage::new(&cfg, 0, Arc::new(SchemaIndex::default()))
    }

    fn trx(n: u64) -> u64 {
        TRX_TAG | (n << 8)
    }

    #[test]
    fn property_version_interleaving() {
        // the classic interleaving: T0 modifies, T1 conflicts until T0
        // commits, readers pin their begin time
        let s = storage();
        s.load_vertex(0, Vid(6), 1, &[(1, Value::Str("peter".into()))]);
        let pid = Vpid::new(Vid(6), 1);

        let (t0, t1, t2, t3) = (trx(1), trx(2), trx(3), trx(4));
        let (bt0, bt1, bt2, bt3) = (1, 2, 4, 5);

        assert!(s.modify_vp(0, pid, &Value::Str("N0".into()), t0, bt0).ok());
        assert_eq!(
            s.get_vp(0, pid, t1, bt1, true),
            ReadStat::Success(Value::Str("peter".into()))
        );
        assert_eq!(
            s.get_vp(0, pid, t0, bt0, false),
            ReadStat::Success(Value::Str("N0".into()))
        );
        assert_eq!(
            s.modify_vp(0, pid, &Value::Str("N1".into()), t1, bt1),
            WriteStat::Conflict
        );

        s.commit(0, t0, 3);
        assert!(s.modify_vp(0, pid, &Value::Str("N1".into()), t1, bt1).ok());
        assert_eq!(
            s.get_vp(0, pid, t1, bt1, false),
            ReadStat::Success(Value::Str("N1".into()))
        );
        assert_eq!(
            s.get_vp(0, pid, t2, bt2, true),
            ReadStat::Success(Value::Str("N0".into()))
        );

        s.abort(0, t1);
        assert!(s.modify_vp(0, pid, &Value::Str("N2".into()), t2, bt2).ok());
        assert_eq!(
            s.get_vp(0, pid, t3, bt3, true),
            ReadStat::Success(Value::Str("N0".into()))
        );
        s.commit(0, t2, 6);
        assert_eq!(
            s.get_vp(0, pid, trx(5), 7, true),
            ReadStat::Success(Value::Str("N2".into()))
        );
    }

    #[test]
    fn add_vertex_visibility_follows_commit_time() {
        let s = storage();
        let t = trx(1);
        let vid = s.add_vertex(0, 2, t, 100);
        // owner sees it, strangers do not
        assert_eq!(s.vertex_visible(vid, t, 100, false), ReadStat::Success(true));
        assert_eq!(s.vertex_visible(vid, trx(2), 99, true), ReadStat::NotFound);
        s.commit(0, t, 101);
        assert_eq!(s.vertex_visible(vid, trx(3), 102, true), ReadStat::Success(true));
        assert_eq!(s.vertex_visible(vid, trx(4), 99, true), ReadStat::NotFound);
    }

    #[test]
    fn edge_lifecycle_with_both_sides_local() {
        let s = storage();
        s.load_vertex(0, Vid(1), 1, &[]);
        s.load_vertex(0, Vid(2), 1, &[]);
        let eid = Eid::new(Vid(1), Vid(2));
        let t = trx(1);

        assert!(s.add_edge_out(0, eid, 3, t, 10).ok());
        assert!(s.add_edge_in(0, eid, 3, t, 10).ok());
        s.commit(0, t, 11);

        let out = match s.get_connected_vertices(0, Vid(1), -1, Direction::Out, trx(2), 12, true) {
            ReadStat::Success(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(out, vec![Vid(2)]);
        let inbound = match s.get_connected_vertices(0, Vid(2), -1, Direction::In, trx(2), 12, true)
        {
            ReadStat::Success(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(inbound, vec![Vid(1)]);

        // drop hides both sides after commit
        let t2 = trx(3);
        assert!(s.drop_edge_local(0, eid, t2, 20).ok());
        s.commit(0, t2, 21);
        assert!(s.get_all_edges(trx(4), 22, true).is_empty());
        let inbound = match s.get_connected_vertices(0, Vid(2), -1, Direction::In, trx(4), 22, true)
        {
            ReadStat::Success(v) => v,
            other => panic!("unexpected {other:?}"),
        };
        assert!(inbound.is_empty());
    }

    #[test]
    fn abort_restores_free_cells() {
        let s = storage();
        s.load_vertex(0, Vid(1), 1, &[(1, Value::Str("x".into()))]);
        let (gets_before, frees_before) = s.vp_store.usage();

        let t = trx(1);
        assert!(s
            .modify_vp(0, Vpid::new(Vid(1), 1), &Value::Str("tmp".into()), t, 10)
            .ok());
        s.abort(0, t);
        let (gets_after, frees_after) = s.vp_store.usage();
        assert_eq!(gets_after - gets_before, frees_after - frees_before);
    }
}
