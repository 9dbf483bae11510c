use std::collections::{BTreeMap, HashSet};

use dashmap::DashMap;
use tracing::info;

use crate::error::ReadStat;
use crate::predicate::{Predicate, PredicateKind};
use crate::storage::DataStorage;
use crate::types::{ElementKind, Epid, LabelId, Value, Vid, Vpid, LABEL_PKEY};

/// One property's (or the label pseudo-property's) value index over the
/// local partition. Built by `BuildIndex`; not maintained under concurrent
/// writes, matching the storage contract.
#[derive(Debug, Default)]
struct PropIndex {
    values: BTreeMap<Value, HashSet<u64>>,
    total: u64,
}

impl PropIndex {
    fn insert(&mut self, value: Value, id: u64) {
        self.values.entry(value).or_default().insert(id);
        self.total += 1;
    }

    fn count(&self, pred: &Predicate) -> u64 {
        match pred.kind {
            PredicateKind::Eq => self
                .values
                .get(&pred.params[0])
                .map(|s| s.len() as u64)
                .unwrap_or(0),
            PredicateKind::Within => pred
                .params
                .iter()
                .map(|p| self.values.get(p).map(|s| s.len() as u64).unwrap_or(0))
                .sum(),
            PredicateKind::Any => self.total,
            _ => self
                .values
                .iter()
                .filter(|(v, _)| pred.eval(v))
                .map(|(_, s)| s.len() as u64)
                .sum(),
        }
    }

    fn lookup(&self, pred: &Predicate) -> HashSet<u64> {
        match pred.kind {
            PredicateKind::Eq => self.values.get(&pred.params[0]).cloned().unwrap_or_default(),
            PredicateKind::Within => {
                let mut out = HashSet::new();
                for p in &pred.params {
                    if let Some(ids) = self.values.get(p) {
                        out.extend(ids.iter().copied());
                    }
                }
                out
            }
            _ => {
                let mut out = HashSet::new();
                for (v, ids) in &self.values {
                    if pred.eval(v) {
                        out.extend(ids.iter().copied());
                    }
                }
                out
            }
        }
    }
}

/// Per-worker secondary indexes over property values, consulted by the
/// planner's push-down pass and the entry operator.
#[derive(Debug, Default)]
pub struct IndexStore {
    vertex: DashMap<LabelId, PropIndex>,
    edge: DashMap<LabelId, PropIndex>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: ElementKind) -> &DashMap<LabelId, PropIndex> {
        match kind {
            ElementKind::Vertex => &self.vertex,
            ElementKind::Edge => &self.edge,
        }
    }

    /// Builds (or rebuilds) the index for `pkey` from the currently visible
    /// data. `pkey == 0` indexes the element label.
    pub fn build(
        &self,
        storage: &DataStorage,
        tid: usize,
        kind: ElementKind,
        pkey: LabelId,
        trx_id: u64,
        bt: u64,
    ) {
        let mut index = PropIndex::default();
        match kind {
            ElementKind::Vertex => {
                for vid in storage.get_all_vertices(trx_id, bt, true) {
                    if pkey as i32 == LABEL_PKEY {
                        if let Some(label) = storage.get_vertex_label(vid) {
                            index.insert(Value::Int(label as i64), vid.0 as u64);
                        }
                    } else if let ReadStat::Success(v) =
                        storage.get_vp(tid, Vpid::new(vid, pkey), trx_id, bt, true)
                    {
                        index.insert(v, vid.0 as u64);
                    }
                }
            }
            ElementKind::Edge => {
                for eid in storage.get_all_edges(trx_id, bt, true) {
                    if pkey as i32 == LABEL_PKEY {
                        if let ReadStat::Success(label) =
                            storage.get_edge_label(eid, trx_id, bt, true)
                        {
                            index.insert(Value::Int(label as i64), eid.value());
                        }
                    } else if let ReadStat::Success(v) =
                        storage.get_ep(tid, Epid::new(eid, pkey), trx_id, bt, true)
                    {
                        index.insert(v, eid.value());
                    }
                }
            }
        }
        info!(
            ?kind,
            pkey,
            entries = index.total,
            "secondary index built"
        );
        self.table(kind).insert(pkey, index);
    }

    pub fn is_enabled(&self, kind: ElementKind, pkey: LabelId) -> bool {
        self.table(kind).contains_key(&pkey)
    }

    /// Estimated matching cardinality when the `(kind, pkey)` index exists.
    pub fn count(&self, kind: ElementKind, pkey: LabelId, pred: &Predicate) -> Option<u64> {
        self.table(kind).get(&pkey).map(|idx| idx.count(pred))
    }

    /// Matching element ids (vids, or packed eids) when indexed.
    pub fn lookup(
        &self,
        kind: ElementKind,
        pkey: LabelId,
        pred: &Predicate,
    ) -> Option<HashSet<u64>> {
        self.table(kind).get(&pkey).map(|idx| idx.lookup(pred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::coordinator::TRX_TAG;
    use crate::loader::{build_partitions, RawGraph};

    #[test]
    fn vertex_name_index_lookup() {
        let cfg = Config {
            num_expert_threads: 2,
            row_pool_size: 1 << 13,
            mvcc_pool_size: 1 << 13,
            vp_store_cells: 1 << 13,
            ep_store_cells: 1 << 13,
            ..Config::default()
        };
        let storage = build_partitions(&cfg, &RawGraph::modern()).remove(0);
        let index = IndexStore::new();
        index.build(&storage, 0, ElementKind::Vertex, 1, TRX_TAG, 1);

        assert!(index.is_enabled(ElementKind::Vertex, 1));
        let pred = Predicate::new(PredicateKind::Eq, vec!["marko".into()]);
        assert_eq!(index.count(ElementKind::Vertex, 1, &pred), Some(1));
        let ids = index.lookup(ElementKind::Vertex, 1, &pred).unwrap();
        assert_eq!(ids, HashSet::from([Vid(1).0 as u64]));
    }

    #[test]
    fn label_pseudo_index() {
        let cfg = Config {
            num_expert_threads: 2,
            row_pool_size: 1 << 13,
            mvcc_pool_size: 1 << 13,
            vp_store_cells: 1 << 13,
            ep_store_cells: 1 << 13,
            ..Config::default()
        };
        let storage = build_partitions(&cfg, &RawGraph::modern()).remove(0);
        let index = IndexStore::new();
        index.build(&storage, 0, ElementKind::Vertex, 0, TRX_TAG, 1);

        let person = Predicate::new(PredicateKind::Within, vec![Value::Int(1)]);
        assert_eq!(index.count(ElementKind::Vertex, 0, &person), Some(4));
    }
}
