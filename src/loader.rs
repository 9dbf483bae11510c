use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::schema::SchemaIndex;
use crate::storage::DataStorage;
use crate::types::{Eid, LabelId, Value, Vid};

#[derive(Debug, Clone, Default)]
pub struct RawVertex {
    pub vid: Vid,
    pub label: LabelId,
    pub in_nbs: Vec<Vid>,
    pub out_nbs: Vec<Vid>,
    pub props: Vec<(LabelId, Value)>,
}

#[derive(Debug, Clone, Default)]
pub struct RawEdge {
    pub label: LabelId,
    pub props: Vec<(LabelId, Value)>,
}

/// An unpartitioned graph image, either parsed from the tab-delimited text
/// layout or built programmatically. Workers fill their partitions from it.
#[derive(Debug, Clone, Default)]
pub struct RawGraph {
    pub vertices: Vec<RawVertex>,
    pub edges: HashMap<u64, RawEdge>,
    pub schema: SchemaIndex,
}

impl RawGraph {
    /// Parses the text layout:
    /// - vertices: `vid \t label \t in_nbs(space-sep) \t out_nbs`
    /// - vertex properties: `vid \t label \t kid:value,kid:value,...`
    /// - edge properties: `out_v \t in_v \t label \t kid:value,...`
    pub fn from_text(
        vertex_text: &str,
        vp_text: &str,
        ep_text: &str,
        schema: SchemaIndex,
    ) -> Result<Self> {
        let mut graph = RawGraph {
            schema,
            ..Default::default()
        };
        let mut by_vid: HashMap<u32, usize> = HashMap::new();

        for line in non_empty(vertex_text) {
            let mut cols = line.split('\t');
            let vid = Vid(parse_col(&mut cols, line)?);
            let label = parse_col(&mut cols, line)?;
            let in_nbs = parse_vid_list(cols.next().unwrap_or(""));
            let out_nbs = parse_vid_list(cols.next().unwrap_or(""));
            by_vid.insert(vid.0, graph.vertices.len());
            graph.vertices.push(RawVertex {
                vid,
                label,
                in_nbs,
                out_nbs,
                props: Vec::new(),
            });
        }

        for line in non_empty(vp_text) {
            let mut cols = line.split('\t');
            let vid: u32 = parse_col(&mut cols, line)?;
            let _label: LabelId = parse_col(&mut cols, line)?;
            let idx = *by_vid
                .get(&vid)
                .ok_or_else(|| GraphError::Parse(format!("vp for unknown vertex: {line}")))?;
            graph.vertices[idx].props = parse_props(cols.next().unwrap_or(""))?;
        }

        for line in non_empty(ep_text) {
            let mut cols = line.split('\t');
            let out_v = Vid(parse_col(&mut cols, line)?);
            let in_v = Vid(parse_col(&mut cols, line)?);
            let label: LabelId = parse_col(&mut cols, line)?;
            let props = parse_props(cols.next().unwrap_or(""))?;
            graph
                .edges
                .insert(Eid::new(out_v, in_v).value(), RawEdge { label, props });
        }

        Ok(graph)
    }

    pub fn edge(&self, eid: Eid) -> Option<&RawEdge> {
        self.edges.get(&eid.value())
    }

    /// The six-vertex "modern" graph used across the test suite.
    pub fn modern() -> Self {
        let mut schema = SchemaIndex::default();
        schema.vertex_labels.insert("person", 1);
        schema.vertex_labels.insert("software", 2);
        schema.edge_labels.insert("knows", 1);
        schema.edge_labels.insert("created", 2);
        schema.vertex_prop_keys.insert("name", 1);
        schema.vertex_prop_keys.insert("age", 2);
        schema.vertex_prop_keys.insert("lang", 3);
        schema.edge_prop_keys.insert("weight", 1);

        let mut graph = RawGraph {
            schema,
            ..Default::default()
        };

        let person = 1;
        let software = 2;
        let (name, age, lang) = (1, 2, 3);
        let mut vertex = |vid: u32, label: LabelId, props: Vec<(LabelId, Value)>| {
            graph.vertices.push(RawVertex {
                vid: Vid(vid),
                label,
                props,
                ..Default::default()
            });
        };
        vertex(1, person, vec![(name, "marko".into()), (age, Value::Int(29))]);
        vertex(2, person, vec![(name, "vadas".into()), (age, Value::Int(27))]);
        vertex(3, software, vec![(name, "lop".into()), (lang, "java".into())]);
        vertex(4, person, vec![(name, "josh".into()), (age, Value::Int(32))]);
        vertex(5, software, vec![(name, "ripple".into()), (lang, "java".into())]);
        vertex(6, person, vec![(name, "peter".into()), (age, Value::Int(35))]);

        let knows = 1;
        let created = 2;
        let weight = 1;
        let edges = [
            (1, 2, knows, 0.5),
            (1, 4, knows, 1.0),
            (1, 3, created, 0.4),
            (4, 5, created, 1.0),
            (4, 3, created, 0.4),
            (6, 3, created, 0.2),
        ];
        for (out_v, in_v, label, w) in edges {
            let eid = Eid::new(Vid(out_v), Vid(in_v));
            graph.edges.insert(
                eid.value(),
                RawEdge {
                    label,
                    props: vec![(weight, Value::Double(w))],
                },
            );
            graph.vertices[out_v as usize - 1].out_nbs.push(Vid(in_v));
            graph.vertices[in_v as usize - 1].in_nbs.push(Vid(out_v));
        }
        graph
    }
}

/// Fills one worker's partition: vertices it owns, plus both topology sides
/// for edges incident to owned vertices.
pub fn fill_partition(storage: &DataStorage, graph: &RawGraph, tid: usize) {
    let rank = storage.worker_rank();
    let workers = storage.worker_count();

    for v in &graph.vertices {
        if v.vid.owner(workers) != rank {
            continue;
        }
        storage.load_vertex(tid, v.vid, v.label, &v.props);
    }
    for v in &graph.vertices {
        if v.vid.owner(workers) != rank {
            continue;
        }
        for &out_nb in &v.out_nbs {
            let eid = Eid::new(v.vid, out_nb);
            if let Some(edge) = graph.edge(eid) {
                storage.load_edge_side(tid, eid, edge.label, true, &edge.props);
            }
        }
        for &in_nb in &v.in_nbs {
            let eid = Eid::new(in_nb, v.vid);
            if let Some(edge) = graph.edge(eid) {
                storage.load_edge_side(tid, eid, edge.label, false, &edge.props);
            }
        }
    }
}

fn non_empty(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn parse_col<'a, T: std::str::FromStr>(
    cols: &mut impl Iterator<Item = &'a str>,
    line: &str,
) -> Result<T> {
    cols.next()
        .and_then(|c| c.trim().parse().ok())
        .ok_or_else(|| GraphError::Parse(format!("bad graph line: {line}")))
}

fn parse_vid_list(col: &str) -> Vec<Vid> {
    col.split_whitespace()
        .filter_map(|v| v.parse().ok().map(Vid))
        .collect()
}

fn parse_props(col: &str) -> Result<Vec<(LabelId, Value)>> {
    let mut out = Vec::new();
    for pair in col.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (kid, value) = pair
            .split_once(':')
            .ok_or_else(|| GraphError::Parse(format!("bad property pair: {pair}")))?;
        let kid: LabelId = kid
            .trim()
            .parse()
            .map_err(|_| GraphError::Parse(format!("bad property key: {pair}")))?;
        out.push((kid, Value::from_literal(value)?));
    }
    Ok(out)
}

/// Convenience for single-process tests: a storage per worker, all filled
/// from the same image.
pub fn build_partitions(
    cfg: &crate::config::Config,
    graph: &RawGraph,
) -> Vec<Arc<DataStorage>> {
    let schema = Arc::new(graph.schema.clone());
    (0..cfg.num_workers)
        .map(|rank| {
            let storage = Arc::new(DataStorage::new(cfg, rank, schema.clone()));
            fill_partition(&storage, graph, cfg.num_expert_threads);
            storage
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::coordinator::TRX_TAG;

    #[test]
    fn modern_graph_shape() {
        let graph = RawGraph::modern();
        assert_eq!(graph.vertices.len(), 6);
        assert_eq!(graph.edges.len(), 6);
        assert_eq!(graph.schema.vertex_prop_keys.id("name"), Some(1));
    }

    #[test]
    fn partitions_cover_all_vertices() {
        let cfg = Config {
            num_workers: 2,
            num_expert_threads: 2,
            row_pool_size: 1 << 13,
            mvcc_pool_size: 1 << 13,
            vp_store_cells: 1 << 13,
            ep_store_cells: 1 << 13,
            ..Config::default()
        };
        let parts = build_partitions(&cfg, &RawGraph::modern());
        let total: usize = parts
            .iter()
            .map(|s| s.get_all_vertices(TRX_TAG, 1, true).len())
            .sum();
        assert_eq!(total, 6);
        let edges: usize = parts
            .iter()
            .map(|s| s.get_all_edges(TRX_TAG, 1, true).len())
            .sum();
        assert_eq!(edges, 6);
    }

    #[test]
    fn text_round_trip() {
        let mut schema = SchemaIndex::default();
        schema.vertex_labels.insert("person", 1);
        let graph = RawGraph::from_text(
            "1\t1\t\t2\n2\t1\t1\t\n",
            "1\t1\t1:\"ann\"\n2\t1\t1:\"bob\"\n",
            "1\t2\t1\t1:0.5\n",
            schema,
        )
        .unwrap();
        assert_eq!(graph.vertices.len(), 2);
        assert_eq!(graph.vertices[0].out_nbs, vec![Vid(2)]);
        assert_eq!(graph.edge(Eid::new(Vid(1), Vid(2))).unwrap().label, 1);
    }
}
