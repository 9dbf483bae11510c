use std::collections::HashSet;

use crate::error::ReadStat;
use crate::experts::WorkerContext;
use crate::message::{History, Message, Payload};
use crate::plan::parser::code_pred;
use crate::predicate::Predicate;
use crate::types::{Eid, ElementKind, Value, Vid};

/// Entry operator: seeds the chain with this worker's slice of `g.V()` /
/// `g.E()`, via pushed-down index predicates when available and a full scan
/// otherwise. With spliced inputs, only locally owned ids survive.
pub fn process(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let kind = if op.param_int(0) == 1 {
        ElementKind::Edge
    } else {
        ElementKind::Vertex
    };
    let with_input = op.param_int(1) == 1;
    let pred_count = op.param_int(2).max(0) as usize;
    let trx_id = plan.trx_id;
    let bt = plan.bt;
    let read_only = plan.read_only();
    let workers = ctx.config.num_workers;

    let mut values: Vec<Value> = Vec::new();

    if with_input {
        for v in &op.params[3 + 3 * pred_count..] {
            for item in v.as_list() {
                let Ok(id) = item.as_u64() else { continue };
                let local = match kind {
                    ElementKind::Vertex => Vid(id as u32).owner(workers) == ctx.rank,
                    ElementKind::Edge => Eid::from_value(id).owner(workers) == ctx.rank,
                };
                if local {
                    values.push(Value::Int(id as i64));
                }
            }
        }
    } else if pred_count > 0 {
        // intersect the pushed-down index lookups
        let mut candidates: Option<HashSet<u64>> = None;
        for group in 0..pred_count {
            let at = 3 + 3 * group;
            let pkey = op.param_int(at).max(0) as u16;
            let pred = Predicate::new(code_pred(op.param_int(at + 1)), op.params[at + 2].as_list());
            let ids = ctx
                .index_store
                .lookup(kind, pkey, &pred)
                .unwrap_or_default();
            candidates = Some(match candidates {
                None => ids,
                Some(prev) => prev.intersection(&ids).copied().collect(),
            });
        }
        // the index is frozen at build time; re-check MVCC visibility
        for id in candidates.unwrap_or_default() {
            let visible = match kind {
                ElementKind::Vertex => matches!(
                    ctx.storage.vertex_visible(Vid(id as u32), trx_id, bt, read_only),
                    ReadStat::Success(true)
                ),
                ElementKind::Edge => matches!(
                    ctx.storage
                        .get_edge_label(Eid::from_value(id), trx_id, bt, read_only),
                    ReadStat::Success(_)
                ),
            };
            if visible {
                values.push(Value::Int(id as i64));
            }
        }
        values.sort_by_key(|v| v.as_int().unwrap_or(0));
    } else {
        match kind {
            ElementKind::Vertex => {
                for vid in ctx.storage.get_all_vertices(trx_id, bt, read_only) {
                    values.push(Value::Int(vid.0 as i64));
                }
            }
            ElementKind::Edge => {
                for eid in ctx.storage.get_all_edges(trx_id, bt, read_only) {
                    values.push(Value::Int(eid.value() as i64));
                }
            }
        }
    }

    let data: Payload = vec![(History::new(), values)];
    ctx.forward(tid, &msg, data);
}
