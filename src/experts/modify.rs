use crate::error::ReadStat;
use crate::experts::{history_value, WorkerContext};
use crate::message::{Message, Payload};
use crate::plan::{ADD_E_PLACEHOLDER, ADD_E_STEP_LABEL};
use crate::types::{Eid, Epid, LabelId, Value, Vid, Vpid};

/// addV(label): one fresh vertex per input traverser (one for a bare
/// `g.addV`). The assigned vid is globally unique, so no conflict can arise.
pub fn process_add_v(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let label = op.param_int(0) as LabelId;

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let count = values.len().max(1);
        let mut bucket = Vec::with_capacity(count);
        for _ in 0..count {
            let vid = ctx
                .storage
                .add_vertex(tid, label, plan.trx_id, plan.bt);
            bucket.push(Value::Int(vid.0 as i64));
        }
        out.push((history.clone(), bucket));
    }
    ctx.push_rw_record(plan.trx_id, out.len(), false);
    ctx.forward(tid, &msg, out);
}

/// Resolves one addE endpoint into candidate vids.
fn endpoint_vids(
    kind: i64,
    param: &Value,
    history: &crate::message::History,
    inputs: &[Value],
) -> Vec<u32> {
    if kind == ADD_E_STEP_LABEL {
        let ls_key = param.as_int().unwrap_or(-1);
        let mut his = history.clone();
        history_value(&mut his, ls_key, false)
            .and_then(|v| v.as_u64().ok())
            .map(|v| vec![v as u32])
            .unwrap_or_default()
    } else if kind == ADD_E_PLACEHOLDER {
        param
            .as_list()
            .iter()
            .filter_map(|v| v.as_u64().ok().map(|v| v as u32))
            .collect()
    } else {
        inputs
            .iter()
            .filter_map(|v| v.as_u64().ok().map(|v| v as u32))
            .collect()
    }
}

/// addE(label).from(X).to(Y): pairs endpoints into eids. The storage writes
/// happen in the two follow-up operators, each on the worker owning its side
/// of the edge.
pub fn process_add_e(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let from_kind = op.param_int(1);
    let to_kind = op.param_int(3);

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let from = endpoint_vids(from_kind, &op.params[2], history, values);
        let to = endpoint_vids(to_kind, &op.params[4], history, values);
        let mut bucket = Vec::new();
        for &out_v in &from {
            for &in_v in &to {
                bucket.push(Value::Int(Eid::new(Vid(out_v), Vid(in_v)).value() as i64));
            }
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}

/// Inserts the authoritative out side of each new edge.
pub fn process_add_edge_out(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let label = op.param_int(0) as LabelId;

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        for value in values {
            let Ok(packed) = value.as_u64() else { continue };
            let eid = Eid::from_value(packed);
            if !ctx
                .storage
                .add_edge_out(tid, eid, label, plan.trx_id, plan.bt)
                .ok()
            {
                ctx.abort_query(tid, &msg, "write conflict adding edge");
                return;
            }
            bucket.push(value.clone());
        }
        out.push((history.clone(), bucket));
    }
    ctx.push_rw_record(plan.trx_id, out.len(), false);
    ctx.forward(tid, &msg, out);
}

/// Mirrors each new edge into its in-vertex's topology rows.
pub fn process_add_edge_in(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let label = op.param_int(0) as LabelId;

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        for value in values {
            let Ok(packed) = value.as_u64() else { continue };
            let eid = Eid::from_value(packed);
            if !ctx
                .storage
                .add_edge_in(tid, eid, label, plan.trx_id, plan.bt)
                .ok()
            {
                ctx.abort_query(tid, &msg, "write conflict adding edge");
                return;
            }
            bucket.push(value.clone());
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}

/// property(key, value): appends an uncommitted property version to each
/// input element; a foreign uncommitted tail aborts the transaction.
pub fn process_property(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex = op.param_int(0) == 0;
    let pkey = op.param_int(1) as LabelId;
    let value = op.params[2].clone();

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        for input in values {
            let Ok(id) = input.as_u64() else { continue };
            let stat = if vertex {
                ctx.storage.modify_vp(
                    tid,
                    Vpid::new(Vid(id as u32), pkey),
                    &value,
                    plan.trx_id,
                    plan.bt,
                )
            } else {
                ctx.storage.modify_ep(
                    tid,
                    Epid::new(Eid::from_value(id), pkey),
                    &value,
                    plan.trx_id,
                    plan.bt,
                )
            };
            if !stat.ok() {
                ctx.abort_query(tid, &msg, "write conflict updating property");
                return;
            }
            bucket.push(input.clone());
        }
        out.push((history.clone(), bucket));
    }
    ctx.push_rw_record(plan.trx_id, out.len(), false);
    ctx.forward(tid, &msg, out);
}

/// drop(): logical-delete versions. Vertex drops emit their connected edge
/// ids for the planner-added second drop pass; any conflicting sub-drop
/// aborts the whole transaction.
pub fn process_drop(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex = op.param_int(0) == 0;
    let is_property = op.param_int(1) == 1;
    let (trx_id, bt) = (plan.trx_id, plan.bt);

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        for value in values {
            if is_property {
                // property payloads are [pid, rendered] lists
                let Value::List(items) = value else { continue };
                let Some(Ok(pid)) = items.first().map(|v| v.as_u64()) else {
                    continue;
                };
                let stat = if vertex {
                    ctx.storage.drop_vp(tid, Vpid(pid), trx_id, bt)
                } else {
                    ctx.storage.drop_ep(tid, Epid(pid), trx_id, bt)
                };
                if stat == crate::error::WriteStat::Conflict {
                    ctx.abort_query(tid, &msg, "write conflict dropping property");
                    return;
                }
                continue;
            }

            let Ok(id) = value.as_u64() else { continue };
            if vertex {
                let vid = Vid(id as u32);
                // collect the still-visible incident edges before hiding the
                // vertex; they feed the follow-up edge-drop pass
                let eids = match ctx.storage.get_connected_edges(
                    tid,
                    vid,
                    -1,
                    crate::types::Direction::Both,
                    trx_id,
                    bt,
                    false,
                ) {
                    ReadStat::Success(eids) => eids,
                    ReadStat::NotFound => Vec::new(),
                    ReadStat::Abort => {
                        ctx.abort_query(tid, &msg, "read conflict dropping vertex");
                        return;
                    }
                };
                match ctx.storage.drop_vertex(tid, vid, trx_id, bt) {
                    crate::error::WriteStat::Conflict => {
                        ctx.abort_query(tid, &msg, "write conflict dropping vertex");
                        return;
                    }
                    _ => {
                        bucket.extend(eids.into_iter().map(|e| Value::Int(e.value() as i64)));
                    }
                }
            } else {
                match ctx.storage.drop_edge_local(tid, Eid::from_value(id), trx_id, bt) {
                    crate::error::WriteStat::Conflict => {
                        ctx.abort_query(tid, &msg, "write conflict dropping edge");
                        return;
                    }
                    _ => {}
                }
            }
        }
        out.push((history.clone(), bucket));
    }
    ctx.push_rw_record(trx_id, out.len(), false);
    ctx.forward(tid, &msg, out);
}
