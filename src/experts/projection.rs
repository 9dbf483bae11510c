use std::collections::HashMap;

use crate::error::ReadStat;
use crate::experts::WorkerContext;
use crate::message::{Message, Payload};
use crate::types::{Eid, Epid, LabelId, Value, Vid, Vpid, LABEL_PKEY};

fn prop_key_name(ctx: &WorkerContext, vertex: bool, pkey: LabelId) -> String {
    let table = if vertex {
        &ctx.storage.schema.vertex_prop_keys
    } else {
        &ctx.storage.schema.edge_prop_keys
    };
    table
        .name(pkey)
        .map(str::to_string)
        .unwrap_or_else(|| pkey.to_string())
}

fn read_props(
    ctx: &WorkerContext,
    tid: usize,
    vertex: bool,
    id: u64,
    keys: &[LabelId],
    trx_id: u64,
    bt: u64,
    read_only: bool,
) -> ReadStat<Vec<(LabelId, Value)>> {
    if keys.is_empty() {
        if vertex {
            ctx.storage
                .get_vp_all(tid, Vid(id as u32), trx_id, bt, read_only)
        } else {
            ctx.storage
                .get_ep_all(tid, Eid::from_value(id), trx_id, bt, read_only)
        }
    } else {
        let mut out = Vec::new();
        for &pkey in keys {
            let read = if vertex {
                ctx.storage
                    .get_vp(tid, Vpid::new(Vid(id as u32), pkey), trx_id, bt, read_only)
            } else {
                ctx.storage.get_ep(
                    tid,
                    Epid::new(Eid::from_value(id), pkey),
                    trx_id,
                    bt,
                    read_only,
                )
            };
            match read {
                ReadStat::Success(v) => out.push((pkey, v)),
                ReadStat::NotFound => {}
                ReadStat::Abort => return ReadStat::Abort,
            }
        }
        ReadStat::Success(out)
    }
}

/// properties(keys...): `(pid, "{key:value}")` pairs per visible property.
pub fn process_properties(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex = op.param_int(0) == 0;
    let keys: Vec<LabelId> = op.params[1..]
        .iter()
        .filter_map(|v| v.as_int().ok().map(|k| k as LabelId))
        .collect();
    let (trx_id, bt, read_only) = (plan.trx_id, plan.bt, plan.read_only());

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        for value in values {
            let Ok(id) = value.as_u64() else { continue };
            match read_props(ctx, tid, vertex, id, &keys, trx_id, bt, read_only) {
                ReadStat::Success(props) => {
                    for (pkey, v) in props {
                        let pid = if vertex {
                            Vpid::new(Vid(id as u32), pkey).0
                        } else {
                            Epid::new(Eid::from_value(id), pkey).0
                        };
                        let rendered = format!(
                            "{{{}:{}}}",
                            prop_key_name(ctx, vertex, pkey),
                            v
                        );
                        bucket.push(Value::List(vec![
                            Value::Int(pid as i64),
                            Value::Str(rendered),
                        ]));
                    }
                }
                ReadStat::NotFound => {}
                ReadStat::Abort => {
                    ctx.abort_query(tid, &msg, "read conflict in properties");
                    return;
                }
            }
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}

/// values(keys...): bare property values.
pub fn process_values(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex = op.param_int(0) == 0;
    let keys: Vec<LabelId> = op.params[1..]
        .iter()
        .filter_map(|v| v.as_int().ok().map(|k| k as LabelId))
        .collect();
    let (trx_id, bt, read_only) = (plan.trx_id, plan.bt, plan.read_only());

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        for value in values {
            let Ok(id) = value.as_u64() else { continue };
            match read_props(ctx, tid, vertex, id, &keys, trx_id, bt, read_only) {
                ReadStat::Success(props) => bucket.extend(props.into_iter().map(|(_, v)| v)),
                ReadStat::NotFound => {}
                ReadStat::Abort => {
                    ctx.abort_query(tid, &msg, "read conflict in values");
                    return;
                }
            }
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}

/// key(): visible property key names of each element.
pub fn process_key(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex = op.param_int(0) == 0;
    let (trx_id, bt, read_only) = (plan.trx_id, plan.bt, plan.read_only());

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        for value in values {
            let Ok(id) = value.as_u64() else { continue };
            match read_props(ctx, tid, vertex, id, &[], trx_id, bt, read_only) {
                ReadStat::Success(props) => {
                    for (pkey, _) in props {
                        bucket.push(Value::Str(prop_key_name(ctx, vertex, pkey)));
                    }
                }
                ReadStat::NotFound => {}
                ReadStat::Abort => {
                    ctx.abort_query(tid, &msg, "read conflict in key");
                    return;
                }
            }
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}

/// label(): element label names.
pub fn process_label(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex = op.param_int(0) == 0;
    let (trx_id, bt, read_only) = (plan.trx_id, plan.bt, plan.read_only());

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        for value in values {
            let Ok(id) = value.as_u64() else { continue };
            let label = if vertex {
                ctx.storage.get_vertex_label(Vid(id as u32))
            } else {
                match ctx
                    .storage
                    .get_edge_label(Eid::from_value(id), trx_id, bt, read_only)
                {
                    ReadStat::Success(l) => Some(l),
                    ReadStat::NotFound => None,
                    ReadStat::Abort => {
                        ctx.abort_query(tid, &msg, "read conflict in label");
                        return;
                    }
                }
            };
            if let Some(label) = label {
                let table = if vertex {
                    &ctx.storage.schema.vertex_labels
                } else {
                    &ctx.storage.schema.edge_labels
                };
                bucket.push(Value::Str(
                    table
                        .name(label)
                        .map(str::to_string)
                        .unwrap_or_else(|| label.to_string()),
                ));
            }
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}

/// Internal projection feeding keyed group()/order(): records the projected
/// key in the history and optionally swaps the traverser for a projected
/// value.
pub fn process_project(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex = op.param_int(0) == 0;
    let key_id = op.param_int(1);
    let value_id = op.param_int(2);
    let proj_key = msg.meta.step as i64;
    let (trx_id, bt, read_only) = (plan.trx_id, plan.bt, plan.read_only());

    let project = |id: u64, pkey: i64| -> ReadStat<Value> {
        if pkey == LABEL_PKEY as i64 {
            let label = if vertex {
                ctx.storage.get_vertex_label(Vid(id as u32))
            } else {
                match ctx
                    .storage
                    .get_edge_label(Eid::from_value(id), trx_id, bt, read_only)
                {
                    ReadStat::Success(l) => Some(l),
                    ReadStat::Abort => return ReadStat::Abort,
                    ReadStat::NotFound => None,
                }
            };
            return match label {
                Some(l) => ReadStat::Success(Value::Int(l as i64)),
                None => ReadStat::NotFound,
            };
        }
        if vertex {
            ctx.storage
                .get_vp(tid, Vpid::new(Vid(id as u32), pkey as u16), trx_id, bt, read_only)
        } else {
            ctx.storage.get_ep(
                tid,
                Epid::new(Eid::from_value(id), pkey as u16),
                trx_id,
                bt,
                read_only,
            )
        }
    };

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        for value in values {
            let Ok(id) = value.as_u64() else { continue };
            let key_val = match project(id, key_id) {
                ReadStat::Success(v) => v,
                ReadStat::NotFound => continue,
                ReadStat::Abort => {
                    ctx.abort_query(tid, &msg, "read conflict in projection");
                    return;
                }
            };
            let out_val = if value_id >= 0 {
                match project(id, value_id) {
                    ReadStat::Success(v) => v,
                    ReadStat::NotFound => continue,
                    ReadStat::Abort => {
                        ctx.abort_query(tid, &msg, "read conflict in projection");
                        return;
                    }
                }
            } else {
                value.clone()
            };
            let mut his = history.clone();
            his.push((proj_key, key_val));
            out.push((his, vec![out_val]));
        }
        if values.is_empty() {
            out.push((history.clone(), Vec::new()));
        }
    }
    ctx.forward(tid, &msg, out);
}

/// as(name): re-buckets the payload so each distinct value owns a history
/// extended with `(label-step-key, value)`.
pub fn process_as(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let ls_key = op.param_int(0);

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut positions: HashMap<Value, usize> = HashMap::new();
        for value in values {
            match positions.get(value) {
                Some(&pos) => out[pos].1.push(value.clone()),
                None => {
                    let mut his = history.clone();
                    his.push((ls_key, value.clone()));
                    positions.insert(value.clone(), out.len());
                    out.push((his, vec![value.clone()]));
                }
            }
        }
        if values.is_empty() {
            out.push((history.clone(), Vec::new()));
        }
    }
    ctx.forward(tid, &msg, out);
}

/// select(names...): restores one labelled step's payload, or renders a
/// name-tagged projection for several.
pub fn process_select(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let pairs: Vec<(i64, String)> = op
        .params
        .chunks(2)
        .filter_map(|c| match c {
            [k, Value::Str(name)] => Some((k.as_int().ok()?, name.clone())),
            _ => None,
        })
        .collect();

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        if !values.is_empty() {
            if pairs.len() == 1 {
                let mut his = history.clone();
                if let Some(v) =
                    crate::experts::history_value(&mut his, pairs[0].0, false)
                {
                    for _ in values {
                        bucket.push(v.clone());
                    }
                }
            } else {
                let mut rendered = Vec::new();
                let mut his = history.clone();
                for (key, name) in &pairs {
                    if let Some(v) = crate::experts::history_value(&mut his, *key, false) {
                        rendered.push(format!("{name}:{v}"));
                    }
                }
                if rendered.len() == pairs.len() {
                    for _ in values {
                        bucket.push(Value::Str(format!("{{{}}}", rendered.join(", "))));
                    }
                }
            }
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}
