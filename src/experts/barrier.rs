use std::collections::{BTreeMap, HashMap, HashSet};

use dashmap::DashMap;
use rand::Rng;
use tracing::debug;

use crate::experts::{
    branch_key_of, branch_value, dispatch, history_value, BarrierCell, MKey, WorkerContext,
    WorkerEvent,
};
use crate::message::{
    create_exit_messages, create_feed_messages, path_ready, History, Message, Payload,
};
use crate::plan::OpKind;
use crate::types::Value;

/// Barrier accumulator identity and completion signature, taken from the
/// innermost branch frame (top-level queries collect under `(qid, 0, 0)`
/// with an empty end path).
fn barrier_meta(msg: &Message) -> (MKey, String) {
    match msg.meta.branch_infos.last() {
        Some(info) => (
            (msg.meta.qid, info.msg_id, info.index),
            info.msg_path.clone(),
        ),
        None => ((msg.meta.qid, 0, 0), String::new()),
    }
}

/// The shared barrier skeleton: locate the accumulator, fold in this
/// message, and on completeness hand the drained state to `finish`.
fn run<T, A, F>(
    table: &DashMap<MKey, BarrierCell<T>>,
    ctx: &WorkerContext,
    tid: usize,
    mut msg: Message,
    accumulate: A,
    finish: F,
) where
    T: Default,
    A: FnOnce(&WorkerContext, &Message, &mut T),
    F: FnOnce(&WorkerContext, usize, &mut Message, T),
{
    let (key, end_path) = barrier_meta(&msg);
    let ready = {
        let mut cell = table.entry(key).or_default();
        let ready = path_ready(&mut cell.path_counter, &msg.meta.msg_path, &end_path);
        accumulate(ctx, &msg, &mut cell.data);
        ready
    };
    if ready {
        let Some((_, cell)) = table.remove(&key) else {
            return;
        };
        msg.meta.msg_path = end_path;
        finish(ctx, tid, &mut msg, cell.data);
    }
}

/// Forwards a completed barrier's output; when the next operator is itself a
/// barrier the payload short-circuits in place, with count collapse applied.
fn emit(ctx: &WorkerContext, tid: usize, msg: &mut Message, mut data: Payload) {
    let next = msg.plan.ops[msg.meta.step].next;
    if next < msg.plan.ops.len() && msg.plan.ops[next].kind.is_barrier() {
        if msg.plan.ops[next].kind == OpKind::Count {
            for pair in &mut data {
                let n = pair.1.len() as i64;
                pair.1 = vec![Value::Int(n)];
            }
        }
        msg.meta.step = next;
        msg.data = data;
        dispatch(ctx, tid, msg.clone());
    } else {
        ctx.forward(tid, msg, data);
    }
}

pub fn process(ctx: &WorkerContext, tid: usize, msg: Message) {
    match msg.plan.ops[msg.meta.step].kind {
        OpKind::End => process_end(ctx, tid, msg),
        OpKind::Count => process_count(ctx, tid, msg),
        OpKind::Dedup => process_dedup(ctx, tid, msg),
        OpKind::Group => process_group(ctx, tid, msg),
        OpKind::Order => process_order(ctx, tid, msg),
        OpKind::Range => process_range(ctx, tid, msg),
        OpKind::Coin => process_coin(ctx, tid, msg),
        OpKind::Math => process_math(ctx, tid, msg),
        OpKind::Aggregate => process_aggregate(ctx, tid, msg),
        OpKind::Cap => process_cap(ctx, tid, msg),
        OpKind::PostValidation => process_post_validation(ctx, tid, msg),
        kind => unreachable!("not a barrier operator: {kind:?}"),
    }
}

// ---- end ------------------------------------------------------------

#[derive(Default)]
pub struct EndState {
    result: Vec<Value>,
}

fn process_end(ctx: &WorkerContext, tid: usize, msg: Message) {
    run(
        &ctx.end_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut EndState| {
            for (_, values) in &msg.data {
                state.result.extend(values.iter().cloned());
            }
        },
        |ctx, tid, msg, state| {
            debug!(qid = msg.meta.qid, n = state.result.len(), "query complete");
            let _ = ctx.control_tx.send(WorkerEvent::QueryDone {
                qid: msg.meta.qid,
                results: state.result,
                abort_reason: None,
            });
            let routing = ctx.routing(tid);
            for exit in create_exit_messages(msg, &routing) {
                ctx.mailbox.send(exit);
            }
        },
    );
}

/// An ABORT short-circuits straight into the end operator.
pub fn process_abort(ctx: &WorkerContext, tid: usize, msg: &Message) {
    let reason = msg
        .data
        .first()
        .and_then(|(_, vals)| vals.first())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "aborted".to_string());
    let _ = ctx.control_tx.send(WorkerEvent::QueryDone {
        qid: msg.meta.qid,
        results: Vec::new(),
        abort_reason: Some(reason),
    });
    let routing = ctx.routing(tid);
    for exit in create_exit_messages(msg, &routing) {
        ctx.mailbox.send(exit);
    }
}

// ---- count ----------------------------------------------------------

#[derive(Default)]
pub struct CountState {
    counters: HashMap<i64, (History, i64)>,
}

fn process_count(ctx: &WorkerContext, tid: usize, msg: Message) {
    let branch_key = branch_key_of(&msg);
    run(
        &ctx.count_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut CountState| {
            for (history, values) in &msg.data {
                // upstream pre-collapses payloads into partial counts
                let partial = values
                    .first()
                    .and_then(|v| v.as_int().ok())
                    .unwrap_or(0);
                let mut his = history.clone();
                let bv = branch_value(&mut his, branch_key, true);
                let entry = state.counters.entry(bv).or_insert_with(|| (his, 0));
                entry.1 += partial;
            }
        },
        |ctx, tid, msg, state| {
            let mut data = Payload::new();
            for (_, (his, count)) in state.counters {
                data.push((his, vec![Value::Int(count)]));
            }
            if data.is_empty() {
                data.push((History::new(), vec![Value::Int(0)]));
            }
            emit(ctx, tid, msg, data);
        },
    );
}

// ---- dedup ----------------------------------------------------------

#[derive(Default)]
pub struct DedupState {
    data_map: HashMap<i64, Payload>,
    his_sets: HashMap<i64, HashSet<History>>,
    val_sets: HashMap<i64, HashSet<Value>>,
}

fn process_dedup(ctx: &WorkerContext, tid: usize, msg: Message) {
    let branch_key = branch_key_of(&msg);
    let keys: Vec<i64> = msg.plan.ops[msg.meta.step]
        .params
        .iter()
        .filter_map(|v| v.as_int().ok())
        .collect();
    run(
        &ctx.dedup_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut DedupState| {
            for (history, values) in &msg.data {
                let mut his = history.clone();
                let bv = branch_value(&mut his, branch_key, false);
                let bucket = state.data_map.entry(bv).or_default();

                let slot = match bucket.iter().position(|(h, _)| h == history) {
                    Some(pos) => pos,
                    None => {
                        bucket.push((history.clone(), Vec::new()));
                        bucket.len() - 1
                    }
                };

                if !keys.is_empty() && !values.is_empty() {
                    // dedup by the selected history keys: first traverser
                    // per distinct key combination survives
                    let mut key_his = History::new();
                    for (k, v) in history.iter() {
                        if keys.contains(k) {
                            key_his.push((*k, v.clone()));
                        }
                    }
                    if state.his_sets.entry(bv).or_default().insert(key_his) {
                        bucket[slot].1.push(values[0].clone());
                    }
                } else {
                    let seen = state.val_sets.entry(bv).or_default();
                    for value in values {
                        if seen.insert(value.clone()) {
                            bucket[slot].1.push(value.clone());
                        }
                    }
                }
            }
        },
        |ctx, tid, msg, state| {
            let mut data = Payload::new();
            for (_, bucket) in state.data_map {
                data.extend(bucket);
            }
            emit(ctx, tid, msg, data);
        },
    );
}

// ---- group ----------------------------------------------------------

#[derive(Default)]
pub struct GroupState {
    map: HashMap<i64, (History, BTreeMap<String, Vec<Value>>)>,
}

fn process_group(ctx: &WorkerContext, tid: usize, msg: Message) {
    let branch_key = branch_key_of(&msg);
    let label_step = msg.plan.ops[msg.meta.step].param_int(1);
    run(
        &ctx.group_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut GroupState| {
            for (history, values) in &msg.data {
                let mut his = history.clone();
                let projected = history_value(&mut his, label_step, false);
                let bv = branch_value(&mut his, branch_key, true);
                let entry = state
                    .map
                    .entry(bv)
                    .or_insert_with(|| (his, BTreeMap::new()));
                for value in values {
                    let key = match &projected {
                        Some(k) => k.to_string(),
                        None => value.to_string(),
                    };
                    entry.1.entry(key).or_default().push(value.clone());
                }
            }
        },
        |ctx, tid, msg, state| {
            let is_count = msg.plan.ops[msg.meta.step].param_int(0) == 1;
            let mut data = Payload::new();
            for (_, (his, groups)) in state.map {
                let mut rendered = Vec::new();
                for (key, members) in groups {
                    if is_count {
                        rendered.push(Value::Str(format!("{key}:{}", members.len())));
                    } else {
                        let joined = members
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join(", ");
                        rendered.push(Value::Str(format!("{key}:[{joined}]")));
                    }
                }
                data.push((his, rendered));
            }
            emit(ctx, tid, msg, data);
        },
    );
}

// ---- order ----------------------------------------------------------

#[derive(Default)]
pub struct OrderState {
    map: HashMap<i64, (History, BTreeMap<Value, Vec<Value>>)>,
}

fn process_order(ctx: &WorkerContext, tid: usize, msg: Message) {
    let branch_key = branch_key_of(&msg);
    let label_step = msg.plan.ops[msg.meta.step].param_int(0);
    run(
        &ctx.order_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut OrderState| {
            for (history, values) in &msg.data {
                let mut his = history.clone();
                let projected = history_value(&mut his, label_step, false);
                let bv = branch_value(&mut his, branch_key, true);
                let entry = state
                    .map
                    .entry(bv)
                    .or_insert_with(|| (his, BTreeMap::new()));
                for value in values {
                    let key = projected.clone().unwrap_or_else(|| value.clone());
                    entry.1.entry(key).or_default().push(value.clone());
                }
            }
        },
        |ctx, tid, msg, state| {
            let descending = msg.plan.ops[msg.meta.step].param_int(1) == 1;
            let mut data = Payload::new();
            for (_, (his, sorted)) in state.map {
                let mut flat = Vec::new();
                if descending {
                    for (_, members) in sorted.into_iter().rev() {
                        flat.extend(members.into_iter().rev());
                    }
                } else {
                    for (_, members) in sorted {
                        flat.extend(members);
                    }
                }
                data.push((his, flat));
            }
            if data.is_empty() {
                data.push((History::new(), Vec::new()));
            }
            emit(ctx, tid, msg, data);
        },
    );
}

// ---- range / coin ---------------------------------------------------

#[derive(Default)]
pub struct RangeState {
    map: HashMap<i64, (i64, Payload)>,
}

fn process_range(ctx: &WorkerContext, tid: usize, msg: Message) {
    let branch_key = branch_key_of(&msg);
    let start = msg.plan.ops[msg.meta.step].param_int(0);
    let end = match msg.plan.ops[msg.meta.step].param_int(1) {
        -1 => i64::MAX,
        n => n,
    };
    run(
        &ctx.range_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut RangeState| {
            for (history, values) in &msg.data {
                let mut his = history.clone();
                let bv = branch_value(&mut his, branch_key, false);
                let (counter, bucket) = state.map.entry(bv).or_default();
                if *counter > end && !values.is_empty() {
                    continue;
                }
                let slot = match bucket.iter().position(|(h, _)| h == history) {
                    Some(pos) => pos,
                    None => {
                        bucket.push((history.clone(), Vec::new()));
                        bucket.len() - 1
                    }
                };
                for value in values {
                    if *counter > end {
                        break;
                    }
                    if *counter >= start {
                        bucket[slot].1.push(value.clone());
                    }
                    *counter += 1;
                }
            }
        },
        |ctx, tid, msg, state| {
            let mut data = Payload::new();
            for (_, (_, bucket)) in state.map {
                data.extend(bucket);
            }
            emit(ctx, tid, msg, data);
        },
    );
}

fn process_coin(ctx: &WorkerContext, tid: usize, msg: Message) {
    let branch_key = branch_key_of(&msg);
    let rate = msg.plan.ops[msg.meta.step]
        .params
        .first()
        .and_then(|v| v.as_double().ok())
        .unwrap_or(0.0);
    run(
        &ctx.range_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut RangeState| {
            let mut rng = rand::thread_rng();
            for (history, values) in &msg.data {
                let mut his = history.clone();
                let bv = branch_value(&mut his, branch_key, false);
                let (_, bucket) = state.map.entry(bv).or_default();
                let slot = match bucket.iter().position(|(h, _)| h == history) {
                    Some(pos) => pos,
                    None => {
                        bucket.push((history.clone(), Vec::new()));
                        bucket.len() - 1
                    }
                };
                for value in values {
                    if rng.gen::<f64>() < rate {
                        bucket[slot].1.push(value.clone());
                    }
                }
            }
        },
        |ctx, tid, msg, state| {
            let mut data = Payload::new();
            for (_, (_, bucket)) in state.map {
                data.extend(bucket);
            }
            emit(ctx, tid, msg, data);
        },
    );
}

// ---- math -----------------------------------------------------------

#[derive(Default)]
pub struct MathState {
    map: HashMap<i64, (History, i64, Option<f64>)>,
}

fn process_math(ctx: &WorkerContext, tid: usize, msg: Message) {
    let branch_key = branch_key_of(&msg);
    let math_kind = msg.plan.ops[msg.meta.step].param_int(0);
    run(
        &ctx.math_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut MathState| {
            for (history, values) in &msg.data {
                let mut his = history.clone();
                let bv = branch_value(&mut his, branch_key, true);
                let entry = state.map.entry(bv).or_insert_with(|| (his, 0, None));
                for value in values {
                    let Ok(v) = value.as_double() else { continue };
                    entry.1 += 1;
                    entry.2 = Some(match (math_kind, entry.2) {
                        (_, None) => v,
                        (0 | 3, Some(acc)) => acc + v, // sum / mean
                        (1, Some(acc)) => acc.max(v),
                        (2, Some(acc)) => acc.min(v),
                        (_, Some(acc)) => acc,
                    });
                }
            }
        },
        |ctx, tid, msg, state| {
            let is_mean = math_kind == 3;
            let mut data = Payload::new();
            for (_, (his, count, acc)) in state.map {
                let mut bucket = Vec::new();
                if let Some(acc) = acc {
                    let result = if is_mean { acc / count as f64 } else { acc };
                    bucket.push(Value::Double(result));
                }
                data.push((his, bucket));
            }
            emit(ctx, tid, msg, data);
        },
    );
}

// ---- aggregate / cap ------------------------------------------------

#[derive(Default)]
pub struct AggState {
    agg: Vec<Value>,
    msg_data: Payload,
}

fn process_aggregate(ctx: &WorkerContext, tid: usize, msg: Message) {
    let se_key = msg.plan.ops[msg.meta.step].param_int(0);
    run(
        &ctx.agg_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut AggState| {
            for (history, values) in &msg.data {
                let slot = match state.msg_data.iter().position(|(h, _)| h == history) {
                    Some(pos) => pos,
                    None => {
                        state.msg_data.push((history.clone(), Vec::new()));
                        state.msg_data.len() - 1
                    }
                };
                state.msg_data[slot].1.extend(values.iter().cloned());
                state.agg.extend(values.iter().cloned());
            }
        },
        |ctx, tid, msg, state| {
            // publish locally, then feed every peer worker
            ctx.agg_store
                .entry((msg.meta.qid, se_key))
                .or_default()
                .extend(state.agg.iter().cloned());
            let routing = ctx.routing(tid);
            for feed in create_feed_messages(msg, se_key, state.agg, &routing) {
                ctx.mailbox.send(feed);
            }
            emit(ctx, tid, msg, state.msg_data);
        },
    );
}

fn process_cap(ctx: &WorkerContext, tid: usize, msg: Message) {
    run(
        &ctx.cap_states,
        ctx,
        tid,
        msg,
        |_, _, _| {},
        |ctx, tid, msg, ()| {
            let op = &msg.plan.ops[msg.meta.step];
            let mut rendered = Vec::new();
            for pair in op.params.chunks(2) {
                let [key, Value::Str(name)] = pair else { continue };
                let se_key = key.as_int().unwrap_or(-1);
                let joined = ctx
                    .agg_store
                    .get(&(msg.meta.qid, se_key))
                    .map(|entry| {
                        entry
                            .value()
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                rendered.push(Value::Str(format!("{name}:[{joined}]")));
            }
            emit(ctx, tid, msg, vec![(History::new(), rendered)]);
        },
    );
}

// ---- post-validation ------------------------------------------------

#[derive(Default)]
pub struct ValidationState {
    failed: bool,
}

fn process_post_validation(ctx: &WorkerContext, tid: usize, msg: Message) {
    run(
        &ctx.validation_states,
        ctx,
        tid,
        msg,
        |_, msg, state: &mut ValidationState| {
            for (_, values) in &msg.data {
                for value in values {
                    if value.as_int().unwrap_or(0) != 1 {
                        state.failed = true;
                    }
                }
            }
        },
        |ctx, tid, msg, state| {
            let decision = !state.failed;
            debug!(qid = msg.meta.qid, decision, "validation decided");
            emit(
                ctx,
                tid,
                msg,
                vec![(History::new(), vec![Value::Int(decision as i64)])],
            );
        },
    );
}
