use crate::error::ReadStat;
use crate::experts::{history_value, WorkerContext};
use crate::message::{Message, Payload};
use crate::plan::parser::code_pred;
use crate::predicate::{Predicate, PredicateKind};
use crate::types::{Eid, Epid, Value, Vid, Vpid};

enum Verdict {
    Keep,
    Drop,
    Abort,
}

/// One `(pid, predicate)` group against one element. pid -1 means "any
/// property matches"; a missing key keeps for hasNot and drops for hasKey.
fn check_element(
    ctx: &WorkerContext,
    tid: usize,
    vertex: bool,
    id: u64,
    pid: i64,
    pred: &Predicate,
    trx_id: u64,
    bt: u64,
    read_only: bool,
) -> Verdict {
    let read = |pkey: u16| -> ReadStat<Value> {
        if vertex {
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
        }
    };

    if pid == -1 {
        // the predicate must match at least one property
        let pids = if vertex {
            ctx.storage
                .get_vpid_list(tid, Vid(id as u32), trx_id, bt, read_only)
        } else {
            match ctx
                .storage
                .get_ep_all(tid, Eid::from_value(id), trx_id, bt, read_only)
            {
                ReadStat::Success(all) => {
                    return if all.iter().any(|(_, v)| pred.eval(v)) {
                        Verdict::Keep
                    } else {
                        Verdict::Drop
                    };
                }
                ReadStat::NotFound => ReadStat::NotFound,
                ReadStat::Abort => ReadStat::Abort,
            }
        };
        return match pids {
            ReadStat::Success(pids) => {
                for pid in pids {
                    match read((pid & crate::types::PKEY_MASK) as u16) {
                        ReadStat::Success(v) if pred.eval(&v) => return Verdict::Keep,
                        ReadStat::Abort => return Verdict::Abort,
                        _ => {}
                    }
                }
                Verdict::Drop
            }
            ReadStat::NotFound => Verdict::Drop,
            ReadStat::Abort => Verdict::Abort,
        };
    }

    match read(pid as u16) {
        ReadStat::Success(value) => match pred.kind {
            PredicateKind::None => Verdict::Drop,
            PredicateKind::Any => Verdict::Keep,
            _ => {
                if pred.eval(&value) {
                    Verdict::Keep
                } else {
                    Verdict::Drop
                }
            }
        },
        ReadStat::NotFound => {
            // key absent: hasNot keeps, everything else drops
            if pred.kind == PredicateKind::None {
                Verdict::Keep
            } else {
                Verdict::Drop
            }
        }
        ReadStat::Abort => Verdict::Abort,
    }
}

/// has / hasKey / hasValue / hasNot over a merged predicate chain.
pub fn process_has(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex = op.param_int(0) == 0;
    let groups = (op.params.len() - 1) / 3;
    let trx_id = plan.trx_id;
    let bt = plan.bt;
    let read_only = plan.read_only();

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        'value: for value in values {
            let Ok(id) = value.as_u64() else { continue };
            for g in 0..groups {
                let at = 1 + g * 3;
                let pid = op.param_int(at);
                let pred = Predicate::new(
                    code_pred(op.param_int(at + 1)),
                    op.params[at + 2].as_list(),
                );
                match check_element(ctx, tid, vertex, id, pid, &pred, trx_id, bt, read_only) {
                    Verdict::Keep => {}
                    Verdict::Drop => continue 'value,
                    Verdict::Abort => {
                        ctx.abort_query(tid, &msg, "read conflict in has filter");
                        return;
                    }
                }
            }
            bucket.push(value.clone());
        }
        out.push((history.clone(), bucket));
    }
    ctx.push_rw_record(trx_id, msg.data.len(), true);
    ctx.forward(tid, &msg, out);
}

pub fn process_has_label(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let vertex = op.param_int(0) == 0;
    let wanted: Vec<i64> = op.params[1..]
        .iter()
        .filter_map(|v| v.as_int().ok())
        .collect();
    let trx_id = plan.trx_id;
    let bt = plan.bt;
    let read_only = plan.read_only();

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        for value in values {
            let Ok(id) = value.as_u64() else { continue };
            let label = if vertex {
                ctx.storage.get_vertex_label(Vid(id as u32)).map(|l| l as i64)
            } else {
                match ctx
                    .storage
                    .get_edge_label(Eid::from_value(id), trx_id, bt, read_only)
                {
                    ReadStat::Success(l) => Some(l as i64),
                    ReadStat::NotFound => None,
                    ReadStat::Abort => {
                        ctx.abort_query(tid, &msg, "read conflict in hasLabel filter");
                        return;
                    }
                }
            };
            if matches!(label, Some(l) if wanted.contains(&l)) {
                bucket.push(value.clone());
            }
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}

/// is(pred) over plain payload values.
pub fn process_is(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let groups = op.params.len() / 2;

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        'value: for value in values {
            for g in 0..groups {
                let pred = Predicate::new(
                    code_pred(op.param_int(g * 2)),
                    op.params[g * 2 + 1].as_list(),
                );
                if !pred.eval(value) {
                    continue 'value;
                }
            }
            bucket.push(value.clone());
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}

/// where(pred) / where(label, pred): predicates over history values;
/// within/without test membership in aggregate side-effect data.
pub fn process_where(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let groups = op.params.len() / 3;
    let qid = msg.meta.qid;

    // every within/without group needs its aggregate data fed first
    for g in 0..groups {
        let kind = code_pred(op.param_int(g * 3 + 1));
        if matches!(kind, PredicateKind::Within | PredicateKind::Without) {
            for key in op.params[g * 3 + 2].as_list() {
                let se_key = key.as_int().unwrap_or(-1);
                if !ctx.agg_store.contains_key(&(qid, se_key)) {
                    // feed not delivered yet, requeue to ourselves
                    let mut back = msg.clone();
                    back.meta.recver_nid = ctx.rank;
                    back.meta.recver_tid = tid;
                    ctx.mailbox.send(back);
                    return;
                }
            }
        }
    }

    let mut out = Payload::new();
    for (history, values) in &msg.data {
        let mut bucket = Vec::new();
        'value: for value in values {
            for g in 0..groups {
                let at = g * 3;
                let label_key = op.param_int(at);
                let kind = code_pred(op.param_int(at + 1));
                let targets = op.params[at + 2].as_list();

                // the probed value: the history entry under `label`, or the
                // traverser itself
                let mut his = history.clone();
                let probe = if label_key >= 0 {
                    match history_value(&mut his, label_key, false) {
                        Some(v) => v,
                        None => continue 'value,
                    }
                } else {
                    value.clone()
                };

                if matches!(kind, PredicateKind::Within | PredicateKind::Without) {
                    for key in &targets {
                        let se_key = key.as_int().unwrap_or(-1);
                        let agg = ctx.agg_store.get(&(qid, se_key));
                        let contained =
                            agg.map(|entry| entry.value().contains(&probe)).unwrap_or(false);
                        let pass = match kind {
                            PredicateKind::Within => contained,
                            _ => !contained,
                        };
                        if !pass {
                            continue 'value;
                        }
                    }
                } else {
                    for key in &targets {
                        let ls = key.as_int().unwrap_or(-1);
                        let mut his2 = history.clone();
                        let Some(other) = history_value(&mut his2, ls, false) else {
                            continue 'value;
                        };
                        let pred = Predicate::new(kind, vec![other]);
                        if !pred.eval(&probe) {
                            continue 'value;
                        }
                    }
                }
            }
            bucket.push(value.clone());
        }
        out.push((history.clone(), bucket));
    }
    ctx.forward(tid, &msg, out);
}
