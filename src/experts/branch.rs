use std::sync::atomic::Ordering;

use tracing::warn;

use crate::experts::{MKey, WorkerContext};
use crate::message::{create_branch_messages, path_ready, Message, MsgType, Payload};

/// Spawn/collect key: the freshly assigned msg id plus the enclosing
/// branch's input index (0 at top level).
fn spawn_key(msg: &Message, msg_id: u64) -> MKey {
    let parent_index = msg
        .meta
        .branch_infos
        .last()
        .map(|info| info.index)
        .unwrap_or(0);
    (msg.meta.qid, msg_id, parent_index)
}

/// Collection key of a returning message: msg id from the innermost frame,
/// index from the frame outside it.
fn collect_key(msg: &Message) -> MKey {
    let infos = &msg.meta.branch_infos;
    let msg_id = infos.last().map(|info| info.msg_id).unwrap_or(0);
    let index = if infos.len() >= 2 {
        infos[infos.len() - 2].index
    } else {
        0
    };
    (msg.meta.qid, msg_id, index)
}

fn end_path_of(msg: &Message) -> String {
    msg.meta
        .branch_infos
        .last()
        .map(|info| info.msg_path.clone())
        .unwrap_or_default()
}

/// One return stream fully collapsed counts one branch; the operator is
/// ready when every sub-chain collapsed.
fn branch_ready(ctx: &WorkerContext, key: MKey, msg: &Message, branch_count: usize) -> bool {
    let end_path = end_path_of(msg);
    let mut entry = ctx.branch_paths.entry(key).or_default();
    let (counter, done) = &mut *entry;
    if path_ready(counter, &msg.meta.msg_path, &end_path) {
        *done += 1;
        if *done == branch_count {
            drop(entry);
            ctx.branch_paths.remove(&key);
            return true;
        }
    }
    false
}

fn sub_starts(msg: &Message, skip: usize) -> Vec<usize> {
    msg.plan.ops[msg.meta.step].params[skip..]
        .iter()
        .filter_map(|v| v.as_int().ok().map(|v| v as usize))
        .collect()
}

/// union(sub, ...) and repeat(sub): spawns every sub-chain over the inputs
/// and forwards the concatenation of their results.
pub fn process_union(ctx: &WorkerContext, tid: usize, mut msg: Message) {
    match msg.meta.msg_type {
        MsgType::Spawn | MsgType::Init | MsgType::Feed => {
            let starts = sub_starts(&msg, 0);
            let msg_id = ctx.branch_msg_ids.fetch_add(1, Ordering::SeqCst);
            let routing = ctx.routing(tid);
            for out in create_branch_messages(&msg, &starts, msg_id, false, &routing) {
                ctx.mailbox.send(out);
            }
        }
        MsgType::Branch => {
            let _serial = ctx.branch_locks.lock();
            let key = collect_key(&msg);
            ctx.branch_data
                .entry(key)
                .or_default()
                .extend(msg.data.iter().cloned());
            let branch_count = sub_starts(&msg, 0).len();
            if branch_ready(ctx, key, &msg, branch_count) {
                let data = ctx
                    .branch_data
                    .remove(&key)
                    .map(|(_, d)| d)
                    .unwrap_or_default();
                msg.meta.msg_path = end_path_of(&msg);
                msg.meta.branch_infos.pop();
                ctx.forward(tid, &msg, data);
            }
        }
        other => warn!(?other, "unexpected message type in union"),
    }
}

/// and/or/not(sub, ...): spawns labelled per-input probes and keeps an input
/// when the per-branch verdict bits satisfy the filter.
pub fn process_branch_filter(ctx: &WorkerContext, tid: usize, mut msg: Message) {
    match msg.meta.msg_type {
        MsgType::Spawn | MsgType::Init | MsgType::Feed => {
            let starts = sub_starts(&msg, 1);
            let msg_id = ctx.branch_msg_ids.fetch_add(1, Ordering::SeqCst);
            let key = spawn_key(&msg, msg_id);
            ctx.branch_data.insert(key, msg.data.clone());
            let routing = ctx.routing(tid);
            for out in create_branch_messages(&msg, &starts, msg_id, true, &routing) {
                ctx.mailbox.send(out);
            }
        }
        MsgType::Branch => {
            let _serial = ctx.branch_locks.lock();
            let key = collect_key(&msg);
            let branch_count = sub_starts(&msg, 1).len();

            {
                let infos = &msg.meta.branch_infos;
                let Some(inner) = infos.last() else {
                    warn!("branch return without branch info");
                    return;
                };
                let his_key = inner.key;
                let branch_index = inner.index;
                let mut counters = ctx.branch_counters.entry(key).or_default();
                for (history, values) in &msg.data {
                    if values.is_empty() {
                        continue;
                    }
                    let Some((_, tag)) = history.iter().find(|(k, _)| *k == his_key) else {
                        continue;
                    };
                    let Ok(data_index) = tag.as_int() else { continue };
                    // one verdict bit per branch position
                    *counters.entry(data_index).or_insert(0) |= 1 << (branch_index - 1);
                }
            }

            if branch_ready(ctx, key, &msg, branch_count) {
                let counters = ctx
                    .branch_counters
                    .remove(&key)
                    .map(|(_, c)| c)
                    .unwrap_or_default();
                let data = ctx
                    .branch_data
                    .remove(&key)
                    .map(|(_, d)| d)
                    .unwrap_or_default();

                let filter = msg.plan.ops[msg.meta.step].param_int(0);
                let full = (1u32 << branch_count) - 1;
                let pass = |bits: u32| match filter {
                    0 => bits == full,  // and
                    1 => bits >= 1,     // or
                    _ => bits == 0,     // not
                };

                let mut kept = Payload::new();
                let mut index = 0i64;
                for (history, values) in data {
                    let mut bucket = Vec::new();
                    for value in values {
                        let bits = counters.get(&index).copied().unwrap_or(0);
                        if pass(bits) {
                            bucket.push(value);
                        }
                        index += 1;
                    }
                    kept.push((history, bucket));
                }

                msg.meta.msg_path = end_path_of(&msg);
                msg.meta.branch_infos.pop();
                ctx.forward(tid, &msg, kept);
            }
        }
        other => warn!(?other, "unexpected message type in branch filter"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BranchInfo;
    use crate::plan::{OpKind, Operator, QueryPlan};
    use std::sync::Arc;

    #[test]
    fn collect_key_uses_inner_msg_id_and_outer_index() {
        let plan = Arc::new(QueryPlan {
            ops: vec![Operator::new(OpKind::BranchFilter)],
            ..QueryPlan::default()
        });
        let mut msg = Message {
            meta: crate::message::Meta {
                qid: 9,
                step: 0,
                sender_nid: 0,
                sender_tid: 0,
                recver_nid: 0,
                recver_tid: 0,
                parent_nid: 0,
                parent_tid: 0,
                msg_type: MsgType::Branch,
                msg_path: String::new(),
                branch_infos: vec![
                    BranchInfo {
                        key: 1,
                        msg_id: 5,
                        index: 2,
                        msg_path: String::new(),
                        home_nid: 0,
                        home_tid: 0,
                    },
                    BranchInfo {
                        key: 3,
                        msg_id: 8,
                        index: 1,
                        msg_path: String::new(),
                        home_nid: 0,
                        home_tid: 0,
                    },
                ],
            },
            plan,
            data: Payload::new(),
        };
        assert_eq!(collect_key(&msg), (9, 8, 2));
        msg.meta.branch_infos.truncate(1);
        assert_eq!(collect_key(&msg), (9, 5, 0));
    }
}
