use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::plan::{OpKind, QueryPlan};
use crate::types::{Eid, Value, Vid};

/// Breadcrumb trail accompanying each payload bucket: ordered
/// `(label-step-key, value)` pairs.
pub type History = SmallVec<[(i64, Value); 4]>;

/// Message payload: per-history buckets of values.
pub type Payload = Vec<(History, Vec<Value>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Init,
    Spawn,
    Feed,
    Barrier,
    Branch,
    Exit,
    Abort,
}

/// Pushed when a branch operator spawns labelled sub-chains; the top entry
/// tells returning messages where to converge and which path signature
/// counts as complete.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchInfo {
    /// History key under which inputs were enumerated.
    pub key: i64,
    pub msg_id: u64,
    /// 1-based branch position.
    pub index: i32,
    /// `msg_path` of the spawning message; the completion signature.
    pub msg_path: String,
    pub home_nid: usize,
    pub home_tid: usize,
}

#[derive(Debug, Clone)]
pub struct Meta {
    pub qid: u64,
    pub step: usize,
    pub sender_nid: usize,
    pub sender_tid: usize,
    pub recver_nid: usize,
    pub recver_tid: usize,
    pub parent_nid: usize,
    pub parent_tid: usize,
    pub msg_type: MsgType,
    /// Fan-out tree encoding: one `"\t<count>"` suffix per split.
    pub msg_path: String,
    pub branch_infos: Vec<BranchInfo>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub meta: Meta,
    pub plan: Arc<QueryPlan>,
    pub data: Payload,
}

/// Static routing facts threaded through the builders.
#[derive(Debug, Clone, Copy)]
pub struct Routing {
    pub workers: usize,
    pub threads: usize,
    pub max_data_size: usize,
    pub my_nid: usize,
    pub my_tid: usize,
}

impl Routing {
    /// Deterministic operator-to-thread mapping so barrier partials of one
    /// step always land in the same queue.
    pub fn thread_of(&self, qid: u64, step: usize) -> usize {
        (qid as usize).wrapping_add(step * 31) % self.threads
    }
}

fn history_size(history: &History) -> usize {
    8 + history.iter().map(|(_, v)| 8 + v.mem_size()).sum::<usize>()
}

fn pair_size(pair: &(History, Vec<Value>)) -> usize {
    history_size(&pair.0) + pair.1.iter().map(Value::mem_size).sum::<usize>()
}

/// Where one outgoing value must be processed.
enum Route {
    Stay,
    Worker(usize),
    Workers(SmallVec<[usize; 2]>),
}

/// Destination-driven locality: the operator consuming a value decides which
/// worker must host it.
fn route_value(plan: &QueryPlan, dst: usize, value: &Value, routing: &Routing) -> Route {
    let op = &plan.ops[dst];
    let workers = routing.workers;
    let by_vid = |v: &Value| -> Route {
        match v.as_int() {
            Ok(vid) => Route::Worker(Vid(vid as u32).owner(workers)),
            Err(_) => Route::Stay,
        }
    };
    let by_eid_out = |v: &Value| -> Route {
        match v.as_u64() {
            Ok(packed) => Route::Worker(Eid::from_value(packed).owner(workers)),
            Err(_) => Route::Stay,
        }
    };
    match op.kind {
        OpKind::Traversal => {
            if op.param_int(0) == 0 {
                by_vid(value)
            } else {
                // edge input: endpoints are derivable from the eid itself
                Route::Stay
            }
        }
        OpKind::Has
        | OpKind::HasLabel
        | OpKind::Properties
        | OpKind::Values
        | OpKind::Key
        | OpKind::Label
        | OpKind::Property
        | OpKind::Project => {
            if op.param_int(0) == 0 {
                by_vid(value)
            } else {
                by_eid_out(value)
            }
        }
        OpKind::Drop => {
            let is_property = op.param_int(1) == 1;
            if op.param_int(0) == 0 {
                if is_property {
                    // property payloads carry [pid, rendered] lists
                    match value {
                        Value::List(items) if !items.is_empty() => by_vid(&Value::Int(
                            (items[0].as_u64().unwrap_or(0) >> crate::types::PID_BITS) as i64,
                        )),
                        _ => Route::Stay,
                    }
                } else {
                    by_vid(value)
                }
            } else if is_property {
                match value {
                    Value::List(items) if !items.is_empty() => by_eid_out(&Value::Int(
                        (items[0].as_u64().unwrap_or(0) >> crate::types::PID_BITS) as i64,
                    )),
                    _ => Route::Stay,
                }
            } else {
                // an edge tombstone lands on both endpoint owners
                match value.as_u64() {
                    Ok(packed) => {
                        let eid = Eid::from_value(packed);
                        let mut targets: SmallVec<[usize; 2]> =
                            SmallVec::from_slice(&[eid.owner(workers)]);
                        let in_owner = eid.in_v.owner(workers);
                        if !targets.contains(&in_owner) {
                            targets.push(in_owner);
                        }
                        Route::Workers(targets)
                    }
                    Err(_) => Route::Stay,
                }
            }
        }
        OpKind::AddEdgeOut => by_eid_out(value),
        OpKind::AddEdgeIn => match value.as_u64() {
            Ok(packed) => Route::Worker(Eid::from_value(packed).in_v.owner(workers)),
            Err(_) => Route::Stay,
        },
        _ => Route::Stay,
    }
}

/// Splits one logical destination's payload into size-bounded chunks.
fn split_payload(data: Payload, max_size: usize) -> Vec<Payload> {
    let mut chunks = Vec::new();
    let mut current = Payload::new();
    let mut size = 0usize;
    for pair in data {
        let s = pair_size(&pair);
        if !current.is_empty() && size + s > max_size {
            chunks.push(std::mem::take(&mut current));
            size = 0;
        }
        size += s;
        current.push(pair);
    }
    if !chunks.is_empty() || !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(Payload::new());
    }
    chunks
}

/// One INIT per worker for scans and validation; a single seeded INIT at the
/// parent for `g.addV` / `g.addE` entries.
pub fn create_init_messages(
    plan: Arc<QueryPlan>,
    qid: u64,
    parent_nid: usize,
    routing: &Routing,
) -> Vec<Message> {
    let first = plan.ops[0].kind;
    let tid = routing.thread_of(qid, 0);
    let broadcast = matches!(
        first,
        OpKind::Init | OpKind::Validation | OpKind::Commit | OpKind::Index | OpKind::Config
    );
    let targets: Vec<usize> = if broadcast {
        (0..routing.workers).collect()
    } else {
        vec![parent_nid]
    };
    let path = targets.len().to_string();

    targets
        .into_iter()
        .map(|nid| Message {
            meta: Meta {
                qid,
                step: 0,
                sender_nid: parent_nid,
                sender_tid: routing.my_tid,
                recver_nid: nid,
                recver_tid: tid,
                parent_nid,
                parent_tid: routing.my_tid,
                msg_type: MsgType::Init,
                msg_path: path.clone(),
                branch_infos: Vec::new(),
            },
            plan: plan.clone(),
            data: if broadcast {
                Payload::new()
            } else {
                vec![(History::new(), Vec::new())]
            },
        })
        .collect()
}

/// The next-step builder: assigns each outgoing pair to a `(worker, thread)`
/// target, extends `msg_path` when fanning out, and emits an empty
/// keep-alive when an expert produced nothing (barrier completeness needs
/// every path accounted for).
pub fn create_next_messages(msg: &Message, data: Payload, routing: &Routing) -> Vec<Message> {
    let plan = &msg.plan;
    let cur = msg.meta.step;
    let dst = plan.ops[cur].next;
    debug_assert!(dst < plan.ops.len());
    let dst_kind = plan.ops[dst].kind;
    let tid = routing.thread_of(msg.meta.qid, dst);

    // count barriers receive pre-collapsed partial counts, not payloads
    let data = if dst_kind == OpKind::Count {
        data.into_iter()
            .map(|(his, values)| (his, vec![Value::Int(values.len() as i64)]))
            .collect()
    } else {
        data
    };

    let make = |nid: usize, tid: usize, msg_type: MsgType, data: Payload| Message {
        meta: Meta {
            qid: msg.meta.qid,
            step: dst,
            sender_nid: routing.my_nid,
            sender_tid: routing.my_tid,
            recver_nid: nid,
            recver_tid: tid,
            parent_nid: msg.meta.parent_nid,
            parent_tid: msg.meta.parent_tid,
            msg_type,
            msg_path: msg.meta.msg_path.clone(),
            branch_infos: msg.meta.branch_infos.clone(),
        },
        plan: msg.plan.clone(),
        data,
    };

    let mut out: Vec<Message> = if dst_kind.is_barrier() {
        split_payload(data, routing.max_data_size)
            .into_iter()
            .map(|chunk| make(msg.meta.parent_nid, tid, MsgType::Barrier, chunk))
            .collect()
    } else if dst_kind.is_branch() && dst < cur {
        // returning from a sub-chain: converge at the spawning worker
        let home = msg
            .meta
            .branch_infos
            .last()
            .map(|info| (info.home_nid, info.home_tid))
            .unwrap_or((msg.meta.parent_nid, tid));
        split_payload(data, routing.max_data_size)
            .into_iter()
            .map(|chunk| make(home.0, home.1, MsgType::Branch, chunk))
            .collect()
    } else if dst_kind.is_branch() {
        vec![make(routing.my_nid, tid, MsgType::Spawn, data)]
    } else if dst_kind == OpKind::Commit {
        // the commit decision reaches every worker
        (0..routing.workers)
            .map(|nid| make(nid, tid, MsgType::Feed, data.clone()))
            .collect()
    } else {
        // per-value locality grouping
        let mut groups: HashMap<usize, Payload> = HashMap::new();
        for (history, values) in data {
            let mut local: HashMap<usize, Vec<Value>> = HashMap::new();
            for value in values {
                match route_value(plan, dst, &value, routing) {
                    Route::Stay => local
                        .entry(routing.my_nid)
                        .or_default()
                        .push(value),
                    Route::Worker(nid) => local.entry(nid).or_default().push(value),
                    Route::Workers(nids) => {
                        for nid in nids {
                            local.entry(nid).or_default().push(value.clone());
                        }
                    }
                }
            }
            if local.is_empty() {
                // keep empty histories flowing toward the end barrier
                groups
                    .entry(routing.my_nid)
                    .or_default()
                    .push((history, Vec::new()));
            } else {
                for (nid, vals) in local {
                    groups.entry(nid).or_default().push((history.clone(), vals));
                }
            }
        }
        if groups.is_empty() {
            groups.insert(routing.my_nid, Payload::new());
        }
        let mut keys: Vec<usize> = groups.keys().copied().collect();
        keys.sort_unstable();
        keys.into_iter()
            .flat_map(|nid| {
                let payload = groups.remove(&nid).unwrap();
                split_payload(payload, routing.max_data_size)
                    .into_iter()
                    .map(move |chunk| (nid, chunk))
                    .collect::<Vec<_>>()
            })
            .map(|(nid, chunk)| make(nid, tid, MsgType::Feed, chunk))
            .collect()
    };

    if out.len() > 1 {
        let suffix = format!("\t{}", out.len());
        for m in &mut out {
            m.meta.msg_path.push_str(&suffix);
        }
    }
    out
}

/// The branch builder: one labelled clone of the inputs per sub-chain.
/// Branch-filter spawns flatten values into individually indexed pairs so
/// per-input verdicts can be counted bit-wise on return.
pub fn create_branch_messages(
    msg: &Message,
    sub_starts: &[usize],
    msg_id: u64,
    tag_inputs: bool,
    routing: &Routing,
) -> Vec<Message> {
    let branch_step = msg.meta.step as i64;
    let mut out = Vec::new();

    for (i, &sub_start) in sub_starts.iter().enumerate() {
        let data: Payload = if tag_inputs {
            let mut flattened = Payload::new();
            let mut data_index = 0i64;
            for (history, values) in &msg.data {
                for value in values {
                    let mut his = history.clone();
                    his.push((branch_step, Value::Int(data_index)));
                    flattened.push((his, vec![value.clone()]));
                    data_index += 1;
                }
                if values.is_empty() {
                    flattened.push((history.clone(), Vec::new()));
                }
            }
            flattened
        } else {
            msg.data.clone()
        };

        let mut info = msg.meta.branch_infos.clone();
        info.push(BranchInfo {
            key: branch_step,
            msg_id,
            index: i as i32 + 1,
            msg_path: msg.meta.msg_path.clone(),
            home_nid: routing.my_nid,
            home_tid: routing.my_tid,
        });

        // route like the next-step builder, but into the sub-chain head
        let sub_msg = Message {
            meta: Meta {
                step: sub_start,
                msg_type: MsgType::Feed,
                branch_infos: info,
                ..msg.meta.clone()
            },
            plan: msg.plan.clone(),
            data,
        };
        let mut routed = route_into_step(sub_msg, routing);
        out.append(&mut routed);
    }
    out
}

/// Routes an already-addressed message's payload by the locality of its own
/// step (used for branch sub-chain heads).
fn route_into_step(msg: Message, routing: &Routing) -> Vec<Message> {
    let step = msg.meta.step;
    let plan = msg.plan.clone();
    let mut groups: HashMap<usize, Payload> = HashMap::new();
    for (history, values) in msg.data.clone() {
        let mut local: HashMap<usize, Vec<Value>> = HashMap::new();
        for value in values {
            match route_value(&plan, step, &value, routing) {
                Route::Stay => local.entry(routing.my_nid).or_default().push(value),
                Route::Worker(nid) => local.entry(nid).or_default().push(value),
                Route::Workers(nids) => {
                    for nid in nids {
                        local.entry(nid).or_default().push(value.clone());
                    }
                }
            }
        }
        if local.is_empty() {
            groups
                .entry(routing.my_nid)
                .or_default()
                .push((history, Vec::new()));
        } else {
            for (nid, vals) in local {
                groups.entry(nid).or_default().push((history.clone(), vals));
            }
        }
    }
    if groups.is_empty() {
        groups.insert(routing.my_nid, Payload::new());
    }

    let tid = routing.thread_of(msg.meta.qid, step);
    let mut keys: Vec<usize> = groups.keys().copied().collect();
    keys.sort_unstable();
    let mut out: Vec<Message> = keys
        .into_iter()
        .map(|nid| {
            let mut m = msg.clone();
            m.meta.recver_nid = nid;
            m.meta.recver_tid = tid;
            m.meta.sender_nid = routing.my_nid;
            m.meta.sender_tid = routing.my_tid;
            m.data = groups.remove(&nid).unwrap();
            m
        })
        .collect();
    if out.len() > 1 {
        let suffix = format!("\t{}", out.len());
        for m in &mut out {
            m.meta.msg_path.push_str(&suffix);
        }
    }
    out
}

/// One EXIT per worker, broadcast when a query's results were delivered so
/// per-query side state (aggregate buffers) can be dropped.
pub fn create_exit_messages(msg: &Message, routing: &Routing) -> Vec<Message> {
    (0..routing.workers)
        .map(|nid| Message {
            meta: Meta {
                qid: msg.meta.qid,
                step: msg.meta.step,
                sender_nid: routing.my_nid,
                sender_tid: routing.my_tid,
                recver_nid: nid,
                recver_tid: routing.thread_of(msg.meta.qid, msg.meta.step),
                parent_nid: msg.meta.parent_nid,
                parent_tid: msg.meta.parent_tid,
                msg_type: MsgType::Exit,
                msg_path: String::new(),
                branch_infos: Vec::new(),
            },
            plan: msg.plan.clone(),
            data: Payload::new(),
        })
        .collect()
}

/// Converts the in-flight message into an ABORT delivered straight to the
/// end operator at the parent worker.
pub fn create_abort_message(msg: &Message, reason: &str, routing: &Routing) -> Message {
    let end_step = msg.plan.ops.len() - 1;
    Message {
        meta: Meta {
            qid: msg.meta.qid,
            step: end_step,
            sender_nid: routing.my_nid,
            sender_tid: routing.my_tid,
            recver_nid: msg.meta.parent_nid,
            recver_tid: routing.thread_of(msg.meta.qid, end_step),
            parent_nid: msg.meta.parent_nid,
            parent_tid: msg.meta.parent_tid,
            msg_type: MsgType::Abort,
            msg_path: msg.meta.msg_path.clone(),
            branch_infos: Vec::new(),
        },
        plan: msg.plan.clone(),
        data: vec![(History::new(), vec![Value::Str(reason.to_string())])],
    }
}

/// Feed message carrying aggregated side-effect data to every worker.
pub fn create_feed_messages(msg: &Message, se_key: i64, data: Vec<Value>, routing: &Routing) -> Vec<Message> {
    let mut tagged = History::new();
    tagged.push((se_key, Value::Int(0)));
    (0..routing.workers)
        .filter(|&nid| nid != routing.my_nid)
        .map(|nid| Message {
            meta: Meta {
                qid: msg.meta.qid,
                step: msg.meta.step,
                sender_nid: routing.my_nid,
                sender_tid: routing.my_tid,
                recver_nid: nid,
                recver_tid: routing.thread_of(msg.meta.qid, msg.meta.step),
                parent_nid: msg.meta.parent_nid,
                parent_tid: msg.meta.parent_tid,
                msg_type: MsgType::Feed,
                msg_path: String::new(),
                branch_infos: Vec::new(),
            },
            plan: msg.plan.clone(),
            data: vec![(tagged.clone(), data.clone())],
        })
        .collect()
}

/// The path-counter readiness check: strip trailing `"\t<n>"` fan-out marks,
/// each requiring `n` observed arrivals, until the path collapses to
/// `end_path`.
pub fn path_ready(
    counter: &mut HashMap<String, usize>,
    msg_path: &str,
    end_path: &str,
) -> bool {
    let mut path = msg_path.to_string();
    while path != end_path {
        let (head, tail) = match path.rfind('\t') {
            Some(i) => (path[..i].to_string(), &path[i + 1..]),
            None => (String::new(), path.as_str()),
        };
        let expected: usize = tail.parse().unwrap_or(1);
        let seen = counter.entry(path.clone()).or_insert(0);
        *seen += 1;
        if *seen == expected {
            *counter.get_mut(&path).unwrap() = 0;
            path = head;
        } else {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Operator;

    fn plan_of(kinds: &[OpKind]) -> Arc<QueryPlan> {
        let ops = kinds
            .iter()
            .enumerate()
            .map(|(i, &kind)| {
                let mut op = Operator::new(kind);
                op.next = i + 1;
                if kind == OpKind::Traversal {
                    op.params = vec![
                        Value::Int(0),
                        Value::Int(0),
                        Value::Int(1),
                        Value::Int(-1),
                    ];
                }
                op
            })
            .collect();
        Arc::new(QueryPlan {
            ops,
            ..QueryPlan::default()
        })
    }

    fn routing() -> Routing {
        Routing {
            workers: 2,
            threads: 4,
            max_data_size: 1 << 20,
            my_nid: 0,
            my_tid: 0,
        }
    }

    fn base_msg(plan: Arc<QueryPlan>) -> Message {
        Message {
            meta: Meta {
                qid: 42,
                step: 0,
                sender_nid: 0,
                sender_tid: 0,
                recver_nid: 0,
                recver_tid: 0,
                parent_nid: 0,
                parent_tid: 0,
                msg_type: MsgType::Feed,
                msg_path: "2".into(),
                branch_infos: Vec::new(),
            },
            plan,
            data: Payload::new(),
        }
    }

    #[test]
    fn values_partition_by_vertex_owner() {
        let plan = plan_of(&[OpKind::Init, OpKind::Traversal, OpKind::End]);
        let msg = base_msg(plan);
        let data = vec![(
            History::new(),
            vec![Value::Int(2), Value::Int(3), Value::Int(4)],
        )];
        let out = create_next_messages(&msg, data, &routing());
        assert_eq!(out.len(), 2);
        // vid 2 and 4 belong to worker 0, vid 3 to worker 1
        let w0 = out.iter().find(|m| m.meta.recver_nid == 0).unwrap();
        assert_eq!(w0.data[0].1, vec![Value::Int(2), Value::Int(4)]);
        // fan-out of two extends the path
        assert!(w0.meta.msg_path.ends_with("\t2"));
    }

    #[test]
    fn barrier_destination_is_parent() {
        let plan = plan_of(&[OpKind::Init, OpKind::Count, OpKind::End]);
        let mut msg = base_msg(plan);
        msg.meta.recver_nid = 1;
        let routing = Routing {
            my_nid: 1,
            ..routing()
        };
        let out = create_next_messages(&msg, vec![(History::new(), vec![Value::Int(9)])], &routing);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].meta.recver_nid, 0);
        assert_eq!(out[0].meta.msg_type, MsgType::Barrier);
        assert_eq!(out[0].meta.msg_path, "2");
    }

    #[test]
    fn empty_output_still_flows() {
        let plan = plan_of(&[OpKind::Init, OpKind::Count, OpKind::End]);
        let msg = base_msg(plan);
        let out = create_next_messages(&msg, Payload::new(), &routing());
        assert_eq!(out.len(), 1);
        assert!(out[0].data.is_empty() || out[0].data[0].1.is_empty());
    }

    #[test]
    fn oversized_payload_splits_and_extends_path() {
        let plan = plan_of(&[OpKind::Init, OpKind::Count, OpKind::End]);
        let msg = base_msg(plan);
        let routing = Routing {
            max_data_size: 64,
            ..routing()
        };
        let big: Payload = (0..16)
            .map(|i| (History::new(), vec![Value::Str(format!("padding-{i:04}"))]))
            .collect();
        let out = create_next_messages(&msg, big, &routing);
        assert!(out.len() > 1);
        let suffix = format!("\t{}", out.len());
        assert!(out.iter().all(|m| m.meta.msg_path.ends_with(&suffix)));
    }

    #[test]
    fn path_counter_collapses_fanout_tree() {
        let mut counter = HashMap::new();
        // a "2" root split into two, one side split again into two
        assert!(!path_ready(&mut counter, "2\t2", ""));
        assert!(!path_ready(&mut counter, "2\t2\t2", ""));
        assert!(!path_ready(&mut counter, "2", ""));
        assert!(path_ready(&mut counter, "2\t2\t2", ""));
    }

    #[test]
    fn branch_spawn_tags_inputs() {
        let plan = plan_of(&[
            OpKind::Init,
            OpKind::BranchFilter,
            OpKind::Has,
            OpKind::End,
        ]);
        let mut msg = base_msg(plan);
        msg.meta.step = 1;
        msg.data = vec![(History::new(), vec![Value::Int(1), Value::Int(2)])];
        let out = create_branch_messages(&msg, &[2], 7, true, &routing());
        assert_eq!(out.len(), 1);
        let spawned = &out[0];
        assert_eq!(spawned.data.len(), 2);
        assert_eq!(spawned.data[0].0[0], (1, Value::Int(0)));
        assert_eq!(spawned.data[1].0[0], (1, Value::Int(1)));
        let info = spawned.meta.branch_infos.last().unwrap();
        assert_eq!(info.msg_id, 7);
        assert_eq!(info.index, 1);
        assert_eq!(info.msg_path, "2");
    }
}
