pub(crate) mod barrier;
pub(crate) mod branch;
pub(crate) mod filter;
pub(crate) mod init;
pub(crate) mod modify;
pub(crate) mod projection;
pub(crate) mod traversal;
pub(crate) mod trxops;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crossbeam_channel::Sender;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::{Config, IsolationLevel, RuntimeFlags};
use crate::coordinator::Coordinator;
use crate::index::IndexStore;
use crate::mailbox::Mailbox;
use crate::message::{
    create_abort_message, create_next_messages, History, Message, MsgType, Payload, Routing,
};
use crate::plan::OpKind;
use crate::storage::DataStorage;
use crate::trx::RctIndex;
use crate::types::Value;

/// Events an expert raises toward its worker's scheduler thread.
#[derive(Debug)]
pub enum WorkerEvent {
    QueryDone {
        qid: u64,
        results: Vec<Value>,
        abort_reason: Option<String>,
    },
}

/// Barrier/branch accumulator key: `(qid, branch msg id, branch index)`.
pub type MKey = (u64, u64, i32);

/// Partial state of one barrier collection.
pub struct BarrierCell<T> {
    pub path_counter: HashMap<String, usize>,
    pub data: T,
}

impl<T: Default> Default for BarrierCell<T> {
    fn default() -> Self {
        Self {
            path_counter: HashMap::new(),
            data: T::default(),
        }
    }
}

/// Everything an expert may touch, threaded explicitly instead of living in
/// process-wide singletons.
pub struct WorkerContext {
    pub rank: usize,
    pub config: Arc<Config>,
    pub storage: Arc<DataStorage>,
    pub mailbox: Arc<dyn Mailbox>,
    pub coordinator: Arc<Coordinator>,
    pub index_store: Arc<IndexStore>,
    pub flags: Arc<RuntimeFlags>,
    pub rct: Arc<RctIndex>,
    pub control_tx: Sender<WorkerEvent>,

    /// Side-effect buffers filled by aggregate() and consumed by cap()/where().
    pub(crate) agg_store: DashMap<(u64, i64), Vec<Value>>,

    // barrier partial states, one table per accumulator shape
    pub(crate) end_states: DashMap<MKey, BarrierCell<barrier::EndState>>,
    pub(crate) count_states: DashMap<MKey, BarrierCell<barrier::CountState>>,
    pub(crate) dedup_states: DashMap<MKey, BarrierCell<barrier::DedupState>>,
    pub(crate) group_states: DashMap<MKey, BarrierCell<barrier::GroupState>>,
    pub(crate) order_states: DashMap<MKey, BarrierCell<barrier::OrderState>>,
    pub(crate) range_states: DashMap<MKey, BarrierCell<barrier::RangeState>>,
    pub(crate) math_states: DashMap<MKey, BarrierCell<barrier::MathState>>,
    pub(crate) agg_states: DashMap<MKey, BarrierCell<barrier::AggState>>,
    pub(crate) cap_states: DashMap<MKey, BarrierCell<()>>,
    pub(crate) validation_states: DashMap<MKey, BarrierCell<barrier::ValidationState>>,

    // branch collection state
    pub(crate) branch_data: DashMap<MKey, Payload>,
    pub(crate) branch_counters: DashMap<MKey, HashMap<i64, u32>>,
    pub(crate) branch_paths: DashMap<MKey, (HashMap<String, usize>, usize)>,
    pub(crate) branch_msg_ids: AtomicU64,
    /// Serializes concurrent returns for one branch key.
    pub(crate) branch_locks: Mutex<()>,

    // per-worker read/write audit counters
    elements_read: AtomicU64,
    elements_written: AtomicU64,
}

impl WorkerContext {
    pub fn isolation(&self) -> IsolationLevel {
        self.config.isolation
    }

    pub fn routing(&self, tid: usize) -> Routing {
        Routing {
            workers: self.config.num_workers,
            threads: self.config.num_expert_threads,
            max_data_size: self.config.max_data_size,
            my_nid: self.rank,
            my_tid: tid,
        }
    }

    /// Forwards `data` along the operator chain.
    pub fn forward(&self, tid: usize, msg: &Message, data: Payload) {
        let routing = self.routing(tid);
        for out in create_next_messages(msg, data, &routing) {
            self.mailbox.send(out);
        }
    }

    /// Converts the in-flight message into an ABORT toward the end operator.
    pub fn abort_query(&self, tid: usize, msg: &Message, reason: &str) {
        warn!(qid = msg.meta.qid, reason, "operator abort");
        let routing = self.routing(tid);
        self.mailbox.send(create_abort_message(msg, reason, &routing));
    }

    /// Audit hook counting element reads and writes flowing through this
    /// worker's experts.
    pub fn push_rw_record(&self, _trx_id: u64, count: usize, is_read: bool) {
        use std::sync::atomic::Ordering;
        if is_read {
            self.elements_read.fetch_add(count as u64, Ordering::Relaxed);
        } else {
            self.elements_written.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// `(reads, writes)` audit totals.
    pub fn rw_record(&self) -> (u64, u64) {
        use std::sync::atomic::Ordering;
        (
            self.elements_read.load(Ordering::Relaxed),
            self.elements_written.load(Ordering::Relaxed),
        )
    }

    /// Drops per-query side state once a query's results were delivered.
    pub fn clean_query_state(&self, qid: u64) {
        self.agg_store.retain(|(q, _), _| *q != qid);
        self.end_states.retain(|(q, _, _), _| *q != qid);
        self.count_states.retain(|(q, _, _), _| *q != qid);
        self.dedup_states.retain(|(q, _, _), _| *q != qid);
        self.group_states.retain(|(q, _, _), _| *q != qid);
        self.order_states.retain(|(q, _, _), _| *q != qid);
        self.range_states.retain(|(q, _, _), _| *q != qid);
        self.math_states.retain(|(q, _, _), _| *q != qid);
        self.agg_states.retain(|(q, _, _), _| *q != qid);
        self.cap_states.retain(|(q, _, _), _| *q != qid);
        self.validation_states.retain(|(q, _, _), _| *q != qid);
        self.branch_data.retain(|(q, _, _), _| *q != qid);
        self.branch_counters.retain(|(q, _, _), _| *q != qid);
        self.branch_paths.retain(|(q, _, _), _| *q != qid);
    }
}

pub fn new_context(
    rank: usize,
    config: Arc<Config>,
    storage: Arc<DataStorage>,
    mailbox: Arc<dyn Mailbox>,
    coordinator: Arc<Coordinator>,
    index_store: Arc<IndexStore>,
    flags: Arc<RuntimeFlags>,
    rct: Arc<RctIndex>,
    control_tx: Sender<WorkerEvent>,
) -> WorkerContext {
    WorkerContext {
        rank,
        config,
        storage,
        mailbox,
        coordinator,
        index_store,
        flags,
        rct,
        control_tx,
        agg_store: DashMap::new(),
        end_states: DashMap::new(),
        count_states: DashMap::new(),
        dedup_states: DashMap::new(),
        group_states: DashMap::new(),
        order_states: DashMap::new(),
        range_states: DashMap::new(),
        math_states: DashMap::new(),
        agg_states: DashMap::new(),
        cap_states: DashMap::new(),
        validation_states: DashMap::new(),
        branch_data: DashMap::new(),
        branch_counters: DashMap::new(),
        branch_paths: DashMap::new(),
        branch_msg_ids: AtomicU64::new(1),
        branch_locks: Mutex::new(()),
        elements_read: AtomicU64::new(0),
        elements_written: AtomicU64::new(0),
    }
}

/// Adapter dispatch: one message in, zero or more messages (or a worker
/// event) out. Called by each expert thread with its own `tid`.
pub fn process(ctx: &WorkerContext, tid: usize, mut msg: Message) {
    match msg.meta.msg_type {
        MsgType::Exit => {
            ctx.clean_query_state(msg.meta.qid);
            return;
        }
        MsgType::Abort => {
            barrier::process_abort(ctx, tid, &msg);
            return;
        }
        MsgType::Feed
            if msg.plan.ops.get(msg.meta.step).map(|op| op.kind) == Some(OpKind::Aggregate) =>
        {
            // chain messages into an aggregate barrier arrive as BARRIER;
            // a FEED here carries another worker's aggregated side effects
            if let Some((his, values)) = msg.data.pop() {
                let key = his.first().map(|(k, _)| *k).unwrap_or(-1);
                ctx.agg_store
                    .entry((msg.meta.qid, key))
                    .or_default()
                    .extend(values);
            }
            return;
        }
        _ => {}
    }

    dispatch(ctx, tid, msg);
}

pub(crate) fn dispatch(ctx: &WorkerContext, tid: usize, msg: Message) {
    let step = msg.meta.step;
    let Some(op) = msg.plan.ops.get(step) else {
        warn!(qid = msg.meta.qid, step, "message past the operator chain");
        return;
    };
    match op.kind {
        OpKind::Init => init::process(ctx, tid, msg),
        OpKind::Traversal => traversal::process(ctx, tid, msg),
        OpKind::Has => filter::process_has(ctx, tid, msg),
        OpKind::HasLabel => filter::process_has_label(ctx, tid, msg),
        OpKind::Is => filter::process_is(ctx, tid, msg),
        OpKind::Where => filter::process_where(ctx, tid, msg),
        OpKind::Properties => projection::process_properties(ctx, tid, msg),
        OpKind::Values => projection::process_values(ctx, tid, msg),
        OpKind::Key => projection::process_key(ctx, tid, msg),
        OpKind::Label => projection::process_label(ctx, tid, msg),
        OpKind::Project => projection::process_project(ctx, tid, msg),
        OpKind::As => projection::process_as(ctx, tid, msg),
        OpKind::Select => projection::process_select(ctx, tid, msg),
        OpKind::AddV => modify::process_add_v(ctx, tid, msg),
        OpKind::AddE => modify::process_add_e(ctx, tid, msg),
        OpKind::AddEdgeOut => modify::process_add_edge_out(ctx, tid, msg),
        OpKind::AddEdgeIn => modify::process_add_edge_in(ctx, tid, msg),
        OpKind::Property => modify::process_property(ctx, tid, msg),
        OpKind::Drop => modify::process_drop(ctx, tid, msg),
        OpKind::Union | OpKind::Repeat => branch::process_union(ctx, tid, msg),
        OpKind::BranchFilter => branch::process_branch_filter(ctx, tid, msg),
        OpKind::Validation => trxops::process_validation(ctx, tid, msg),
        OpKind::Commit => trxops::process_commit(ctx, tid, msg),
        OpKind::Index => trxops::process_index(ctx, tid, msg),
        OpKind::Config => trxops::process_config(ctx, tid, msg),
        kind if kind.is_barrier() => barrier::process(ctx, tid, msg),
        kind => {
            warn!(?kind, "no expert registered for operator");
        }
    }
}

/// Innermost branch key for history bucketing, -1 outside any branch.
pub(crate) fn branch_key_of(msg: &Message) -> i64 {
    msg.meta
        .branch_infos
        .last()
        .map(|info| info.key)
        .unwrap_or(-1)
}

/// Looks up (and optionally truncates after) the history entry for `key`.
pub(crate) fn history_value(his: &mut History, key: i64, erase_after: bool) -> Option<Value> {
    if key < 0 {
        return None;
    }
    let pos = his.iter().position(|(k, _)| *k == key)?;
    let value = his[pos].1.clone();
    if erase_after {
        his.truncate(pos + 1);
    }
    Some(value)
}

/// Branch-assigned input index of a history, -1 when unbranched.
pub(crate) fn branch_value(his: &mut History, key: i64, erase_after: bool) -> i64 {
    history_value(his, key, erase_after)
        .and_then(|v| v.as_int().ok())
        .unwrap_or(-1)
}
