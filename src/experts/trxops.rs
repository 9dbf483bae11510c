use tracing::{debug, info};

use crate::config::IsolationLevel;
use crate::experts::WorkerContext;
use crate::message::{History, Message};
use crate::types::{ElementKind, Value};

/// Validates this worker's slice of the transaction against the recent
/// committed transactions in `(bt, ct - 1]`: write/write overlap always
/// conflicts, read/write overlap conflicts under SERIALIZABLE.
pub fn process_validation(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let trx_id = plan.trx_id;
    let bt = plan.bt;
    let ct = plan.ops[msg.meta.step].param_int(0) as u64;

    let ok = if plan.read_only() {
        true
    } else {
        let (reads, writes) = ctx.storage.rw_sets(trx_id);
        let mut ok = true;
        'check: for other in ctx.rct.query_trx(bt + 1, ct.saturating_sub(1)) {
            if other == trx_id {
                continue;
            }
            let Some(their_writes) = ctx.storage.committed_write_set(other) else {
                continue;
            };
            for key in their_writes.iter() {
                if writes.contains(key) {
                    debug!(trx_id, other, "validation failed on write/write overlap");
                    ok = false;
                    break 'check;
                }
                if ctx.isolation() == IsolationLevel::Serializable && reads.contains(key) {
                    debug!(trx_id, other, "validation failed on read/write overlap");
                    ok = false;
                    break 'check;
                }
            }
        }
        ok
    };

    ctx.forward(
        tid,
        &msg,
        vec![(History::new(), vec![Value::Int(ok as i64)])],
    );
}

/// Applies the commit/abort decision to local storage. The decision rides in
/// the payload on the normal path and in the operator parameters when the
/// scheduler broadcasts an abort directly.
pub fn process_commit(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let trx_id = plan.trx_id;
    let decision = msg
        .data
        .first()
        .and_then(|(_, vals)| vals.first())
        .and_then(|v| v.as_int().ok())
        .unwrap_or_else(|| op.param_int(0));
    let ct = op.param_int(1) as u64;

    if decision == 1 {
        ctx.storage.commit(tid, trx_id, ct);
        if !plan.read_only() {
            ctx.rct.insert_trx(ct, trx_id);
        }
    } else {
        ctx.storage.abort(tid, trx_id);
    }

    ctx.forward(
        tid,
        &msg,
        vec![(History::new(), vec![Value::Int(decision)])],
    );
}

/// BuildIndex(V|E, key): rebuilds the local secondary index.
pub fn process_index(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let kind = if op.param_int(0) == 1 {
        ElementKind::Edge
    } else {
        ElementKind::Vertex
    };
    let pkey = op.param_int(1).max(0) as u16;
    ctx.index_store
        .build(&ctx.storage, tid, kind, pkey, plan.trx_id, plan.bt);
    info!(rank = ctx.rank, ?kind, pkey, "BuildIndex applied");

    ctx.forward(
        tid,
        &msg,
        vec![(
            History::new(),
            vec![Value::Str("Build index done".to_string())],
        )],
    );
}

/// SetConfig(name, value): toggles a runtime flag on this worker.
pub fn process_config(ctx: &WorkerContext, tid: usize, msg: Message) {
    let plan = msg.plan.clone();
    let op = &plan.ops[msg.meta.step];
    let name = op.params[0].to_string();
    let enable = matches!(op.params[1].to_string().as_str(), "t" | "true" | "1");

    let reply = match ctx.flags.set(&name, enable) {
        Ok(()) => format!("Set config {name}={enable}"),
        Err(e) => format!("Set config failed: {e}"),
    };
    ctx.forward(tid, &msg, vec![(History::new(), vec![Value::Str(reply)])]);
}
