use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::{Config, RuntimeFlags};
use crate::coordinator::{qid_of, trx_of_qid, Coordinator};
use crate::error::{GraphError, Result};
use crate::experts::{self, WorkerContext, WorkerEvent};
use crate::index::IndexStore;
use crate::mailbox::Mailbox;
use crate::message::{create_init_messages, Message, Routing};
use crate::plan::parser::{Parser, ParserOptions};
use crate::plan::{OpKind, Operator, TrxPlan};
use crate::storage::DataStorage;
use crate::trx::{RctIndex, TableWrite, TableWriter, TransactionTable};
use crate::types::Value;

/// Reply returned to the submitting client.
#[derive(Debug, Clone, PartialEq)]
pub struct TrxReply {
    pub results: Vec<String>,
    pub elapsed_micros: u64,
    pub aborted: bool,
}

/// A client request entering this worker's scheduler.
pub struct Submit {
    pub query: String,
    pub reply: Sender<TrxReply>,
}

struct ActiveTrx {
    plan: TrxPlan,
    reply: Sender<TrxReply>,
    released: HashSet<u8>,
    final_index: Option<u8>,
    commit_time: Option<u64>,
    /// Decision observed from the synthetic commit query.
    committed: bool,
    validating: bool,
}

/// One worker's scheduler: parses transactions, releases query levels,
/// drives validation and finalizes commit/abort.
pub struct Scheduler {
    rank: usize,
    config: Arc<Config>,
    ctx: Arc<WorkerContext>,
    coordinator: Arc<Coordinator>,
    table: Arc<TransactionTable>,
    table_writer: Arc<TableWriter>,
    active: std::collections::HashMap<u64, ActiveTrx>,
    finished_since_sweep: usize,
}

const SWEEP_EVERY: usize = 32;

impl Scheduler {
    fn routing(&self) -> Routing {
        Routing {
            workers: self.config.num_workers,
            threads: self.config.num_expert_threads,
            max_data_size: self.config.max_data_size,
            my_nid: self.rank,
            my_tid: 0,
        }
    }

    fn on_submit(&mut self, submit: Submit) {
        let trx_id = self.coordinator.register_trx(self.rank);
        let bt = self.coordinator.allocate_bt(trx_id);
        let mut plan = TrxPlan::new(trx_id, bt);

        let options = ParserOptions {
            enable_step_reorder: self.ctx.flags.step_reorder(),
            enable_indexing: self.ctx.flags.indexing(),
            index_ratio: self.config.index_ratio,
        };
        let parse_result = {
            let mut parser = Parser::new(
                &self.ctx.storage.schema,
                Some(self.ctx.index_store.as_ref()),
                options,
            );
            parser.parse(&submit.query, &mut plan)
        };

        if let Err(err) = parse_result {
            self.coordinator.retire_bt(bt);
            self.coordinator.forget_trx(trx_id);
            let _ = submit.reply.send(TrxReply {
                results: vec![err.to_string()],
                elapsed_micros: plan.start_time.elapsed().as_micros() as u64,
                aborted: true,
            });
            return;
        }

        info!(rank = self.rank, trx_id, bt, query = %submit.query, "transaction registered");
        self.table_writer.send(TableWrite::Insert {
            trx_id,
            bt,
            readonly: plan.read_only(),
        });

        self.active.insert(
            trx_id,
            ActiveTrx {
                plan,
                reply: submit.reply,
                released: HashSet::new(),
                final_index: None,
                commit_time: None,
                committed: false,
                validating: false,
            },
        );
        self.release(trx_id);
    }

    /// Releases every query whose dependency count reached zero; aborted
    /// transactions skip straight to the abort broadcast.
    fn release(&mut self, trx_id: u64) {
        let routing = self.routing();
        loop {
            let Some(state) = self.active.get_mut(&trx_id) else {
                return;
            };
            let ready = state.plan.next_queries();
            if ready.is_empty() {
                break;
            }
            for mut qplan in ready {
                let index = qplan.query_index;
                let is_final = qplan.ops.first().map(|op| op.kind) == Some(OpKind::Validation);

                if state.plan.abort_reason.is_some() && !is_final {
                    state.plan.skip_query(index);
                    continue;
                }

                if is_final {
                    state.final_index = Some(index);
                    if state.plan.abort_reason.is_some() {
                        qplan.ops = abort_apply_ops();
                    } else {
                        let ct = self.coordinator.allocate_ct(trx_id);
                        state.commit_time = Some(ct);
                        state.validating = true;
                        self.table_writer.send(TableWrite::Validate { trx_id, ct });
                        qplan.ops[0].params = vec![Value::Int(ct as i64)];
                        qplan.ops[2].params = vec![Value::Int(1), Value::Int(ct as i64)];
                    }
                }

                state.released.insert(index);
                let qid = qid_of(trx_id, index);
                debug!(rank = self.rank, qid, index, "query released");
                let plan = Arc::new(qplan);
                for msg in create_init_messages(plan, qid, self.rank, &routing) {
                    self.ctx.mailbox.send(msg);
                }
            }
        }

        let finished = self
            .active
            .get(&trx_id)
            .map(|s| s.plan.finished())
            .unwrap_or(false);
        if finished {
            self.finalize(trx_id);
        }
    }

    fn on_query_done(&mut self, qid: u64, results: Vec<Value>, abort_reason: Option<String>) {
        let (trx_id, index) = trx_of_qid(qid);
        let Some(state) = self.active.get_mut(&trx_id) else {
            return;
        };
        if !state.released.remove(&index) {
            // stray or duplicate completion of an already-settled query
            return;
        }

        if state.final_index == Some(index) {
            let decision = abort_reason.is_none()
                && results
                    .first()
                    .and_then(|v| v.as_int().ok())
                    .unwrap_or(0)
                    == 1;
            state.committed = decision && state.plan.abort_reason.is_none();
            if !decision && state.plan.abort_reason.is_none() {
                state.plan.abort_reason =
                    Some("Abort with [Validation] conflicting commit".to_string());
            }
            state.plan.skip_query(index);
        } else if let Some(reason) = abort_reason {
            warn!(rank = self.rank, qid, %reason, "query aborted");
            if state.plan.abort_reason.is_none() {
                state.plan.abort_reason = Some(format!("Abort with [Processing] {reason}"));
            }
            state.plan.skip_query(index);
        } else {
            state.plan.fill_result(index, results);
        }

        self.release(trx_id);
    }

    fn finalize(&mut self, trx_id: u64) {
        let Some(state) = self.active.remove(&trx_id) else {
            return;
        };
        let bt = state.plan.bt;
        let elapsed = state.plan.start_time.elapsed().as_micros() as u64;

        if state.committed {
            self.table_writer.send(TableWrite::Finish {
                trx_id,
                committed: true,
                gc_ts: state.commit_time.unwrap_or(bt),
            });
        } else if state.validating {
            self.table_writer.send(TableWrite::Finish {
                trx_id,
                committed: false,
                gc_ts: state.commit_time.unwrap_or(bt),
            });
        } else {
            self.table_writer.send(TableWrite::AbortProcessing {
                trx_id,
                gc_ts: bt,
            });
        }
        self.coordinator.retire_bt(bt);
        self.coordinator.forget_trx(trx_id);

        let reply = match &state.plan.abort_reason {
            Some(reason) => TrxReply {
                results: vec![reason.clone()],
                elapsed_micros: elapsed,
                aborted: true,
            },
            None => TrxReply {
                results: state
                    .plan
                    .final_result()
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
                elapsed_micros: elapsed,
                aborted: false,
            },
        };
        info!(
            rank = self.rank,
            trx_id,
            committed = state.committed,
            elapsed,
            "transaction finished"
        );
        let _ = state.reply.send(reply);

        self.finished_since_sweep += 1;
        if self.finished_since_sweep >= SWEEP_EVERY {
            self.finished_since_sweep = 0;
            self.sweep();
        }
    }

    /// Garbage collection against the minimum active begin time: erases
    /// finished table slots, prunes the RCT and drops dead write sets.
    fn sweep(&mut self) {
        let min_bt = self.coordinator.min_active_bt();
        self.table_writer
            .send(TableWrite::Sweep { min_active_bt: min_bt });
        self.ctx.rct.prune(min_bt);
        let live: HashSet<u64> = self
            .ctx
            .rct
            .query_trx(min_bt, u64::MAX)
            .into_iter()
            .collect();
        self.ctx
            .storage
            .sweep_committed_writes(|trx| live.contains(&trx));
        debug!(rank = self.rank, min_bt, "gc sweep");
    }

    pub fn table(&self) -> Arc<TransactionTable> {
        self.table.clone()
    }
}

/// The synthetic query broadcast to undo an aborted transaction's writes.
fn abort_apply_ops() -> Vec<Operator> {
    let mut commit = Operator::new(OpKind::Commit);
    commit.params = vec![Value::Int(0), Value::Int(0)];
    commit.next = 1;
    let mut end = Operator::new(OpKind::End);
    end.next = 2;
    vec![commit, end]
}

/// One worker: expert threads pulling from their mailbox queues plus the
/// scheduler thread driving transactions.
pub struct Worker {
    pub rank: usize,
    pub submit_tx: Sender<Submit>,
    pub table: Arc<TransactionTable>,
    pub storage: Arc<DataStorage>,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_worker(
    rank: usize,
    config: Arc<Config>,
    storage: Arc<DataStorage>,
    mailbox: Arc<dyn Mailbox>,
    mailbox_queues: Vec<Receiver<Message>>,
    coordinator: Arc<Coordinator>,
) -> Worker {
    let flags = Arc::new(RuntimeFlags::new(&config));
    let index_store = Arc::new(IndexStore::new());
    let rct = Arc::new(RctIndex::new());
    let table = Arc::new(TransactionTable::new(
        config.trx_main_buckets,
        config.trx_indirect_buckets,
    ));
    let table_writer = Arc::new(TableWriter::spawn(table.clone()));

    let (event_tx, event_rx) = crossbeam_channel::unbounded::<WorkerEvent>();
    let (submit_tx, submit_rx) = crossbeam_channel::unbounded::<Submit>();

    let ctx = Arc::new(experts::new_context(
        rank,
        config.clone(),
        storage.clone(),
        mailbox,
        coordinator.clone(),
        index_store,
        flags,
        rct,
        event_tx,
    ));

    for (tid, queue) in mailbox_queues.into_iter().enumerate() {
        let ctx = ctx.clone();
        std::thread::Builder::new()
            .name(format!("w{rank}-expert{tid}"))
            .spawn(move || {
                while let Ok(msg) = queue.recv() {
                    experts::process(&ctx, tid, msg);
                }
            })
            .expect("spawn expert thread");
    }

    {
        let ctx = ctx.clone();
        let config = config.clone();
        let table = table.clone();
        std::thread::Builder::new()
            .name(format!("w{rank}-scheduler"))
            .spawn(move || {
                let mut scheduler = Scheduler {
                    rank,
                    config,
                    ctx,
                    coordinator,
                    table,
                    table_writer,
                    active: std::collections::HashMap::new(),
                    finished_since_sweep: 0,
                };
                loop {
                    select! {
                        recv(submit_rx) -> submit => match submit {
                            Ok(submit) => scheduler.on_submit(submit),
                            Err(_) => break,
                        },
                        recv(event_rx) -> event => match event {
                            Ok(WorkerEvent::QueryDone { qid, results, abort_reason }) => {
                                scheduler.on_query_done(qid, results, abort_reason)
                            }
                            Err(_) => break,
                        },
                    }
                }
            })
            .expect("spawn scheduler thread");
    }

    Worker {
        rank,
        submit_tx,
        table,
        storage,
    }
}

impl Worker {
    /// Submits a transaction to this worker and waits for the reply.
    pub fn submit(&self, query: &str) -> Result<TrxReply> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.submit_tx
            .send(Submit {
                query: query.to_string(),
                reply: tx,
            })
            .map_err(|_| GraphError::Transport("worker scheduler is gone".into()))?;
        rx.recv_timeout(std::time::Duration::from_secs(30))
            .map_err(|_| GraphError::Transport("timed out waiting for reply".into()))
    }
}
