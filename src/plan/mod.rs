pub mod parser;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use crate::types::Value;

/// Transaction write-kind bits; a transaction's kind is the union of its
/// lines.
pub const TRX_READONLY: u8 = 0;
pub const TRX_UPDATE: u8 = 1;
pub const TRX_ADD: u8 = 2;
pub const TRX_DELETE: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Init,
    Traversal,
    Has,
    HasLabel,
    Properties,
    Values,
    Key,
    Label,
    Is,
    Where,
    As,
    Select,
    AddV,
    AddE,
    /// Internal: inserts the authoritative out-side of a new edge on the
    /// worker owning its out vertex.
    AddEdgeOut,
    /// Internal: mirrors a new edge into the in-vertex's topology rows.
    AddEdgeIn,
    Property,
    Drop,
    Project,
    Count,
    Dedup,
    Group,
    Order,
    Range,
    Coin,
    Math,
    Aggregate,
    Cap,
    Union,
    Repeat,
    BranchFilter,
    End,
    Validation,
    PostValidation,
    Commit,
    Index,
    Config,
}

impl OpKind {
    /// Barrier operators collect all partial messages before emitting.
    pub fn is_barrier(self) -> bool {
        matches!(
            self,
            OpKind::End
                | OpKind::Aggregate
                | OpKind::Cap
                | OpKind::Count
                | OpKind::Dedup
                | OpKind::Group
                | OpKind::Order
                | OpKind::Range
                | OpKind::Coin
                | OpKind::Math
                | OpKind::PostValidation
        )
    }

    /// Branch operators spawn labelled sub-chains that re-converge.
    pub fn is_branch(self) -> bool {
        matches!(self, OpKind::Union | OpKind::Repeat | OpKind::BranchFilter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathKind {
    Sum,
    Max,
    Min,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDir {
    Incr,
    Decr,
}

/// Endpoint sourcing for `addE().from(..).to(..)`.
pub const ADD_E_NOT_APPLICABLE: i64 = 0;
pub const ADD_E_STEP_LABEL: i64 = 1;
pub const ADD_E_PLACEHOLDER: i64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct Operator {
    pub kind: OpKind,
    pub params: Vec<Value>,
    /// Index of the next operator in the chain. Branch sub-chains point back
    /// at their branch operator; the branch operator points past them.
    pub next: usize,
    /// Outputs are partitioned by element locality before sending.
    pub send_remote: bool,
}

impl Operator {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            params: Vec::new(),
            next: 0,
            send_remote: false,
        }
    }

    pub fn with_params(kind: OpKind, params: Vec<Value>) -> Self {
        Self {
            params,
            ..Self::new(kind)
        }
    }

    pub fn param_int(&self, idx: usize) -> i64 {
        self.params
            .get(idx)
            .and_then(|v| v.as_int().ok())
            .unwrap_or(-1)
    }
}

/// One query line lowered to an operator chain, plus the transaction info
/// every expert needs.
#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    pub query_index: u8,
    pub ops: Vec<Operator>,
    pub trx_id: u64,
    pub bt: u64,
    pub trx_type: u8,
}

impl QueryPlan {
    pub fn read_only(&self) -> bool {
        self.trx_type == TRX_READONLY
    }
}

/// Placeholder position: `(query, operator, param)`; param -1 appends at the
/// end of the operator's parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub query: u8,
    pub op: usize,
    pub param: i32,
}

/// A parsed multi-line transaction: ordered query plans, the dependency DAG,
/// and the placeholder splice map.
pub struct TrxPlan {
    pub trx_id: u64,
    pub bt: u64,
    pub trx_type: u8,
    pub query_plans: Vec<Option<QueryPlan>>,
    deps_count: HashMap<u8, usize>,
    topo: HashMap<u8, HashSet<u8>>,
    place_holder: HashMap<u8, Vec<Position>>,
    results: BTreeMap<u8, Vec<Value>>,
    received: usize,
    /// Abort reason once any query of this transaction aborted.
    pub abort_reason: Option<String>,
    pub start_time: Instant,
}

impl TrxPlan {
    pub fn new(trx_id: u64, bt: u64) -> Self {
        Self {
            trx_id,
            bt,
            trx_type: TRX_READONLY,
            query_plans: Vec::new(),
            deps_count: HashMap::new(),
            topo: HashMap::new(),
            place_holder: HashMap::new(),
            results: BTreeMap::new(),
            received: 0,
            abort_reason: None,
            start_time: Instant::now(),
        }
    }

    pub fn query_count(&self) -> usize {
        self.query_plans.len()
    }

    pub fn read_only(&self) -> bool {
        self.trx_type == TRX_READONLY
    }

    /// Records that `dst` cannot start before `src` finished.
    pub fn reg_dependency(&mut self, src: u8, dst: u8) {
        if self.topo.entry(src).or_default().insert(dst) {
            *self.deps_count.entry(dst).or_insert(0) += 1;
        }
    }

    /// Registers a parameter slot of `pos` to be spliced with `src`'s result.
    pub fn reg_place_holder(&mut self, src: u8, pos: Position) {
        self.place_holder.entry(src).or_default().push(pos);
        self.reg_dependency(src, pos.query);
    }

    pub(crate) fn ensure_dep_entry(&mut self, index: u8) {
        self.deps_count.entry(index).or_insert(0);
    }

    /// Feeds one finished query's results: fills placeholders, unblocks
    /// dependents and appends to the client-visible result set.
    pub fn fill_result(&mut self, query_index: u8, mut results: Vec<Value>) {
        for pos in self.place_holder.remove(&query_index).unwrap_or_default() {
            let Some(Some(plan)) = self.query_plans.get_mut(pos.query as usize) else {
                continue;
            };
            let op = &mut plan.ops[pos.op];
            let at = if pos.param < 0 {
                op.params.len()
            } else {
                pos.param as usize
            };
            match op.kind {
                // the entry operator splices the full input vector
                OpKind::Init => {
                    for (i, v) in results.iter().enumerate() {
                        op.params.insert(at + i, v.clone());
                    }
                }
                _ => {
                    let spliced = if results.len() == 1 {
                        results[0].clone()
                    } else {
                        Value::List(results.clone())
                    };
                    if at < op.params.len() {
                        op.params[at] = spliced;
                    } else {
                        op.params.push(spliced);
                    }
                }
            }
        }

        for dst in self.topo.remove(&query_index).unwrap_or_default() {
            if let Some(count) = self.deps_count.get_mut(&dst) {
                *count = count.saturating_sub(1);
            }
        }

        let entry = self.results.entry(query_index).or_default();
        entry.push(Value::Str(format!("Query {}: ", query_index + 1)));
        entry.append(&mut results);
        self.received += 1;
    }

    /// Marks a query finished without touching placeholders or results, used
    /// when skipping the remainder of an aborted transaction.
    pub fn skip_query(&mut self, query_index: u8) {
        self.place_holder.remove(&query_index);
        for dst in self.topo.remove(&query_index).unwrap_or_default() {
            if let Some(count) = self.deps_count.get_mut(&dst) {
                *count = count.saturating_sub(1);
            }
        }
        self.received += 1;
    }

    pub fn finished(&self) -> bool {
        self.received == self.query_plans.len()
    }

    /// Extracts every query whose dependency count reached zero.
    pub fn next_queries(&mut self) -> Vec<QueryPlan> {
        let mut ready: Vec<u8> = self
            .deps_count
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| *idx)
            .collect();
        ready.sort_unstable();

        let mut out = Vec::new();
        for idx in ready {
            self.deps_count.remove(&idx);
            if let Some(plan) = self.query_plans[idx as usize].take() {
                let mut plan = plan;
                plan.query_index = idx;
                plan.trx_id = self.trx_id;
                plan.bt = self.bt;
                plan.trx_type = self.trx_type;
                out.push(plan);
            }
        }
        out
    }

    /// Query results concatenated in line order.
    pub fn final_result(&self) -> Vec<Value> {
        self.results
            .values()
            .flat_map(|vals| vals.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_lines(n: usize) -> TrxPlan {
        let mut plan = TrxPlan::new(0x8000_0000_0000_0100, 1);
        for i in 0..n {
            plan.ensure_dep_entry(i as u8);
            plan.query_plans.push(Some(QueryPlan {
                ops: vec![Operator::new(OpKind::Init)],
                ..QueryPlan::default()
            }));
        }
        plan
    }

    #[test]
    fn dependency_release_order() {
        let mut plan = plan_with_lines(3);
        plan.reg_dependency(0, 1);
        plan.reg_dependency(0, 2);
        plan.reg_dependency(1, 2);

        let first: Vec<u8> = plan.next_queries().iter().map(|q| q.query_index).collect();
        assert_eq!(first, vec![0]);
        assert!(plan.next_queries().is_empty());

        plan.fill_result(0, vec![Value::Int(1)]);
        let second: Vec<u8> = plan.next_queries().iter().map(|q| q.query_index).collect();
        assert_eq!(second, vec![1]);

        plan.fill_result(1, vec![]);
        let third: Vec<u8> = plan.next_queries().iter().map(|q| q.query_index).collect();
        assert_eq!(third, vec![2]);
    }

    #[test]
    fn placeholder_splicing() {
        let mut plan = plan_with_lines(2);
        plan.reg_place_holder(
            0,
            Position {
                query: 1,
                op: 0,
                param: 2,
            },
        );
        // init params: [elem_type, with_input]
        plan.query_plans[1].as_mut().unwrap().ops[0].params =
            vec![Value::Int(0), Value::Int(1)];
        plan.next_queries();
        plan.fill_result(0, vec![Value::Int(4), Value::Int(6)]);

        let released = plan.next_queries();
        assert_eq!(released.len(), 1);
        assert_eq!(
            released[0].ops[0].params,
            vec![
                Value::Int(0),
                Value::Int(1),
                Value::Int(4),
                Value::Int(6)
            ]
        );
    }
}
