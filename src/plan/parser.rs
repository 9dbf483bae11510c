use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::index::IndexStore;
use crate::plan::{
    OpKind, Operator, Position, QueryPlan, TrxPlan, ADD_E_NOT_APPLICABLE, ADD_E_PLACEHOLDER,
    ADD_E_STEP_LABEL, TRX_ADD, TRX_DELETE, TRX_UPDATE,
};
use crate::predicate::{Predicate, PredicateKind};
use crate::schema::SchemaIndex;
use crate::types::{ElementKind, Value};

/// Output type of a (partial) traversal, used for step type checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IoType {
    Vertex,
    Edge,
    Int,
    Double,
    Char,
    Str,
    Collection,
    VertexProp,
    EdgeProp,
}

impl IoType {
    fn is_element(self) -> bool {
        matches!(self, IoType::Vertex | IoType::Edge)
    }

    fn is_number(self) -> bool {
        matches!(self, IoType::Int | IoType::Double)
    }

    fn is_value(self) -> bool {
        matches!(self, IoType::Int | IoType::Double | IoType::Char | IoType::Str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Step {
    In,
    Out,
    Both,
    InE,
    OutE,
    BothE,
    InV,
    OutV,
    BothV,
    AddE,
    AddV,
    And,
    Aggregate,
    As,
    Cap,
    Coin,
    Count,
    Dedup,
    Drop,
    From,
    Group,
    GroupCount,
    Has,
    HasLabel,
    HasKey,
    HasValue,
    HasNot,
    Is,
    Key,
    Label,
    Limit,
    Max,
    Mean,
    Min,
    Not,
    Or,
    Order,
    Property,
    Properties,
    Range,
    Repeat,
    Select,
    Skip,
    Sum,
    To,
    Union,
    Values,
    Where,
}

fn step_of(name: &str) -> Option<Step> {
    Some(match name {
        "in" => Step::In,
        "out" => Step::Out,
        "both" => Step::Both,
        "inE" => Step::InE,
        "outE" => Step::OutE,
        "bothE" => Step::BothE,
        "inV" => Step::InV,
        "outV" => Step::OutV,
        "bothV" => Step::BothV,
        "addE" => Step::AddE,
        "addV" => Step::AddV,
        "and" => Step::And,
        "aggregate" => Step::Aggregate,
        "as" => Step::As,
        "cap" => Step::Cap,
        "coin" => Step::Coin,
        "count" => Step::Count,
        "dedup" => Step::Dedup,
        "drop" => Step::Drop,
        "from" => Step::From,
        "group" => Step::Group,
        "groupCount" => Step::GroupCount,
        "has" => Step::Has,
        "hasLabel" => Step::HasLabel,
        "hasKey" => Step::HasKey,
        "hasValue" => Step::HasValue,
        "hasNot" => Step::HasNot,
        "is" => Step::Is,
        "key" => Step::Key,
        "label" => Step::Label,
        "limit" => Step::Limit,
        "max" => Step::Max,
        "mean" => Step::Mean,
        "min" => Step::Min,
        "not" => Step::Not,
        "or" => Step::Or,
        "order" => Step::Order,
        "property" => Step::Property,
        "properties" => Step::Properties,
        "range" => Step::Range,
        "repeat" => Step::Repeat,
        "select" => Step::Select,
        "skip" => Step::Skip,
        "sum" => Step::Sum,
        "to" => Step::To,
        "union" => Step::Union,
        "values" => Step::Values,
        "where" => Step::Where,
        _ => return None,
    })
}

/// Filter-only steps eligible for reordering, low to high; -1 = pinned.
fn step_priority(step: Step) -> i32 {
    match step {
        Step::Is | Step::Where => 0,
        Step::Has | Step::HasNot | Step::HasKey | Step::HasValue => 1,
        Step::HasLabel => 2,
        Step::And | Step::Or | Step::Not => 3,
        Step::Dedup => 4,
        Step::As => 5,
        Step::Order => 6,
        _ => -1,
    }
}

pub struct ParserOptions {
    pub enable_step_reorder: bool,
    pub enable_indexing: bool,
    pub index_ratio: u64,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            enable_step_reorder: true,
            enable_indexing: true,
            index_ratio: 3,
        }
    }
}

/// Lowers a semicolon-separated transaction string into a `TrxPlan`.
pub struct Parser<'a> {
    schema: &'a SchemaIndex,
    index_store: Option<&'a IndexStore>,
    options: ParserOptions,

    // transaction-level state
    line_index: u8,
    last_update: i32,
    side_effect_key: i64,
    place_holder: HashMap<String, (u8, IoType)>,

    // per-line state
    ops: Vec<Operator>,
    str2ls: HashMap<String, i64>,
    ls2type: HashMap<i64, IoType>,
    str2se: HashMap<String, i64>,
    io_type: IoType,
    first_in_sub: usize,
    is_read_only: bool,
    min_count: u64,
    index_count: Vec<u64>,
}

impl<'a> Parser<'a> {
    pub fn new(
        schema: &'a SchemaIndex,
        index_store: Option<&'a IndexStore>,
        options: ParserOptions,
    ) -> Self {
        Self {
            schema,
            index_store,
            options,
            line_index: 0,
            last_update: -1,
            side_effect_key: 0,
            place_holder: HashMap::new(),
            ops: Vec::new(),
            str2ls: HashMap::new(),
            ls2type: HashMap::new(),
            str2se: HashMap::new(),
            io_type: IoType::Vertex,
            first_in_sub: 0,
            is_read_only: true,
            min_count: u64::MAX,
            index_count: Vec::new(),
        }
    }

    /// Parses the whole transaction into `plan`. On error the offending line
    /// is echoed back, the transaction never having entered the table.
    pub fn parse(&mut self, input: &str, plan: &mut TrxPlan) -> Result<()> {
        self.clear_trx();
        let lines: Vec<String> = input
            .split(';')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if lines.is_empty() {
            return Err(GraphError::Parse("empty transaction".into()));
        }
        plan.query_plans = vec![None; lines.len() + 1];

        for line in &lines {
            plan.ensure_dep_entry(self.line_index);
            let ops = self.parse_line(line, plan).map_err(|e| {
                GraphError::Parse(format!(
                    "Parser error at line {}:\n{}\n{}",
                    self.line_index + 1,
                    line,
                    e
                ))
            })?;
            plan.query_plans[self.line_index as usize] = Some(QueryPlan {
                ops,
                ..QueryPlan::default()
            });

            if !self.is_read_only {
                // an update line depends on everything since the previous
                // update, inclusive
                let begin = self.last_update.max(0) as u8;
                for i in begin..self.line_index {
                    plan.reg_dependency(i, self.line_index);
                }
                self.last_update = self.line_index as i32;
            } else if self.last_update >= 0 {
                plan.reg_dependency(self.last_update as u8, self.line_index);
            }
            self.line_index += 1;
        }

        self.add_commit_statement(plan);
        Ok(())
    }

    fn clear_trx(&mut self) {
        self.line_index = 0;
        self.last_update = -1;
        self.side_effect_key = 0;
        self.place_holder.clear();
    }

    fn clear_query(&mut self) {
        self.ops.clear();
        self.str2ls.clear();
        self.ls2type.clear();
        self.str2se.clear();
        self.io_type = IoType::Vertex;
        self.first_in_sub = 0;
        self.is_read_only = true;
        self.min_count = u64::MAX;
        self.index_count.clear();
    }

    fn parse_line(&mut self, line: &str, plan: &mut TrxPlan) -> Result<Vec<Operator>> {
        self.clear_query();

        if let Some(rest) = line.strip_prefix("BuildIndex") {
            self.parse_index_command(rest)?;
        } else if let Some(rest) = line.strip_prefix("SetConfig") {
            self.parse_config_command(rest)?;
        } else {
            let (var_name, query) = self.parse_init(line, plan)?;
            self.parse_query(&query, plan)?;
            if let Some(name) = var_name {
                self.place_holder
                    .insert(name, (self.line_index, self.io_type));
            }
        }

        // addE endpoint arity rules
        for (i, op) in self.ops.iter().enumerate() {
            if op.kind == OpKind::AddE {
                let from_kind = op.param_int(1);
                let to_kind = op.param_int(3);
                let mut count = 0;
                if from_kind != ADD_E_NOT_APPLICABLE {
                    count += if from_kind == ADD_E_PLACEHOLDER { 2 } else { 1 };
                }
                if to_kind != ADD_E_NOT_APPLICABLE {
                    count += if to_kind == ADD_E_PLACEHOLDER { 2 } else { 1 };
                }
                if (i == 0 && count != 4) || (i != 0 && (count == 0 || count == 4)) {
                    return Err(GraphError::Parse("addE params not match".into()));
                }
            }
        }

        let mut ops = std::mem::take(&mut self.ops);
        let mut end = Operator::new(OpKind::End);
        end.next = ops.len() + 1;
        ops.push(end);
        Ok(ops)
    }

    fn parse_index_command(&mut self, rest: &str) -> Result<()> {
        // BuildIndex(V|E, key)
        let inner = strip_parens(rest)?;
        let params = split_params(inner)?;
        if params.len() != 2 {
            return Err(GraphError::Parse("expect two params for BuildIndex".into()));
        }
        let kind = match params[0].as_str() {
            "V" => ElementKind::Vertex,
            "E" => ElementKind::Edge,
            other => {
                return Err(GraphError::Parse(format!(
                    "expect V or E in BuildIndex, got {other}"
                )))
            }
        };
        self.io_type = match kind {
            ElementKind::Vertex => IoType::Vertex,
            ElementKind::Edge => IoType::Edge,
        };
        let key = trim_quotes(&params[1]);
        let pkey = if key == "label" {
            0
        } else {
            self.key_id(&key, false)
                .ok_or_else(|| GraphError::Parse(format!("unexpected key: {key}")))?
        };
        let mut op = Operator::new(OpKind::Index);
        op.params = vec![Value::Int(elem_code(kind)), Value::Int(pkey as i64)];
        self.append_op(op);
        Ok(())
    }

    fn parse_config_command(&mut self, rest: &str) -> Result<()> {
        let inner = strip_parens(rest)?;
        let params = split_params(inner)?;
        if params.len() != 2 {
            return Err(GraphError::Parse("expect two params for SetConfig".into()));
        }
        let mut op = Operator::new(OpKind::Config);
        op.params = vec![
            Value::Str(trim_quotes(&params[0])),
            Value::Str(trim_quotes(&params[1])),
        ];
        self.append_op(op);
        Ok(())
    }

    /// Peels the optional `name =` prefix and the `g.V()/g.E()` entry;
    /// returns the remaining step string.
    fn parse_init(
        &mut self,
        line: &str,
        plan: &mut TrxPlan,
    ) -> Result<(Option<String>, String)> {
        let (var_name, query) = match split_assignment(line) {
            Some((name, rest)) => {
                if name.is_empty() {
                    return Err(GraphError::Parse(
                        "expect variable name at the left of '='".into(),
                    ));
                }
                (Some(name), rest)
            }
            None => (None, line.to_string()),
        };

        if query.starts_with("g.addV") || query.starts_with("g.addE") {
            self.io_type = if query.starts_with("g.addV") {
                IoType::Vertex
            } else {
                IoType::Edge
            };
            return Ok((var_name, query[2..].to_string()));
        }

        let element_kind = if query.starts_with("g.V") {
            self.io_type = IoType::Vertex;
            ElementKind::Vertex
        } else if query.starts_with("g.E") {
            self.io_type = IoType::Edge;
            ElementKind::Edge
        } else {
            return Err(GraphError::Parse("Execute query with g.V or g.E".into()));
        };

        let idx = query
            .find(").")
            .ok_or_else(|| GraphError::Parse("Execute query with g.V() or g.E()".into()))
            .or_else(|e| {
                // a bare g.V() / g.E() scan has no further steps
                if query.ends_with("()") {
                    Ok(query.len() - 1)
                } else {
                    Err(e)
                }
            })?;

        let mut op = Operator::new(OpKind::Init);
        op.params = vec![
            Value::Int(elem_code(element_kind)),
            Value::Int(0),
            Value::Int(0), // pushed-down predicate group count
        ];

        if idx > 4 {
            // g.V(x) consumes an earlier line's result
            let var = query[4..idx].trim().trim_start_matches('$').to_string();
            self.reg_place_holder(&var, 0, -1, self.io_type, plan)?;
            op.params[1] = Value::Int(1);
        }
        self.append_op(op);

        let rest = if idx + 2 <= query.len() {
            query[(idx + 2).min(query.len())..].to_string()
        } else {
            String::new()
        };
        Ok((var_name, rest))
    }

    fn reg_place_holder(
        &mut self,
        var: &str,
        op_index: usize,
        param: i32,
        expected: IoType,
        plan: &mut TrxPlan,
    ) -> Result<()> {
        let Some(&(src_line, var_type)) = self.place_holder.get(var) else {
            return Err(GraphError::Parse(format!("unexpected variable {var}")));
        };
        if var_type != expected {
            return Err(GraphError::Parse(format!(
                "variable {var} has the wrong element type"
            )));
        }
        plan.reg_place_holder(
            src_line,
            Position {
                query: self.line_index,
                op: op_index,
                param,
            },
        );
        Ok(())
    }

    fn parse_query(&mut self, query: &str, plan: &mut TrxPlan) -> Result<()> {
        if query.is_empty() {
            return Ok(());
        }
        let mut tokens = get_steps(query)?;
        if self.options.enable_step_reorder {
            reorder_steps(&mut tokens);
        }
        self.parse_steps(&tokens, plan)
    }

    fn parse_steps(&mut self, tokens: &[(Step, String)], plan: &mut TrxPlan) -> Result<()> {
        for (step, raw) in tokens {
            let params = split_params(raw)?;
            match step {
                Step::AddE => self.parse_add_e(&params, plan)?,
                Step::From | Step::To => self.parse_from_to(&params, *step, plan)?,
                Step::AddV => self.parse_add_v(&params, plan)?,
                Step::Aggregate => self.parse_aggregate(&params)?,
                Step::As => self.parse_as(&params)?,
                Step::Union => self.parse_branch(&params, OpKind::Union, plan)?,
                Step::Repeat => self.parse_branch(&params, OpKind::Repeat, plan)?,
                Step::And | Step::Or | Step::Not => {
                    self.parse_branch_filter(&params, *step, plan)?
                }
                Step::Cap => self.parse_cap(&params)?,
                Step::Coin => self.parse_coin(&params)?,
                Step::Count => self.parse_count(&params)?,
                Step::Dedup => self.parse_dedup(&params)?,
                Step::Drop => self.parse_drop(&params, plan)?,
                Step::Group | Step::GroupCount => self.parse_group(&params, *step)?,
                Step::Has | Step::HasKey | Step::HasValue | Step::HasNot => {
                    self.parse_has(&params, *step)?
                }
                Step::HasLabel => self.parse_has_label(&params)?,
                Step::Is => self.parse_is(&params)?,
                Step::Key => self.parse_key(&params)?,
                Step::Label => self.parse_label(&params)?,
                Step::Max | Step::Mean | Step::Min | Step::Sum => {
                    self.parse_math(&params, *step)?
                }
                Step::Order => self.parse_order(&params)?,
                Step::Properties => self.parse_properties(&params)?,
                Step::Property => self.parse_property(&params, plan)?,
                Step::Limit | Step::Range | Step::Skip => self.parse_range(&params, *step)?,
                Step::Select => self.parse_select(&params)?,
                Step::In
                | Step::Out
                | Step::Both
                | Step::InE
                | Step::OutE
                | Step::BothE
                | Step::InV
                | Step::OutV
                | Step::BothV => self.parse_traversal(&params, *step)?,
                Step::Values => self.parse_values(&params)?,
                Step::Where => self.parse_where(&params, plan)?,
            }
        }
        Ok(())
    }

    fn append_op(&mut self, mut op: Operator) {
        op.next = self.ops.len() + 1;
        self.ops.push(op);
    }

    fn remove_last_op(&mut self) {
        self.ops.pop();
    }

    /// True when the last operator in chain order is of `kind` (sub-query
    /// boundaries never merge).
    fn last_op_is(&self, kind: OpKind) -> bool {
        let current = self.ops.len();
        if current == 0 || current <= self.first_in_sub {
            return false;
        }
        let mut itr = current - 1;
        while self.ops[itr].next != current {
            itr = self.ops[itr].next;
        }
        self.ops[itr].kind == kind
    }

    fn key_id(&self, key: &str, is_label: bool) -> Option<u16> {
        let table = match (self.io_type, is_label) {
            (IoType::Vertex, true) => &self.schema.vertex_labels,
            (IoType::Vertex, false) => &self.schema.vertex_prop_keys,
            (IoType::Edge, true) => &self.schema.edge_labels,
            (IoType::Edge, false) => &self.schema.edge_prop_keys,
            _ => return None,
        };
        table.id(key)
    }

    fn expect_key_id(&self, raw: &str, is_label: bool) -> Result<u16> {
        let key = trim_quotes(raw);
        if !is_label && key == "label" {
            return Ok(0);
        }
        self.key_id(&key, is_label).ok_or_else(|| {
            GraphError::Parse(format!(
                "unexpected key: {key}, expected is {}",
                self.schema.expected_keys(self.io_type == IoType::Vertex, is_label)
            ))
        })
    }

    fn element_kind(&self) -> Result<ElementKind> {
        match self.io_type {
            IoType::Vertex => Ok(ElementKind::Vertex),
            IoType::Edge => Ok(ElementKind::Edge),
            _ => Err(GraphError::Parse("expect vertex/edge input".into())),
        }
    }

    // ---- per-step parsers --------------------------------------------

    fn parse_add_e(&mut self, params: &[String], plan: &mut TrxPlan) -> Result<()> {
        if params.len() != 1 {
            return Err(GraphError::Parse("expect one parameter for addE".into()));
        }
        if self.io_type != IoType::Vertex {
            return Err(GraphError::Parse("expect vertex before addE".into()));
        }
        let label = self.expect_key_id(&params[0], true)?;
        self.io_type = IoType::Edge;

        let mut op = Operator::new(OpKind::AddE);
        op.params = vec![
            Value::Int(label as i64),
            Value::Int(ADD_E_NOT_APPLICABLE),
            Value::Int(-1),
            Value::Int(ADD_E_NOT_APPLICABLE),
            Value::Int(-1),
        ];
        self.append_op(op);

        // the authoritative out side and the in-side mirror each run on the
        // owning worker, as planner-emitted follow-up operators
        let mut out_op = Operator::new(OpKind::AddEdgeOut);
        out_op.params = vec![Value::Int(label as i64)];
        out_op.send_remote = true;
        self.append_op(out_op);
        let mut in_op = Operator::new(OpKind::AddEdgeIn);
        in_op.params = vec![Value::Int(label as i64)];
        in_op.send_remote = true;
        self.append_op(in_op);

        plan.trx_type |= TRX_ADD;
        self.is_read_only = false;
        Ok(())
    }

    fn parse_from_to(&mut self, params: &[String], step: Step, plan: &mut TrxPlan) -> Result<()> {
        // locate the addE operator this endpoint belongs to
        let adde_idx = self
            .ops
            .iter()
            .rposition(|op| op.kind == OpKind::AddE)
            .filter(|&i| self.ops.len() - i <= 3)
            .ok_or_else(|| GraphError::Parse("expect 'addE()' before from/to".into()))?;
        if params.len() != 1 {
            return Err(GraphError::Parse("expect one parameter for from/to".into()));
        }

        let param_index = match step {
            Step::From => 1,
            _ => 3,
        };
        let name = params[0].trim().trim_start_matches('$').to_string();
        let name = trim_quotes(&name);
        if let Some(&ls_key) = self.str2ls.get(&name) {
            self.ops[adde_idx].params[param_index] = Value::Int(ADD_E_STEP_LABEL);
            self.ops[adde_idx].params[param_index + 1] = Value::Int(ls_key);
        } else if self.place_holder.contains_key(&name) {
            self.ops[adde_idx].params[param_index] = Value::Int(ADD_E_PLACEHOLDER);
            self.reg_place_holder(
                &name,
                adde_idx,
                param_index as i32 + 1,
                IoType::Vertex,
                plan,
            )?;
        } else {
            return Err(GraphError::Parse(format!("unexpected variable {name}")));
        }
        Ok(())
    }

    fn parse_add_v(&mut self, params: &[String], plan: &mut TrxPlan) -> Result<()> {
        if params.len() != 1 {
            return Err(GraphError::Parse("expect one parameter for addV".into()));
        }
        self.io_type = IoType::Vertex;
        let label = self.expect_key_id(&params[0], true)?;
        let mut op = Operator::new(OpKind::AddV);
        op.params = vec![Value::Int(label as i64)];
        self.append_op(op);
        plan.trx_type |= TRX_ADD;
        self.is_read_only = false;
        Ok(())
    }

    fn parse_aggregate(&mut self, params: &[String]) -> Result<()> {
        if params.len() != 1 {
            return Err(GraphError::Parse("expect one parameter for aggregate".into()));
        }
        let key = trim_quotes(&params[0]);
        let next = self.side_effect_key;
        let se_key = *self.str2se.entry(key).or_insert_with(|| next);
        if se_key == next {
            self.side_effect_key += 1;
        }
        let mut op = Operator::new(OpKind::Aggregate);
        op.params = vec![Value::Int(se_key)];
        op.send_remote = self.io_type.is_element();
        self.append_op(op);
        Ok(())
    }

    fn parse_as(&mut self, params: &[String]) -> Result<()> {
        if params.len() != 1 {
            return Err(GraphError::Parse("expect one parameter for as".into()));
        }
        let key = trim_quotes(&params[0]);
        if self.str2ls.contains_key(&key) {
            return Err(GraphError::Parse(format!("duplicated key: {key}")));
        }
        let ls_id = self.ops.len() as i64;
        self.str2ls.insert(key, ls_id);
        self.ls2type.insert(ls_id, self.io_type);
        let mut op = Operator::new(OpKind::As);
        op.params = vec![Value::Int(ls_id)];
        self.append_op(op);
        Ok(())
    }

    fn parse_branch(&mut self, params: &[String], kind: OpKind, plan: &mut TrxPlan) -> Result<()> {
        if params.is_empty() {
            return Err(GraphError::Parse("expect at least one branch".into()));
        }
        let current = self.ops.len();
        self.append_op(Operator::new(kind));
        self.parse_sub(params, current, false, plan)
    }

    fn parse_branch_filter(
        &mut self,
        params: &[String],
        step: Step,
        plan: &mut TrxPlan,
    ) -> Result<()> {
        if params.is_empty() {
            return Err(GraphError::Parse("expect at least one branch".into()));
        }
        let filter = match step {
            Step::And => 0,
            Step::Or => 1,
            _ => 2,
        };
        let current = self.ops.len();
        let mut op = Operator::new(OpKind::BranchFilter);
        op.params = vec![Value::Int(filter)];
        self.append_op(op);
        self.parse_sub(params, current, true, plan)
    }

    /// Parses branch sub-queries in place: each sub-chain's last operator
    /// loops back to the branch operator, whose `next` skips past them all.
    fn parse_sub(
        &mut self,
        params: &[String],
        current: usize,
        filter_branch: bool,
        plan: &mut TrxPlan,
    ) -> Result<()> {
        let current_type = self.io_type;
        let saved_first = self.first_in_sub;
        let mut sub_type = None;
        let mut sub_start = self.ops.len();

        for sub in params {
            self.io_type = current_type;
            self.first_in_sub = self.ops.len();
            self.parse_query(sub, plan)?;

            match sub_type {
                None => sub_type = Some(self.io_type),
                Some(t) if !filter_branch && t != self.io_type => {
                    return Err(GraphError::Parse(
                        "expect same output type in sub queries".into(),
                    ))
                }
                _ => {}
            }

            self.ops[current].params.push(Value::Int(sub_start as i64));

            // rewire the sub-chain's tail back to the branch operator
            let after = self.ops.len();
            let mut last = sub_start;
            while self.ops[last].next != after {
                last = self.ops[last].next;
            }
            self.ops[last].next = current;
            sub_start = after;
        }

        self.ops[current].next = sub_start;
        if filter_branch {
            self.io_type = current_type;
        }
        self.first_in_sub = saved_first;
        Ok(())
    }

    fn parse_cap(&mut self, params: &[String]) -> Result<()> {
        if params.is_empty() {
            return Err(GraphError::Parse("expect at least one parameter for cap".into()));
        }
        let mut op = Operator::new(OpKind::Cap);
        for raw in params {
            let key = trim_quotes(raw);
            let se_key = *self
                .str2se
                .get(&key)
                .ok_or_else(|| GraphError::Parse(format!("unexpected key in cap: {key}")))?;
            op.params.push(Value::Int(se_key));
            op.params.push(Value::Str(key));
        }
        self.append_op(op);
        self.io_type = IoType::Collection;
        Ok(())
    }

    fn parse_coin(&mut self, params: &[String]) -> Result<()> {
        if params.len() != 1 {
            return Err(GraphError::Parse(
                "one parameter in range of [0, 1] of coin step is needed".into(),
            ));
        }
        let rate: f64 = params[0]
            .parse()
            .map_err(|_| GraphError::Parse(format!("expected a number: {}", params[0])))?;
        if !(0.0..=1.0).contains(&rate) {
            return Err(GraphError::Parse("expected a value in range [0.0, 1.0]".into()));
        }
        let mut op = Operator::new(OpKind::Coin);
        op.params = vec![Value::Double(rate)];
        op.send_remote = self.io_type.is_element();
        self.append_op(op);
        Ok(())
    }

    fn parse_count(&mut self, params: &[String]) -> Result<()> {
        if !params.is_empty() {
            return Err(GraphError::Parse("expect no parameter for count".into()));
        }
        self.append_op(Operator::new(OpKind::Count));
        self.io_type = IoType::Int;
        Ok(())
    }

    fn parse_dedup(&mut self, params: &[String]) -> Result<()> {
        let mut op = Operator::new(OpKind::Dedup);
        for raw in params {
            let key = trim_quotes(raw);
            let ls_key = *self
                .str2ls
                .get(&key)
                .ok_or_else(|| GraphError::Parse(format!("unexpected key in dedup: {key}")))?;
            op.params.push(Value::Int(ls_key));
        }
        op.send_remote = self.io_type.is_element();
        self.append_op(op);
        Ok(())
    }

    fn parse_drop(&mut self, params: &[String], plan: &mut TrxPlan) -> Result<()> {
        if !params.is_empty() {
            return Err(GraphError::Parse("expect no param in drop".into()));
        }
        let (kind, is_property) = match self.io_type {
            IoType::Vertex => (ElementKind::Vertex, false),
            IoType::VertexProp => (ElementKind::Vertex, true),
            IoType::Edge => (ElementKind::Edge, false),
            IoType::EdgeProp => (ElementKind::Edge, true),
            _ => return Err(GraphError::Parse("unexpected input type before drop".into())),
        };
        let mut op = Operator::new(OpKind::Drop);
        op.params = vec![Value::Int(elem_code(kind)), Value::Int(is_property as i64)];
        op.send_remote = true;
        self.append_op(op);

        // dropping a vertex drops its connected edges in a second pass
        if self.io_type == IoType::Vertex {
            let mut edge_op = Operator::new(OpKind::Drop);
            edge_op.params = vec![
                Value::Int(elem_code(ElementKind::Edge)),
                Value::Int(0),
            ];
            edge_op.send_remote = true;
            self.append_op(edge_op);
        }

        plan.trx_type |= TRX_DELETE;
        self.is_read_only = false;
        Ok(())
    }

    fn parse_group(&mut self, params: &[String], step: Step) -> Result<()> {
        if params.len() > 2 {
            return Err(GraphError::Parse("expect at most two params in group".into()));
        }
        let is_count = step == Step::GroupCount;

        let mut ls_key = -1i64;
        if !params.is_empty() {
            let kind = self.element_kind()?;
            let mut proj = [-1i64; 2];
            for (i, raw) in params.iter().enumerate() {
                proj[i] = self.expect_key_id(raw, false)? as i64;
            }
            ls_key = self.ops.len() as i64;
            self.append_project(kind, proj[0], proj[1]);
        }

        let mut op = Operator::new(OpKind::Group);
        op.params = vec![Value::Int(is_count as i64), Value::Int(ls_key)];
        self.append_op(op);
        self.io_type = IoType::Collection;
        Ok(())
    }

    fn append_project(&mut self, kind: ElementKind, key_id: i64, value_id: i64) {
        let mut op = Operator::new(OpKind::Project);
        op.params = vec![
            Value::Int(elem_code(kind)),
            Value::Int(key_id),
            Value::Int(value_id),
        ];
        self.append_op(op);
    }

    fn parse_has(&mut self, params: &[String], step: Step) -> Result<()> {
        if params.is_empty() {
            return Err(GraphError::Parse("expect at least one param for has".into()));
        }
        let kind = self.element_kind()?;

        if !self.last_op_is(OpKind::Has) {
            let mut op = Operator::new(OpKind::Has);
            op.params = vec![Value::Int(elem_code(kind))];
            self.append_op(op);
        }
        let op_idx = self.ops.len() - 1;

        let mut last_key = -1i64;
        match step {
            Step::Has => {
                if params.len() > 2 {
                    return Err(GraphError::Parse("expect at most two params for has".into()));
                }
                let key = self.expect_key_id(&params[0], false)? as i64;
                last_key = key;
                let (pred_kind, pred_params) = if params.len() == 2 {
                    parse_predicate(&params[1])?
                } else {
                    (PredicateKind::Any, Vec::new())
                };
                let op = &mut self.ops[op_idx];
                op.params.push(Value::Int(key));
                op.params.push(Value::Int(pred_code(pred_kind)));
                op.params.push(Value::List(pred_params));
            }
            Step::HasValue => {
                for raw in params {
                    let value = Value::from_literal(raw)?;
                    let op = &mut self.ops[op_idx];
                    op.params.push(Value::Int(-1));
                    op.params.push(Value::Int(pred_code(PredicateKind::Eq)));
                    op.params.push(Value::List(vec![value]));
                }
            }
            Step::HasNot => {
                if params.len() != 1 {
                    return Err(GraphError::Parse("expect one param for hasNot".into()));
                }
                let key = self.expect_key_id(&params[0], false)? as i64;
                let op = &mut self.ops[op_idx];
                op.params.push(Value::Int(key));
                op.params.push(Value::Int(pred_code(PredicateKind::None)));
                op.params.push(Value::List(Vec::new()));
            }
            _ => {
                // hasKey
                if params.len() != 1 {
                    return Err(GraphError::Parse("expect one param for hasKey".into()));
                }
                let key = self.expect_key_id(&params[0], false)? as i64;
                let op = &mut self.ops[op_idx];
                op.params.push(Value::Int(key));
                op.params.push(Value::Int(pred_code(PredicateKind::Any)));
                op.params.push(Value::List(Vec::new()));
            }
        }

        // index push-down only applies right after the entry operator
        if self.ops.len() == 2 && self.ops[0].kind == OpKind::Init && last_key >= 0 {
            self.try_push_down(kind, last_key);
        }
        Ok(())
    }

    /// Moves the latest predicate group into the entry operator when its
    /// estimated cardinality beats the ratio gate, pushing back groups that
    /// no longer qualify.
    fn try_push_down(&mut self, kind: ElementKind, _key: i64) {
        if !self.options.enable_indexing {
            return;
        }
        let Some(index_store) = self.index_store else {
            return;
        };
        let has_idx = self.ops.len() - 1;
        let group_at = self.ops[has_idx].params.len() - 3;
        let pkey = self.ops[has_idx].params[group_at].as_int().unwrap_or(-1);
        let pred_kind = code_pred(self.ops[has_idx].params[group_at + 1].as_int().unwrap_or(0));
        let pred_params = self.ops[has_idx].params[group_at + 2].as_list();
        if pkey < 0 || !index_store.is_enabled(kind, pkey as u16) {
            return;
        }
        let pred = Predicate::new(pred_kind, pred_params);
        let Some(count) = index_store.count(kind, pkey as u16, &pred) else {
            return;
        };

        if count / self.options.index_ratio < self.min_count {
            // move the group into the entry operator
            let group: Vec<Value> = self.ops[has_idx].params.drain(group_at..).collect();
            self.ops[0].params.extend(group);
            bump_init_pred_count(&mut self.ops[0], 1);

            if count < self.min_count {
                self.min_count = count;

                // push back previously pushed groups that exceed the gate
                let mut i = 0;
                while i < self.index_count.len() {
                    if self.index_count[i] / self.options.index_ratio >= self.min_count {
                        self.index_count.remove(i);
                        let first = 3 + 3 * i;
                        let group: Vec<Value> =
                            self.ops[0].params.drain(first..first + 3).collect();
                        self.ops[has_idx].params.extend(group);
                        bump_init_pred_count(&mut self.ops[0], -1);
                    } else {
                        i += 1;
                    }
                }
            }
            self.index_count.push(count);

            // nothing left to filter: drop the has operator entirely
            if self.ops[has_idx].params.len() == 1 {
                self.remove_last_op();
            }
        }
    }

    fn parse_has_label(&mut self, params: &[String]) -> Result<()> {
        if params.is_empty() {
            return Err(GraphError::Parse("expect at least one param for hasLabel".into()));
        }
        let kind = self.element_kind()?;
        if !self.last_op_is(OpKind::HasLabel) {
            let mut op = Operator::new(OpKind::HasLabel);
            op.params = vec![Value::Int(elem_code(kind))];
            self.append_op(op);
        }
        let op_idx = self.ops.len() - 1;
        for raw in params {
            let label = self.expect_key_id(raw, true)?;
            self.ops[op_idx].params.push(Value::Int(label as i64));
        }

        // label-index push-down right after the entry operator
        if self.ops.len() == 2
            && self.ops[0].kind == OpKind::Init
            && self.options.enable_indexing
        {
            if let Some(index_store) = self.index_store {
                if index_store.is_enabled(kind, 0) {
                    let labels: Vec<Value> = self.ops[op_idx].params[1..].to_vec();
                    self.remove_last_op();
                    self.ops[0].params.push(Value::Int(0));
                    self.ops[0]
                        .params
                        .push(Value::Int(pred_code(PredicateKind::Within)));
                    self.ops[0].params.push(Value::List(labels));
                    bump_init_pred_count(&mut self.ops[0], 1);
                }
            }
        }
        Ok(())
    }

    fn parse_is(&mut self, params: &[String]) -> Result<()> {
        if params.len() != 1 {
            return Err(GraphError::Parse("expect one param for is".into()));
        }
        if !self.io_type.is_value() {
            return Err(GraphError::Parse("unexpected input type for is".into()));
        }
        if !self.last_op_is(OpKind::Is) {
            self.append_op(Operator::new(OpKind::Is));
        }
        let op_idx = self.ops.len() - 1;
        let (kind, pred_params) = parse_predicate(&params[0])?;
        self.ops[op_idx].params.push(Value::Int(pred_code(kind)));
        self.ops[op_idx].params.push(Value::List(pred_params));
        Ok(())
    }

    fn parse_key(&mut self, params: &[String]) -> Result<()> {
        if !params.is_empty() {
            return Err(GraphError::Parse("expect no parameter for key".into()));
        }
        let kind = self.element_kind()?;
        let mut op = Operator::new(OpKind::Key);
        op.params = vec![Value::Int(elem_code(kind))];
        self.append_op(op);
        self.io_type = IoType::Str;
        Ok(())
    }

    fn parse_label(&mut self, params: &[String]) -> Result<()> {
        if !params.is_empty() {
            return Err(GraphError::Parse("expect no parameter for label".into()));
        }
        let kind = self.element_kind()?;
        let mut op = Operator::new(OpKind::Label);
        op.params = vec![Value::Int(elem_code(kind))];
        self.append_op(op);
        self.io_type = IoType::Str;
        Ok(())
    }

    fn parse_math(&mut self, params: &[String], step: Step) -> Result<()> {
        if !params.is_empty() {
            return Err(GraphError::Parse("expect no parameter for math".into()));
        }
        if !self.io_type.is_number() {
            return Err(GraphError::Parse(
                "expect number input for math related step".into(),
            ));
        }
        let math = match step {
            Step::Sum => 0,
            Step::Max => 1,
            Step::Min => 2,
            _ => 3,
        };
        let mut op = Operator::new(OpKind::Math);
        op.params = vec![Value::Int(math)];
        self.append_op(op);
        self.io_type = IoType::Double;
        Ok(())
    }

    fn parse_order(&mut self, params: &[String]) -> Result<()> {
        if params.len() > 2 {
            return Err(GraphError::Parse("expect at most two params in order".into()));
        }
        let mut ls_key = -1i64;
        let mut order = 0i64; // incr

        for raw in params {
            let raw_t = trim_quotes(raw).to_ascii_lowercase();
            if raw_t == "incr" || raw_t == "decr" {
                order = (raw_t == "decr") as i64;
            } else {
                let kind = self.element_kind()?;
                let key = self.expect_key_id(raw, false)? as i64;
                ls_key = self.ops.len() as i64;
                self.append_project(kind, key, -1);
            }
        }

        let mut op = Operator::new(OpKind::Order);
        op.params = vec![Value::Int(ls_key), Value::Int(order)];
        op.send_remote = self.io_type.is_element();
        self.append_op(op);
        Ok(())
    }

    fn parse_properties(&mut self, params: &[String]) -> Result<()> {
        let kind = self.element_kind()?;
        let mut op = Operator::new(OpKind::Properties);
        op.params = vec![Value::Int(elem_code(kind))];
        for raw in params {
            let key = self.expect_key_id(raw, false)?;
            op.params.push(Value::Int(key as i64));
        }
        op.send_remote = true;
        self.append_op(op);
        self.io_type = match kind {
            ElementKind::Vertex => IoType::VertexProp,
            ElementKind::Edge => IoType::EdgeProp,
        };
        Ok(())
    }

    fn parse_property(&mut self, params: &[String], plan: &mut TrxPlan) -> Result<()> {
        if params.len() != 2 {
            return Err(GraphError::Parse("expect two params for property".into()));
        }
        let kind = self.element_kind()?;
        let key = self.expect_key_id(&params[0], false)?;
        let value = Value::from_literal(&params[1])?;
        let mut op = Operator::new(OpKind::Property);
        op.params = vec![
            Value::Int(elem_code(kind)),
            Value::Int(key as i64),
            value,
        ];
        op.send_remote = true;
        self.append_op(op);
        plan.trx_type |= TRX_UPDATE;
        self.is_read_only = false;
        Ok(())
    }

    fn parse_range(&mut self, params: &[String], step: Step) -> Result<()> {
        let nums: Vec<i64> = params
            .iter()
            .map(|p| {
                p.parse()
                    .map_err(|_| GraphError::Parse(format!("expect number but get: {p}")))
            })
            .collect::<Result<_>>()?;
        let (start, end) = match step {
            Step::Range => {
                if nums.len() != 2 {
                    return Err(GraphError::Parse("expect two parameters for range".into()));
                }
                (nums[0], nums[1])
            }
            Step::Limit => {
                if nums.len() != 1 {
                    return Err(GraphError::Parse("expect one parameter for limit".into()));
                }
                (0, nums[0] - 1)
            }
            _ => {
                if nums.len() != 1 {
                    return Err(GraphError::Parse("expect one parameter for skip".into()));
                }
                (nums[0], -1)
            }
        };
        let mut op = Operator::new(OpKind::Range);
        op.params = vec![Value::Int(start), Value::Int(end)];
        op.send_remote = self.io_type.is_element();
        self.append_op(op);
        Ok(())
    }

    fn parse_select(&mut self, params: &[String]) -> Result<()> {
        if params.is_empty() {
            return Err(GraphError::Parse("expect at least one param for select".into()));
        }
        let mut op = Operator::new(OpKind::Select);
        let mut selected_type = self.io_type;
        for raw in params {
            let key = trim_quotes(raw);
            let ls_key = *self
                .str2ls
                .get(&key)
                .ok_or_else(|| GraphError::Parse(format!("unexpected label step: {key}")))?;
            selected_type = self.ls2type[&ls_key];
            op.params.push(Value::Int(ls_key));
            op.params.push(Value::Str(key));
        }
        if params.len() == 1 {
            self.io_type = selected_type;
            op.send_remote = self.io_type.is_element();
        } else {
            self.io_type = IoType::Collection;
        }
        self.append_op(op);
        Ok(())
    }

    fn parse_traversal(&mut self, params: &[String], step: Step) -> Result<()> {
        let (in_kind, out_kind, dir) = match step {
            Step::In | Step::Out | Step::Both => {
                if params.len() > 1 {
                    return Err(GraphError::Parse(
                        "expect at most one param for in/out/both".into(),
                    ));
                }
                if self.io_type != IoType::Vertex {
                    return Err(GraphError::Parse("expect vertex input for in/out/both".into()));
                }
                (
                    ElementKind::Vertex,
                    ElementKind::Vertex,
                    direction_of(step),
                )
            }
            Step::InE | Step::OutE | Step::BothE => {
                if params.len() > 1 {
                    return Err(GraphError::Parse(
                        "expect at most one param for in/out/bothE".into(),
                    ));
                }
                if self.io_type != IoType::Vertex {
                    return Err(GraphError::Parse(
                        "expect vertex input for in/out/bothE".into(),
                    ));
                }
                (ElementKind::Vertex, ElementKind::Edge, direction_of(step))
            }
            _ => {
                if !params.is_empty() {
                    return Err(GraphError::Parse("expect no param for in/out/bothV".into()));
                }
                if self.io_type != IoType::Edge {
                    return Err(GraphError::Parse("expect edge input for in/out/bothV".into()));
                }
                (ElementKind::Edge, ElementKind::Vertex, direction_of(step))
            }
        };

        let mut label = -1i64;
        if params.len() == 1 {
            // edge label filter; keys resolve against the edge tables
            let saved = self.io_type;
            self.io_type = IoType::Edge;
            label = self.expect_key_id(&params[0], true)? as i64;
            self.io_type = saved;
        }

        let mut op = Operator::new(OpKind::Traversal);
        op.params = vec![
            Value::Int(elem_code(in_kind)),
            Value::Int(elem_code(out_kind)),
            Value::Int(dir),
            Value::Int(label),
        ];
        op.send_remote = true;
        self.append_op(op);
        self.io_type = match out_kind {
            ElementKind::Edge => IoType::Edge,
            ElementKind::Vertex => IoType::Vertex,
        };
        Ok(())
    }

    fn parse_values(&mut self, params: &[String]) -> Result<()> {
        let kind = self.element_kind()?;
        let mut op = Operator::new(OpKind::Values);
        op.params = vec![Value::Int(elem_code(kind))];
        for raw in params {
            let key = self.expect_key_id(raw, false)?;
            op.params.push(Value::Int(key as i64));
        }
        op.send_remote = true;
        self.append_op(op);
        self.io_type = IoType::Str;
        Ok(())
    }

    fn parse_where(&mut self, params: &[String], plan: &mut TrxPlan) -> Result<()> {
        if params.is_empty() || params.len() > 2 {
            return Err(GraphError::Parse("expect one or two params for where".into()));
        }

        if params.len() == 1 && is_query(&params[0]) {
            // a where sub-traversal filters like and()
            return self.parse_branch_filter(&params[..1], Step::And, plan);
        }

        let (label_step_key, pred_raw) = if params.len() == 2 {
            let key = trim_quotes(&params[0]);
            let ls = *self
                .str2ls
                .get(&key)
                .ok_or_else(|| GraphError::Parse(format!("Unexpected label step: {key}")))?;
            (ls, &params[1])
        } else {
            (-1, &params[0])
        };

        let (kind, raw_params) = parse_predicate_raw(pred_raw)?;
        // where predicates name label steps (or aggregate side effects for
        // within/without), not literals
        let map = if matches!(kind, PredicateKind::Within | PredicateKind::Without) {
            &self.str2se
        } else {
            &self.str2ls
        };
        let mut keys = Vec::new();
        for raw in &raw_params {
            let name = trim_quotes(raw);
            let id = *map.get(&name).ok_or_else(|| {
                GraphError::Parse(format!(
                    "unexpected key: {name}, avail is {:?}",
                    map.keys().collect::<Vec<_>>()
                ))
            })?;
            keys.push(Value::Int(id));
        }

        if !self.last_op_is(OpKind::Where) {
            self.append_op(Operator::new(OpKind::Where));
        }
        let op_idx = self.ops.len() - 1;
        let op = &mut self.ops[op_idx];
        op.params.push(Value::Int(label_step_key));
        op.params.push(Value::Int(pred_code(kind)));
        op.params.push(Value::List(keys));
        Ok(())
    }

    /// Appends the synthetic validation -> post-validation -> commit query
    /// depending on every prior line.
    fn add_commit_statement(&mut self, plan: &mut TrxPlan) {
        let mut ops = Vec::new();
        for kind in [OpKind::Validation, OpKind::PostValidation, OpKind::Commit, OpKind::End] {
            let mut op = Operator::new(kind);
            op.next = ops.len() + 1;
            ops.push(op);
        }
        let index = self.line_index;
        plan.ensure_dep_entry(index);
        plan.query_plans[index as usize] = Some(QueryPlan {
            ops,
            ..QueryPlan::default()
        });
        let begin = self.last_update.max(0) as u8;
        for i in begin..index {
            plan.reg_dependency(i, index);
        }
    }
}

fn direction_of(step: Step) -> i64 {
    match step {
        Step::In | Step::InE | Step::InV => 0,
        Step::Out | Step::OutE | Step::OutV => 1,
        _ => 2,
    }
}

fn elem_code(kind: ElementKind) -> i64 {
    match kind {
        ElementKind::Vertex => 0,
        ElementKind::Edge => 1,
    }
}

pub fn code_elem(code: i64) -> ElementKind {
    if code == 1 {
        ElementKind::Edge
    } else {
        ElementKind::Vertex
    }
}

pub fn pred_code(kind: PredicateKind) -> i64 {
    match kind {
        PredicateKind::Eq => 0,
        PredicateKind::Neq => 1,
        PredicateKind::Lt => 2,
        PredicateKind::Lte => 3,
        PredicateKind::Gt => 4,
        PredicateKind::Gte => 5,
        PredicateKind::Inside => 6,
        PredicateKind::Outside => 7,
        PredicateKind::Between => 8,
        PredicateKind::Within => 9,
        PredicateKind::Without => 10,
        PredicateKind::Any => 11,
        PredicateKind::None => 12,
    }
}

pub fn code_pred(code: i64) -> PredicateKind {
    match code {
        0 => PredicateKind::Eq,
        1 => PredicateKind::Neq,
        2 => PredicateKind::Lt,
        3 => PredicateKind::Lte,
        4 => PredicateKind::Gt,
        5 => PredicateKind::Gte,
        6 => PredicateKind::Inside,
        7 => PredicateKind::Outside,
        8 => PredicateKind::Between,
        9 => PredicateKind::Within,
        10 => PredicateKind::Without,
        12 => PredicateKind::None,
        _ => PredicateKind::Any,
    }
}

fn bump_init_pred_count(init: &mut Operator, delta: i64) {
    let count = init.params[2].as_int().unwrap_or(0) + delta;
    init.params[2] = Value::Int(count);
}

/// Strips one outer pair of parentheses from a command tail.
fn strip_parens(rest: &str) -> Result<&str> {
    let t = rest.trim();
    t.strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| GraphError::Parse(format!("expected (...), got '{t}'")))
}

/// Splits `name = rest` at the first '=' not part of a step call.
fn split_assignment(line: &str) -> Option<(String, String)> {
    let idx = line.find('=')?;
    if line[..idx].contains('(') {
        return None;
    }
    Some((
        line[..idx].trim().trim_start_matches('$').to_string(),
        line[idx + 1..].trim().to_string(),
    ))
}

/// Extracts `(step, params)` tokens with balanced-bracket matching.
fn get_steps(query: &str) -> Result<Vec<(Step, String)>> {
    let bytes = query.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    if query.is_empty() {
        return Err(GraphError::Parse("empty query".into()));
    }

    while pos < bytes.len() {
        let lb = query[pos..]
            .find('(')
            .map(|i| i + pos)
            .ok_or_else(|| GraphError::Parse(format!(
                "unexpected words at the end: '{}'",
                &query[pos..]
            )))?;
        let name = &query[pos..lb];
        let step = step_of(name)
            .ok_or_else(|| GraphError::Parse(format!("unexpected step: {name}")))?;

        let mut depth = 1;
        let mut cursor = lb;
        let mut in_str: Option<u8> = None;
        let params;
        loop {
            cursor += 1;
            if cursor >= bytes.len() {
                return Err(GraphError::Parse("parentheses not balanced".into()));
            }
            match bytes[cursor] {
                b'"' | b'\'' => match in_str {
                    Some(q) if q == bytes[cursor] => in_str = None,
                    None => in_str = Some(bytes[cursor]),
                    _ => {}
                },
                b'(' if in_str.is_none() => depth += 1,
                b')' if in_str.is_none() => {
                    depth -= 1;
                    if depth == 0 {
                        params = query[lb + 1..cursor].trim().to_string();
                        tokens.push((step, params));
                        cursor += 1;
                        if cursor != bytes.len() {
                            if bytes[cursor] != b'.' {
                                return Err(GraphError::Parse("expect '.' after ')'".into()));
                            }
                            cursor += 1;
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        pos = cursor;
    }
    Ok(tokens)
}

/// Splits on commas not enclosed by brackets or quotes.
fn split_params(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if raw.ends_with(',') {
        return Err(GraphError::Parse(format!("unexpected ',' at: {raw}")));
    }
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_str: Option<char> = None;
    let mut current = String::new();
    for c in raw.chars() {
        match c {
            '"' | '\'' => {
                match in_str {
                    Some(q) if q == c => in_str = None,
                    None => in_str = Some(c),
                    _ => {}
                }
                current.push(c);
            }
            '(' if in_str.is_none() => {
                depth += 1;
                current.push(c);
            }
            ')' if in_str.is_none() => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 && in_str.is_none() => {
                out.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    out.push(current.trim().to_string());
    Ok(out)
}

fn trim_quotes(raw: &str) -> String {
    let t = raw.trim();
    if (t.starts_with('"') && t.ends_with('"') && t.len() >= 2)
        || (t.starts_with('\'') && t.ends_with('\'') && t.len() >= 2)
    {
        t[1..t.len() - 1].to_string()
    } else {
        t.to_string()
    }
}

fn is_query(param: &str) -> bool {
    match param.find('(') {
        Some(pos) => step_of(&param[..pos]).is_some(),
        None => false,
    }
}

/// `pred(name(args))` or a bare literal (implicit eq); parameters parsed as
/// literals.
fn parse_predicate(raw: &str) -> Result<(PredicateKind, Vec<Value>)> {
    let (kind, params) = parse_predicate_raw(raw)?;
    let values = params
        .iter()
        .map(|p| Value::from_literal(p))
        .collect::<Result<Vec<_>>>()?;
    let pred = Predicate::new(kind, values.clone());
    pred.check_arity()?;
    Ok((kind, values))
}

/// Like `parse_predicate` but leaves parameters as raw strings, for where()
/// whose parameters are key names.
fn parse_predicate_raw(raw: &str) -> Result<(PredicateKind, Vec<String>)> {
    let t = raw.trim();
    if let Some(pos) = t.find('(') {
        if let Some(kind) = PredicateKind::from_name(t[..pos].trim()) {
            if !t.ends_with(')') {
                return Err(GraphError::Parse(format!("parentheses not balanced: {t}")));
            }
            let inner = &t[pos + 1..t.len() - 1];
            return Ok((kind, split_params(inner)?));
        }
    }
    Ok((PredicateKind::Eq, vec![t.to_string()]))
}

/// Behavior-preserving reorder: lower-priority filter steps move earlier,
/// never crossing an `as()` label a later where/dedup references.
fn reorder_steps(tokens: &mut [(Step, String)]) {
    for i in 1..tokens.len() {
        let mut priority = step_priority(tokens[i].0);
        if priority == -1 {
            continue;
        }
        let mut check_as = false;
        match tokens[i].0 {
            Step::Where => {
                if is_query(&tokens[i].1) {
                    priority = step_priority(Step::And);
                } else {
                    check_as = true;
                }
            }
            Step::Dedup => check_as = !tokens[i].1.is_empty(),
            _ => {}
        }

        let mut current = i;
        for j in (0..i).rev() {
            if check_as && tokens[j].0 == Step::As {
                break;
            } else if step_priority(tokens[j].0) > priority {
                tokens.swap(current, j);
                current = j;
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TRX_TAG;
    use crate::loader::RawGraph;

    fn parse_one(input: &str) -> (TrxPlan, Vec<Operator>) {
        let graph = RawGraph::modern();
        let mut parser = Parser::new(&graph.schema, None, ParserOptions::default());
        let mut plan = TrxPlan::new(TRX_TAG | 0x100, 1);
        parser.parse(input, &mut plan).unwrap();
        let ops = plan.query_plans[0].as_ref().unwrap().ops.clone();
        (plan, ops)
    }

    fn parse_err(input: &str) -> String {
        let graph = RawGraph::modern();
        let mut parser = Parser::new(&graph.schema, None, ParserOptions::default());
        let mut plan = TrxPlan::new(TRX_TAG | 0x100, 1);
        parser.parse(input, &mut plan).unwrap_err().to_string()
    }

    #[test]
    fn simple_scan_chain() {
        let (_, ops) = parse_one("g.V().has(\"name\", \"marko\").out(\"knows\").values(\"name\")");
        let kinds: Vec<OpKind> = ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OpKind::Init,
                OpKind::Has,
                OpKind::Traversal,
                OpKind::Values,
                OpKind::End
            ]
        );
        // has merged [pkey, pred, params]
        assert_eq!(ops[1].params[1], Value::Int(1)); // name
        assert_eq!(ops[2].params[3], Value::Int(1)); // knows
        assert!(ops[2].send_remote);
    }

    #[test]
    fn consecutive_has_steps_merge() {
        let (_, ops) = parse_one("g.V().has(\"name\", \"marko\").has(\"age\", gt(20)).count()");
        let kinds: Vec<OpKind> = ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![OpKind::Init, OpKind::Has, OpKind::Count, OpKind::End]
        );
        // two predicate groups in one operator
        assert_eq!(ops[1].params.len(), 1 + 3 * 2);
    }

    #[test]
    fn transaction_dependencies() {
        let graph = RawGraph::modern();
        let mut parser = Parser::new(&graph.schema, None, ParserOptions::default());
        let mut plan = TrxPlan::new(TRX_TAG | 0x100, 1);
        parser
            .parse(
                "g.V().count(); g.V().has(\"name\", \"marko\").property(\"age\", 30); g.V().count()",
                &mut plan,
            )
            .unwrap();
        assert_eq!(plan.query_plans.len(), 4);
        assert_eq!(plan.trx_type, TRX_UPDATE);

        // line 0 runs first; the update line 1 depends on it; line 2 depends
        // on the update; the commit line depends on everything since the
        // update
        let ready: Vec<u8> = plan.next_queries().iter().map(|q| q.query_index).collect();
        assert_eq!(ready, vec![0]);
        plan.fill_result(0, vec![]);
        let ready: Vec<u8> = plan.next_queries().iter().map(|q| q.query_index).collect();
        assert_eq!(ready, vec![1]);
        plan.fill_result(1, vec![]);
        let ready: Vec<u8> = plan.next_queries().iter().map(|q| q.query_index).collect();
        assert_eq!(ready, vec![2]);
        plan.fill_result(2, vec![]);
        let ready: Vec<u8> = plan.next_queries().iter().map(|q| q.query_index).collect();
        assert_eq!(ready, vec![3]);
    }

    #[test]
    fn commit_statement_shape() {
        let (plan, _) = parse_one("g.V().count()");
        let commit = plan.query_plans[1].as_ref().unwrap();
        let kinds: Vec<OpKind> = commit.ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OpKind::Validation,
                OpKind::PostValidation,
                OpKind::Commit,
                OpKind::End
            ]
        );
    }

    #[test]
    fn branch_subquery_wiring() {
        let (_, ops) = parse_one("g.V().union(out(\"knows\"), out(\"created\")).count()");
        assert_eq!(ops[1].kind, OpKind::Union);
        // two sub-chain start indices
        assert_eq!(ops[1].params, vec![Value::Int(2), Value::Int(3)]);
        // sub-chains loop back to the union operator
        assert_eq!(ops[2].next, 1);
        assert_eq!(ops[3].next, 1);
        // the union continues past both sub-chains
        assert_eq!(ops[1].next, 4);
        assert_eq!(ops[4].kind, OpKind::Count);
    }

    #[test]
    fn where_subquery_lowers_to_and_filter() {
        let (_, ops) = parse_one("g.V().where(out(\"knows\")).count()");
        assert_eq!(ops[1].kind, OpKind::BranchFilter);
        assert_eq!(ops[1].params[0], Value::Int(0)); // AND
    }

    #[test]
    fn vertex_drop_adds_edge_pass() {
        let (plan, ops) = parse_one("g.V().drop()");
        let kinds: Vec<OpKind> = ops.iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![OpKind::Init, OpKind::Drop, OpKind::Drop, OpKind::End]
        );
        assert_eq!(ops[2].params[0], Value::Int(1)); // edge pass
        assert_eq!(plan.trx_type, TRX_DELETE);
    }

    #[test]
    fn add_edge_between_placeholders() {
        let graph = RawGraph::modern();
        let mut parser = Parser::new(&graph.schema, None, ParserOptions::default());
        let mut plan = TrxPlan::new(TRX_TAG | 0x100, 1);
        parser
            .parse(
                "a = g.V().has(\"name\", \"marko\"); b = g.V().has(\"name\", \"peter\"); \
                 g.addE(\"knows\").from(a).to(b)",
                &mut plan,
            )
            .unwrap();
        let ops = &plan.query_plans[2].as_ref().unwrap().ops;
        assert_eq!(ops[0].kind, OpKind::AddE);
        assert_eq!(ops[0].params[1], Value::Int(ADD_E_PLACEHOLDER));
        assert_eq!(ops[0].params[3], Value::Int(ADD_E_PLACEHOLDER));
        assert_eq!(ops[1].kind, OpKind::AddEdgeOut);
        assert_eq!(ops[2].kind, OpKind::AddEdgeIn);
        assert_eq!(plan.trx_type, TRX_ADD);
    }

    #[test]
    fn reorder_moves_haslabel_before_order() {
        let mut tokens = get_steps("order().hasLabel('person')").unwrap();
        reorder_steps(&mut tokens);
        assert_eq!(tokens[0].0, Step::HasLabel);
        assert_eq!(tokens[1].0, Step::Order);
    }

    #[test]
    fn reorder_respects_as_labels() {
        let mut tokens = get_steps("as('x').order().dedup('x')").unwrap();
        reorder_steps(&mut tokens);
        // dedup('x') must not cross as('x'); order still yields to dedup
        let kinds: Vec<Step> = tokens.iter().map(|t| t.0).collect();
        assert_eq!(kinds, vec![Step::As, Step::Dedup, Step::Order]);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let msg = parse_err("g.V().has(\"nickname\", \"x\").count()");
        assert!(msg.contains("unexpected key"), "{msg}");
    }

    #[test]
    fn unbalanced_parens_is_an_error() {
        let msg = parse_err("g.V().has(\"name\", \"x\"");
        assert!(msg.contains("parentheses") || msg.contains("g.V"), "{msg}");
    }

    #[test]
    fn limit_and_skip_lower_to_range() {
        let (_, ops) = parse_one("g.V().limit(3)");
        assert_eq!(ops[1].params, vec![Value::Int(0), Value::Int(2)]);
        let (_, ops) = parse_one("g.V().skip(2)");
        assert_eq!(ops[1].params, vec![Value::Int(2), Value::Int(-1)]);
    }

    #[test]
    fn index_push_down_moves_predicate_into_entry() {
        use crate::config::Config;
        use crate::index::IndexStore;
        use crate::loader::build_partitions;
        use crate::types::ElementKind;

        let cfg = Config {
            num_expert_threads: 2,
            row_pool_size: 1 << 13,
            mvcc_pool_size: 1 << 13,
            vp_store_cells: 1 << 13,
            ep_store_cells: 1 << 13,
            ..Config::default()
        };
        let graph = RawGraph::modern();
        let storage = build_partitions(&cfg, &graph).remove(0);
        let index = IndexStore::new();
        index.build(&storage, 0, ElementKind::Vertex, 1, TRX_TAG, 1);

        let mut parser = Parser::new(&graph.schema, Some(&index), ParserOptions::default());
        let mut plan = TrxPlan::new(TRX_TAG | 0x100, 1);
        parser
            .parse("g.V().has(\"name\", \"marko\").count()", &mut plan)
            .unwrap();
        let ops = &plan.query_plans[0].as_ref().unwrap().ops;
        // the has operator disappeared into the entry operator
        let kinds: Vec<OpKind> = ops.iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OpKind::Init, OpKind::Count, OpKind::End]);
        assert_eq!(ops[0].params[2], Value::Int(1));
        assert_eq!(ops[0].params[3], Value::Int(1)); // pushed pkey
    }
}
