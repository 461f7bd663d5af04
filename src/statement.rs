//! Statements and their per-partition instances.
//!
//! A [`StatementSpec`] is compiled once into a plan. Parameters are declared
//! during compilation; binding produces a new plan with the values folded in,
//! so every activation runs on its own immutable plan. Each partition a
//! statement lives in gets a [`StatementInstance`] holding the statement's
//! window, groups and output batcher for that partition only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use roaring::RoaringTreemap;
use tracing::{trace, warn};

use crate::aggregation::{AggregateKind, AggregationRow};
use crate::calendar::TimePeriod;
use crate::context::PartitionId;
use crate::datatype::{Timestamp, Value};
use crate::error::{ContinuumError, Result};
use crate::filter::{AggregateDef, CompiledExpr, Compiler, EvalContext, Expr, Scope};
use crate::interface::{Dispatcher, OutputBatch, StatementId};
use crate::output::{self, Drained, KeyedRow, OutputBatcher, OutputSpec, SnapshotSource};
use crate::parameter::ParameterSlots;
use crate::relation::{Relation, RelationHandle, RelationKeeper, RowId};
use crate::schema::{Attribute, Event, EventType, SchemaRegistry};
use crate::OtherHasher;

// ------------- Specification -------------
/// Which events of the source stream a statement retains.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DataWindow {
    /// Nothing is retained; aggregates see every event forever.
    #[default]
    None,
    KeepAll,
    Length(usize),
    Time(TimePeriod),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub expr: Expr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SelectList {
    #[default]
    Wildcard,
    Items(Vec<Projection>),
}
impl SelectList {
    fn push(&mut self, expr: Expr, alias: Option<&str>) {
        let projection = Projection {
            expr,
            alias: alias.map(str::to_string),
        };
        match self {
            SelectList::Items(items) => items.push(projection),
            SelectList::Wildcard => *self = SelectList::Items(vec![projection]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub column: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Target {
    #[default]
    Listeners,
    /// Output rows are also inserted into this named window or table.
    InsertInto(String),
    /// Aggregations accumulate into the table's columns by group key.
    IntoTable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectSpec {
    pub name: Option<String>,
    pub from: String,
    pub alias: Option<String>,
    pub filter: Option<Expr>,
    pub window: DataWindow,
    pub items: SelectList,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderItem>,
    pub output: OutputSpec,
    pub context: Option<String>,
    pub target: Target,
}

impl SelectSpec {
    pub fn from(event_type: &str) -> Self {
        Self {
            name: None,
            from: event_type.to_string(),
            alias: None,
            filter: None,
            window: DataWindow::None,
            items: SelectList::Wildcard,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            output: OutputSpec::default(),
            context: None,
            target: Target::Listeners,
        }
    }
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }
    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }
    pub fn window(mut self, window: DataWindow) -> Self {
        self.window = window;
        self
    }
    pub fn select(mut self, expr: Expr) -> Self {
        self.items.push(expr, None);
        self
    }
    pub fn select_as(mut self, expr: Expr, alias: &str) -> Self {
        self.items.push(expr, Some(alias));
        self
    }
    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }
    pub fn having(mut self, expr: Expr) -> Self {
        self.having = Some(expr);
        self
    }
    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order_by.push(OrderItem {
            column: column.to_string(),
            descending,
        });
        self
    }
    pub fn output(mut self, output: OutputSpec) -> Self {
        self.output = output;
        self
    }
    pub fn context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }
    pub fn insert_into(mut self, relation: &str) -> Self {
        self.target = Target::InsertInto(relation.to_string());
        self
    }
    pub fn into_table(mut self, table: &str) -> Self {
        self.target = Target::IntoTable(table.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerAction {
    Select { items: SelectList, delete: bool },
    Delete,
    Merge {
        update: Vec<(String, Expr)>,
        insert: Option<Vec<(String, Expr)>>,
    },
}

/// `on <trigger> ... <action> <relation> where <condition>`.
#[derive(Debug, Clone, PartialEq)]
pub struct OnTriggerSpec {
    pub name: Option<String>,
    pub trigger: String,
    pub alias: Option<String>,
    pub filter: Option<Expr>,
    pub relation: String,
    pub relation_alias: Option<String>,
    pub condition: Option<Expr>,
    pub action: TriggerAction,
    pub output: OutputSpec,
    pub context: Option<String>,
}

impl OnTriggerSpec {
    pub fn on(trigger: &str, relation: &str) -> Self {
        Self {
            name: None,
            trigger: trigger.to_string(),
            alias: None,
            filter: None,
            relation: relation.to_string(),
            relation_alias: None,
            condition: None,
            action: TriggerAction::Select {
                items: SelectList::Wildcard,
                delete: false,
            },
            output: OutputSpec::default(),
            context: None,
        }
    }
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }
    pub fn relation_alias(mut self, alias: &str) -> Self {
        self.relation_alias = Some(alias.to_string());
        self
    }
    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }
    pub fn when(mut self, condition: Expr) -> Self {
        self.condition = Some(condition);
        self
    }
    fn select_items(&mut self) -> &mut SelectList {
        if !matches!(self.action, TriggerAction::Select { .. }) {
            self.action = TriggerAction::Select {
                items: SelectList::Wildcard,
                delete: false,
            };
        }
        match &mut self.action {
            TriggerAction::Select { items, .. } => items,
            _ => unreachable!("action was just set to select"),
        }
    }
    pub fn select(mut self, expr: Expr) -> Self {
        self.select_items().push(expr, None);
        self
    }
    pub fn select_as(mut self, expr: Expr, alias: &str) -> Self {
        self.select_items().push(expr, Some(alias));
        self
    }
    /// Turns a select action into `select and delete`.
    pub fn and_delete(mut self) -> Self {
        if let TriggerAction::Select { delete, .. } = &mut self.action {
            *delete = true;
        }
        self
    }
    pub fn delete(mut self) -> Self {
        self.action = TriggerAction::Delete;
        self
    }
    fn merge_parts(&mut self) -> (&mut Vec<(String, Expr)>, &mut Option<Vec<(String, Expr)>>) {
        if !matches!(self.action, TriggerAction::Merge { .. }) {
            self.action = TriggerAction::Merge {
                update: Vec::new(),
                insert: None,
            };
        }
        match &mut self.action {
            TriggerAction::Merge { update, insert } => (update, insert),
            _ => unreachable!("action was just set to merge"),
        }
    }
    /// `when matched then update set <column> = <expr>`.
    pub fn merge_update(mut self, column: &str, expr: Expr) -> Self {
        self.merge_parts().0.push((column.to_string(), expr));
        self
    }
    /// `when not matched then insert`, one column at a time.
    pub fn merge_insert(mut self, column: &str, expr: Expr) -> Self {
        self.merge_parts()
            .1
            .get_or_insert_with(Vec::new)
            .push((column.to_string(), expr));
        self
    }
    pub fn output(mut self, output: OutputSpec) -> Self {
        self.output = output;
        self
    }
    pub fn context(mut self, context: &str) -> Self {
        self.context = Some(context.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementSpec {
    Select(SelectSpec),
    OnTrigger(OnTriggerSpec),
}
impl StatementSpec {
    pub fn name(&self) -> Option<&str> {
        match self {
            StatementSpec::Select(s) => s.name.as_deref(),
            StatementSpec::OnTrigger(t) => t.name.as_deref(),
        }
    }
    pub fn context(&self) -> Option<&str> {
        match self {
            StatementSpec::Select(s) => s.context.as_deref(),
            StatementSpec::OnTrigger(t) => t.context.as_deref(),
        }
    }
}
impl From<SelectSpec> for StatementSpec {
    fn from(spec: SelectSpec) -> Self {
        StatementSpec::Select(spec)
    }
}
impl From<OnTriggerSpec> for StatementSpec {
    fn from(spec: OnTriggerSpec) -> Self {
        StatementSpec::OnTrigger(spec)
    }
}

// ------------- Plans -------------
#[derive(Debug, Clone)]
struct Item {
    name: String,
    expr: CompiledExpr,
}

#[derive(Debug, Clone)]
enum Shape {
    Wildcard,
    Items(Vec<Item>),
}

impl Shape {
    fn compile(list: &SelectList, compiler: &mut Compiler, scope: &Scope) -> Result<Shape> {
        Ok(match list {
            SelectList::Wildcard => Shape::Wildcard,
            SelectList::Items(items) => Shape::Items(
                items
                    .iter()
                    .map(|p| {
                        Ok(Item {
                            name: p.alias.clone().unwrap_or_else(|| p.expr.to_string()),
                            expr: compiler.compile(&p.expr, scope)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }
    fn bind(&self, values: &[Value]) -> Result<Shape> {
        Ok(match self {
            Shape::Wildcard => Shape::Wildcard,
            Shape::Items(items) => Shape::Items(
                items
                    .iter()
                    .map(|i| {
                        Ok(Item {
                            name: i.name.clone(),
                            expr: i.expr.bind(values)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }
    fn exprs(&self) -> Vec<&CompiledExpr> {
        match self {
            Shape::Wildcard => Vec::new(),
            Shape::Items(items) => items.iter().map(|i| &i.expr).collect(),
        }
    }
    fn output_type(&self, name: &str, wildcard: &Arc<EventType>) -> Arc<EventType> {
        match self {
            Shape::Wildcard => Arc::clone(wildcard),
            Shape::Items(items) => EventType::anonymous(
                name,
                items
                    .iter()
                    .map(|i| Attribute::new(&i.name, i.expr.value_type()))
                    .collect(),
            ),
        }
    }
    fn describe(&self) -> String {
        match self {
            Shape::Wildcard => "*".into(),
            Shape::Items(items) => items
                .iter()
                .map(|i| {
                    let shown = i.expr.to_string();
                    if shown == i.name {
                        shown
                    } else {
                        format!("{} as {}", shown, i.name)
                    }
                })
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

fn bind_all(exprs: &[CompiledExpr], values: &[Value]) -> Result<Vec<CompiledExpr>> {
    exprs.iter().map(|e| e.bind(values)).collect()
}

fn bind_option(expr: &Option<CompiledExpr>, values: &[Value]) -> Result<Option<CompiledExpr>> {
    expr.as_ref().map(|e| e.bind(values)).transpose()
}

fn bind_aggregates(aggregates: &[AggregateDef], values: &[Value]) -> Result<Vec<AggregateDef>> {
    aggregates
        .iter()
        .map(|a| {
            Ok(AggregateDef {
                kind: a.kind,
                argument: bind_option(&a.argument, values)?,
                input_type: a.input_type.clone(),
            })
        })
        .collect()
}

fn aggregation_row(aggregates: &[AggregateDef]) -> AggregationRow {
    let definitions: Vec<(AggregateKind, _)> = aggregates.iter().map(|a| (a.kind, a.input_type.clone())).collect();
    AggregationRow::new(&definitions)
}

fn aggregate_inputs(aggregates: &[AggregateDef], ctx: &EvalContext) -> Result<Vec<Value>> {
    aggregates
        .iter()
        .map(|a| match &a.argument {
            Some(argument) => argument.eval(ctx),
            None => Ok(Value::Null),
        })
        .collect()
}

fn project(shape: &Shape, output_type: &Arc<EventType>, ctx: &EvalContext, wildcard: &Event) -> Result<Event> {
    match shape {
        Shape::Wildcard => Ok(wildcard.clone()),
        Shape::Items(items) => {
            let values = items.iter().map(|i| i.expr.eval(ctx)).collect::<Result<Vec<_>>>()?;
            Ok(Event::from_parts(Arc::clone(output_type), values))
        }
    }
}

#[derive(Debug, Clone)]
enum PlanTarget {
    Listeners,
    InsertInto(RelationHandle),
    /// Pairs of table column and aggregate slot.
    IntoTable { table: RelationHandle, columns: Vec<(usize, usize)> },
}

#[derive(Debug, Clone)]
pub(crate) struct SelectPlan {
    source: Arc<EventType>,
    alias: Option<String>,
    filter: Option<CompiledExpr>,
    window: DataWindow,
    shape: Shape,
    group_by: Vec<CompiledExpr>,
    having: Option<CompiledExpr>,
    aggregates: Vec<AggregateDef>,
    order: Vec<(usize, bool)>,
    output: OutputSpec,
    target: PlanTarget,
    output_type: Arc<EventType>,
}

impl SelectPlan {
    fn compile(
        spec: &SelectSpec,
        schema: &SchemaRegistry,
        relations: &RelationKeeper,
        slots: &mut ParameterSlots,
    ) -> Result<Self> {
        let source = schema.get(&spec.from)?;
        let scope = Scope::single(Arc::clone(&source), spec.alias.as_deref());
        let mut aggregates = Vec::new();
        let shape = Shape::compile(
            &spec.items,
            &mut Compiler::new(relations, slots).with_aggregates(&mut aggregates),
            &scope,
        )?;
        let filter = match &spec.filter {
            Some(f) => Some(Compiler::new(relations, slots).compile(f, &scope)?),
            None => None,
        };
        let mut group_by = Vec::with_capacity(spec.group_by.len());
        for g in &spec.group_by {
            group_by.push(Compiler::new(relations, slots).compile(g, &scope)?);
        }
        let having = match &spec.having {
            Some(h) => Some(Compiler::new(relations, slots).with_aggregates(&mut aggregates).compile(h, &scope)?),
            None => None,
        };
        if spec.window == DataWindow::Length(0) {
            return Err(ContinuumError::Validation("a length window must retain at least one event".into()));
        }
        spec.output.validate(!spec.order_by.is_empty())?;

        let target = match &spec.target {
            Target::Listeners => PlanTarget::Listeners,
            Target::InsertInto(name) => PlanTarget::InsertInto(relations.get(name)?),
            Target::IntoTable(name) => Self::table_target(relations.get(name)?, &shape, &group_by, &aggregates)?,
        };
        let mut plan = Self {
            output_type: Arc::clone(&source),
            source,
            alias: spec.alias.clone(),
            filter,
            window: spec.window.clone(),
            shape,
            group_by,
            having,
            aggregates,
            order: Vec::new(),
            output: spec.output.clone(),
            target,
        };
        plan.output_type = plan.derive_output_type();
        plan.order = spec
            .order_by
            .iter()
            .map(|o| {
                plan.output_type
                    .position(&o.column)
                    .map(|p| (p, o.descending))
                    .ok_or_else(|| ContinuumError::UnknownAttribute { name: o.column.clone() })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(plan)
    }

    fn table_target(
        table: RelationHandle,
        shape: &Shape,
        group_by: &[CompiledExpr],
        aggregates: &[AggregateDef],
    ) -> Result<PlanTarget> {
        let invalid = |msg: String| ContinuumError::Validation(format!("into table '{}': {}", table.name(), msg));
        if group_by.len() != table.key_columns().len() {
            return Err(invalid(format!(
                "the table has {} key columns but the statement groups by {}",
                table.key_columns().len(),
                group_by.len()
            )));
        }
        let Shape::Items(items) = shape else {
            return Err(invalid("the select list must name aggregations".into()));
        };
        let relation = table.read()?;
        let mut columns = Vec::with_capacity(items.len());
        for item in items {
            let CompiledExpr::Aggregate { slot, .. } = &item.expr else {
                return Err(invalid(format!("'{}' is not an aggregation", item.name)));
            };
            let column = table.row_type().position(&item.name).ok_or_else(|| ContinuumError::UnknownAttribute {
                name: format!("{}.{}", table.name(), item.name),
            })?;
            match relation.aggregate_kind(column) {
                Some(kind) if kind == aggregates[*slot].kind => columns.push((column, *slot)),
                Some(kind) => {
                    return Err(invalid(format!(
                        "column '{}' aggregates {} but the statement computes {}",
                        item.name, kind, aggregates[*slot].kind
                    )))
                }
                None => return Err(invalid(format!("column '{}' is not an aggregation column", item.name))),
            }
        }
        drop(relation);
        Ok(PlanTarget::IntoTable { table, columns })
    }

    fn derive_output_type(&self) -> Arc<EventType> {
        match &self.target {
            PlanTarget::IntoTable { table, .. } => Arc::clone(table.row_type()),
            _ => self.shape.output_type(self.source.name(), &self.source),
        }
    }

    fn bind(&self, values: &[Value]) -> Result<Self> {
        let mut bound = Self {
            source: Arc::clone(&self.source),
            alias: self.alias.clone(),
            filter: bind_option(&self.filter, values)?,
            window: self.window.clone(),
            shape: self.shape.bind(values)?,
            group_by: bind_all(&self.group_by, values)?,
            having: bind_option(&self.having, values)?,
            aggregates: bind_aggregates(&self.aggregates, values)?,
            order: self.order.clone(),
            output: self.output.clone(),
            target: self.target.clone(),
            output_type: Arc::clone(&self.output_type),
        };
        bound.output_type = bound.derive_output_type();
        Ok(bound)
    }

    fn aggregated(&self) -> bool {
        !matches!(self.target, PlanTarget::IntoTable { .. }) && (!self.aggregates.is_empty() || !self.group_by.is_empty())
    }

    fn table_inputs(columns: &[(usize, usize)], inputs: &[Value]) -> Vec<(usize, Value)> {
        columns.iter().map(|(column, slot)| (*column, inputs[*slot].clone())).collect()
    }

    /// The row of one group, or nothing when `having` rejects it.
    fn project_group(&self, event: &Event, row: &AggregationRow) -> Result<Option<Event>> {
        let streams = [event];
        let ctx = EvalContext::with_aggregates(&streams, row.accumulators());
        if let Some(having) = &self.having {
            if !having.eval_bool(&ctx)? {
                return Ok(None);
            }
        }
        project(&self.shape, &self.output_type, &ctx, event).map(Some)
    }

    fn exprs(&self) -> Vec<&CompiledExpr> {
        let mut all = self.shape.exprs();
        all.extend(self.filter.iter());
        all.extend(self.group_by.iter());
        all.extend(self.having.iter());
        all.extend(self.aggregates.iter().filter_map(|a| a.argument.as_ref()));
        all
    }

    fn describe(&self) -> String {
        let mut text = format!("select {} from {}", self.shape.describe(), self.source.name());
        if let Some(filter) = &self.filter {
            text.push_str(&format!("({})", filter));
        }
        if let Some(alias) = &self.alias {
            text.push_str(&format!(" as {}", alias));
        }
        if !self.group_by.is_empty() {
            let keys: Vec<String> = self.group_by.iter().map(|g| g.to_string()).collect();
            text.push_str(&format!(" group by {}", keys.join(", ")));
        }
        if let Some(having) = &self.having {
            text.push_str(&format!(" having {}", having));
        }
        match &self.target {
            PlanTarget::InsertInto(r) => format!("insert into {} {}", r.name(), text),
            PlanTarget::IntoTable { table, .. } => format!("into table {} {}", table.name(), text),
            PlanTarget::Listeners => text,
        }
    }
}

#[derive(Debug, Clone)]
enum CompiledAction {
    Select { shape: Shape, aggregates: Vec<AggregateDef>, delete: bool },
    Delete,
    Merge {
        update: Vec<(usize, CompiledExpr)>,
        insert: Option<(Arc<EventType>, Vec<CompiledExpr>)>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct TriggerPlan {
    trigger: Arc<EventType>,
    alias: Option<String>,
    filter: Option<CompiledExpr>,
    relation: RelationHandle,
    condition: Option<CompiledExpr>,
    action: CompiledAction,
    output: OutputSpec,
    output_type: Arc<EventType>,
}

impl TriggerPlan {
    fn compile(
        spec: &OnTriggerSpec,
        schema: &SchemaRegistry,
        relations: &RelationKeeper,
        slots: &mut ParameterSlots,
    ) -> Result<Self> {
        let trigger = schema.get(&spec.trigger)?;
        let relation = relations.get(&spec.relation)?;
        let single = Scope::single(Arc::clone(&trigger), spec.alias.as_deref());
        let mut pair = single.clone();
        pair.push(Arc::clone(relation.row_type()), spec.relation_alias.as_deref());

        let filter = match &spec.filter {
            Some(f) => Some(Compiler::new(relations, slots).compile(f, &single)?),
            None => None,
        };
        let action = match &spec.action {
            TriggerAction::Select { items, delete } => {
                let mut aggregates = Vec::new();
                let shape = Shape::compile(
                    items,
                    &mut Compiler::new(relations, slots).with_aggregates(&mut aggregates),
                    &pair,
                )?;
                CompiledAction::Select {
                    shape,
                    aggregates,
                    delete: *delete,
                }
            }
            TriggerAction::Delete => CompiledAction::Delete,
            TriggerAction::Merge { update, insert } => {
                let row_type = relation.row_type();
                let state = relation.read()?;
                let plain_column = |name: &str| -> Result<usize> {
                    let column = row_type.position(name).ok_or_else(|| ContinuumError::UnknownAttribute {
                        name: format!("{}.{}", spec.relation, name),
                    })?;
                    if state.aggregate_kind(column).is_some() {
                        return Err(ContinuumError::Validation(format!(
                            "aggregation column '{}' of '{}' cannot be assigned",
                            name, spec.relation
                        )));
                    }
                    Ok(column)
                };
                let mut assignments = Vec::with_capacity(update.len());
                for (name, expr) in update {
                    let column = plain_column(name)?;
                    let compiled = Compiler::new(relations, slots).compile(expr, &pair)?;
                    check_assignable(&compiled, &row_type.attributes()[column])?;
                    assignments.push((column, compiled));
                }
                let insert = match insert {
                    Some(columns) => {
                        let mut attributes = Vec::with_capacity(columns.len());
                        let mut values = Vec::with_capacity(columns.len());
                        for (name, expr) in columns {
                            let attribute = row_type.attributes()[plain_column(name)?].clone();
                            let compiled = Compiler::new(relations, slots).compile(expr, &single)?;
                            check_assignable(&compiled, &attribute)?;
                            attributes.push(attribute);
                            values.push(compiled);
                        }
                        Some((EventType::anonymous(&spec.relation, attributes), values))
                    }
                    None => None,
                };
                CompiledAction::Merge {
                    update: assignments,
                    insert,
                }
            }
        };
        let condition = match &spec.condition {
            Some(c) => Some(Compiler::new(relations, slots).compile(c, &pair)?),
            None => None,
        };
        spec.output.validate(false)?;
        let mut plan = Self {
            output_type: Arc::clone(relation.row_type()),
            trigger,
            alias: spec.alias.clone(),
            filter,
            relation,
            condition,
            action,
            output: spec.output.clone(),
        };
        if let Some(e) = plan.exprs().into_iter().find(|e| e.references(&spec.relation)) {
            return Err(ContinuumError::Validation(format!(
                "expression '{}' may not read relation '{}' the statement acts on",
                e, spec.relation
            )));
        }
        plan.output_type = plan.derive_output_type();
        Ok(plan)
    }

    fn derive_output_type(&self) -> Arc<EventType> {
        match &self.action {
            CompiledAction::Select { shape, .. } => shape.output_type(self.relation.name(), self.relation.row_type()),
            _ => Arc::clone(self.relation.row_type()),
        }
    }

    fn exprs(&self) -> Vec<&CompiledExpr> {
        let mut all: Vec<&CompiledExpr> = self.filter.iter().chain(self.condition.iter()).collect();
        match &self.action {
            CompiledAction::Select { shape, aggregates, .. } => {
                all.extend(shape.exprs());
                all.extend(aggregates.iter().filter_map(|a| a.argument.as_ref()));
            }
            CompiledAction::Delete => {}
            CompiledAction::Merge { update, insert } => {
                all.extend(update.iter().map(|(_, e)| e));
                if let Some((_, values)) = insert {
                    all.extend(values.iter());
                }
            }
        }
        all
    }

    fn bind(&self, values: &[Value]) -> Result<Self> {
        let action = match &self.action {
            CompiledAction::Select { shape, aggregates, delete } => CompiledAction::Select {
                shape: shape.bind(values)?,
                aggregates: bind_aggregates(aggregates, values)?,
                delete: *delete,
            },
            CompiledAction::Delete => CompiledAction::Delete,
            CompiledAction::Merge { update, insert } => CompiledAction::Merge {
                update: update
                    .iter()
                    .map(|(c, e)| Ok((*c, e.bind(values)?)))
                    .collect::<Result<Vec<_>>>()?,
                insert: match insert {
                    Some((t, exprs)) => Some((Arc::clone(t), bind_all(exprs, values)?)),
                    None => None,
                },
            },
        };
        let mut bound = Self {
            trigger: Arc::clone(&self.trigger),
            alias: self.alias.clone(),
            filter: bind_option(&self.filter, values)?,
            relation: Arc::clone(&self.relation),
            condition: bind_option(&self.condition, values)?,
            action,
            output: self.output.clone(),
            output_type: Arc::clone(&self.output_type),
        };
        bound.output_type = bound.derive_output_type();
        Ok(bound)
    }

    fn matches(&self, trigger: &Event, row: &Event) -> Result<bool> {
        match &self.condition {
            Some(condition) => {
                let streams = [trigger, row];
                condition.eval_bool(&EvalContext::new(&streams))
            }
            None => Ok(true),
        }
    }

    /// The matched row ids and the rows the select list makes of them.
    fn select_matching(
        &self,
        rows: &[(RowId, Event)],
        trigger: &Event,
        shape: &Shape,
        aggregates: &[AggregateDef],
    ) -> Result<(RoaringTreemap, Vec<Event>)> {
        let mut ids = RoaringTreemap::new();
        let mut matched = Vec::new();
        for (id, row) in rows {
            if self.matches(trigger, row)? {
                ids.insert(*id);
                matched.push(row);
            }
        }
        if matched.is_empty() {
            return Ok((ids, Vec::new()));
        }
        let mut group = aggregation_row(aggregates);
        for &row in &matched {
            let streams = [trigger, row];
            let inputs = aggregate_inputs(aggregates, &EvalContext::new(&streams))?;
            group.add(&inputs, row)?;
        }
        let accumulators = group.accumulators();
        let per_row = match shape {
            Shape::Wildcard => true,
            Shape::Items(items) => aggregates.is_empty() || items.iter().any(|i| i.expr.reads_stream(1)),
        };
        let output = if per_row {
            matched
                .iter()
                .map(|&row| {
                    let streams = [trigger, row];
                    project(shape, &self.output_type, &EvalContext::with_aggregates(&streams, accumulators), row)
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            let streams = [trigger];
            vec![project(
                shape,
                &self.output_type,
                &EvalContext::with_aggregates(&streams, accumulators),
                trigger,
            )?]
        };
        Ok((ids, output))
    }

    fn matching_ids(&self, rows: &[(RowId, Event)], trigger: &Event) -> Result<RoaringTreemap> {
        let mut ids = RoaringTreemap::new();
        for (id, row) in rows {
            if self.matches(trigger, row)? {
                ids.insert(*id);
            }
        }
        Ok(ids)
    }

    /// Evaluates against a snapshot of the relation with no lock held, since
    /// conditions may run subselects on other relations, then applies the
    /// outcome if the relation has not changed in between. Otherwise the
    /// evaluation starts over on a fresh snapshot.
    fn write_back<T, R>(
        &self,
        mut evaluate: impl FnMut(&[(RowId, Event)]) -> Result<T>,
        mut apply: impl FnMut(&mut Relation, T) -> Result<R>,
    ) -> Result<R> {
        loop {
            let (version, rows) = self.relation.read()?.snapshot();
            let outcome = evaluate(&rows)?;
            let mut relation = self.relation.write()?;
            if relation.version() == version {
                return apply(&mut *relation, outcome);
            }
            trace!(relation = %self.relation.name(), "relation changed during evaluation, retrying");
        }
    }

    fn describe(&self) -> String {
        let mut text = format!("on {}", self.trigger.name());
        if let Some(filter) = &self.filter {
            text.push_str(&format!("({})", filter));
        }
        if let Some(alias) = &self.alias {
            text.push_str(&format!(" as {}", alias));
        }
        match &self.action {
            CompiledAction::Select { shape, delete, .. } => {
                text.push_str(&format!(" select {}", shape.describe()));
                if *delete {
                    text.push_str(" and delete");
                }
                text.push_str(&format!(" from {}", self.relation.name()));
            }
            CompiledAction::Delete => text.push_str(&format!(" delete from {}", self.relation.name())),
            CompiledAction::Merge { .. } => text.push_str(&format!(" merge {}", self.relation.name())),
        }
        if let Some(condition) = &self.condition {
            text.push_str(&format!(" where {}", condition));
        }
        text
    }
}

fn check_assignable(expr: &CompiledExpr, column: &Attribute) -> Result<()> {
    let from = expr.value_type();
    if from.is_assignable_to(column.value_type()) {
        return Ok(());
    }
    Err(ContinuumError::TypeMismatch {
        expression: format!("{}={}", column.name(), expr),
        from: from.to_string(),
        to: column.value_type().to_string(),
    })
}

#[derive(Debug, Clone)]
pub(crate) enum Plan {
    Select(SelectPlan),
    Trigger(TriggerPlan),
}

impl Plan {
    /// Compiles a statement, declaring its parameters along the way.
    pub(crate) fn compile(
        spec: &StatementSpec,
        schema: &SchemaRegistry,
        relations: &RelationKeeper,
    ) -> Result<(Plan, ParameterSlots)> {
        let mut slots = ParameterSlots::new();
        let plan = match spec {
            StatementSpec::Select(s) => Plan::Select(SelectPlan::compile(s, schema, relations, &mut slots)?),
            StatementSpec::OnTrigger(t) => Plan::Trigger(TriggerPlan::compile(t, schema, relations, &mut slots)?),
        };
        Ok((plan, slots))
    }

    pub(crate) fn bind(&self, values: &[Value]) -> Result<Plan> {
        Ok(match self {
            Plan::Select(p) => Plan::Select(p.bind(values)?),
            Plan::Trigger(t) => Plan::Trigger(t.bind(values)?),
        })
    }

    fn source(&self) -> &Arc<EventType> {
        match self {
            Plan::Select(p) => &p.source,
            Plan::Trigger(t) => &t.trigger,
        }
    }

    fn output(&self) -> &OutputSpec {
        match self {
            Plan::Select(p) => &p.output,
            Plan::Trigger(t) => &t.output,
        }
    }

    pub(crate) fn output_type(&self) -> &Arc<EventType> {
        match self {
            Plan::Select(p) => &p.output_type,
            Plan::Trigger(t) => &t.output_type,
        }
    }

    pub(crate) fn has_parameters(&self) -> bool {
        match self {
            Plan::Select(p) => p.exprs().into_iter().any(CompiledExpr::has_parameters),
            Plan::Trigger(t) => t.exprs().into_iter().any(CompiledExpr::has_parameters),
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Plan::Select(p) => p.describe(),
            Plan::Trigger(t) => t.describe(),
        }
    }
}

// ------------- Instances -------------
#[derive(Debug)]
struct Retained {
    event: Event,
    at: Timestamp,
    key: Vec<Value>,
    inputs: Vec<Value>,
    projected: Option<Event>,
}

#[derive(Debug)]
struct Group {
    row: AggregationRow,
    last: Event,
}

#[derive(Debug)]
struct InstanceState {
    plan: Arc<Plan>,
    window: VecDeque<Retained>,
    groups: HashMap<Vec<Value>, Group, OtherHasher>,
}

impl InstanceState {
    fn admit(&mut self, window: &DataWindow, retained: Retained) -> Vec<Retained> {
        match window {
            DataWindow::None => Vec::new(),
            DataWindow::KeepAll | DataWindow::Time(_) => {
                self.window.push_back(retained);
                Vec::new()
            }
            DataWindow::Length(limit) => {
                self.window.push_back(retained);
                let mut evicted = Vec::new();
                while self.window.len() > *limit {
                    evicted.extend(self.window.pop_front());
                }
                evicted
            }
        }
    }

    fn expire(&mut self, period: &TimePeriod, now: Timestamp) -> Result<Vec<Retained>> {
        let mut expired = Vec::new();
        while let Some(oldest) = self.window.front() {
            if period.add_to(oldest.at, 1)? > now {
                break;
            }
            expired.extend(self.window.pop_front());
        }
        Ok(expired)
    }

    fn add_to_group(&mut self, plan: &SelectPlan, key: &[Value], inputs: &[Value], event: &Event) -> Result<()> {
        let group = self.groups.entry(key.to_vec()).or_insert_with(|| Group {
            row: aggregation_row(&plan.aggregates),
            last: event.clone(),
        });
        match group.row.add(inputs, event) {
            Ok(()) => {
                group.last = event.clone();
                Ok(())
            }
            Err(e) => {
                if group.row.contributions() == 0 {
                    self.groups.remove(key);
                }
                Err(e)
            }
        }
    }

    /// Undoes what evicted events contributed and returns the rows to report.
    fn retract(&mut self, plan: &SelectPlan, evicted: &[Retained]) -> Result<(Vec<KeyedRow>, Vec<KeyedRow>)> {
        match &plan.target {
            PlanTarget::IntoTable { table, columns } => {
                let mut updated = Vec::new();
                if !evicted.is_empty() {
                    let mut relation = table.write()?;
                    for r in evicted {
                        let change = relation.retract_from(&r.key, &SelectPlan::table_inputs(columns, &r.inputs), &r.event)?;
                        updated.extend(change.inserted.into_iter().map(|row| KeyedRow::new(r.key.clone(), row)));
                    }
                }
                Ok((updated, Vec::new()))
            }
            _ if plan.aggregated() => {
                for r in evicted {
                    if let Some(group) = self.groups.get_mut(&r.key) {
                        group.row.remove(&r.inputs, &r.event)?;
                        if group.row.contributions() == 0 {
                            self.groups.remove(&r.key);
                        }
                    }
                }
                Ok((Vec::new(), Vec::new()))
            }
            _ => Ok((
                Vec::new(),
                evicted
                    .iter()
                    .filter_map(|r| r.projected.clone().map(KeyedRow::ungrouped))
                    .collect(),
            )),
        }
    }

    fn render_groups(&self, plan: &SelectPlan, affected: Vec<(Vec<Value>, Event)>) -> Result<Vec<KeyedRow>> {
        let mut seen: HashSet<Vec<Value>, OtherHasher> = HashSet::default();
        let mut rows = Vec::new();
        for (key, event) in affected {
            if !seen.insert(key.clone()) {
                continue;
            }
            let emptied;
            let row = match self.groups.get(&key) {
                Some(group) => &group.row,
                None => {
                    emptied = aggregation_row(&plan.aggregates);
                    &emptied
                }
            };
            if let Some(projected) = plan.project_group(&event, row)? {
                rows.push(KeyedRow::new(key, projected));
            }
        }
        Ok(rows)
    }
}

impl SnapshotSource for InstanceState {
    fn snapshot(&self) -> Result<Vec<Event>> {
        match &*self.plan {
            Plan::Select(p) => match &p.target {
                PlanTarget::IntoTable { table, .. } => Ok(table.read()?.rows()),
                _ if p.aggregated() => {
                    let mut keys: Vec<&Vec<Value>> = self.groups.keys().collect();
                    keys.sort();
                    let mut rows = Vec::with_capacity(keys.len());
                    for key in keys {
                        let group = &self.groups[key];
                        rows.extend(p.project_group(&group.last, &group.row)?);
                    }
                    Ok(rows)
                }
                _ => Ok(self.window.iter().filter_map(|r| r.projected.clone()).collect()),
            },
            Plan::Trigger(t) => Ok(t.relation.read()?.rows()),
        }
    }
}

/// The state one statement keeps in one partition.
#[derive(Debug)]
pub(crate) struct StatementInstance {
    batcher: OutputBatcher,
    state: InstanceState,
}

impl StatementInstance {
    fn new(plan: Arc<Plan>, now: Timestamp) -> Result<Self> {
        Ok(Self {
            batcher: OutputBatcher::new(plan.output().clone(), now)?,
            state: InstanceState {
                plan,
                window: VecDeque::new(),
                groups: HashMap::default(),
            },
        })
    }

    pub(crate) fn pending_rows(&self) -> usize {
        self.batcher.pending_rows()
    }

    pub(crate) fn process(&mut self, event: &Event, now: Timestamp) -> Result<Option<Drained>> {
        let plan = Arc::clone(&self.state.plan);
        let drained = match &*plan {
            Plan::Select(p) => self.process_select(p, event, now)?,
            Plan::Trigger(t) => self.process_trigger(t, event)?,
        };
        Ok(self.finish(&plan, drained))
    }

    fn process_select(&mut self, p: &SelectPlan, event: &Event, now: Timestamp) -> Result<Option<Drained>> {
        let streams = [event];
        let ctx = EvalContext::new(&streams);
        if let Some(filter) = &p.filter {
            if !filter.eval_bool(&ctx)? {
                return Ok(None);
            }
        }
        let key = p.group_by.iter().map(|g| g.eval(&ctx)).collect::<Result<Vec<_>>>()?;
        let inputs = aggregate_inputs(&p.aggregates, &ctx)?;

        // the new event is applied first; if that fails nothing has changed
        let mut inserted = Vec::new();
        let mut projected = None;
        match &p.target {
            PlanTarget::IntoTable { table, columns } => {
                let change = table
                    .write()?
                    .aggregate_into(&key, &SelectPlan::table_inputs(columns, &inputs), event)?;
                inserted.extend(change.inserted.into_iter().map(|row| KeyedRow::new(key.clone(), row)));
            }
            _ if p.aggregated() => self.state.add_to_group(p, &key, &inputs, event)?,
            _ => {
                let row = project(&p.shape, &p.output_type, &ctx, event)?;
                inserted.push(KeyedRow::ungrouped(row.clone()));
                projected = Some(row);
            }
        }
        let evicted = self.state.admit(
            &p.window,
            Retained {
                event: event.clone(),
                at: now,
                key: key.clone(),
                inputs,
                projected,
            },
        );
        let (updated, removed) = self.state.retract(p, &evicted)?;
        inserted.extend(updated);
        if p.aggregated() {
            let affected = std::iter::once((key, event.clone()))
                .chain(evicted.into_iter().map(|r| (r.key, r.event)))
                .collect();
            inserted = self.state.render_groups(p, affected)?;
        }
        self.batcher.offer(inserted, removed, &self.state)
    }

    fn process_trigger(&mut self, t: &TriggerPlan, event: &Event) -> Result<Option<Drained>> {
        let single = [event];
        if let Some(filter) = &t.filter {
            if !filter.eval_bool(&EvalContext::new(&single))? {
                return Ok(None);
            }
        }
        let (inserted, removed) = match &t.action {
            CompiledAction::Select { shape, aggregates, delete: true } => {
                let rows = t.write_back(
                    |rows| t.select_matching(rows, event, shape, aggregates),
                    |relation, (ids, output): (RoaringTreemap, Vec<Event>)| {
                        relation.delete_rows(&ids)?;
                        Ok(output)
                    },
                )?;
                (rows, Vec::new())
            }
            CompiledAction::Select { shape, aggregates, delete: false } => {
                let (_, rows) = t.relation.read()?.snapshot();
                let (_, output) = t.select_matching(&rows, event, shape, aggregates)?;
                (output, Vec::new())
            }
            CompiledAction::Delete => {
                let removed = t.write_back(
                    |rows| t.matching_ids(rows, event),
                    |relation, ids| relation.delete_rows(&ids),
                )?;
                (removed, Vec::new())
            }
            CompiledAction::Merge { update, insert } => {
                let insert_row = match insert {
                    Some((row_type, exprs)) => {
                        let ctx = EvalContext::new(&single);
                        let values = exprs.iter().map(|e| e.eval(&ctx)).collect::<Result<Vec<_>>>()?;
                        Some(Event::new(Arc::clone(row_type), values)?)
                    }
                    None => None,
                };
                let change = t.write_back(
                    |rows| {
                        let mut updates = Vec::new();
                        for (id, row) in rows {
                            if !t.matches(event, row)? {
                                continue;
                            }
                            let streams = [event, row];
                            let ctx = EvalContext::new(&streams);
                            let assignments = update
                                .iter()
                                .map(|(column, e)| Ok((*column, e.eval(&ctx)?)))
                                .collect::<Result<Vec<_>>>()?;
                            updates.push((*id, assignments));
                        }
                        Ok(updates)
                    },
                    |relation, updates| relation.apply_merge(updates, insert_row.as_ref()),
                )?;
                (change.inserted, change.removed)
            }
        };
        self.batcher.offer(
            inserted.into_iter().map(KeyedRow::ungrouped).collect(),
            removed.into_iter().map(KeyedRow::ungrouped).collect(),
            &self.state,
        )
    }

    /// Moves engine time: expires time windows, then checks the output boundary.
    pub(crate) fn advance(&mut self, now: Timestamp) -> Result<Option<Drained>> {
        let plan = Arc::clone(&self.state.plan);
        let mut expired_output = None;
        if let Plan::Select(p) = &*plan {
            if let DataWindow::Time(period) = &p.window {
                let expired = self.state.expire(period, now)?;
                if !expired.is_empty() {
                    let (mut inserted, removed) = self.state.retract(p, &expired)?;
                    if p.aggregated() {
                        let affected = expired.into_iter().map(|r| (r.key, r.event)).collect();
                        inserted = self.state.render_groups(p, affected)?;
                    }
                    expired_output = self.batcher.offer(inserted, removed, &self.state)?;
                }
            }
        }
        let flushed = self.batcher.advance(now, &self.state)?;
        Ok(self.finish(&plan, output::merge(expired_output, flushed)))
    }

    /// The terminal flush of an ending partition.
    pub(crate) fn terminate(&mut self) -> Result<Option<Drained>> {
        let plan = Arc::clone(&self.state.plan);
        let drained = self.batcher.terminate(&self.state)?;
        self.state.window.clear();
        self.state.groups.clear();
        Ok(self.finish(&plan, drained))
    }

    // Orders the batch and feeds an insert-into target.
    fn finish(&self, plan: &Plan, drained: Option<Drained>) -> Option<Drained> {
        let mut drained = drained?;
        if let Plan::Select(p) = plan {
            if !p.order.is_empty() {
                let order = |a: &Event, b: &Event| {
                    p.order
                        .iter()
                        .map(|(column, descending)| {
                            let ordering = a.value(*column).cmp(b.value(*column));
                            if *descending {
                                ordering.reverse()
                            } else {
                                ordering
                            }
                        })
                        .find(|o| o.is_ne())
                        .unwrap_or(std::cmp::Ordering::Equal)
                };
                drained.inserted.sort_by(order);
                drained.removed.sort_by(order);
            }
            if let PlanTarget::InsertInto(relation) = &p.target {
                match relation.write() {
                    Ok(mut target) => {
                        for row in &drained.inserted {
                            if let Err(error) = target.insert(row) {
                                warn!(relation = %relation.name(), %error, "insert into relation failed");
                            }
                        }
                    }
                    Err(error) => warn!(relation = %relation.name(), %error, "relation unavailable"),
                }
            }
        }
        Some(drained)
    }
}

// ------------- Statement -------------
/// An activated statement: a bound plan plus the listeners of its output.
#[derive(Debug)]
pub struct Statement {
    id: StatementId,
    name: String,
    text: String,
    context: Option<String>,
    plan: Arc<Plan>,
    dispatcher: Dispatcher,
}

impl Statement {
    pub(crate) fn new(id: StatementId, name: Option<&str>, context: Option<&str>, plan: Plan) -> Self {
        let name = name.map(str::to_string).unwrap_or_else(|| format!("stmt-{}", id.0));
        Self {
            id,
            text: plan.describe(),
            dispatcher: Dispatcher::new(&name),
            name,
            context: context.map(str::to_string),
            plan: Arc::new(plan),
        }
    }
    pub fn id(&self) -> StatementId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The statement as text, with bound parameters shown as literals.
    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
    pub fn output_type(&self) -> &Arc<EventType> {
        self.plan.output_type()
    }
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
    pub(crate) fn accepts(&self, event: &Event) -> bool {
        let source = self.plan.source();
        Arc::ptr_eq(event.event_type(), source) || event.event_type().id() == source.id()
    }
    pub(crate) fn instantiate(&self, now: Timestamp) -> Result<StatementInstance> {
        StatementInstance::new(Arc::clone(&self.plan), now)
    }
    pub(crate) fn enqueue(&self, partition: PartitionId, drained: Drained) {
        self.dispatcher.enqueue(OutputBatch {
            statement: self.id,
            statement_name: self.name.clone(),
            context: self.context.clone(),
            partition,
            terminal: drained.terminal,
            inserted: drained.inserted,
            removed: drained.removed,
        });
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.name, self.text)
    }
}
