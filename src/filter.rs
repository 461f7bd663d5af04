//! Expressions: the builder tree a front end hands over ([`Expr`]), and the
//! compiled form that statements evaluate per event ([`CompiledExpr`]).
//!
//! Compilation resolves every attribute to a (stream, position) pair within a
//! [`Scope`], declares substitution parameters, and collects aggregate calls.
//! Parameters stay as placeholders in the compiled template until
//! [`CompiledExpr::bind`] copies the bound values in.

use std::fmt;
use std::sync::Arc;

use bigdecimal::BigDecimal;
use std::cmp::Ordering;

use crate::aggregation::{Accessor, Accumulator, AggregateKind};
use crate::datatype::{Value, ValueType};
use crate::error::{ContinuumError, Result};
use crate::parameter::{ParameterRef, ParameterSlots};
use crate::relation::{RelationHandle, RelationKeeper};
use crate::schema::{Event, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}
impl CompareOp {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}
impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let op = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}
impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let op = match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        };
        write!(f, "{}", op)
    }
}

// ------------- Expr -------------
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Attribute { stream: Option<String>, name: String },
    /// The whole event of a stream, e.g. `s0` in `s0.getTheString()`.
    Stream(String),
    Literal(Value),
    Parameter(ParameterRef),
    Method { target: Box<Expr>, method: String },
    Compare { op: CompareOp, left: Box<Expr>, right: Box<Expr> },
    Arith { op: ArithOp, left: Box<Expr>, right: Box<Expr> },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    In { expr: Box<Expr>, list: Vec<Expr>, negated: bool },
    Aggregate { kind: AggregateKind, argument: Option<Box<Expr>>, accessor: Accessor },
    Subselect(Box<Subselect>),
    TableAccess { table: String, key: Vec<Expr>, column: String },
}

/// `(select <select> from <relation> [as <alias>] where <filter>)`, evaluated
/// per outer event. Unqualified names resolve against the relation first.
#[derive(Debug, Clone, PartialEq)]
pub struct Subselect {
    pub relation: String,
    pub alias: Option<String>,
    pub select: Expr,
    pub filter: Option<Expr>,
}
impl Subselect {
    pub fn from(relation: &str, select: Expr) -> Self {
        Self {
            relation: relation.to_string(),
            alias: None,
            select,
            filter: None,
        }
    }
    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }
    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl Expr {
    pub fn attr(name: &str) -> Self {
        Expr::Attribute { stream: None, name: name.to_string() }
    }
    pub fn qualified(stream: &str, name: &str) -> Self {
        Expr::Attribute {
            stream: Some(stream.to_string()),
            name: name.to_string(),
        }
    }
    pub fn stream(alias: &str) -> Self {
        Expr::Stream(alias.to_string())
    }
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }
    pub fn param() -> Self {
        Expr::Parameter(ParameterRef::Positional)
    }
    pub fn named(name: &str) -> Self {
        Expr::Parameter(ParameterRef::Named(name.to_string()))
    }
    pub fn method(self, method: &str) -> Self {
        Expr::Method {
            target: Box::new(self),
            method: method.to_string(),
        }
    }
    fn compare(self, op: CompareOp, other: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }
    pub fn eq(self, other: Expr) -> Self {
        self.compare(CompareOp::Eq, other)
    }
    pub fn ne(self, other: Expr) -> Self {
        self.compare(CompareOp::Ne, other)
    }
    pub fn lt(self, other: Expr) -> Self {
        self.compare(CompareOp::Lt, other)
    }
    pub fn le(self, other: Expr) -> Self {
        self.compare(CompareOp::Le, other)
    }
    pub fn gt(self, other: Expr) -> Self {
        self.compare(CompareOp::Gt, other)
    }
    pub fn ge(self, other: Expr) -> Self {
        self.compare(CompareOp::Ge, other)
    }
    fn arith(self, op: ArithOp, other: Expr) -> Self {
        Expr::Arith {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }
    pub fn plus(self, other: Expr) -> Self {
        self.arith(ArithOp::Add, other)
    }
    pub fn minus(self, other: Expr) -> Self {
        self.arith(ArithOp::Sub, other)
    }
    pub fn times(self, other: Expr) -> Self {
        self.arith(ArithOp::Mul, other)
    }
    pub fn divided_by(self, other: Expr) -> Self {
        self.arith(ArithOp::Div, other)
    }
    pub fn and(self, other: Expr) -> Self {
        Expr::And(Box::new(self), Box::new(other))
    }
    pub fn or(self, other: Expr) -> Self {
        Expr::Or(Box::new(self), Box::new(other))
    }
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }
    pub fn is_in(self, list: Vec<Expr>) -> Self {
        Expr::In {
            expr: Box::new(self),
            list,
            negated: false,
        }
    }
    pub fn not_in(self, list: Vec<Expr>) -> Self {
        Expr::In {
            expr: Box::new(self),
            list,
            negated: true,
        }
    }
    pub fn aggregate(kind: AggregateKind, argument: Option<Expr>) -> Self {
        Expr::Aggregate {
            kind,
            argument: argument.map(Box::new),
            accessor: Accessor::Value,
        }
    }
    pub fn sum(argument: Expr) -> Self {
        Self::aggregate(AggregateKind::Sum, Some(argument))
    }
    pub fn count(argument: Expr) -> Self {
        Self::aggregate(AggregateKind::Count, Some(argument))
    }
    pub fn count_star() -> Self {
        Self::aggregate(AggregateKind::CountStar, None)
    }
    /// Reads an aggregate through an accessor, e.g. `sorted(x).maxBy()`.
    pub fn access(self, accessor: Accessor) -> Self {
        match self {
            Expr::Aggregate { kind, argument, .. } => Expr::Aggregate { kind, argument, accessor },
            other => other,
        }
    }
    pub fn subselect(subselect: Subselect) -> Self {
        Expr::Subselect(Box::new(subselect))
    }
    pub fn table(table: &str, key: Vec<Expr>, column: &str) -> Self {
        Expr::TableAccess {
            table: table.to_string(),
            key,
            column: column.to_string(),
        }
    }

    pub fn has_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Method { target, .. } | Expr::Not(target) => target.has_aggregate(),
            Expr::Compare { left, right, .. } | Expr::Arith { left, right, .. } => {
                left.has_aggregate() || right.has_aggregate()
            }
            Expr::And(a, b) | Expr::Or(a, b) => a.has_aggregate() || b.has_aggregate(),
            Expr::In { expr, list, .. } => expr.has_aggregate() || list.iter().any(Expr::has_aggregate),
            _ => false,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Attribute { stream: Some(s), name } => write!(f, "{}.{}", s, name),
            Expr::Attribute { stream: None, name } => write!(f, "{}", name),
            Expr::Stream(s) => write!(f, "{}", s),
            Expr::Literal(v) => write!(f, "{}", v.render_literal()),
            Expr::Parameter(p) => write!(f, "{}", p),
            Expr::Method { target, method } => write!(f, "{}.{}()", target, method),
            Expr::Compare { op, left, right } => write!(f, "{}{}{}", left, op, right),
            Expr::Arith { op, left, right } => write!(f, "{}{}{}", left, op, right),
            Expr::And(a, b) => write!(f, "{} and {}", a, b),
            Expr::Or(a, b) => write!(f, "({} or {})", a, b),
            Expr::Not(e) => write!(f, "not {}", e),
            Expr::In { expr, list, negated } => {
                let items: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                let kw = if *negated { "not in" } else { "in" };
                write!(f, "{} {} ({})", expr, kw, items.join(","))
            }
            Expr::Aggregate { kind, argument, accessor } => {
                match argument {
                    Some(a) => write!(f, "{}({})", kind, a)?,
                    None => write!(f, "{}(*)", kind)?,
                }
                write_accessor(f, *accessor)
            }
            Expr::Subselect(s) => {
                write!(f, "(select {} from {}", s.select, s.relation)?;
                if let Some(alias) = &s.alias {
                    write!(f, " as {}", alias)?;
                }
                if let Some(filter) = &s.filter {
                    write!(f, " where {}", filter)?;
                }
                write!(f, ")")
            }
            Expr::TableAccess { table, key, column } => {
                let keys: Vec<String> = key.iter().map(|e| e.to_string()).collect();
                write!(f, "{}[{}].{}", table, keys.join(","), column)
            }
        }
    }
}

fn write_accessor(f: &mut fmt::Formatter, accessor: Accessor) -> fmt::Result {
    match accessor {
        Accessor::Value => Ok(()),
        Accessor::MinBy => write!(f, ".minBy()"),
        Accessor::MaxBy => write!(f, ".maxBy()"),
        Accessor::First => write!(f, ".first()"),
        Accessor::Last => write!(f, ".last()"),
    }
}

// ------------- Scope -------------
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub alias: Option<String>,
    pub event_type: Arc<EventType>,
}

/// The streams an expression may reference, in evaluation order.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    streams: Vec<StreamInfo>,
    preferred: Option<usize>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn single(event_type: Arc<EventType>, alias: Option<&str>) -> Self {
        let mut scope = Self::new();
        scope.push(event_type, alias);
        scope
    }
    pub fn push(&mut self, event_type: Arc<EventType>, alias: Option<&str>) -> usize {
        self.streams.push(StreamInfo {
            alias: alias.map(str::to_string),
            event_type,
        });
        self.streams.len() - 1
    }
    pub fn len(&self) -> usize {
        self.streams.len()
    }
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
    pub fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }
    fn find_stream(&self, qualifier: &str) -> Option<usize> {
        self.streams
            .iter()
            .position(|s| s.alias.as_deref() == Some(qualifier))
            .or_else(|| self.streams.iter().position(|s| s.event_type.name() == qualifier))
    }
    /// Resolves an attribute, rejecting unqualified names that more than one
    /// stream provides.
    pub fn resolve(&self, qualifier: Option<&str>, name: &str) -> Result<(usize, usize, ValueType)> {
        let found = |stream: usize| {
            let event_type = &self.streams[stream].event_type;
            event_type
                .position(name)
                .map(|i| (stream, i, event_type.attributes()[i].value_type().clone()))
        };
        if let Some(q) = qualifier {
            return self.find_stream(q).and_then(found).ok_or_else(|| ContinuumError::UnknownAttribute {
                name: format!("{}.{}", q, name),
            });
        }
        if let Some(hit) = self.preferred.and_then(found) {
            return Ok(hit);
        }
        let mut hits = (0..self.streams.len()).filter_map(found);
        match (hits.next(), hits.next()) {
            (Some(hit), None) => Ok(hit),
            (Some(_), Some(_)) => Err(ContinuumError::AmbiguousColumn { column: name.to_string() }),
            _ => Err(ContinuumError::UnknownAttribute { name: name.to_string() }),
        }
    }
}

// ------------- Compiled -------------
/// An aggregate call collected while compiling, owned by the statement.
#[derive(Debug, Clone)]
pub struct AggregateDef {
    pub kind: AggregateKind,
    pub argument: Option<CompiledExpr>,
    pub input_type: ValueType,
}

#[derive(Debug, Clone)]
pub enum CompiledExpr {
    Attribute { stream: usize, index: usize, value_type: ValueType, display: String },
    Stream { stream: usize, value_type: ValueType, display: String },
    Literal(Value),
    Parameter { slot: usize, display: String },
    /// A getter on an event whose type is only known at evaluation time.
    Method { target: Box<CompiledExpr>, method: String },
    Field { target: Box<CompiledExpr>, index: usize, value_type: ValueType, method: String },
    Compare { op: CompareOp, left: Box<CompiledExpr>, right: Box<CompiledExpr> },
    Arith { op: ArithOp, left: Box<CompiledExpr>, right: Box<CompiledExpr>, value_type: ValueType },
    And(Box<CompiledExpr>, Box<CompiledExpr>),
    Or(Box<CompiledExpr>, Box<CompiledExpr>),
    Not(Box<CompiledExpr>),
    In { expr: Box<CompiledExpr>, list: Vec<CompiledExpr>, negated: bool },
    Aggregate { slot: usize, accessor: Accessor, value_type: ValueType, display: String },
    Subselect(Box<CompiledSubselect>),
    TableAccess { table: RelationHandle, key: Vec<CompiledExpr>, column: usize, value_type: ValueType },
}

#[derive(Debug, Clone)]
pub struct CompiledSubselect {
    relation: RelationHandle,
    alias: Option<String>,
    inner: usize,
    select: CompiledExpr,
    filter: Option<CompiledExpr>,
}

/// Rows visible to one evaluation and the accumulators of the current group.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub streams: &'a [&'a Event],
    pub aggregates: &'a [Accumulator],
}

impl<'a> EvalContext<'a> {
    pub fn new(streams: &'a [&'a Event]) -> Self {
        Self { streams, aggregates: &[] }
    }
    pub fn with_aggregates(streams: &'a [&'a Event], aggregates: &'a [Accumulator]) -> Self {
        Self { streams, aggregates }
    }
}

// ------------- Compiler -------------
pub struct Compiler<'a> {
    relations: &'a RelationKeeper,
    parameters: &'a mut ParameterSlots,
    aggregates: Option<&'a mut Vec<AggregateDef>>,
}

impl<'a> Compiler<'a> {
    pub fn new(relations: &'a RelationKeeper, parameters: &'a mut ParameterSlots) -> Self {
        Self {
            relations,
            parameters,
            aggregates: None,
        }
    }
    /// Allows aggregate calls, collecting them into `aggregates`.
    pub fn with_aggregates(mut self, aggregates: &'a mut Vec<AggregateDef>) -> Self {
        self.aggregates = Some(aggregates);
        self
    }

    pub fn compile(&mut self, expr: &Expr, scope: &Scope) -> Result<CompiledExpr> {
        Ok(match expr {
            Expr::Attribute { stream, name } => {
                let (s, index, value_type) = scope.resolve(stream.as_deref(), name)?;
                CompiledExpr::Attribute {
                    stream: s,
                    index,
                    value_type,
                    display: expr.to_string(),
                }
            }
            Expr::Stream(alias) => {
                let s = scope
                    .find_stream(alias)
                    .ok_or_else(|| ContinuumError::UnknownAttribute { name: alias.clone() })?;
                CompiledExpr::Stream {
                    stream: s,
                    value_type: ValueType::Event(scope.streams[s].event_type.name().to_string()),
                    display: alias.clone(),
                }
            }
            Expr::Literal(v) => CompiledExpr::Literal(v.clone()),
            Expr::Parameter(p) => CompiledExpr::Parameter {
                slot: self.parameters.declare(p)?,
                display: p.to_string(),
            },
            Expr::Method { target, method } => {
                let target = self.compile(target, scope)?;
                match target.value_type() {
                    ValueType::Event(type_name) => {
                        let event_type = scope
                            .streams
                            .iter()
                            .map(|s| &s.event_type)
                            .find(|t| t.name() == type_name)
                            .cloned();
                        match event_type {
                            Some(t) => {
                                let index = t.resolve_getter(method).ok_or_else(|| ContinuumError::UnknownAttribute {
                                    name: format!("{}.{}()", target, method),
                                })?;
                                CompiledExpr::Field {
                                    value_type: t.attributes()[index].value_type().clone(),
                                    target: Box::new(target),
                                    index,
                                    method: method.clone(),
                                }
                            }
                            None => CompiledExpr::Method { target: Box::new(target), method: method.clone() },
                        }
                    }
                    _ => CompiledExpr::Method { target: Box::new(target), method: method.clone() },
                }
            }
            Expr::Compare { op, left, right } => {
                let left = self.compile(left, scope)?;
                let right = self.compile(right, scope)?;
                let compiled = CompiledExpr::Compare {
                    op: *op,
                    left: Box::new(left),
                    right: Box::new(right),
                };
                compiled.check_types()?;
                compiled
            }
            Expr::Arith { op, left, right } => {
                let left = self.compile(left, scope)?;
                let right = self.compile(right, scope)?;
                let value_type = arith_type(*op, &left.value_type(), &right.value_type())
                    .ok_or_else(|| not_numeric(*op, &left, &right))?;
                CompiledExpr::Arith {
                    op: *op,
                    left: Box::new(left),
                    right: Box::new(right),
                    value_type,
                }
            }
            Expr::And(a, b) => CompiledExpr::And(Box::new(self.compile(a, scope)?), Box::new(self.compile(b, scope)?)),
            Expr::Or(a, b) => CompiledExpr::Or(Box::new(self.compile(a, scope)?), Box::new(self.compile(b, scope)?)),
            Expr::Not(e) => CompiledExpr::Not(Box::new(self.compile(e, scope)?)),
            Expr::In { expr, list, negated } => {
                let expr = self.compile(expr, scope)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    let item = self.compile(item, scope)?;
                    items.push(item);
                }
                let compiled = CompiledExpr::In {
                    expr: Box::new(expr),
                    list: items,
                    negated: *negated,
                };
                compiled.check_types()?;
                compiled
            }
            Expr::Aggregate { kind, argument, accessor } => {
                let argument = match argument {
                    Some(a) if kind.takes_argument() => {
                        if a.has_aggregate() {
                            return Err(ContinuumError::Validation(format!("aggregate functions cannot be nested in '{}'", expr)));
                        }
                        Some(self.compile(a, scope)?)
                    }
                    None if kind.takes_argument() => {
                        return Err(ContinuumError::Validation(format!("aggregation '{}' requires an argument", kind)))
                    }
                    _ => None,
                };
                let input_type = argument.as_ref().map(CompiledExpr::value_type).unwrap_or(ValueType::Null);
                let row_type = scope
                    .streams
                    .first()
                    .map(|s| ValueType::Event(s.event_type.name().to_string()))
                    .unwrap_or(ValueType::Null);
                let value_type = kind.result_type(&input_type, &row_type, *accessor)?;
                let aggregates = self.aggregates.as_mut().ok_or_else(|| {
                    ContinuumError::Validation(format!("aggregate function '{}' is not allowed here", expr))
                })?;
                aggregates.push(AggregateDef {
                    kind: *kind,
                    argument,
                    input_type,
                });
                CompiledExpr::Aggregate {
                    slot: aggregates.len() - 1,
                    accessor: *accessor,
                    value_type,
                    display: expr.to_string(),
                }
            }
            Expr::Subselect(sub) => {
                let relation = self.relations.get(&sub.relation)?;
                let mut inner_scope = scope.clone();
                let inner = inner_scope.push(Arc::clone(relation.row_type()), sub.alias.as_deref());
                inner_scope.preferred = Some(inner);
                // aggregates inside a subselect belong to no group of ours
                let mut nested = Compiler::new(self.relations, &mut *self.parameters);
                let select = nested.compile(&sub.select, &inner_scope)?;
                let filter = match &sub.filter {
                    Some(f) => Some(nested.compile(f, &inner_scope)?),
                    None => None,
                };
                CompiledExpr::Subselect(Box::new(CompiledSubselect {
                    relation,
                    alias: sub.alias.clone(),
                    inner,
                    select,
                    filter,
                }))
            }
            Expr::TableAccess { table, key, column } => {
                let handle = self.relations.get(table)?;
                let primary = handle.key_columns().len();
                if primary == 0 || primary != key.len() {
                    return Err(ContinuumError::Validation(format!(
                        "table '{}' expects {} key expressions but received {}",
                        table,
                        primary,
                        key.len()
                    )));
                }
                let index = handle.row_type().position(column).ok_or_else(|| ContinuumError::UnknownAttribute {
                    name: format!("{}.{}", table, column),
                })?;
                let value_type = handle.row_type().attributes()[index].value_type().clone();
                let mut keys = Vec::with_capacity(key.len());
                for k in key {
                    keys.push(self.compile(k, scope)?);
                }
                CompiledExpr::TableAccess {
                    table: handle,
                    key: keys,
                    column: index,
                    value_type,
                }
            }
        })
    }

}

fn not_numeric(op: ArithOp, left: &CompiledExpr, right: &CompiledExpr) -> ContinuumError {
    ContinuumError::Validation(format!(
        "Implicit conversion from datatype '{}' to numeric is not allowed in '{}{}{}'",
        if left.value_type().is_numeric() { right.value_type() } else { left.value_type() },
        left,
        op,
        right
    ))
}

fn arith_type(op: ArithOp, left: &ValueType, right: &ValueType) -> Option<ValueType> {
    let known = |t: &ValueType| t.is_numeric() || *t == ValueType::Null;
    if !known(left) || !known(right) {
        return None;
    }
    let widest = if left.is_assignable_to(right) { right.clone() } else { left.clone() };
    Some(match (op, widest) {
        (ArithOp::Div, ValueType::Decimal) => ValueType::Decimal,
        (ArithOp::Div, _) => ValueType::Double,
        (_, widest) => widest,
    })
}

fn arith(op: ArithOp, left: &Value, right: &Value) -> Result<Value> {
    let overflow = || ContinuumError::Evaluation(format!("numeric overflow in {}{}{}", left, op, right));
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    if op == ArithOp::Div {
        if right.as_f64() == Some(0.0) {
            return Err(ContinuumError::Evaluation(format!("division by zero in {}/{}", left, right)));
        }
        if matches!(left, Value::Decimal(_)) || matches!(right, Value::Decimal(_)) {
            let (a, b) = (left.as_decimal(), right.as_decimal());
            return a.zip(b).map(|(a, b)| Value::Decimal(a / b)).ok_or_else(overflow);
        }
        let (a, b) = (left.as_f64(), right.as_f64());
        return a.zip(b).map(|(a, b)| Value::Double(a / b)).ok_or_else(overflow);
    }
    Ok(match (left, right) {
        (Value::Int(a), Value::Int(b)) => Value::Int(
            match op {
                ArithOp::Add => a.checked_add(*b),
                ArithOp::Sub => a.checked_sub(*b),
                _ => a.checked_mul(*b),
            }
            .ok_or_else(overflow)?,
        ),
        (Value::Int(_) | Value::Long(_), Value::Int(_) | Value::Long(_)) => {
            let (a, b) = (left.as_i64().ok_or_else(overflow)?, right.as_i64().ok_or_else(overflow)?);
            Value::Long(
                match op {
                    ArithOp::Add => a.checked_add(b),
                    ArithOp::Sub => a.checked_sub(b),
                    _ => a.checked_mul(b),
                }
                .ok_or_else(overflow)?,
            )
        }
        (Value::Decimal(_), _) | (_, Value::Decimal(_)) => {
            let (a, b): (BigDecimal, BigDecimal) = (left.as_decimal().ok_or_else(overflow)?, right.as_decimal().ok_or_else(overflow)?);
            Value::Decimal(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                _ => a * b,
            })
        }
        _ => {
            let (a, b) = (left.as_f64().ok_or_else(overflow)?, right.as_f64().ok_or_else(overflow)?);
            Value::Double(match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                _ => a * b,
            })
        }
    })
}

fn truth(value: &Value) -> Option<bool> {
    value.as_bool()
}

fn getter(value: &Value, method: &str, shown: &dyn fmt::Display) -> Result<Value> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Event(e) => e
            .event_type()
            .resolve_getter(method)
            .map(|i| e.value(i).clone())
            .ok_or_else(|| ContinuumError::UnknownAttribute {
                name: format!("{}.{}()", shown, method),
            }),
        other => Err(ContinuumError::Evaluation(format!(
            "method '{}' cannot be invoked on a value of type {}",
            method,
            other.value_type()
        ))),
    }
}

impl CompiledExpr {
    pub fn value_type(&self) -> ValueType {
        match self {
            CompiledExpr::Attribute { value_type, .. }
            | CompiledExpr::Stream { value_type, .. }
            | CompiledExpr::Field { value_type, .. }
            | CompiledExpr::Arith { value_type, .. }
            | CompiledExpr::Aggregate { value_type, .. }
            | CompiledExpr::TableAccess { value_type, .. } => value_type.clone(),
            CompiledExpr::Literal(v) => v.value_type(),
            CompiledExpr::Parameter { .. } | CompiledExpr::Method { .. } => ValueType::Null,
            CompiledExpr::Compare { .. }
            | CompiledExpr::And(..)
            | CompiledExpr::Or(..)
            | CompiledExpr::Not(_)
            | CompiledExpr::In { .. } => ValueType::Boolean,
            CompiledExpr::Subselect(sub) => sub.select.value_type(),
        }
    }

    pub fn has_parameters(&self) -> bool {
        match self {
            CompiledExpr::Parameter { .. } => true,
            CompiledExpr::Method { target, .. } | CompiledExpr::Field { target, .. } | CompiledExpr::Not(target) => {
                target.has_parameters()
            }
            CompiledExpr::Compare { left, right, .. } | CompiledExpr::Arith { left, right, .. } => {
                left.has_parameters() || right.has_parameters()
            }
            CompiledExpr::And(a, b) | CompiledExpr::Or(a, b) => a.has_parameters() || b.has_parameters(),
            CompiledExpr::In { expr, list, .. } => expr.has_parameters() || list.iter().any(CompiledExpr::has_parameters),
            CompiledExpr::Subselect(sub) => {
                sub.select.has_parameters() || sub.filter.as_ref().is_some_and(CompiledExpr::has_parameters)
            }
            CompiledExpr::TableAccess { key, .. } => key.iter().any(CompiledExpr::has_parameters),
            _ => false,
        }
    }

    /// Whether evaluating this reads `relation`.
    pub fn references(&self, relation: &str) -> bool {
        match self {
            CompiledExpr::Subselect(sub) => {
                sub.relation.name() == relation
                    || sub.select.references(relation)
                    || sub.filter.as_ref().is_some_and(|f| f.references(relation))
            }
            CompiledExpr::TableAccess { table, key, .. } => {
                table.name() == relation || key.iter().any(|k| k.references(relation))
            }
            CompiledExpr::Method { target, .. } | CompiledExpr::Field { target, .. } | CompiledExpr::Not(target) => {
                target.references(relation)
            }
            CompiledExpr::Compare { left, right, .. } | CompiledExpr::Arith { left, right, .. } => {
                left.references(relation) || right.references(relation)
            }
            CompiledExpr::And(a, b) | CompiledExpr::Or(a, b) => a.references(relation) || b.references(relation),
            CompiledExpr::In { expr, list, .. } => expr.references(relation) || list.iter().any(|e| e.references(relation)),
            _ => false,
        }
    }

    fn static_type(&self) -> Option<ValueType> {
        match self.value_type() {
            ValueType::Null => None,
            t => Some(t),
        }
    }

    fn mismatch(&self, from: &ValueType, to: &ValueType) -> ContinuumError {
        ContinuumError::TypeMismatch {
            expression: self.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    // Comparisons between two known types must be able to widen one way.
    fn check_types(&self) -> Result<()> {
        match self {
            CompiledExpr::Compare { left, right, .. } => {
                if let (Some(l), Some(r)) = (left.static_type(), right.static_type()) {
                    if !l.is_comparable_with(&r) {
                        let (from, to) = if matches!(**right, CompiledExpr::Literal(_)) { (r, l) } else { (l, r) };
                        return Err(self.mismatch(&from, &to));
                    }
                }
                Ok(())
            }
            CompiledExpr::In { expr, list, .. } => {
                if let Some(target) = expr.static_type() {
                    for item in list {
                        if let Some(t) = item.static_type() {
                            if !t.is_comparable_with(&target) {
                                return Err(self.mismatch(&t, &target));
                            }
                        }
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// A copy with every parameter replaced by its bound value. Getter calls
    /// on bound events are folded and comparison sites are type checked.
    pub fn bind(&self, values: &[Value]) -> Result<CompiledExpr> {
        let bind_box = |e: &CompiledExpr| -> Result<Box<CompiledExpr>> { Ok(Box::new(e.bind(values)?)) };
        let bound = match self {
            CompiledExpr::Parameter { slot, .. } => CompiledExpr::Literal(
                values
                    .get(*slot)
                    .cloned()
                    .ok_or_else(|| ContinuumError::UnboundParameter { index: slot + 1, name: None })?,
            ),
            CompiledExpr::Method { target, method } => {
                let target = target.bind(values)?;
                match &target {
                    CompiledExpr::Literal(v) => CompiledExpr::Literal(getter(v, method, &target)?),
                    _ => CompiledExpr::Method { target: Box::new(target), method: method.clone() },
                }
            }
            CompiledExpr::Field { target, index, value_type, method } => CompiledExpr::Field {
                target: bind_box(target)?,
                index: *index,
                value_type: value_type.clone(),
                method: method.clone(),
            },
            CompiledExpr::Compare { op, left, right } => {
                let bound = CompiledExpr::Compare {
                    op: *op,
                    left: bind_box(left)?,
                    right: bind_box(right)?,
                };
                bound.check_types()?;
                bound
            }
            CompiledExpr::Arith { op, left, right, value_type } => {
                let (left, right) = (bind_box(left)?, bind_box(right)?);
                // a bound parameter now has a type of its own
                if arith_type(*op, &left.value_type(), &right.value_type()).is_none() {
                    return Err(not_numeric(*op, &left, &right));
                }
                CompiledExpr::Arith {
                    op: *op,
                    left,
                    right,
                    value_type: value_type.clone(),
                }
            }
            CompiledExpr::And(a, b) => CompiledExpr::And(bind_box(a)?, bind_box(b)?),
            CompiledExpr::Or(a, b) => CompiledExpr::Or(bind_box(a)?, bind_box(b)?),
            CompiledExpr::Not(e) => CompiledExpr::Not(bind_box(e)?),
            CompiledExpr::In { expr, list, negated } => {
                let bound = CompiledExpr::In {
                    expr: bind_box(expr)?,
                    list: list.iter().map(|e| e.bind(values)).collect::<Result<Vec<_>>>()?,
                    negated: *negated,
                };
                bound.check_types()?;
                bound
            }
            CompiledExpr::Subselect(sub) => CompiledExpr::Subselect(Box::new(CompiledSubselect {
                relation: Arc::clone(&sub.relation),
                alias: sub.alias.clone(),
                inner: sub.inner,
                select: sub.select.bind(values)?,
                filter: sub.filter.as_ref().map(|f| f.bind(values)).transpose()?,
            })),
            CompiledExpr::TableAccess { table, key, column, value_type } => CompiledExpr::TableAccess {
                table: Arc::clone(table),
                key: key.iter().map(|e| e.bind(values)).collect::<Result<Vec<_>>>()?,
                column: *column,
                value_type: value_type.clone(),
            },
            other => other.clone(),
        };
        Ok(bound)
    }

    pub fn eval(&self, ctx: &EvalContext) -> Result<Value> {
        match self {
            CompiledExpr::Attribute { stream, index, .. } => Ok(ctx
                .streams
                .get(*stream)
                .map(|e| e.value(*index).clone())
                .unwrap_or(Value::Null)),
            CompiledExpr::Stream { stream, .. } => Ok(ctx
                .streams
                .get(*stream)
                .map(|e| Value::Event((*e).clone()))
                .unwrap_or(Value::Null)),
            CompiledExpr::Literal(v) => Ok(v.clone()),
            CompiledExpr::Parameter { slot, .. } => Err(ContinuumError::UnboundParameter { index: slot + 1, name: None }),
            CompiledExpr::Method { target, method } => getter(&target.eval(ctx)?, method, target),
            CompiledExpr::Field { target, index, .. } => Ok(match target.eval(ctx)? {
                Value::Event(e) => e.value(*index).clone(),
                _ => Value::Null,
            }),
            CompiledExpr::Compare { op, left, right } => {
                let (l, r) = (left.eval(ctx)?, right.eval(ctx)?);
                Ok(match l.compare(&r) {
                    Some(ordering) => Value::Bool(op.holds(ordering)),
                    None if l.is_null() || r.is_null() => Value::Null,
                    // differing events or arrays are never equal
                    None => Value::Bool(*op == CompareOp::Ne),
                })
            }
            CompiledExpr::Arith { op, left, right, .. } => arith(*op, &left.eval(ctx)?, &right.eval(ctx)?),
            CompiledExpr::And(a, b) => {
                let l = truth(&a.eval(ctx)?);
                if l == Some(false) {
                    return Ok(Value::Bool(false));
                }
                let r = truth(&b.eval(ctx)?);
                Ok(match (l, r) {
                    (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                })
            }
            CompiledExpr::Or(a, b) => {
                let l = truth(&a.eval(ctx)?);
                if l == Some(true) {
                    return Ok(Value::Bool(true));
                }
                let r = truth(&b.eval(ctx)?);
                Ok(match (l, r) {
                    (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            CompiledExpr::Not(e) => Ok(match truth(&e.eval(ctx)?) {
                Some(b) => Value::Bool(!b),
                None => Value::Null,
            }),
            CompiledExpr::In { expr, list, negated } => {
                let v = expr.eval(ctx)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                for item in list {
                    if v.loose_eq(&item.eval(ctx)?) {
                        return Ok(Value::Bool(!negated));
                    }
                }
                Ok(Value::Bool(*negated))
            }
            CompiledExpr::Aggregate { slot, accessor, .. } => match ctx.aggregates.get(*slot) {
                Some(acc) => acc.access(*accessor),
                None => Ok(Value::Null),
            },
            CompiledExpr::Subselect(sub) => sub.eval(ctx),
            CompiledExpr::TableAccess { table, key, column, .. } => {
                let key = key.iter().map(|k| k.eval(ctx)).collect::<Result<Vec<_>>>()?;
                let relation = table.read()?;
                Ok(relation
                    .get_by_key(&key)
                    .map(|row| row.value(*column).clone())
                    .unwrap_or(Value::Null))
            }
        }
    }

    /// Filters accept only a true result; null counts as false.
    pub fn eval_bool(&self, ctx: &EvalContext) -> Result<bool> {
        Ok(self.eval(ctx)?.as_bool().unwrap_or(false))
    }
}

impl CompiledSubselect {
    // An equality on an indexed relation column against outer values only
    // becomes a lookup instead of a scan.
    fn indexed_lookup(&self, ctx: &EvalContext) -> Result<Option<Vec<Event>>> {
        if let Some(CompiledExpr::Compare { op: CompareOp::Eq, left, right }) = &self.filter {
            for (inner_side, outer_side) in [(left, right), (right, left)] {
                if let CompiledExpr::Attribute { stream, index, .. } = inner_side.as_ref() {
                    if *stream == self.inner && !outer_side.reads_stream(self.inner) {
                        let wanted = outer_side.eval(ctx)?;
                        let relation = self.relation.read()?;
                        if let Some(rows) = relation.indexed(*index, &wanted) {
                            return Ok(Some(rows));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn eval(&self, ctx: &EvalContext) -> Result<Value> {
        let candidates = match self.indexed_lookup(ctx)? {
            Some(rows) => rows,
            None => self.relation.read()?.rows(),
        };
        for row in &candidates {
            let mut streams: Vec<&Event> = ctx.streams.to_vec();
            streams.push(row);
            let inner = EvalContext::new(&streams);
            let matched = match &self.filter {
                Some(filter) => filter.eval_bool(&inner)?,
                None => true,
            };
            if matched {
                return self.select.eval(&inner);
            }
        }
        Ok(Value::Null)
    }
}

impl CompiledExpr {
    pub(crate) fn reads_stream(&self, stream: usize) -> bool {
        match self {
            CompiledExpr::Attribute { stream: s, .. } | CompiledExpr::Stream { stream: s, .. } => *s == stream,
            CompiledExpr::Method { target, .. } | CompiledExpr::Field { target, .. } | CompiledExpr::Not(target) => {
                target.reads_stream(stream)
            }
            CompiledExpr::Compare { left, right, .. } | CompiledExpr::Arith { left, right, .. } => {
                left.reads_stream(stream) || right.reads_stream(stream)
            }
            CompiledExpr::And(a, b) | CompiledExpr::Or(a, b) => a.reads_stream(stream) || b.reads_stream(stream),
            CompiledExpr::In { expr, list, .. } => expr.reads_stream(stream) || list.iter().any(|e| e.reads_stream(stream)),
            CompiledExpr::Subselect(_) | CompiledExpr::TableAccess { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompiledExpr::Attribute { display, .. }
            | CompiledExpr::Stream { display, .. }
            | CompiledExpr::Parameter { display, .. } => write!(f, "{}", display),
            CompiledExpr::Literal(v) => write!(f, "{}", v.render_literal()),
            CompiledExpr::Method { target, method } | CompiledExpr::Field { target, method, .. } => {
                write!(f, "{}.{}()", target, method)
            }
            CompiledExpr::Compare { op, left, right } => write!(f, "{}{}{}", left, op, right),
            CompiledExpr::Arith { op, left, right, .. } => write!(f, "{}{}{}", left, op, right),
            CompiledExpr::And(a, b) => write!(f, "{} and {}", a, b),
            CompiledExpr::Or(a, b) => write!(f, "({} or {})", a, b),
            CompiledExpr::Not(e) => write!(f, "not {}", e),
            CompiledExpr::In { expr, list, negated } => {
                let items: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                let kw = if *negated { "not in" } else { "in" };
                write!(f, "{} {} ({})", expr, kw, items.join(","))
            }
            CompiledExpr::Aggregate { display, .. } => write!(f, "{}", display),
            CompiledExpr::Subselect(sub) => {
                write!(f, "(select {} from {}", sub.select, sub.relation.name())?;
                if let Some(alias) = &sub.alias {
                    write!(f, " as {}", alias)?;
                }
                if let Some(filter) = &sub.filter {
                    write!(f, " where {}", filter)?;
                }
                write!(f, ")")
            }
            CompiledExpr::TableAccess { table, key, column, .. } => {
                let keys: Vec<String> = key.iter().map(|e| e.to_string()).collect();
                let name = table.row_type().attributes()[*column].name().to_string();
                write!(f, "{}[{}].{}", table.name(), keys.join(","), name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;

    fn support_bean() -> Arc<EventType> {
        EventType::anonymous(
            "SupportBean",
            vec![
                Attribute::new("theString", ValueType::String),
                Attribute::new("intPrimitive", ValueType::Integer),
                Attribute::new("longPrimitive", ValueType::Long),
            ],
        )
    }

    fn compile(expr: &Expr, slots: &mut ParameterSlots) -> Result<CompiledExpr> {
        let relations = RelationKeeper::new();
        let scope = Scope::single(support_bean(), None);
        Compiler::new(&relations, slots).compile(expr, &scope)
    }

    fn event(s: &str, i: i32) -> Event {
        Event::new(support_bean(), vec![Value::from(s), Value::Int(i), Value::Long(i as i64)]).unwrap()
    }

    #[test]
    fn bound_parameters_render_as_literals() {
        let mut slots = ParameterSlots::new();
        let template = compile(&Expr::attr("theString").eq(Expr::param()), &mut slots).unwrap();
        assert_eq!(slots.len(), 1);
        let bound = template.bind(&[Value::from("e1")]).unwrap();
        assert_eq!(bound.to_string(), "theString=\"e1\"");
        let e = event("e1", 1);
        assert!(bound.eval_bool(&EvalContext::new(&[&e])).unwrap());
        assert_eq!(
            template.bind(&[Value::Int(-1)]).unwrap_err().to_string(),
            "Failed to validate filter expression 'theString=-1': Implicit conversion from datatype 'Integer' to 'String' is not allowed"
        );
    }

    #[test]
    fn arithmetic_parameters_are_checked_when_bound() {
        let mut slots = ParameterSlots::new();
        let template = compile(&Expr::attr("intPrimitive").plus(Expr::param()).gt(Expr::lit(5)), &mut slots).unwrap();
        assert_eq!(
            template.bind(&[Value::from("x")]).unwrap_err().to_string(),
            "Validation error: Implicit conversion from datatype 'String' to numeric is not allowed in 'intPrimitive+\"x\"'"
        );
        let bound = template.bind(&[Value::Int(3)]).unwrap();
        assert!(bound.eval_bool(&EvalContext::new(&[&event("e", 3)])).unwrap());
        assert!(template.bind(&[Value::Null]).is_ok());
    }

    #[test]
    fn getters_on_bound_events_fold() {
        let mut slots = ParameterSlots::new();
        let template = compile(&Expr::attr("theString").eq(Expr::param().method("getTheString")), &mut slots).unwrap();
        let bound = template.bind(&[Value::Event(event("e2", 0))]).unwrap();
        assert_eq!(bound.to_string(), "theString=\"e2\"");
    }

    #[test]
    fn in_lists_and_widening() {
        let mut slots = ParameterSlots::new();
        let template = compile(&Expr::attr("longPrimitive").is_in(vec![Expr::param(), Expr::param()]), &mut slots).unwrap();
        let bound = template.bind(&[Value::Int(1), Value::Long(3)]).unwrap();
        let (hit, miss) = (event("a", 3), event("b", 2));
        assert!(bound.eval_bool(&EvalContext::new(&[&hit])).unwrap());
        assert!(!bound.eval_bool(&EvalContext::new(&[&miss])).unwrap());
    }

    #[test]
    fn ambiguous_columns_are_rejected() {
        let relations = RelationKeeper::new();
        let mut slots = ParameterSlots::new();
        let mut scope = Scope::single(support_bean(), Some("s0"));
        scope.push(support_bean(), Some("win"));
        let mut compiler = Compiler::new(&relations, &mut slots);
        assert_eq!(
            compiler.compile(&Expr::attr("theString"), &scope).unwrap_err().to_string(),
            "Ambiguous table column 'theString' should be prefixed by a stream name"
        );
        assert!(compiler.compile(&Expr::qualified("win", "theString"), &scope).is_ok());
    }

    #[test]
    fn arithmetic_faults_surface_as_errors() {
        let mut slots = ParameterSlots::new();
        let expr = compile(&Expr::lit(10).divided_by(Expr::attr("intPrimitive")), &mut slots).unwrap();
        let zero = event("z", 0);
        assert!(expr.eval(&EvalContext::new(&[&zero])).is_err());
        let two = event("t", 2);
        assert_eq!(expr.eval(&EvalContext::new(&[&two])).unwrap(), Value::Double(5.0));
    }

    #[test]
    fn aggregates_need_a_collector() {
        let mut slots = ParameterSlots::new();
        assert!(compile(&Expr::sum(Expr::attr("intPrimitive")), &mut slots).is_err());
    }
}
