//! Incremental aggregation.
//!
//! Every accumulator supports `add` and its exact inverse `remove`. Removing a
//! value that was never added fails with [`ContinuumError::AccumulatorUnderflow`]
//! and leaves the accumulator as it was.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use bigdecimal::{BigDecimal, ToPrimitive, Zero};

use crate::datatype::{Value, ValueType};
use crate::error::{ContinuumError, Result};
use crate::schema::Event;
use crate::OtherHasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Sum,
    Count,
    CountStar,
    Avg,
    Min,
    Max,
    /// Rows ordered by the argument value.
    Sorted,
    /// Rows in arrival order, optionally only the N most recent.
    Window(Option<usize>),
    MostFrequent,
}

/// What a reference to an accumulator reads from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Accessor {
    #[default]
    Value,
    MinBy,
    MaxBy,
    First,
    Last,
}

impl AggregateKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateKind::Sum => "sum",
            AggregateKind::Count | AggregateKind::CountStar => "count",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::Sorted => "sorted",
            AggregateKind::Window(_) => "window",
            AggregateKind::MostFrequent => "mostFrequent",
        }
    }
    /// `count(*)` and `window(*)` aggregate whole rows.
    pub fn takes_argument(&self) -> bool {
        !matches!(self, AggregateKind::CountStar | AggregateKind::Window(_))
    }
    pub fn supports(&self, accessor: Accessor) -> bool {
        match accessor {
            Accessor::Value => true,
            Accessor::MinBy | Accessor::MaxBy => *self == AggregateKind::Sorted,
            Accessor::First | Accessor::Last => matches!(self, AggregateKind::Sorted | AggregateKind::Window(_)),
        }
    }
    /// The type read through `accessor`, given the argument and row types.
    pub fn result_type(&self, input: &ValueType, row: &ValueType, accessor: Accessor) -> Result<ValueType> {
        if !self.supports(accessor) {
            return Err(ContinuumError::Validation(format!(
                "aggregation '{}' does not provide {:?}",
                self.name(),
                accessor
            )));
        }
        Ok(match self {
            AggregateKind::Sum => match input {
                ValueType::Integer | ValueType::Long | ValueType::Double | ValueType::Decimal => input.clone(),
                ValueType::Null => ValueType::Null,
                other => {
                    return Err(ContinuumError::Validation(format!(
                        "Implicit conversion from datatype '{}' to numeric is not allowed for aggregation function 'sum'",
                        other
                    )))
                }
            },
            AggregateKind::Count | AggregateKind::CountStar => ValueType::Long,
            AggregateKind::Avg => {
                if !input.is_numeric() && *input != ValueType::Null {
                    return Err(ContinuumError::Validation(format!(
                        "Implicit conversion from datatype '{}' to numeric is not allowed for aggregation function 'avg'",
                        input
                    )));
                }
                ValueType::Double
            }
            AggregateKind::Min | AggregateKind::Max | AggregateKind::MostFrequent => input.clone(),
            AggregateKind::Sorted | AggregateKind::Window(_) => match accessor {
                Accessor::Value => ValueType::Array(Box::new(row.clone())),
                _ => row.clone(),
            },
        })
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ------------- Accumulator -------------
#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum { total: Value, count: u64 },
    Count { count: i64, star: bool },
    Avg { total: BigDecimal, count: u64 },
    Extreme { values: BTreeMap<Value, usize>, max: bool },
    Sorted { entries: BTreeMap<Value, Vec<Event>> },
    Window { rows: VecDeque<Event>, limit: Option<usize> },
    MostFrequent { counts: HashMap<Value, usize, OtherHasher> },
}

fn mismatch(kind: &str, value: &Value) -> ContinuumError {
    ContinuumError::Evaluation(format!("{} cannot accumulate a value of type {}", kind, value.value_type()))
}

// true when the count dropped to zero
fn decrement(count: Option<&mut usize>) -> bool {
    match count {
        Some(n) => {
            *n -= 1;
            *n == 0
        }
        None => false,
    }
}

fn zero_of(input: &ValueType) -> Value {
    match input {
        ValueType::Long => Value::Long(0),
        ValueType::Double => Value::Double(0.0),
        ValueType::Decimal => Value::Decimal(BigDecimal::zero()),
        _ => Value::Int(0),
    }
}

// sum(int) wraps like the integer type it sums
fn shift(total: &Value, value: &Value, negate: bool) -> Option<Value> {
    Some(match total {
        Value::Int(t) => {
            let v = match value {
                Value::Int(v) => *v,
                _ => return None,
            };
            Value::Int(if negate { t.wrapping_sub(v) } else { t.wrapping_add(v) })
        }
        Value::Long(t) => {
            let v = value.as_i64()?;
            Value::Long(if negate { t.wrapping_sub(v) } else { t.wrapping_add(v) })
        }
        Value::Double(t) => {
            let v = match value {
                Value::Decimal(_) => return None,
                other => other.as_f64()?,
            };
            Value::Double(if negate { t - v } else { t + v })
        }
        Value::Decimal(t) => {
            let v = value.as_decimal()?;
            Value::Decimal(if negate { t - v } else { t + v })
        }
        _ => return None,
    })
}

impl Accumulator {
    pub fn new(kind: AggregateKind, input: &ValueType) -> Self {
        match kind {
            AggregateKind::Sum => Accumulator::Sum { total: zero_of(input), count: 0 },
            AggregateKind::Count => Accumulator::Count { count: 0, star: false },
            AggregateKind::CountStar => Accumulator::Count { count: 0, star: true },
            AggregateKind::Avg => Accumulator::Avg { total: BigDecimal::zero(), count: 0 },
            AggregateKind::Min => Accumulator::Extreme { values: BTreeMap::new(), max: false },
            AggregateKind::Max => Accumulator::Extreme { values: BTreeMap::new(), max: true },
            AggregateKind::Sorted => Accumulator::Sorted { entries: BTreeMap::new() },
            AggregateKind::Window(limit) => Accumulator::Window { rows: VecDeque::new(), limit },
            AggregateKind::MostFrequent => Accumulator::MostFrequent { counts: HashMap::default() },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Accumulator::Sum { .. } => "sum",
            Accumulator::Count { .. } => "count",
            Accumulator::Avg { .. } => "avg",
            Accumulator::Extreme { max: false, .. } => "min",
            Accumulator::Extreme { max: true, .. } => "max",
            Accumulator::Sorted { .. } => "sorted",
            Accumulator::Window { .. } => "window",
            Accumulator::MostFrequent { .. } => "mostFrequent",
        }
    }


    /// `value` is the evaluated argument, `row` the row it came from.
    pub fn add(&mut self, value: &Value, row: &Event) -> Result<()> {
        let kind = self.kind();
        match self {
            Accumulator::Count { count, star } => {
                if *star || !value.is_null() {
                    *count += 1;
                }
            }
            Accumulator::Sorted { entries } => entries.entry(value.clone()).or_default().push(row.clone()),
            Accumulator::Window { rows, limit } => {
                rows.push_back(row.clone());
                if let Some(limit) = limit {
                    while rows.len() > *limit {
                        rows.pop_front();
                    }
                }
            }
            _ if value.is_null() => (),
            Accumulator::Sum { total, count } => {
                *total = shift(total, value, false).ok_or_else(|| mismatch(kind, value))?;
                *count += 1;
            }
            Accumulator::Avg { total, count } => {
                *total += value.as_decimal().ok_or_else(|| mismatch(kind, value))?;
                *count += 1;
            }
            Accumulator::Extreme { values, .. } => *values.entry(value.clone()).or_insert(0) += 1,
            Accumulator::MostFrequent { counts } => *counts.entry(value.clone()).or_insert(0) += 1,
        }
        Ok(())
    }

    /// Whether `remove` with the same arguments would succeed.
    pub fn can_remove(&self, value: &Value, row: &Event) -> bool {
        match self {
            Accumulator::Count { count, star } => !(*star || !value.is_null()) || *count > 0,
            Accumulator::Sorted { entries } => entries.get(value).is_some_and(|rows| rows.contains(row)),
            Accumulator::Window { rows, limit } => limit.is_some() || rows.contains(row),
            _ if value.is_null() => true,
            Accumulator::Sum { count, .. } | Accumulator::Avg { count, .. } => *count > 0,
            Accumulator::Extreme { values, .. } => values.contains_key(value),
            Accumulator::MostFrequent { counts } => counts.contains_key(value),
        }
    }

    pub fn remove(&mut self, value: &Value, row: &Event) -> Result<()> {
        if !self.can_remove(value, row) {
            return Err(ContinuumError::AccumulatorUnderflow { kind: self.kind() });
        }
        let kind = self.kind();
        match self {
            Accumulator::Count { count, star } => {
                if *star || !value.is_null() {
                    *count -= 1;
                }
            }
            Accumulator::Sorted { entries } => {
                if let Some(rows) = entries.get_mut(value) {
                    if let Some(i) = rows.iter().position(|r| r == row) {
                        rows.remove(i);
                    }
                    if rows.is_empty() {
                        entries.remove(value);
                    }
                }
            }
            Accumulator::Window { rows, .. } => {
                // a bounded window may already have evicted the row
                if let Some(i) = rows.iter().position(|r| r == row) {
                    rows.remove(i);
                }
            }
            _ if value.is_null() => (),
            Accumulator::Sum { total, count } => {
                *total = shift(total, value, true).ok_or_else(|| mismatch(kind, value))?;
                *count -= 1;
            }
            Accumulator::Avg { total, count } => {
                *total -= value.as_decimal().ok_or_else(|| mismatch(kind, value))?;
                *count -= 1;
            }
            Accumulator::Extreme { values, .. } => {
                if decrement(values.get_mut(value)) {
                    values.remove(value);
                }
            }
            Accumulator::MostFrequent { counts } => {
                if decrement(counts.get_mut(value)) {
                    counts.remove(value);
                }
            }
        }
        Ok(())
    }

    pub fn value(&self) -> Value {
        match self {
            Accumulator::Sum { total, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    total.clone()
                }
            }
            Accumulator::Count { count, .. } => Value::Long(*count),
            Accumulator::Avg { total, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    total.to_f64().map(|t| Value::Double(t / *count as f64)).unwrap_or(Value::Null)
                }
            }
            Accumulator::Extreme { values, max } => {
                let found = if *max { values.keys().next_back() } else { values.keys().next() };
                found.cloned().unwrap_or(Value::Null)
            }
            Accumulator::Sorted { entries } => {
                Value::Array(entries.values().flatten().cloned().map(Value::Event).collect())
            }
            Accumulator::Window { rows, .. } => Value::Array(rows.iter().cloned().map(Value::Event).collect()),
            Accumulator::MostFrequent { counts } => counts
                .iter()
                .max_by(|(va, ca), (vb, cb)| ca.cmp(cb).then_with(|| vb.cmp(va)))
                .map(|(v, _)| v.clone())
                .unwrap_or(Value::Null),
        }
    }

    pub fn access(&self, accessor: Accessor) -> Result<Value> {
        let found = match (self, accessor) {
            (_, Accessor::Value) => return Ok(self.value()),
            (Accumulator::Sorted { entries }, Accessor::MinBy | Accessor::First) => {
                entries.values().flatten().next().cloned()
            }
            (Accumulator::Sorted { entries }, Accessor::MaxBy | Accessor::Last) => {
                entries.values().next_back().and_then(|rows| rows.last()).cloned()
            }
            (Accumulator::Window { rows, .. }, Accessor::First) => rows.front().cloned(),
            (Accumulator::Window { rows, .. }, Accessor::Last) => rows.back().cloned(),
            _ => {
                return Err(ContinuumError::Validation(format!(
                    "aggregation '{}' does not provide {:?}",
                    self.kind(),
                    accessor
                )))
            }
        };
        Ok(found.map(Value::Event).unwrap_or(Value::Null))
    }
}

// ------------- AggregationRow -------------
/// The accumulators of one group, updated together.
#[derive(Debug, Clone)]
pub struct AggregationRow {
    accumulators: Vec<Accumulator>,
    contributions: usize,
}

impl AggregationRow {
    pub fn new(definitions: &[(AggregateKind, ValueType)]) -> Self {
        Self {
            accumulators: definitions.iter().map(|(kind, input)| Accumulator::new(*kind, input)).collect(),
            contributions: 0,
        }
    }
    pub fn accumulators(&self) -> &[Accumulator] {
        &self.accumulators
    }
    /// Rows currently contributing to this group.
    pub fn contributions(&self) -> usize {
        self.contributions
    }
    pub fn values(&self) -> Vec<Value> {
        self.accumulators.iter().map(Accumulator::value).collect()
    }

    /// Adds one row to every accumulator, or to none of them.
    pub fn add(&mut self, inputs: &[Value], row: &Event) -> Result<()> {
        for (i, (acc, value)) in self.accumulators.iter_mut().zip(inputs).enumerate() {
            if let Err(e) = acc.add(value, row) {
                for (undo, value) in self.accumulators[..i].iter_mut().zip(inputs) {
                    undo.remove(value, row)?;
                }
                return Err(e);
            }
        }
        self.contributions += 1;
        Ok(())
    }

    /// Removes one previously added row from every accumulator, or from none.
    pub fn remove(&mut self, inputs: &[Value], row: &Event) -> Result<()> {
        if let Some(acc) = self
            .accumulators
            .iter()
            .zip(inputs)
            .find_map(|(acc, value)| (!acc.can_remove(value, row)).then_some(acc))
        {
            return Err(ContinuumError::AccumulatorUnderflow { kind: acc.kind() });
        }
        for (acc, value) in self.accumulators.iter_mut().zip(inputs) {
            acc.remove(value, row)?;
        }
        self.contributions = self.contributions.saturating_sub(1);
        Ok(())
    }

    /// Feeds a single accumulator, as tables do for externally computed inputs.
    pub fn add_to(&mut self, index: usize, value: &Value, row: &Event) -> Result<()> {
        self.accumulator_mut(index)?.add(value, row)
    }
    pub fn remove_from(&mut self, index: usize, value: &Value, row: &Event) -> Result<()> {
        self.accumulator_mut(index)?.remove(value, row)
    }
    fn accumulator_mut(&mut self, index: usize) -> Result<&mut Accumulator> {
        self.accumulators
            .get_mut(index)
            .ok_or_else(|| ContinuumError::Invariant(format!("no accumulator at position {}", index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Attribute, EventType};

    fn row(s: &str, i: i32) -> Event {
        let t = EventType::anonymous(
            "Row",
            vec![Attribute::new("theString", ValueType::String), Attribute::new("intPrimitive", ValueType::Integer)],
        );
        Event::new(t, vec![Value::from(s), Value::Int(i)]).unwrap()
    }

    #[test]
    fn sum_removal_reverses_addition() {
        let mut sum = Accumulator::new(AggregateKind::Sum, &ValueType::Integer);
        assert_eq!(sum.value(), Value::Null);
        let (a, b) = (row("a", 10), row("b", 5));
        sum.add(&Value::Int(10), &a).unwrap();
        sum.add(&Value::Int(5), &b).unwrap();
        assert_eq!(sum.value(), Value::Int(15));
        sum.remove(&Value::Int(10), &a).unwrap();
        assert_eq!(sum.value(), Value::Int(5));
        sum.remove(&Value::Int(5), &b).unwrap();
        assert_eq!(sum.value(), Value::Null);
        assert_eq!(
            sum.remove(&Value::Int(5), &b),
            Err(ContinuumError::AccumulatorUnderflow { kind: "sum" })
        );
    }

    #[test]
    fn extremes_and_most_frequent() {
        let mut max = Accumulator::new(AggregateKind::Max, &ValueType::Integer);
        let mut freq = Accumulator::new(AggregateKind::MostFrequent, &ValueType::Integer);
        let r = row("a", 0);
        for v in [3, 7, 7, 1] {
            max.add(&Value::Int(v), &r).unwrap();
            freq.add(&Value::Int(v), &r).unwrap();
        }
        assert_eq!(max.value(), Value::Int(7));
        assert_eq!(freq.value(), Value::Int(7));
        max.remove(&Value::Int(7), &r).unwrap();
        assert_eq!(max.value(), Value::Int(7));
        max.remove(&Value::Int(7), &r).unwrap();
        assert_eq!(max.value(), Value::Int(3));
        assert!(max.remove(&Value::Int(8), &r).is_err());
        assert_eq!(max.value(), Value::Int(3));
    }

    #[test]
    fn sorted_rows_expose_min_and_max_by() {
        let mut sorted = Accumulator::new(AggregateKind::Sorted, &ValueType::Integer);
        let (a, b, c) = (row("a", 20), row("b", 10), row("c", 30));
        for r in [&a, &b, &c] {
            sorted.add(r.value(1), r).unwrap();
        }
        assert_eq!(sorted.access(Accessor::MinBy).unwrap(), Value::Event(b.clone()));
        assert_eq!(sorted.access(Accessor::MaxBy).unwrap(), Value::Event(c.clone()));
        sorted.remove(c.value(1), &c).unwrap();
        assert_eq!(sorted.access(Accessor::MaxBy).unwrap(), Value::Event(a));
        assert!(sorted.remove(c.value(1), &c).is_err());
    }

    #[test]
    fn bounded_window_forgets_evicted_rows() {
        let mut window = Accumulator::new(AggregateKind::Window(Some(2)), &ValueType::Null);
        let rows: Vec<Event> = (0..3).map(|i| row("w", i)).collect();
        for r in &rows {
            window.add(&Value::Null, r).unwrap();
        }
        assert_eq!(window.access(Accessor::First).unwrap(), Value::Event(rows[1].clone()));
        window.remove(&Value::Null, &rows[0]).unwrap();
        assert_eq!(window.value().as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn group_removal_is_all_or_nothing() {
        let defs = [(AggregateKind::CountStar, ValueType::Null), (AggregateKind::Sum, ValueType::Integer)];
        let mut group = AggregationRow::new(&defs);
        let r = row("a", 4);
        group.add(&[Value::Null, Value::Int(4)], &r).unwrap();
        assert!(group.remove(&[Value::Null, Value::Int(4)], &r).is_ok());
        assert!(group.remove(&[Value::Null, Value::Int(4)], &r).is_err());
        assert_eq!(group.values(), vec![Value::Long(0), Value::Null]);
        // a failed add leaves nothing behind
        assert!(group.add(&[Value::Null, Value::from("x")], &r).is_err());
        assert_eq!(group.values(), vec![Value::Long(0), Value::Null]);
        assert_eq!(group.contributions(), 0);
    }
}
