//! Named windows and tables.
//!
//! A relation keeps rows of plain columns and, next to them, aggregation
//! columns whose accumulators are fed by the rows (or, for tables, by
//! statements aggregating into them). Rows are kept in arrival order under
//! monotonically increasing row ids, so a set of matched rows is a bitmap.
//!
//! Relations are shared between statements through a [`RelationHandle`];
//! readers and the single writer are separated by an `RwLock`, which is what
//! keeps a merge from ever being observed half applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

// row identities are plain integers, so "matched rows" are bitsets
use roaring::RoaringTreemap;
use tracing::debug;

use crate::aggregation::{AggregateKind, AggregationRow, Accessor};
use crate::datatype::{Value, ValueType};
use crate::error::{ContinuumError, Result};
use crate::schema::{Attribute, Event, EventType};
use crate::OtherHasher;

pub type RowId = u64;

// the group key of a relation without a primary key
const GLOBAL: &[Value] = &[];

// ------------- Specification -------------
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSpec {
    Plain {
        name: String,
        value_type: ValueType,
    },
    /// `input` names the plain column each row contributes; without it the
    /// accumulator sees whole rows (`count(*)`, `window(*)`) or only values
    /// aggregated into the table by statements.
    Aggregate {
        name: String,
        kind: AggregateKind,
        value_type: ValueType,
        input: Option<String>,
    },
}
impl ColumnSpec {
    pub fn plain(name: &str, value_type: ValueType) -> Self {
        ColumnSpec::Plain {
            name: name.to_string(),
            value_type,
        }
    }
    pub fn aggregate(name: &str, kind: AggregateKind, value_type: ValueType) -> Self {
        ColumnSpec::Aggregate {
            name: name.to_string(),
            kind,
            value_type,
            input: None,
        }
    }
    pub fn fed_by(self, column: &str) -> Self {
        match self {
            ColumnSpec::Aggregate { name, kind, value_type, .. } => ColumnSpec::Aggregate {
                name,
                kind,
                value_type,
                input: Some(column.to_string()),
            },
            plain => plain,
        }
    }
    pub fn name(&self) -> &str {
        match self {
            ColumnSpec::Plain { name, .. } | ColumnSpec::Aggregate { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Retention {
    #[default]
    KeepAll,
    /// A newer row with the same value in this column replaces the older.
    Unique(String),
    /// Only the N most recent rows are kept.
    Length(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateKey {
    #[default]
    Reject,
    Replace,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: Vec<String>,
    pub retention: Retention,
    pub on_duplicate: DuplicateKey,
}
impl RelationSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            retention: Retention::KeepAll,
            on_duplicate: DuplicateKey::Reject,
        }
    }
    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }
    pub fn retain(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }
    pub fn on_duplicate(mut self, on_duplicate: DuplicateKey) -> Self {
        self.on_duplicate = on_duplicate;
        self
    }
}

/// Rows a relation operation added and removed, in their visible form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationChange {
    pub inserted: Vec<Event>,
    pub removed: Vec<Event>,
}
impl RelationChange {
    fn absorb(&mut self, other: RelationChange) {
        self.inserted.extend(other.inserted);
        self.removed.extend(other.removed);
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Plain(usize),
    Aggregate(usize),
}

#[derive(Debug, Clone)]
struct AggregateColumn {
    kind: AggregateKind,
    input_type: ValueType,
    input: Option<usize>,
}

// ------------- Relation -------------
#[derive(Debug)]
pub struct Relation {
    name: String,
    stored_type: Arc<EventType>,
    row_type: Arc<EventType>,
    layout: Vec<Layout>,
    aggregates: Vec<AggregateColumn>,
    key_columns: Vec<usize>,
    unique_column: Option<usize>,
    length: Option<usize>,
    on_duplicate: DuplicateKey,
    rows: BTreeMap<RowId, Event>,
    next_id: RowId,
    key_index: HashMap<Vec<Value>, RowId, OtherHasher>,
    unique_index: HashMap<Value, RowId, OtherHasher>,
    groups: HashMap<Vec<Value>, AggregationRow, OtherHasher>,
    version: u64,
}

impl Relation {
    pub fn new(spec: &RelationSpec) -> Result<Self> {
        let invalid = |msg: String| ContinuumError::Validation(format!("relation '{}': {}", spec.name, msg));
        let mut plain = Vec::new();
        let mut layout = Vec::new();
        for (i, column) in spec.columns.iter().enumerate() {
            if spec.columns[..i].iter().any(|c| c.name() == column.name()) {
                return Err(invalid(format!("column '{}' is declared twice", column.name())));
            }
            if let ColumnSpec::Plain { name, value_type } = column {
                layout.push(Layout::Plain(plain.len()));
                plain.push(Attribute::new(name, value_type.clone()));
            } else {
                layout.push(Layout::Aggregate(0));
            }
        }
        let stored_type = EventType::anonymous(&spec.name, plain);
        let stored_row = ValueType::Event(spec.name.clone());

        let mut aggregates = Vec::new();
        let mut visible = Vec::new();
        for (column, slot) in spec.columns.iter().zip(layout.iter_mut()) {
            match column {
                ColumnSpec::Plain { name, value_type } => visible.push(Attribute::new(name, value_type.clone())),
                ColumnSpec::Aggregate { name, kind, value_type, input } => {
                    let (input, input_type) = match input {
                        Some(source) => {
                            let p = stored_type
                                .position(source)
                                .ok_or_else(|| invalid(format!("aggregation input '{}' is not a plain column", source)))?;
                            (Some(p), stored_type.attributes()[p].value_type().clone())
                        }
                        None => (None, value_type.clone()),
                    };
                    let result = kind.result_type(&input_type, &stored_row, Accessor::Value)?;
                    visible.push(Attribute::new(name, result));
                    *slot = Layout::Aggregate(aggregates.len());
                    aggregates.push(AggregateColumn { kind: *kind, input_type, input });
                }
            }
        }
        let row_type = if aggregates.is_empty() {
            Arc::clone(&stored_type)
        } else {
            EventType::anonymous(&spec.name, visible)
        };

        let key_columns = spec
            .primary_key
            .iter()
            .map(|k| stored_type.position(k).ok_or_else(|| invalid(format!("primary key column '{}' is not a plain column", k))))
            .collect::<Result<Vec<_>>>()?;
        let unique_column = match &spec.retention {
            Retention::Unique(column) => Some(
                stored_type
                    .position(column)
                    .ok_or_else(|| invalid(format!("unique column '{}' is not a plain column", column)))?,
            ),
            _ => None,
        };
        let length = match spec.retention {
            Retention::Length(0) => return Err(invalid("length retention must keep at least one row".into())),
            Retention::Length(n) => Some(n),
            _ => None,
        };
        if !key_columns.is_empty() && spec.retention != Retention::KeepAll {
            return Err(invalid("a table with a primary key keeps all rows".into()));
        }

        let mut relation = Self {
            name: spec.name.clone(),
            stored_type,
            row_type,
            layout,
            aggregates,
            key_columns,
            unique_column,
            length,
            on_duplicate: spec.on_duplicate,
            rows: BTreeMap::new(),
            next_id: 0,
            key_index: HashMap::default(),
            unique_index: HashMap::default(),
            groups: HashMap::default(),
            version: 0,
        };
        if relation.key_columns.is_empty() {
            let group = relation.new_group();
            relation.groups.insert(Vec::new(), group);
        }
        Ok(relation)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    /// The visible row type: plain and aggregation columns in declared order.
    pub fn row_type(&self) -> &Arc<EventType> {
        &self.row_type
    }
    pub fn stored_type(&self) -> &Arc<EventType> {
        &self.stored_type
    }
    pub fn column_names(&self) -> Vec<&str> {
        self.row_type.attributes().iter().map(Attribute::name).collect()
    }
    pub fn is_keyed(&self) -> bool {
        !self.key_columns.is_empty()
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn new_group(&self) -> AggregationRow {
        let definitions: Vec<(AggregateKind, ValueType)> =
            self.aggregates.iter().map(|a| (a.kind, a.input_type.clone())).collect();
        AggregationRow::new(&definitions)
    }

    /// The accumulator kind behind a visible column, if it is an aggregation.
    pub fn aggregate_kind(&self, column: usize) -> Option<AggregateKind> {
        match self.layout.get(column)? {
            Layout::Aggregate(a) => Some(self.aggregates[*a].kind),
            Layout::Plain(_) => None,
        }
    }

    fn key_of(&self, stored: &Event) -> Vec<Value> {
        self.key_columns.iter().map(|&k| stored.value(k).clone()).collect()
    }

    fn inputs_of(&self, stored: &Event) -> Vec<Value> {
        self.aggregates
            .iter()
            .map(|a| a.input.map(|i| stored.value(i).clone()).unwrap_or(Value::Null))
            .collect()
    }

    fn stored_position(&self, column: usize) -> Option<usize> {
        match self.layout.get(column)? {
            Layout::Plain(p) => Some(*p),
            Layout::Aggregate(_) => None,
        }
    }

    fn render(&self, stored: &Event) -> Event {
        if self.aggregates.is_empty() {
            return stored.clone();
        }
        self.render_with(stored, self.groups.get(&self.key_of(stored)))
    }

    fn render_with(&self, stored: &Event, group: Option<&AggregationRow>) -> Event {
        if self.aggregates.is_empty() {
            return stored.clone();
        }
        let values = self
            .layout
            .iter()
            .map(|slot| match slot {
                Layout::Plain(p) => stored.value(*p).clone(),
                Layout::Aggregate(a) => group.map(|g| g.accumulators()[*a].value()).unwrap_or(Value::Null),
            })
            .collect();
        Event::from_parts(Arc::clone(&self.row_type), values)
    }

    /// Brings a row of any type into the stored layout, matching columns by
    /// name. Missing columns are null.
    pub fn conform(&self, row: &Event) -> Result<Event> {
        if Arc::ptr_eq(row.event_type(), &self.stored_type) {
            return Ok(row.clone());
        }
        let values = self
            .stored_type
            .attributes()
            .iter()
            .map(|a| row.get(a.name()).cloned().unwrap_or(Value::Null))
            .collect();
        Event::new(Arc::clone(&self.stored_type), values)
    }

    fn coerce_key(&self, key: &[Value]) -> Option<Vec<Value>> {
        if key.len() != self.key_columns.len() {
            return None;
        }
        key.iter()
            .zip(&self.key_columns)
            .map(|(v, &k)| v.coerce_to(self.stored_type.attributes()[k].value_type()))
            .collect()
    }

    // ------------- Reads -------------
    /// Visible rows in arrival order.
    pub fn rows(&self) -> Vec<Event> {
        self.rows.values().map(|r| self.render(r)).collect()
    }

    pub fn row(&self, id: RowId) -> Option<Event> {
        self.rows.get(&id).map(|r| self.render(r))
    }

    pub fn get_by_key(&self, key: &[Value]) -> Option<Event> {
        let key = self.coerce_key(key)?;
        self.key_index.get(&key).and_then(|id| self.row(*id))
    }

    /// Rows whose visible `column` equals `value`, if an index covers that
    /// column. `None` means a scan is needed.
    pub fn indexed(&self, column: usize, value: &Value) -> Option<Vec<Event>> {
        let stored = self.stored_position(column)?;
        let target = self.stored_type.attributes()[stored].value_type();
        if self.key_columns == [stored] {
            let key = vec![value.coerce_to(target)?];
            return Some(self.key_index.get(&key).and_then(|id| self.row(*id)).into_iter().collect());
        }
        if self.unique_column == Some(stored) {
            let value = value.coerce_to(target)?;
            return Some(self.unique_index.get(&value).and_then(|id| self.row(*id)).into_iter().collect());
        }
        None
    }

    pub fn lookup(&self, column: usize, value: &Value) -> Vec<Event> {
        self.indexed(column, value).unwrap_or_else(|| {
            self.rows()
                .into_iter()
                .filter(|row| row.value(column).loose_eq(value))
                .collect()
        })
    }

    /// Changes with every write. Equal versions mean equal contents.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The version together with every visible row and its id, for callers
    /// that evaluate outside the lock and write back later.
    pub fn snapshot(&self) -> (u64, Vec<(RowId, Event)>) {
        let rows = self.rows.iter().map(|(id, stored)| (*id, self.render(stored))).collect();
        (self.version, rows)
    }

    /// The value of an aggregation column for a key, or for the whole
    /// relation when it has no primary key.
    pub fn aggregate_value(&self, key: &[Value], column: usize) -> Result<Value> {
        let Some(Layout::Aggregate(a)) = self.layout.get(column) else {
            return Err(ContinuumError::Validation(format!(
                "column {} of relation '{}' is not an aggregation",
                column, self.name
            )));
        };
        let key = if self.is_keyed() { self.coerce_key(key).unwrap_or_default() } else { Vec::new() };
        Ok(self
            .groups
            .get(&key)
            .map(|g| g.accumulators()[*a].value())
            .unwrap_or(Value::Null))
    }

    // ------------- Writes -------------
    /// Inserts a row, displacing the holder of its key or unique value and
    /// evicting beyond the length limit. Every aggregation change is worked
    /// out first, so a failing insert leaves the relation as it was.
    pub fn insert(&mut self, row: &Event) -> Result<RelationChange> {
        let stored = self.conform(row)?;
        let key = self.key_of(&stored);
        let mut displaced = Vec::new();
        if self.is_keyed() {
            if let Some(existing) = self.key_index.get(&key).copied() {
                if self.on_duplicate == DuplicateKey::Reject {
                    return Err(ContinuumError::KeyViolation {
                        relation: self.name.clone(),
                        key: render_key(&key),
                    });
                }
                displaced.push(existing);
            }
        }
        if let Some(u) = self.unique_column {
            if let Some(existing) = self.unique_index.get(stored.value(u)).copied() {
                if !displaced.contains(&existing) {
                    displaced.push(existing);
                }
            }
        }
        let evicted: Vec<RowId> = match self.length {
            Some(limit) => {
                let after = self.rows.len() - displaced.len() + 1;
                self.rows
                    .keys()
                    .copied()
                    .filter(|id| !displaced.contains(id))
                    .take(after.saturating_sub(limit))
                    .collect()
            }
            None => Vec::new(),
        };

        let inputs = self.inputs_of(&stored);
        let mut change = RelationChange::default();
        if self.is_keyed() {
            let mut group = self.new_group();
            group.add(&inputs, &stored)?;
            change.removed.extend(displaced.iter().filter_map(|id| self.row(*id)));
            change.inserted.push(self.render_with(&stored, Some(&group)));
            for id in &displaced {
                self.unstore(*id);
            }
            self.store(stored);
            self.groups.insert(key, group);
            return Ok(change);
        }
        if displaced.is_empty() && evicted.is_empty() {
            self.global_group_mut()?.add(&inputs, &stored)?;
            change.inserted.push(self.render(&stored));
            self.store(stored);
            return Ok(change);
        }
        let mut group = self.global_group()?.clone();
        for id in &displaced {
            change.removed.push(self.retract_staged(&mut group, *id)?);
        }
        group.add(&inputs, &stored)?;
        change.inserted.push(self.render_with(&stored, Some(&group)));
        for id in &evicted {
            change.removed.push(self.retract_staged(&mut group, *id)?);
        }
        for id in displaced.iter().chain(&evicted) {
            self.unstore(*id);
        }
        self.store(stored);
        self.groups.insert(Vec::new(), group);
        Ok(change)
    }

    fn global_group(&self) -> Result<&AggregationRow> {
        self.groups
            .get(GLOBAL)
            .ok_or_else(|| ContinuumError::Invariant(format!("relation '{}' lost its aggregation group", self.name)))
    }

    fn global_group_mut(&mut self) -> Result<&mut AggregationRow> {
        let name = &self.name;
        self.groups
            .get_mut(GLOBAL)
            .ok_or_else(|| ContinuumError::Invariant(format!("relation '{}' lost its aggregation group", name)))
    }

    // Renders a row as it leaves, then takes it out of a staged group copy.
    fn retract_staged(&self, group: &mut AggregationRow, id: RowId) -> Result<Event> {
        let stored = self
            .rows
            .get(&id)
            .ok_or_else(|| ContinuumError::Invariant(format!("relation '{}' has no row {}", self.name, id)))?;
        let visible = self.render_with(stored, Some(&*group));
        group.remove(&self.inputs_of(stored), stored)?;
        Ok(visible)
    }

    fn store(&mut self, stored: Event) -> RowId {
        let id = self.next_id;
        self.next_id += 1;
        self.version = self.version.wrapping_add(1);
        if self.is_keyed() {
            let key = self.key_of(&stored);
            self.key_index.insert(key, id);
        }
        if let Some(u) = self.unique_column {
            self.unique_index.insert(stored.value(u).clone(), id);
        }
        self.rows.insert(id, stored);
        id
    }

    fn unstore(&mut self, id: RowId) -> Option<Event> {
        let stored = self.rows.remove(&id)?;
        self.version = self.version.wrapping_add(1);
        if self.is_keyed() {
            let key = self.key_of(&stored);
            self.key_index.remove(&key);
            self.groups.remove(&key);
        }
        if let Some(u) = self.unique_column {
            if self.unique_index.get(stored.value(u)) == Some(&id) {
                self.unique_index.remove(stored.value(u));
            }
        }
        Some(stored)
    }

    /// Removes one row, retracting what it contributed to the aggregations.
    pub fn remove_row(&mut self, id: RowId) -> Result<Option<Event>> {
        let Some(stored) = self.rows.get(&id).cloned() else {
            return Ok(None);
        };
        let visible = self.render(&stored);
        if !self.is_keyed() {
            let inputs = self.inputs_of(&stored);
            self.global_group_mut()?.remove(&inputs, &stored)?;
        }
        self.unstore(id);
        Ok(Some(visible))
    }

    pub fn delete_rows(&mut self, ids: &RoaringTreemap) -> Result<Vec<Event>> {
        let mut removed = Vec::with_capacity(ids.len() as usize);
        for id in ids.iter() {
            removed.extend(self.remove_row(id)?);
        }
        debug!(relation = %self.name, rows = removed.len(), "rows deleted");
        Ok(removed)
    }

    /// Applies assignments computed ahead of time, per row id, or inserts
    /// `insert` when there are none. Rows keep their ids. A row outside the
    /// update that holds a unique value an updated row takes is evicted.
    /// Nothing changes unless the whole update succeeds.
    pub fn apply_merge(&mut self, updates: Vec<(RowId, Vec<(usize, Value)>)>, insert: Option<&Event>) -> Result<RelationChange> {
        if updates.is_empty() {
            return match insert {
                Some(row) => self.insert(row),
                None => Ok(RelationChange::default()),
            };
        }
        let mut planned = Vec::with_capacity(updates.len());
        for (id, assignments) in updates {
            let Some(stored) = self.rows.get(&id) else { continue };
            let mut values = stored.values().to_vec();
            for (column, value) in assignments {
                let p = self.stored_position(column).ok_or_else(|| {
                    ContinuumError::Validation(format!("aggregation column {} of '{}' cannot be assigned", column, self.name))
                })?;
                values[p] = value;
            }
            planned.push((id, Event::new(Arc::clone(&self.stored_type), values)?));
        }
        let ids: RoaringTreemap = planned.iter().map(|(id, _)| *id).collect();
        if self.is_keyed() {
            let mut claimed: HashMap<Vec<Value>, RowId, OtherHasher> = HashMap::default();
            for (id, row) in &planned {
                let key = self.key_of(row);
                let taken = self.key_index.get(&key).is_some_and(|owner| !ids.contains(*owner));
                if taken || claimed.insert(key.clone(), *id).is_some() {
                    return Err(ContinuumError::KeyViolation {
                        relation: self.name.clone(),
                        key: render_key(&key),
                    });
                }
            }
        }
        let mut evicted = Vec::new();
        if let Some(u) = self.unique_column {
            let mut claimed: HashMap<&Value, RowId, OtherHasher> = HashMap::default();
            for (id, row) in &planned {
                let value = row.value(u);
                if claimed.insert(value, *id).is_some() {
                    return Err(ContinuumError::KeyViolation {
                        relation: self.name.clone(),
                        key: render_key(std::slice::from_ref(value)),
                    });
                }
                if let Some(holder) = self.unique_index.get(value).copied() {
                    if !ids.contains(holder) && !evicted.contains(&holder) {
                        evicted.push(holder);
                    }
                }
            }
        }

        // stage every group change on copies
        let mut staged: HashMap<Vec<Value>, AggregationRow, OtherHasher> = HashMap::default();
        let mut change = RelationChange::default();
        for holder in &evicted {
            let group = self.staged_group(&mut staged, GLOBAL)?;
            change.removed.push(self.retract_staged(group, *holder)?);
        }
        for (id, row) in &planned {
            let Some(old) = self.rows.get(id) else { continue };
            let group = self.staged_group(&mut staged, &self.key_of(old))?;
            change.removed.push(self.render_with(old, Some(&*group)));
            group.remove(&self.inputs_of(old), old)?;
            group.add(&self.inputs_of(row), row)?;
            change.inserted.push(self.render_with(row, Some(&*group)));
        }

        // commit
        for holder in evicted {
            self.unstore(holder);
        }
        self.groups.extend(staged);
        let mut moved = Vec::new();
        for (id, row) in &planned {
            let Some(old) = self.rows.get(id) else { continue };
            if let Some(u) = self.unique_column {
                if self.unique_index.get(old.value(u)) == Some(id) {
                    self.unique_index.remove(old.value(u));
                }
            }
            let (old_key, new_key) = (self.key_of(old), self.key_of(row));
            if old_key != new_key {
                self.key_index.remove(&old_key);
                moved.push((*id, new_key, self.groups.remove(&old_key)));
            }
        }
        for (id, key, group) in moved {
            self.key_index.insert(key.clone(), id);
            if let Some(group) = group {
                self.groups.insert(key, group);
            }
        }
        for (id, row) in planned {
            if let Some(u) = self.unique_column {
                self.unique_index.insert(row.value(u).clone(), id);
            }
            self.rows.insert(id, row);
        }
        self.version = self.version.wrapping_add(1);
        debug!(relation = %self.name, rows = change.inserted.len(), "rows merged");
        Ok(change)
    }

    // The staged copy of a group, taken from the live one on first use.
    fn staged_group<'a>(
        &self,
        staged: &'a mut HashMap<Vec<Value>, AggregationRow, OtherHasher>,
        key: &[Value],
    ) -> Result<&'a mut AggregationRow> {
        if !staged.contains_key(key) {
            let group = self
                .groups
                .get(key)
                .cloned()
                .ok_or_else(|| ContinuumError::Invariant(format!("relation '{}' lost the group of a row", self.name)))?;
            staged.insert(key.to_vec(), group);
        }
        staged
            .get_mut(key)
            .ok_or_else(|| ContinuumError::Invariant(format!("relation '{}' lost the group of a row", self.name)))
    }

    fn ensure_row(&mut self, key: &[Value], change: &mut RelationChange) -> Result<Vec<Value>> {
        if !self.is_keyed() {
            if self.rows.is_empty() {
                let row = Event::from_parts(Arc::clone(&self.stored_type), vec![Value::Null; self.stored_type.len()]);
                self.store(row);
            }
            return Ok(Vec::new());
        }
        let key = self.coerce_key(key).ok_or_else(|| {
            ContinuumError::Validation(format!("key {} does not fit table '{}'", render_key(key), self.name))
        })?;
        match self.key_index.get(&key).and_then(|id| self.rows.get(id)) {
            Some(existing) => change.removed.push(self.render(existing)),
            None => {
                let mut values = vec![Value::Null; self.stored_type.len()];
                for (&k, v) in self.key_columns.iter().zip(&key) {
                    values[k] = v.clone();
                }
                self.store(Event::from_parts(Arc::clone(&self.stored_type), values));
                let group = self.new_group();
                self.groups.insert(key.clone(), group);
            }
        }
        Ok(key)
    }

    fn aggregate_slot(&self, column: usize) -> Result<usize> {
        match self.layout.get(column) {
            Some(Layout::Aggregate(a)) => Ok(*a),
            _ => Err(ContinuumError::Validation(format!(
                "column {} of relation '{}' is not an aggregation",
                column, self.name
            ))),
        }
    }

    fn visible_row(&self, key: &[Value]) -> Option<Event> {
        if self.is_keyed() {
            self.key_index.get(key).and_then(|id| self.row(*id))
        } else {
            self.rows.values().next().map(|r| self.render(r))
        }
    }

    /// Feeds values computed by a statement into the aggregation columns of
    /// the row for `key`, creating the row when the key is new.
    pub fn aggregate_into(&mut self, key: &[Value], inputs: &[(usize, Value)], source: &Event) -> Result<RelationChange> {
        let slots = inputs
            .iter()
            .map(|(column, _)| self.aggregate_slot(*column))
            .collect::<Result<Vec<_>>>()?;
        let mut change = RelationChange::default();
        let key = self.ensure_row(key, &mut change)?;
        let group = self
            .groups
            .get_mut(&key)
            .ok_or_else(|| ContinuumError::Invariant(format!("relation '{}' lost the group of a row", self.name)))?;
        for (i, (slot, (_, value))) in slots.iter().zip(inputs).enumerate() {
            if let Err(e) = group.add_to(*slot, value, source) {
                for (undo, (_, value)) in slots[..i].iter().zip(inputs) {
                    group.remove_from(*undo, value, source)?;
                }
                return Err(e);
            }
        }
        self.version = self.version.wrapping_add(1);
        change.inserted.extend(self.visible_row(&key));
        Ok(change)
    }

    /// The exact inverse of an earlier [`Relation::aggregate_into`].
    pub fn retract_from(&mut self, key: &[Value], inputs: &[(usize, Value)], source: &Event) -> Result<RelationChange> {
        let slots = inputs
            .iter()
            .map(|(column, _)| self.aggregate_slot(*column))
            .collect::<Result<Vec<_>>>()?;
        let key = if self.is_keyed() { self.coerce_key(key).unwrap_or_default() } else { Vec::new() };
        let previous = self.visible_row(&key);
        let Some(group) = self.groups.get_mut(&key) else {
            return Err(ContinuumError::AccumulatorUnderflow { kind: "table" });
        };
        for (slot, (_, value)) in slots.iter().zip(inputs) {
            if !group.accumulators()[*slot].can_remove(value, source) {
                return Err(ContinuumError::AccumulatorUnderflow {
                    kind: group.accumulators()[*slot].kind(),
                });
            }
        }
        for (slot, (_, value)) in slots.iter().zip(inputs) {
            group.remove_from(*slot, value, source)?;
        }
        self.version = self.version.wrapping_add(1);
        Ok(RelationChange {
            inserted: self.visible_row(&key).into_iter().collect(),
            removed: previous.into_iter().collect(),
        })
    }
}

fn render_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(Value::render_literal).collect();
    format!("({})", parts.join(","))
}

// ------------- Sharing -------------
#[derive(Debug)]
pub struct SharedRelation {
    name: String,
    row_type: Arc<EventType>,
    key_columns: Vec<usize>,
    state: RwLock<Relation>,
}
pub type RelationHandle = Arc<SharedRelation>;

impl SharedRelation {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn row_type(&self) -> &Arc<EventType> {
        &self.row_type
    }
    /// Positions of the primary key columns in the visible row type.
    pub fn key_columns(&self) -> &[usize] {
        &self.key_columns
    }
    pub fn read(&self) -> Result<RwLockReadGuard<'_, Relation>> {
        Ok(self.state.read()?)
    }
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Relation>> {
        Ok(self.state.write()?)
    }
}

/// Owns every declared relation, addressed by name.
#[derive(Debug, Default)]
pub struct RelationKeeper {
    kept: RwLock<HashMap<String, RelationHandle>>,
}

impl RelationKeeper {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn keep(&self, spec: &RelationSpec) -> Result<RelationHandle> {
        let relation = Relation::new(spec)?;
        let mut kept = self.kept.write()?;
        if kept.contains_key(&spec.name) {
            return Err(ContinuumError::Validation(format!("relation '{}' already exists", spec.name)));
        }
        let row_type = Arc::clone(relation.row_type());
        let key_columns = spec
            .primary_key
            .iter()
            .filter_map(|k| row_type.position(k))
            .collect();
        let handle = Arc::new(SharedRelation {
            name: spec.name.clone(),
            row_type,
            key_columns,
            state: RwLock::new(relation),
        });
        kept.insert(spec.name.clone(), Arc::clone(&handle));
        debug!(relation = %spec.name, "relation created");
        Ok(handle)
    }
    pub fn get(&self, name: &str) -> Result<RelationHandle> {
        self.kept
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| ContinuumError::UnknownRelation(name.to_string()))
    }
    pub fn len(&self) -> usize {
        self.kept.read().map(|k| k.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals() -> RelationSpec {
        RelationSpec::new("Totals")
            .column(ColumnSpec::plain("theString", ValueType::String))
            .column(ColumnSpec::plain("intPrimitive", ValueType::Integer))
            .column(ColumnSpec::aggregate("total", AggregateKind::Sum, ValueType::Integer).fed_by("intPrimitive"))
    }

    fn row(relation: &Relation, s: &str, i: i32) -> Event {
        Event::new(Arc::clone(relation.stored_type()), vec![Value::from(s), Value::Int(i)]).unwrap()
    }

    #[test]
    fn deletes_reverse_the_running_sum() {
        let mut r = Relation::new(&totals()).unwrap();
        for (s, i) in [("a", 1), ("b", 2), ("c", 3)] {
            let e = row(&r, s, i);
            r.insert(&e).unwrap();
        }
        assert_eq!(r.aggregate_value(&[], 2).unwrap(), Value::Int(6));
        let removed = r.delete_rows(&RoaringTreemap::from_iter([1u64])).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(r.aggregate_value(&[], 2).unwrap(), Value::Int(4));
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn unique_retention_replaces_and_reports() {
        let mut r = Relation::new(&totals().retain(Retention::Unique("theString".into()))).unwrap();
        let first = row(&r, "a", 1);
        r.insert(&first).unwrap();
        let second = row(&r, "a", 5);
        let change = r.insert(&second).unwrap();
        assert_eq!(change.removed.len(), 1);
        assert_eq!(r.len(), 1);
        assert_eq!(r.aggregate_value(&[], 2).unwrap(), Value::Int(5));
        assert_eq!(r.indexed(0, &Value::from("a")).map(|rows| rows.len()), Some(1));
    }

    #[test]
    fn length_retention_evicts_oldest() {
        let mut r = Relation::new(&totals().retain(Retention::Length(2))).unwrap();
        for i in 0..3 {
            let e = row(&r, "x", i);
            r.insert(&e).unwrap();
        }
        assert_eq!(r.len(), 2);
        assert_eq!(r.rows()[0].value(1), &Value::Int(1));
    }

    #[test]
    fn tables_reject_or_replace_duplicates() {
        let spec = RelationSpec::new("T")
            .column(ColumnSpec::plain("k", ValueType::String))
            .column(ColumnSpec::plain("v", ValueType::Integer))
            .primary_key(&["k"]);
        let mut t = Relation::new(&spec).unwrap();
        let e = row(&t, "k1", 1);
        t.insert(&e).unwrap();
        assert!(matches!(t.insert(&e), Err(ContinuumError::KeyViolation { .. })));
        let mut t = Relation::new(&spec.on_duplicate(DuplicateKey::Replace)).unwrap();
        t.insert(&e).unwrap();
        let newer = row(&t, "k1", 2);
        t.insert(&newer).unwrap();
        assert_eq!(t.get_by_key(&[Value::from("k1")]).map(|r| r.value(1).clone()), Some(Value::Int(2)));
    }

    #[test]
    fn aggregate_into_creates_rows_per_key() {
        let spec = RelationSpec::new("varTotal")
            .column(ColumnSpec::plain("key", ValueType::String))
            .column(ColumnSpec::aggregate("total", AggregateKind::Sum, ValueType::Integer))
            .primary_key(&["key"]);
        let mut t = Relation::new(&spec).unwrap();
        let source = row(&Relation::new(&totals()).unwrap(), "E1", 10);
        t.aggregate_into(&[Value::from("E1")], &[(1, Value::Int(10))], &source).unwrap();
        t.aggregate_into(&[Value::from("E1")], &[(1, Value::Int(5))], &source).unwrap();
        assert_eq!(t.get_by_key(&[Value::from("E1")]).map(|r| r.value(1).clone()), Some(Value::Int(15)));
        t.retract_from(&[Value::from("E1")], &[(1, Value::Int(10))], &source).unwrap();
        assert_eq!(t.aggregate_value(&[Value::from("E1")], 1).unwrap(), Value::Int(5));
        assert_eq!(t.len(), 1);
    }

    fn id_of(relation: &Relation, s: &str) -> RowId {
        let (_, rows) = relation.snapshot();
        rows.into_iter().find(|(_, row)| row.value(0) == &Value::from(s)).map(|(id, _)| id).unwrap()
    }

    fn contents(relation: &Relation) -> Vec<(Value, Value)> {
        relation.rows().iter().map(|r| (r.value(0).clone(), r.value(1).clone())).collect()
    }

    #[test]
    fn merge_updates_matched_rows_atomically() {
        let mut r = Relation::new(&totals()).unwrap();
        for (s, i) in [("a", 1), ("b", 2)] {
            let e = row(&r, s, i);
            r.insert(&e).unwrap();
        }
        let a = id_of(&r, "a");
        let change = r.apply_merge(vec![(a, vec![(1, Value::Int(10))])], None).unwrap();
        assert_eq!(change.inserted.len(), 1);
        assert_eq!(r.aggregate_value(&[], 2).unwrap(), Value::Int(12));
        let everything = vec![(a, vec![(2, Value::Int(0))]), (id_of(&r, "b"), vec![(2, Value::Int(0))])];
        assert!(r.apply_merge(everything, None).is_err());
        assert_eq!(r.aggregate_value(&[], 2).unwrap(), Value::Int(12));
    }

    // A window whose sorted column lost a row's contribution cannot take
    // that row out again, which makes the removal step fail.
    fn sorted_window(retention: Retention) -> Relation {
        let spec = RelationSpec::new("Sorted")
            .column(ColumnSpec::plain("theString", ValueType::String))
            .column(ColumnSpec::plain("intPrimitive", ValueType::Integer))
            .column(ColumnSpec::aggregate("sorted", AggregateKind::Sorted, ValueType::Integer).fed_by("intPrimitive"))
            .retain(retention);
        Relation::new(&spec).unwrap()
    }

    #[test]
    fn failed_eviction_leaves_window_unchanged() {
        let mut r = sorted_window(Retention::Length(1));
        let first = row(&r, "a", 1);
        r.insert(&first).unwrap();
        r.retract_from(&[], &[(2, Value::Int(1))], &first).unwrap();
        let before = (r.version(), contents(&r));

        let second = row(&r, "b", 2);
        assert!(matches!(r.insert(&second), Err(ContinuumError::AccumulatorUnderflow { .. })));
        assert_eq!((r.version(), contents(&r)), before);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn failed_unique_replacement_leaves_window_unchanged() {
        let mut r = sorted_window(Retention::Unique("theString".into()));
        let first = row(&r, "a", 1);
        r.insert(&first).unwrap();
        r.retract_from(&[], &[(2, Value::Int(1))], &first).unwrap();
        let before = (r.version(), contents(&r));

        let newer = row(&r, "a", 2);
        assert!(r.insert(&newer).is_err());
        assert_eq!((r.version(), contents(&r)), before);
        assert_eq!(r.indexed(0, &Value::from("a")).map(|rows| rows.len()), Some(1));
    }

    #[test]
    fn failing_merge_changes_no_row() {
        let mut r = sorted_window(Retention::KeepAll);
        for (s, i) in [("a", 1), ("b", 2)] {
            let e = row(&r, s, i);
            r.insert(&e).unwrap();
        }
        let b = row(&r, "b", 2);
        r.retract_from(&[], &[(2, Value::Int(2))], &b).unwrap();
        let before = (r.version(), contents(&r));

        // "a" would update fine, "b" cannot leave the sorted column
        let updates = vec![
            (id_of(&r, "a"), vec![(1, Value::Int(10))]),
            (id_of(&r, "b"), vec![(1, Value::Int(20))]),
        ];
        assert!(r.apply_merge(updates, None).is_err());
        assert_eq!((r.version(), contents(&r)), before);
    }

    #[test]
    fn merge_onto_unique_value_evicts_its_holder() {
        let mut r = Relation::new(&totals().retain(Retention::Unique("theString".into()))).unwrap();
        for (s, i) in [("a", 1), ("b", 2), ("c", 3)] {
            let e = row(&r, s, i);
            r.insert(&e).unwrap();
        }
        let a = id_of(&r, "a");
        let change = r.apply_merge(vec![(a, vec![(0, Value::from("b"))])], None).unwrap();
        assert_eq!(change.removed.len(), 2, "the old b and the old a");
        assert_eq!(r.len(), 2);
        assert_eq!(r.aggregate_value(&[], 2).unwrap(), Value::Int(4));
        let holders = r.indexed(0, &Value::from("b")).unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].value(1), &Value::Int(1));
        assert!(r.indexed(0, &Value::from("a")).unwrap().is_empty());

        // two rows cannot take the same value
        let (_, rows) = r.snapshot();
        let both = rows.iter().map(|(id, _)| (*id, vec![(0, Value::from("z"))])).collect();
        assert!(matches!(r.apply_merge(both, None), Err(ContinuumError::KeyViolation { .. })));
        assert_eq!(r.len(), 2);

        // the index still points at the merged row
        let newer = row(&r, "b", 9);
        let change = r.insert(&newer).unwrap();
        assert_eq!(change.removed[0].value(1), &Value::Int(1));
        assert_eq!(r.len(), 2);
        assert_eq!(r.aggregate_value(&[], 2).unwrap(), Value::Int(12));
    }
}
