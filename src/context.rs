//! Contexts: partitions of statement state that start and end on events or
//! time.
//!
//! Every partition holds one [`StatementInstance`] per statement scoped to its
//! context behind a reader/writer gate. Sending threads process an event
//! under the shared side of the gate, so many events may run against one
//! partition at once (each statement instance is still locked on its own).
//! Termination first moves the lifecycle from ACTIVE to TERMINATING, which
//! turns away new events, and then takes the exclusive side, which waits for
//! the events already admitted. Only then are the terminal flushes made and
//! the state released.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::calendar::TimePeriod;
use crate::datatype::Timestamp;
use crate::error::{ContinuumError, Result};
use crate::filter::{CompiledExpr, Compiler, EvalContext, Expr, Scope};
use crate::interface::StatementId;
use crate::parameter::ParameterSlots;
use crate::relation::RelationKeeper;
use crate::schema::{Event, EventType, SchemaRegistry};
use crate::statement::{Statement, StatementInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub u64);

impl PartitionId {
    /// The partition of statements that do not name a context.
    pub const DEFAULT: PartitionId = PartitionId(0);
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ------------- Declaration -------------
#[derive(Debug, Clone, PartialEq)]
pub enum StartCondition {
    /// A partition starts right away, and again whenever the previous one ends.
    Immediate,
    Event { event_type: String, filter: Option<Expr> },
}

impl StartCondition {
    pub fn on(event_type: &str) -> Self {
        StartCondition::Event {
            event_type: event_type.to_string(),
            filter: None,
        }
    }
    pub fn on_filtered(event_type: &str, filter: Expr) -> Self {
        StartCondition::Event {
            event_type: event_type.to_string(),
            filter: Some(filter),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EndCondition {
    Never,
    After(TimePeriod),
    Event { event_type: String, filter: Option<Expr> },
}

impl EndCondition {
    pub fn on(event_type: &str) -> Self {
        EndCondition::Event {
            event_type: event_type.to_string(),
            filter: None,
        }
    }
    pub fn on_filtered(event_type: &str, filter: Expr) -> Self {
        EndCondition::Event {
            event_type: event_type.to_string(),
            filter: Some(filter),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextSpec {
    pub name: String,
    pub start: StartCondition,
    pub end: EndCondition,
    /// Each start event opens another partition. Otherwise start events are
    /// ignored while a partition is live.
    pub overlapping: bool,
}

impl ContextSpec {
    pub fn new(name: &str, start: StartCondition, end: EndCondition) -> Self {
        Self {
            name: name.to_string(),
            start,
            end,
            overlapping: false,
        }
    }
    pub fn overlapping(mut self) -> Self {
        self.overlapping = true;
        self
    }
}

// ------------- Partition -------------
const ACTIVE: u8 = 0;
const TERMINATING: u8 = 1;
const TERMINATED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Active,
    Terminating,
    Terminated,
}

#[derive(Debug)]
struct Slot {
    statement: Arc<Statement>,
    instance: Mutex<StatementInstance>,
}

#[derive(Debug, Default)]
struct PartitionBody {
    slots: Vec<Slot>,
}

#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    started_at: Timestamp,
    ends_at: Option<Timestamp>,
    lifecycle: AtomicU8,
    gate: RwLock<PartitionBody>,
}

/// Logs a per-event fault of one statement in one partition.
pub(crate) fn report_fault(
    statement: &Statement,
    partition: PartitionId,
    error: &ContinuumError,
    event: Option<&Event>,
    log_events: bool,
) {
    match event {
        Some(event) if log_events => warn!(
            statement = %statement.name(),
            %partition,
            %error,
            %event,
            "statement fault"
        ),
        _ => warn!(statement = %statement.name(), %partition, %error, "statement fault"),
    }
}

impl Partition {
    pub(crate) fn new(
        id: PartitionId,
        started_at: Timestamp,
        ends_at: Option<Timestamp>,
        statements: &[Arc<Statement>],
    ) -> Self {
        let mut body = PartitionBody::default();
        for statement in statements {
            match statement.instantiate(started_at) {
                Ok(instance) => body.slots.push(Slot {
                    statement: Arc::clone(statement),
                    instance: Mutex::new(instance),
                }),
                Err(error) => report_fault(statement, id, &error, None, false),
            }
        }
        Self {
            id,
            started_at,
            ends_at,
            lifecycle: AtomicU8::new(ACTIVE),
            gate: RwLock::new(body),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }
    pub fn ends_at(&self) -> Option<Timestamp> {
        self.ends_at
    }
    pub fn state(&self) -> PartitionState {
        match self.lifecycle.load(Ordering::SeqCst) {
            ACTIVE => PartitionState::Active,
            TERMINATING => PartitionState::Terminating,
            _ => PartitionState::Terminated,
        }
    }
    fn is_active(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == ACTIVE
    }

    /// Runs the event through every accepting statement. Returns the
    /// statements that have batches waiting for delivery.
    pub(crate) fn process(&self, event: &Event, now: Timestamp, log_events: bool) -> Vec<Arc<Statement>> {
        let body = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_active() {
            return Vec::new();
        }
        let mut touched = Vec::new();
        for slot in body.slots.iter().filter(|s| s.statement.accepts(event)) {
            let mut instance = slot.instance.lock().unwrap_or_else(PoisonError::into_inner);
            match instance.process(event, now) {
                Ok(Some(drained)) => {
                    slot.statement.enqueue(self.id, drained);
                    touched.push(Arc::clone(&slot.statement));
                }
                Ok(None) => {}
                Err(error) => report_fault(&slot.statement, self.id, &error, Some(event), log_events),
            }
        }
        touched
    }

    /// The time-advance signal, taking the same path as events.
    pub(crate) fn advance(&self, now: Timestamp) -> Vec<Arc<Statement>> {
        let body = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_active() {
            return Vec::new();
        }
        let mut touched = Vec::new();
        for slot in &body.slots {
            let mut instance = slot.instance.lock().unwrap_or_else(PoisonError::into_inner);
            match instance.advance(now) {
                Ok(Some(drained)) => {
                    slot.statement.enqueue(self.id, drained);
                    touched.push(Arc::clone(&slot.statement));
                }
                Ok(None) => {}
                Err(error) => report_fault(&slot.statement, self.id, &error, None, false),
            }
        }
        touched
    }

    /// Ends the partition. Only the first caller does anything; it waits for
    /// the events in flight and makes the terminal flush of every statement.
    pub(crate) fn terminate(&self) -> Vec<Arc<Statement>> {
        if self
            .lifecycle
            .compare_exchange(ACTIVE, TERMINATING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Vec::new();
        }
        let mut body = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        let mut touched = Vec::new();
        for slot in body.slots.drain(..) {
            let mut instance = slot.instance.into_inner().unwrap_or_else(PoisonError::into_inner);
            match instance.terminate() {
                Ok(Some(drained)) => {
                    slot.statement.enqueue(self.id, drained);
                    touched.push(slot.statement);
                }
                Ok(None) => {}
                Err(error) => report_fault(&slot.statement, self.id, &error, None, false),
            }
        }
        self.lifecycle.store(TERMINATED, Ordering::SeqCst);
        debug!(partition = %self.id, "partition terminated");
        touched
    }

    pub(crate) fn attach(&self, statement: &Arc<Statement>, now: Timestamp) -> Result<()> {
        let mut body = self.gate.write()?;
        if !self.is_active() {
            return Ok(());
        }
        body.slots.push(Slot {
            statement: Arc::clone(statement),
            instance: Mutex::new(statement.instantiate(now)?),
        });
        Ok(())
    }

    pub(crate) fn detach(&self, statement: StatementId) {
        let mut body = self.gate.write().unwrap_or_else(PoisonError::into_inner);
        body.slots.retain(|s| s.statement.id() != statement);
    }

    pub(crate) fn pending_rows(&self, statement: StatementId) -> usize {
        let body = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        body.slots
            .iter()
            .filter(|s| s.statement.id() == statement)
            .map(|s| s.instance.lock().unwrap_or_else(PoisonError::into_inner).pending_rows())
            .sum()
    }
}

// ------------- Context Manager -------------
#[derive(Debug)]
struct Trigger {
    event_type: Arc<EventType>,
    filter: Option<CompiledExpr>,
}

impl Trigger {
    fn compile(event_type: &str, filter: &Option<Expr>, schema: &SchemaRegistry, relations: &RelationKeeper) -> Result<Self> {
        let event_type = schema.get(event_type)?;
        let mut slots = ParameterSlots::new();
        let filter = match filter {
            Some(f) => {
                let scope = Scope::single(Arc::clone(&event_type), None);
                Some(Compiler::new(relations, &mut slots).compile(f, &scope)?)
            }
            None => None,
        };
        if !slots.is_empty() {
            return Err(ContinuumError::Validation(
                "context conditions cannot use substitution parameters".into(),
            ));
        }
        Ok(Self { event_type, filter })
    }

    fn fires(&self, context: &str, event: &Event) -> bool {
        if event.event_type().id() != self.event_type.id() {
            return false;
        }
        let Some(filter) = &self.filter else { return true };
        let streams = [event];
        match filter.eval_bool(&EvalContext::new(&streams)) {
            Ok(fires) => fires,
            Err(error) => {
                warn!(%context, %error, "context condition fault");
                false
            }
        }
    }
}

#[derive(Debug)]
enum Start {
    Immediate,
    Event(Trigger),
}

#[derive(Debug)]
enum End {
    Never,
    After(TimePeriod),
    Event(Trigger),
}

/// The live partitions of one declared context and the statements scoped to it.
#[derive(Debug)]
pub struct ContextManager {
    name: String,
    start: Start,
    end: End,
    overlapping: bool,
    max_partitions: Option<usize>,
    next_id: AtomicU64,
    closed: AtomicBool,
    // lock order: live before statements
    live: RwLock<Vec<Arc<Partition>>>,
    statements: RwLock<Vec<Arc<Statement>>>,
}

impl ContextManager {
    pub(crate) fn declare(
        spec: &ContextSpec,
        schema: &SchemaRegistry,
        relations: &RelationKeeper,
        now: Timestamp,
        max_partitions: Option<usize>,
    ) -> Result<Self> {
        let start = match &spec.start {
            StartCondition::Immediate => Start::Immediate,
            StartCondition::Event { event_type, filter } => {
                Start::Event(Trigger::compile(event_type, filter, schema, relations)?)
            }
        };
        let end = match &spec.end {
            EndCondition::Never => End::Never,
            EndCondition::After(period) => {
                // rejects empty and negative periods
                crate::calendar::CalendarDelta::new(*period)?;
                End::After(*period)
            }
            EndCondition::Event { event_type, filter } => End::Event(Trigger::compile(event_type, filter, schema, relations)?),
        };
        let manager = Self {
            name: spec.name.clone(),
            start,
            end,
            overlapping: spec.overlapping,
            max_partitions,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            live: RwLock::new(Vec::new()),
            statements: RwLock::new(Vec::new()),
        };
        manager.restart_immediate(now);
        info!(context = %manager.name, "context declared");
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn live_partitions(&self) -> Vec<PartitionId> {
        self.live_snapshot().iter().map(|p| p.id()).collect()
    }
    /// How many partitions this context has opened so far.
    pub fn partitions_started(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst) - 1
    }

    fn live_snapshot(&self) -> Vec<Arc<Partition>> {
        self.live.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn take_live(&self, mut ending: impl FnMut(&Partition) -> bool) -> Vec<Arc<Partition>> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        let mut taken = Vec::new();
        live.retain(|p| {
            if ending(&**p) {
                taken.push(Arc::clone(p));
                false
            } else {
                true
            }
        });
        taken
    }

    fn start_partition(&self, live: &mut Vec<Arc<Partition>>, now: Timestamp) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(cap) = self.max_partitions {
            if live.len() >= cap {
                warn!(context = %self.name, cap, "partition limit reached, start ignored");
                return;
            }
        }
        let ends_at = match &self.end {
            End::After(period) => match period.add_to(now, 1) {
                Ok(at) => Some(at),
                Err(error) => {
                    warn!(context = %self.name, %error, "cannot schedule partition end");
                    None
                }
            },
            _ => None,
        };
        let id = PartitionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let statements = self.statements.read().unwrap_or_else(PoisonError::into_inner);
        live.push(Arc::new(Partition::new(id, now, ends_at, &statements)));
        debug!(context = %self.name, partition = %id, start = now, "partition started");
    }

    fn restart_immediate(&self, now: Timestamp) {
        if let Start::Immediate = self.start {
            let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
            if live.is_empty() {
                self.start_partition(&mut live, now);
            }
        }
    }

    fn terminate(&self, ending: Vec<Arc<Partition>>) -> Vec<Arc<Statement>> {
        ending.iter().flat_map(|p| p.terminate()).collect()
    }

    /// Ends first, then delivery to live partitions, then starts. A start
    /// event is therefore never seen by the partition it opens.
    pub(crate) fn on_event(&self, event: &Event, now: Timestamp, log_events: bool) -> Vec<Arc<Statement>> {
        let mut touched = Vec::new();
        if let End::Event(trigger) = &self.end {
            if trigger.fires(&self.name, event) {
                touched.extend(self.terminate(self.take_live(|_| true)));
                self.restart_immediate(now);
            }
        }
        for partition in self.live_snapshot() {
            touched.extend(partition.process(event, now, log_events));
        }
        if let Start::Event(trigger) = &self.start {
            if trigger.fires(&self.name, event) {
                let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
                if self.overlapping || live.is_empty() {
                    self.start_partition(&mut live, now);
                }
            }
        }
        touched
    }

    pub(crate) fn advance(&self, now: Timestamp) -> Vec<Arc<Statement>> {
        let mut touched = self.terminate(self.take_live(|p| p.ends_at().is_some_and(|at| at <= now)));
        self.restart_immediate(now);
        for partition in self.live_snapshot() {
            touched.extend(partition.advance(now));
        }
        touched
    }

    /// Ends every live partition and opens no more.
    pub(crate) fn close(&self) -> Vec<Arc<Statement>> {
        self.closed.store(true, Ordering::SeqCst);
        self.terminate(self.take_live(|_| true))
    }

    pub(crate) fn attach(&self, statement: &Arc<Statement>, now: Timestamp) -> Result<()> {
        let live = self.live.write()?;
        self.statements.write()?.push(Arc::clone(statement));
        for partition in live.iter() {
            partition.attach(statement, now)?;
        }
        Ok(())
    }

    pub(crate) fn detach(&self, statement: StatementId) {
        let live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        self.statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id() != statement);
        for partition in live.iter() {
            partition.detach(statement);
        }
    }

    pub(crate) fn pending_rows(&self, statement: StatementId) -> usize {
        self.live_snapshot().iter().map(|p| p.pending_rows(statement)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::ValueType;
    use crate::interface::CollectingListener;
    use crate::output::OutputSpec;
    use crate::schema::Attribute;
    use crate::statement::{Plan, SelectSpec, StatementSpec};

    fn setup() -> (SchemaRegistry, RelationKeeper) {
        let schema = SchemaRegistry::new();
        schema.register("A", vec![Attribute::new("id", ValueType::Integer)]).unwrap();
        schema.register("B", vec![Attribute::new("id", ValueType::Integer)]).unwrap();
        (schema, RelationKeeper::new())
    }

    fn statement(schema: &SchemaRegistry, relations: &RelationKeeper) -> Arc<Statement> {
        let spec = SelectSpec::from("B")
            .select_as(crate::filter::Expr::count_star(), "cnt")
            .output(OutputSpec::default().only_when_terminated())
            .context("ctx");
        let (plan, _) = Plan::compile(&StatementSpec::Select(spec), schema, relations).unwrap();
        Arc::new(Statement::new(StatementId(1), None, Some("ctx"), plan))
    }

    fn event(schema: &SchemaRegistry, name: &str, id: i32) -> Event {
        schema.event(name).unwrap().with("id", id).unwrap().build().unwrap()
    }

    #[test]
    fn terminal_flush_happens_once() {
        let (schema, relations) = setup();
        let statement = statement(&schema, &relations);
        let listener = Arc::new(CollectingListener::new());
        statement.dispatcher().add_listener(listener.clone());
        let partition = Partition::new(PartitionId(1), 0, None, &[Arc::clone(&statement)]);
        partition.process(&event(&schema, "B", 1), 0, true);
        partition.process(&event(&schema, "B", 2), 0, true);
        assert_eq!(partition.terminate().len(), 1);
        assert!(partition.terminate().is_empty());
        assert!(partition.process(&event(&schema, "B", 3), 0, true).is_empty());
        statement.dispatcher().deliver();
        assert_eq!(listener.terminal_count(), 1);
        assert_eq!(listener.inserted_rows()[0].value(0), &crate::datatype::Value::Long(2));
        assert_eq!(partition.state(), PartitionState::Terminated);
    }

    #[test]
    fn start_event_is_not_seen_by_its_partition() {
        let (schema, relations) = setup();
        let spec = ContextSpec::new("ctx", StartCondition::on("A"), EndCondition::on("A"));
        let manager = ContextManager::declare(&spec, &schema, &relations, 0, None).unwrap();
        let statement = statement(&schema, &relations);
        manager.attach(&statement, 0).unwrap();
        manager.on_event(&event(&schema, "A", 1), 0, true);
        assert_eq!(manager.live_partitions(), vec![PartitionId(1)]);
        manager.on_event(&event(&schema, "B", 1), 0, true);
        let touched = manager.on_event(&event(&schema, "A", 2), 0, true);
        assert_eq!(touched.len(), 1);
        assert_eq!(manager.live_partitions(), vec![PartitionId(2)]);
        assert_eq!(manager.partitions_started(), 2);
    }

    #[test]
    fn timed_end_follows_engine_time() {
        let (schema, relations) = setup();
        let spec = ContextSpec::new("ctx", StartCondition::on("A"), EndCondition::After(TimePeriod::seconds(2)));
        let manager = ContextManager::declare(&spec, &schema, &relations, 0, Some(4)).unwrap();
        manager.on_event(&event(&schema, "A", 1), 1000, true);
        manager.on_event(&event(&schema, "A", 2), 1500, true);
        assert_eq!(manager.live_partitions().len(), 1);
        manager.advance(2999);
        assert_eq!(manager.live_partitions().len(), 1);
        manager.advance(3000);
        assert!(manager.live_partitions().is_empty());
    }
}
