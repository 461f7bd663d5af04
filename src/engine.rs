//! The engine value that owns schemas, relations, contexts and statements.
//!
//! There is no global state: every [`Engine`] is independent and cheap to
//! clone, clones share the same engine. Event submission is synchronous for
//! the calling thread and safe from many threads at once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::calendar::datetime_to_millis;
use crate::config::EngineConfig;
use crate::context::{ContextManager, ContextSpec, Partition, PartitionId};
use crate::datatype::{Timestamp, Value};
use crate::error::{ContinuumError, Result};
use crate::interface::{CancelToken, StatementId, UpdateListener};
use crate::parameter::{ParameterBindings, ParameterKey};
use crate::relation::{RelationHandle, RelationKeeper, RelationSpec};
use crate::schema::{Attribute, Event, EventBuilder, EventType, SchemaRegistry};
use crate::statement::{Plan, Statement, StatementSpec};

struct EngineInner {
    config: EngineConfig,
    schema: SchemaRegistry,
    relations: RelationKeeper,
    contexts: RwLock<HashMap<String, Arc<ContextManager>>>,
    statements: RwLock<HashMap<StatementId, Arc<Statement>>>,
    default_partition: Partition,
    clock: AtomicI64,
    next_statement: AtomicU64,
    timer: Mutex<Option<(CancelToken, JoinHandle<()>)>>,
    shut_down: AtomicBool,
}

fn wall_clock() -> Timestamp {
    datetime_to_millis(&Utc::now())
}

// a statement may have batches from several partitions, one drain is enough
fn deliver(touched: Vec<Arc<Statement>>) {
    let mut seen = HashSet::new();
    for statement in touched {
        if seen.insert(statement.id()) {
            statement.dispatcher().deliver();
        }
    }
}

impl EngineInner {
    fn now(&self) -> Timestamp {
        self.clock.load(Ordering::SeqCst)
    }

    fn contexts(&self) -> Vec<Arc<ContextManager>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn advance_time(&self, to: Timestamp) {
        let previous = self.clock.fetch_max(to, Ordering::SeqCst);
        let now = previous.max(to);
        let mut touched = Vec::new();
        for context in self.contexts() {
            touched.extend(context.advance(now));
        }
        touched.extend(self.default_partition.advance(now));
        deliver(touched);
    }

    fn stop_timer(&self) {
        let timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some((token, handle)) = timer {
            token.cancel();
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some((token, _)) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("time", &self.inner.now())
            .field("types", &self.inner.schema.len())
            .field("relations", &self.inner.relations.len())
            .finish()
    }
}

impl Engine {
    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub fn new(config: EngineConfig) -> Self {
        let start = if config.internal_timer {
            wall_clock()
        } else {
            config.start_time_ms
        };
        let inner = Arc::new(EngineInner {
            schema: SchemaRegistry::new(),
            relations: RelationKeeper::new(),
            contexts: RwLock::new(HashMap::new()),
            statements: RwLock::new(HashMap::new()),
            default_partition: Partition::new(PartitionId::DEFAULT, start, None, &[]),
            clock: AtomicI64::new(start),
            next_statement: AtomicU64::new(1),
            timer: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            config,
        });
        if inner.config.internal_timer {
            Self::start_timer(&inner);
        }
        info!(start, internal_timer = inner.config.internal_timer, "engine started");
        Self { inner }
    }

    fn start_timer(inner: &Arc<EngineInner>) {
        let token = CancelToken::new();
        let cancelled = token.clone();
        let engine: Weak<EngineInner> = Arc::downgrade(inner);
        let resolution = Duration::from_millis(inner.config.timer_resolution_ms.max(1));
        let spawned = thread::Builder::new().name("continuum-timer".into()).spawn(move || {
            loop {
                thread::sleep(resolution);
                if cancelled.is_cancelled() {
                    break;
                }
                let Some(inner) = engine.upgrade() else { break };
                inner.advance_time(wall_clock());
            }
            debug!("timer stopped");
        });
        match spawned {
            Ok(handle) => *inner.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some((token, handle)),
            Err(error) => warn!(%error, "could not start the internal timer"),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
    pub fn schema(&self) -> &SchemaRegistry {
        &self.inner.schema
    }
    pub fn relations(&self) -> &RelationKeeper {
        &self.inner.relations
    }
    pub fn current_time(&self) -> Timestamp {
        self.inner.now()
    }

    // ------------- Declarations -------------
    pub fn register_type(&self, name: &str, attributes: Vec<Attribute>) -> Result<Arc<EventType>> {
        self.inner.schema.register(name, attributes)
    }

    pub fn event(&self, event_type: &str) -> Result<EventBuilder> {
        self.inner.schema.event(event_type)
    }

    pub fn create_relation(&self, spec: &RelationSpec) -> Result<RelationHandle> {
        let relation = self.inner.relations.keep(spec)?;
        info!(relation = %spec.name, "relation created");
        Ok(relation)
    }

    pub fn relation(&self, name: &str) -> Result<RelationHandle> {
        self.inner.relations.get(name)
    }

    pub fn declare_context(&self, spec: &ContextSpec) -> Result<Arc<ContextManager>> {
        let mut contexts = self.inner.contexts.write()?;
        if contexts.contains_key(&spec.name) {
            return Err(ContinuumError::Validation(format!("context '{}' already exists", spec.name)));
        }
        let manager = Arc::new(ContextManager::declare(
            spec,
            &self.inner.schema,
            &self.inner.relations,
            self.inner.now(),
            self.inner.config.max_partitions_per_context,
        )?);
        contexts.insert(spec.name.clone(), Arc::clone(&manager));
        Ok(manager)
    }

    pub fn context(&self, name: &str) -> Result<Arc<ContextManager>> {
        self.inner
            .contexts
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| ContinuumError::UnknownContext(name.to_string()))
    }

    // ------------- Statements -------------
    /// Compiles a statement whose parameters are bound before activation.
    pub fn prepare(&self, spec: impl Into<StatementSpec>) -> Result<PreparedStatement> {
        let spec = spec.into();
        if let Some(context) = spec.context() {
            self.context(context)?;
        }
        let (plan, slots) = Plan::compile(&spec, &self.inner.schema, &self.inner.relations)?;
        Ok(PreparedStatement {
            engine: self.clone(),
            name: spec.name().map(str::to_string),
            context: spec.context().map(str::to_string),
            plan: Arc::new(plan),
            bindings: ParameterBindings::new(Arc::new(slots)),
        })
    }

    /// Compiles and activates a statement without parameters.
    pub fn create_statement(&self, spec: impl Into<StatementSpec>) -> Result<StatementHandle> {
        let prepared = self.prepare(spec)?;
        if prepared.parameter_count() > 0 {
            return Err(ContinuumError::ParametersRequirePrepare);
        }
        prepared.activate()
    }

    fn install(&self, name: Option<&str>, context: Option<&str>, plan: Plan) -> Result<StatementHandle> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ContinuumError::Destroyed("engine".into()));
        }
        let id = StatementId(self.inner.next_statement.fetch_add(1, Ordering::SeqCst));
        let statement = Arc::new(Statement::new(id, name, context, plan));
        let now = self.inner.now();
        match context {
            Some(context) => self.context(context)?.attach(&statement, now)?,
            None => self.inner.default_partition.attach(&statement, now)?,
        }
        self.inner.statements.write()?.insert(id, Arc::clone(&statement));
        info!(statement = %statement.name(), text = %statement.text(), "statement activated");
        Ok(StatementHandle {
            engine: self.clone(),
            statement,
        })
    }

    pub fn statements(&self) -> Vec<StatementHandle> {
        let statements = self.inner.statements.read().unwrap_or_else(PoisonError::into_inner);
        let mut handles: Vec<StatementHandle> = statements
            .values()
            .map(|s| StatementHandle {
                engine: self.clone(),
                statement: Arc::clone(s),
            })
            .collect();
        handles.sort_by_key(|h| h.id());
        handles
    }

    pub fn statement(&self, name: &str) -> Option<StatementHandle> {
        self.statements().into_iter().find(|h| h.name() == name)
    }

    // ------------- Events and time -------------
    /// Processes the event against every statement and partition it reaches
    /// and delivers the resulting batches before returning. Faults of single
    /// statements are logged, not returned.
    pub fn send(&self, event: Event) -> Result<()> {
        let event_type = event.event_type();
        if self.inner.schema.name_of(event_type.id()).as_deref() != Some(event_type.name()) {
            return Err(ContinuumError::UnknownType(event_type.name().to_string()));
        }
        if self.inner.shut_down.load(Ordering::SeqCst) {
            debug!(event_type = %event_type.name(), "event after shutdown ignored");
            return Ok(());
        }
        let now = self.inner.now();
        let log_events = self.inner.config.log_fault_events;
        let mut touched = Vec::new();
        for context in self.inner.contexts() {
            touched.extend(context.on_event(&event, now, log_events));
        }
        touched.extend(self.inner.default_partition.process(&event, now, log_events));
        deliver(touched);
        Ok(())
    }

    /// Moves engine time forward; earlier times are ignored.
    pub fn advance_time(&self, to: Timestamp) {
        self.inner.advance_time(to);
    }

    /// Stops the timer, ends every partition with its terminal flushes and
    /// destroys all statements.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop_timer();
        let mut touched = Vec::new();
        for context in self.inner.contexts() {
            touched.extend(context.close());
        }
        touched.extend(self.inner.default_partition.terminate());
        deliver(touched);
        let statements: Vec<Arc<Statement>> = self
            .inner
            .statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for statement in statements {
            statement.dispatcher().destroy();
        }
        info!("engine shut down");
    }
}

// ------------- Prepared statements -------------
/// A compiled statement waiting for its parameter values.
#[derive(Debug)]
pub struct PreparedStatement {
    engine: Engine,
    name: Option<String>,
    context: Option<String>,
    plan: Arc<Plan>,
    bindings: ParameterBindings,
}

impl PreparedStatement {
    pub fn parameter_count(&self) -> usize {
        self.bindings.slots().len()
    }

    /// Binds by 1-based index or by name, whichever style the statement uses.
    pub fn bind<'a>(&mut self, key: impl Into<ParameterKey<'a>>, value: impl Into<Value>) -> Result<&mut Self> {
        self.bindings.bind(key, value)?;
        Ok(self)
    }

    /// Activates a new statement with the values bound right now. Later
    /// binds only affect later activations.
    pub fn activate(&self) -> Result<StatementHandle> {
        let values = self.bindings.snapshot()?;
        let plan = if values.is_empty() {
            (*self.plan).clone()
        } else {
            self.plan.bind(&values)?
        };
        self.engine.install(self.name.as_deref(), self.context.as_deref(), plan)
    }
}

// ------------- Statement handles -------------
#[derive(Debug, Clone)]
pub struct StatementHandle {
    engine: Engine,
    statement: Arc<Statement>,
}

impl StatementHandle {
    pub fn id(&self) -> StatementId {
        self.statement.id()
    }
    pub fn name(&self) -> &str {
        self.statement.name()
    }
    pub fn text(&self) -> &str {
        self.statement.text()
    }
    pub fn output_type(&self) -> &Arc<EventType> {
        self.statement.output_type()
    }
    pub fn add_listener(&self, listener: Arc<dyn UpdateListener>) {
        self.statement.dispatcher().add_listener(listener);
    }
    pub fn remove_all_listeners(&self) {
        self.statement.dispatcher().remove_all_listeners();
    }
    /// Rows held by the output batcher across all partitions.
    pub fn pending_rows(&self) -> usize {
        match self.statement.context() {
            Some(context) => self.engine.context(context).map(|c| c.pending_rows(self.id())).unwrap_or(0),
            None => self.engine.inner.default_partition.pending_rows(self.id()),
        }
    }
    pub fn is_destroyed(&self) -> bool {
        self.statement.dispatcher().is_destroyed()
    }

    /// After this returns no listener of the statement is called again.
    pub fn destroy(&self) {
        self.statement.dispatcher().destroy();
        match self.statement.context() {
            Some(context) => {
                if let Ok(manager) = self.engine.context(context) {
                    manager.detach(self.id());
                }
            }
            None => self.engine.inner.default_partition.detach(self.id()),
        }
        self.engine
            .inner
            .statements
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id());
        info!(statement = %self.name(), "statement destroyed");
    }
}
