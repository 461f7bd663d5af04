//! Output rate limiting.
//!
//! Every statement instance owns one [`OutputBatcher`]. Rows a statement
//! produces for an event are offered to it together with the key that
//! distinguishes them (the group-by key, or the row itself when ungrouped).
//! The batcher decides whether they are forwarded now or held until the next
//! boundary, at which point the pending changeset is drained into one batch.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::calendar::{CalendarDelta, TimePeriod};
use crate::datatype::{Timestamp, Value};
use crate::error::{ContinuumError, Result};
use crate::schema::Event;
use crate::OtherHasher;

// ------------- Output Clause -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputPolicy {
    #[default]
    All,
    First,
    Last,
    Snapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputBoundary {
    /// Flush after every N contributing events.
    Events(u64),
    /// Flush whenever engine time passes the next period boundary.
    Every(TimePeriod),
    /// Only the terminal flush, if requested, ever delivers.
    Never,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub policy: OutputPolicy,
    pub boundary: OutputBoundary,
    pub when_terminated: bool,
    /// Collapse the LAST changeset eagerly, one row per key.
    pub compaction: bool,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            policy: OutputPolicy::All,
            boundary: OutputBoundary::Events(1),
            when_terminated: false,
            compaction: false,
        }
    }
}

impl OutputSpec {
    pub fn new(policy: OutputPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }
    pub fn every_events(mut self, count: u64) -> Self {
        self.boundary = OutputBoundary::Events(count);
        self
    }
    pub fn every(mut self, period: TimePeriod) -> Self {
        self.boundary = OutputBoundary::Every(period);
        self
    }
    /// `output when terminated`: nothing until the partition ends.
    pub fn only_when_terminated(mut self) -> Self {
        self.boundary = OutputBoundary::Never;
        self.when_terminated = true;
        self
    }
    pub fn and_when_terminated(mut self) -> Self {
        self.when_terminated = true;
        self
    }
    pub fn compacted(mut self) -> Self {
        self.compaction = true;
        self
    }

    pub fn validate(&self, ordered: bool) -> Result<()> {
        if self.compaction && ordered {
            return Err(ContinuumError::Validation(
                "The ENABLE_OUTPUTLIMIT_OPT hint is not supported with order-by".into(),
            ));
        }
        match &self.boundary {
            OutputBoundary::Events(0) => Err(ContinuumError::Validation(
                "an output event count must be at least one".into(),
            )),
            OutputBoundary::Never if !self.when_terminated => Err(ContinuumError::Validation(
                "an output clause without a boundary requires 'when terminated'".into(),
            )),
            OutputBoundary::Every(period) => CalendarDelta::new(period.clone()).map(|_| ()),
            _ => Ok(()),
        }
    }
}

// ------------- Changeset -------------
/// A produced row and the key that tells it apart from other rows.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRow {
    pub key: Vec<Value>,
    pub row: Event,
}
impl KeyedRow {
    pub fn new(key: Vec<Value>, row: Event) -> Self {
        Self { key, row }
    }
    /// Ungrouped rows are told apart by their full value.
    pub fn ungrouped(row: Event) -> Self {
        Self {
            key: row.values().to_vec(),
            row,
        }
    }
}

/// Supplies the rows a SNAPSHOT flush re-materializes.
pub trait SnapshotSource {
    fn snapshot(&self) -> Result<Vec<Event>>;
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Drained {
    pub inserted: Vec<Event>,
    pub removed: Vec<Event>,
    pub terminal: bool,
}
impl Drained {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
struct Compacted {
    slots: Vec<KeyedRow>,
    index: HashMap<Vec<Value>, usize, OtherHasher>,
}
impl Compacted {
    fn put(&mut self, row: KeyedRow) {
        match self.index.get(&row.key) {
            Some(&i) => self.slots[i] = row,
            None => {
                self.index.insert(row.key.clone(), self.slots.len());
                self.slots.push(row);
            }
        }
    }
}

#[derive(Debug)]
enum Pending {
    Queue(Vec<KeyedRow>),
    Compacted(Compacted),
}
impl Pending {
    fn new(compacted: bool) -> Self {
        if compacted {
            Pending::Compacted(Compacted::default())
        } else {
            Pending::Queue(Vec::new())
        }
    }
    fn len(&self) -> usize {
        match self {
            Pending::Queue(rows) => rows.len(),
            Pending::Compacted(c) => c.slots.len(),
        }
    }
    fn push(&mut self, row: KeyedRow) {
        match self {
            Pending::Queue(rows) => rows.push(row),
            Pending::Compacted(c) => c.put(row),
        }
    }
    /// Drains the rows. With `last_per_key` a queue is rendered down to the
    /// most recent row per key, each kept where its key first appeared.
    fn take(&mut self, last_per_key: bool) -> Vec<Event> {
        match self {
            Pending::Compacted(c) => {
                c.index.clear();
                c.slots.drain(..).map(|k| k.row).collect()
            }
            Pending::Queue(rows) if last_per_key => {
                let mut collapsed = Compacted::default();
                for row in rows.drain(..) {
                    collapsed.put(row);
                }
                collapsed.slots.into_iter().map(|k| k.row).collect()
            }
            Pending::Queue(rows) => rows.drain(..).map(|k| k.row).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Accumulating,
}

// ------------- Batcher -------------
#[derive(Debug)]
pub struct OutputBatcher {
    spec: OutputSpec,
    state: BatchState,
    inserted: Pending,
    removed: Pending,
    events: u64,
    first_seen: HashSet<Vec<Value>, OtherHasher>,
    delta: Option<CalendarDelta>,
    reference: Timestamp,
    next_flush: Option<Timestamp>,
}

impl OutputBatcher {
    /// A batcher whose time boundaries are anchored at `now`.
    pub fn new(spec: OutputSpec, now: Timestamp) -> Result<Self> {
        let delta = match &spec.boundary {
            OutputBoundary::Every(period) => Some(CalendarDelta::new(period.clone())?),
            _ => None,
        };
        let next_flush = match &delta {
            Some(delta) => Some(now + delta.delta_add(now)?),
            None => None,
        };
        let compacted = spec.compaction && spec.policy == OutputPolicy::Last;
        Ok(Self {
            inserted: Pending::new(compacted),
            removed: Pending::new(compacted),
            spec,
            state: BatchState::Idle,
            events: 0,
            first_seen: HashSet::default(),
            delta,
            reference: now,
            next_flush,
        })
    }

    pub fn spec(&self) -> &OutputSpec {
        &self.spec
    }
    pub fn state(&self) -> BatchState {
        self.state
    }
    /// Rows held in the changeset, inserted and removed.
    pub fn pending_rows(&self) -> usize {
        self.inserted.len() + self.removed.len()
    }
    pub fn next_flush(&self) -> Option<Timestamp> {
        self.next_flush
    }

    /// Records the rows one contributing event produced. Returns what must be
    /// delivered now, if anything.
    pub fn offer(
        &mut self,
        inserted: Vec<KeyedRow>,
        removed: Vec<KeyedRow>,
        source: &dyn SnapshotSource,
    ) -> Result<Option<Drained>> {
        let mut immediate = None;
        match self.spec.policy {
            OutputPolicy::First => {
                let mut forward = Drained::default();
                for row in inserted {
                    if self.first_seen.insert(row.key) {
                        forward.inserted.push(row.row);
                    }
                }
                if !forward.inserted.is_empty() {
                    forward.removed = removed.into_iter().map(|k| k.row).collect();
                }
                if !forward.is_empty() {
                    immediate = Some(forward);
                }
            }
            OutputPolicy::All | OutputPolicy::Last => {
                for row in inserted {
                    self.inserted.push(row);
                }
                for row in removed {
                    self.removed.push(row);
                }
                self.state = BatchState::Accumulating;
            }
            OutputPolicy::Snapshot => self.state = BatchState::Accumulating,
        }
        self.events += 1;
        if let OutputBoundary::Events(n) = self.spec.boundary {
            if self.events >= n {
                let flushed = self.flush(source, false)?;
                return Ok(merge(immediate, flushed));
            }
        }
        Ok(immediate)
    }

    /// Moves engine time. A jump across several periods flushes once.
    pub fn advance(&mut self, now: Timestamp, source: &dyn SnapshotSource) -> Result<Option<Drained>> {
        let (Some(due), Some(delta)) = (self.next_flush, &self.delta) else {
            return Ok(None);
        };
        if now < due {
            return Ok(None);
        }
        let stepped = delta.delta_add_with_reference(now, self.reference)?;
        self.reference = stepped.last_reference;
        self.next_flush = Some(now + stepped.delta);
        trace!(now, next = now + stepped.delta, "output boundary reached");
        self.flush(source, false)
    }

    /// The terminal flush of an ending partition. With `when terminated`
    /// exactly one batch comes back, possibly empty; otherwise pending rows
    /// are dropped.
    pub fn terminate(&mut self, source: &dyn SnapshotSource) -> Result<Option<Drained>> {
        if !self.spec.when_terminated {
            self.reset();
            return Ok(None);
        }
        self.flush(source, true)
    }

    fn reset(&mut self) {
        let compacted = matches!(self.inserted, Pending::Compacted(_));
        self.inserted = Pending::new(compacted);
        self.removed = Pending::new(compacted);
        self.first_seen.clear();
        self.events = 0;
        self.state = BatchState::Idle;
    }

    fn flush(&mut self, source: &dyn SnapshotSource, terminal: bool) -> Result<Option<Drained>> {
        let last = self.spec.policy == OutputPolicy::Last;
        let drained = match self.spec.policy {
            // the whole state, whether or not anything arrived this period
            OutputPolicy::Snapshot => Drained {
                inserted: source.snapshot()?,
                removed: Vec::new(),
                terminal,
            },
            _ => Drained {
                inserted: self.inserted.take(last),
                removed: self.removed.take(last),
                terminal,
            },
        };
        self.first_seen.clear();
        self.events = 0;
        self.state = BatchState::Idle;
        if drained.is_empty() && !terminal {
            return Ok(None);
        }
        Ok(Some(drained))
    }
}

/// Joins two drained batches in order. The result is terminal if either is.
pub(crate) fn merge(first: Option<Drained>, second: Option<Drained>) -> Option<Drained> {
    match (first, second) {
        (Some(mut a), Some(b)) => {
            a.inserted.extend(b.inserted);
            a.removed.extend(b.removed);
            a.terminal |= b.terminal;
            Some(a)
        }
        (a, b) => a.or(b),
    }
}
