//! Event types and the registry that resolves them.
//!
//! An [`EventType`] is a static attribute descriptor: names and value types in
//! a fixed order. Statements resolve attribute names to positions once, at
//! compile time, so per-event evaluation is a plain index into [`Event`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

// used to keep the one-to-one mapping between type names and their identities
use bimap::BiMap;

use crate::datatype::{DataType, Value, ValueType};
use crate::error::{ContinuumError, Result};
use crate::OtherHasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

// ------------- Attribute -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    value_type: ValueType,
}
impl Attribute {
    pub fn new(name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            value_type,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn value_type(&self) -> &ValueType {
        &self.value_type
    }
}

// ------------- EventType -------------
#[derive(Debug)]
pub struct EventType {
    id: TypeId,
    name: String,
    attributes: Vec<Attribute>,
    index: HashMap<String, usize, OtherHasher>,
}
impl EventType {
    pub fn new(id: TypeId, name: &str, attributes: Vec<Attribute>) -> Self {
        let index = attributes
            .iter()
            .enumerate()
            .map(|(i, a)| (a.name.clone(), i))
            .collect();
        Self {
            id,
            name: name.to_string(),
            attributes,
            index,
        }
    }
    /// An event type that is not registered, e.g. the row type of a relation
    /// or the output type of a statement.
    pub fn anonymous(name: &str, attributes: Vec<Attribute>) -> Arc<Self> {
        Arc::new(Self::new(TypeId(u32::MAX), name, attributes))
    }
    pub fn id(&self) -> TypeId {
        self.id
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
    pub fn len(&self) -> usize {
        self.attributes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.position(name).map(|i| &self.attributes[i])
    }
    /// Getter-style method names (`getTheString`) resolve to the attribute
    /// `theString`. Plain attribute names are accepted as well.
    pub fn resolve_getter(&self, method: &str) -> Option<usize> {
        if let Some(i) = self.position(method) {
            return Some(i);
        }
        let stripped = method.strip_prefix("get")?;
        let mut chars = stripped.chars();
        let first = chars.next()?;
        let property: String = first.to_lowercase().chain(chars).collect();
        self.position(&property)
    }
}

// ------------- Event -------------
#[derive(Debug)]
struct EventInner {
    event_type: Arc<EventType>,
    values: Vec<Value>,
}

/// An immutable, cheaply clonable event (or row) of a known type.
#[derive(Debug, Clone)]
pub struct Event(Arc<EventInner>);

impl Event {
    pub fn new(event_type: Arc<EventType>, values: Vec<Value>) -> Result<Self> {
        if values.len() != event_type.len() {
            return Err(ContinuumError::ArityMismatch {
                expected: event_type.len(),
                actual: values.len(),
            });
        }
        let mut coerced = Vec::with_capacity(values.len());
        for (value, attribute) in values.into_iter().zip(event_type.attributes.iter()) {
            match value.coerce_to(&attribute.value_type) {
                Some(v) if v.value_type().is_assignable_to(&attribute.value_type) => coerced.push(v),
                _ => {
                    return Err(ContinuumError::TypeMismatch {
                        expression: attribute.name.clone(),
                        from: value.value_type().to_string(),
                        to: attribute.value_type.to_string(),
                    })
                }
            }
        }
        Ok(Self::from_parts(event_type, coerced))
    }
    // Callers guarantee arity and types.
    pub(crate) fn from_parts(event_type: Arc<EventType>, values: Vec<Value>) -> Self {
        Self(Arc::new(EventInner { event_type, values }))
    }
    pub fn event_type(&self) -> &Arc<EventType> {
        &self.0.event_type
    }
    pub fn values(&self) -> &[Value] {
        &self.0.values
    }
    pub fn value(&self, index: usize) -> &Value {
        &self.0.values[index]
    }
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.event_type.position(name).map(|i| &self.0.values[i])
    }
    pub fn get_as<T: DataType>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(T::from_value)
    }
    pub fn same_instance(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.same_instance(other)
            || (self.0.event_type.name == other.0.event_type.name && self.0.values == other.0.values)
    }
}
impl Eq for Event {}
impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.0.event_type.name, &self.0.values).cmp(&(&other.0.event_type.name, &other.0.values))
    }
}
impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.event_type.name.hash(state);
        self.0.values.hash(state);
    }
}
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fields: Vec<String> = self
            .0
            .event_type
            .attributes
            .iter()
            .zip(self.0.values.iter())
            .map(|(a, v)| format!("{}={}", a.name, v.render_literal()))
            .collect();
        write!(f, "{}{{{}}}", self.0.event_type.name, fields.join(", "))
    }
}

// ------------- EventBuilder -------------
pub struct EventBuilder {
    event_type: Arc<EventType>,
    values: Vec<Value>,
}
impl EventBuilder {
    pub fn new(event_type: Arc<EventType>) -> Self {
        let values = vec![Value::Null; event_type.len()];
        Self { event_type, values }
    }
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        let i = self
            .event_type
            .position(name)
            .ok_or_else(|| ContinuumError::UnknownAttribute { name: name.to_string() })?;
        self.values[i] = value.into();
        Ok(self)
    }
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }
    pub fn build(self) -> Result<Event> {
        Event::new(self.event_type, self.values)
    }
}

// ------------- SchemaRegistry -------------
#[derive(Debug, Default)]
struct RegistryInner {
    names: BiMap<String, TypeId>,
    types: Vec<Arc<EventType>>,
}

/// Maps declared type names to their static attribute descriptors.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    inner: RwLock<RegistryInner>,
}
impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers a type. Registering the same name twice with identical
    /// attributes returns the kept type; differing attributes are an error.
    pub fn register(&self, name: &str, attributes: Vec<Attribute>) -> Result<Arc<EventType>> {
        let mut inner = self.inner.write()?;
        if let Some(id) = inner.names.get_by_left(name) {
            let kept = Arc::clone(&inner.types[id.0 as usize]);
            if kept.attributes == attributes {
                return Ok(kept);
            }
            return Err(ContinuumError::Validation(format!(
                "event type '{}' is already registered with different attributes",
                name
            )));
        }
        let id = TypeId(inner.types.len() as u32);
        let event_type = Arc::new(EventType::new(id, name, attributes));
        inner.names.insert(name.to_string(), id);
        inner.types.push(Arc::clone(&event_type));
        Ok(event_type)
    }
    pub fn get(&self, name: &str) -> Result<Arc<EventType>> {
        let inner = self.inner.read()?;
        inner
            .names
            .get_by_left(name)
            .map(|id| Arc::clone(&inner.types[id.0 as usize]))
            .ok_or_else(|| ContinuumError::UnknownType(name.to_string()))
    }
    pub fn name_of(&self, id: TypeId) -> Option<String> {
        self.inner.read().ok()?.names.get_by_right(&id).cloned()
    }
    pub fn event(&self, name: &str) -> Result<EventBuilder> {
        Ok(EventBuilder::new(self.get(name)?))
    }
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.types.len()).unwrap_or(0)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getters_resolve_to_attributes() {
        let registry = SchemaRegistry::new();
        let t = registry
            .register("SupportBean", vec![Attribute::new("theString", ValueType::String)])
            .unwrap();
        assert_eq!(t.resolve_getter("getTheString"), Some(0));
        assert_eq!(t.resolve_getter("theString"), Some(0));
        assert_eq!(t.resolve_getter("getOther"), None);
    }

    #[test]
    fn events_are_validated_once() {
        let registry = SchemaRegistry::new();
        registry
            .register(
                "SupportBean",
                vec![Attribute::new("theString", ValueType::String), Attribute::new("longPrimitive", ValueType::Long)],
            )
            .unwrap();
        let e = registry.event("SupportBean").unwrap().with("longPrimitive", 5).unwrap().build().unwrap();
        assert_eq!(e.get("longPrimitive"), Some(&Value::Long(5)));
        let err = registry.event("SupportBean").unwrap().with("theString", 5).unwrap().build();
        assert!(matches!(err, Err(ContinuumError::TypeMismatch { .. })));
    }
}
