//! Substitution parameters.
//!
//! A statement declares its `?` placeholders while its expressions compile.
//! They are either all positional (numbered 1..N in order of appearance) or
//! all named (`?:name`, where reusing a name reuses its slot). A
//! [`ParameterBindings`] holds the values bound so far; activation copies them
//! into the compiled expressions so later re-binding leaves running instances
//! alone.

use std::fmt;
use std::sync::Arc;

use crate::datatype::Value;
use crate::error::{ContinuumError, Result};

/// A placeholder as written in an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParameterRef {
    Positional,
    Named(String),
}

impl fmt::Display for ParameterRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParameterRef::Positional => write!(f, "?"),
            ParameterRef::Named(name) => write!(f, "?:{}", name),
        }
    }
}

/// How a bind call addresses its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKey<'a> {
    Index(usize),
    Name(&'a str),
}
impl From<usize> for ParameterKey<'_> {
    fn from(index: usize) -> Self {
        ParameterKey::Index(index)
    }
}
impl<'a> From<&'a str> for ParameterKey<'a> {
    fn from(name: &'a str) -> Self {
        ParameterKey::Name(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Positional,
    Named,
}
impl Style {
    fn describe(self) -> &'static str {
        match self {
            Style::Positional => "positional",
            Style::Named => "named",
        }
    }
}

// positional slots have no name
#[derive(Debug, Clone, PartialEq)]
struct Slot {
    name: Option<String>,
}

// ------------- Slots -------------
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSlots {
    style: Option<Style>,
    slots: Vec<Slot>,
}

impl ParameterSlots {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn len(&self) -> usize {
        self.slots.len()
    }
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Declares a placeholder and returns its zero-based slot.
    pub fn declare(&mut self, parameter: &ParameterRef) -> Result<usize> {
        let style = match parameter {
            ParameterRef::Positional => Style::Positional,
            ParameterRef::Named(_) => Style::Named,
        };
        match self.style {
            Some(existing) if existing != style => return Err(ContinuumError::InconsistentParameterNaming),
            _ => self.style = Some(style),
        }
        if let ParameterRef::Named(name) = parameter {
            if let Some(i) = self.slots.iter().position(|s| s.name.as_deref() == Some(name.as_str())) {
                return Ok(i);
            }
        }
        self.slots.push(Slot {
            name: match parameter {
                ParameterRef::Named(name) => Some(name.clone()),
                ParameterRef::Positional => None,
            },
        });
        Ok(self.slots.len() - 1)
    }

    fn resolve(&self, key: ParameterKey) -> Result<usize> {
        if self.slots.is_empty() {
            return Err(ContinuumError::NoParameters);
        }
        match key {
            ParameterKey::Index(index) => {
                if index < 1 {
                    return Err(ContinuumError::IndexOutOfRange { index });
                }
                if self.style == Some(Style::Named) {
                    return Err(ContinuumError::ParameterStyleMismatch {
                        expected: Style::Named.describe(),
                        supplied: "index",
                    });
                }
                if index > self.slots.len() {
                    return Err(ContinuumError::IndexExceedsDeclaredMax {
                        index,
                        max: self.slots.len(),
                    });
                }
                Ok(index - 1)
            }
            ParameterKey::Name(name) => {
                if self.style == Some(Style::Positional) {
                    return Err(ContinuumError::ParameterStyleMismatch {
                        expected: Style::Positional.describe(),
                        supplied: "name",
                    });
                }
                self.slots
                    .iter()
                    .position(|s| s.name.as_deref() == Some(name))
                    .ok_or_else(|| ContinuumError::UnknownName { name: name.to_string() })
            }
        }
    }
}

// ------------- Bindings -------------
#[derive(Debug, Clone)]
pub struct ParameterBindings {
    slots: Arc<ParameterSlots>,
    values: Vec<Option<Value>>,
}

impl ParameterBindings {
    pub fn new(slots: Arc<ParameterSlots>) -> Self {
        let values = vec![None; slots.len()];
        Self { slots, values }
    }
    pub fn slots(&self) -> &ParameterSlots {
        &self.slots
    }
    /// Binds or re-binds one slot. A failed bind leaves every slot unchanged.
    pub fn bind<'a>(&mut self, key: impl Into<ParameterKey<'a>>, value: impl Into<Value>) -> Result<()> {
        let slot = self.slots.resolve(key.into())?;
        self.values[slot] = Some(value.into());
        Ok(())
    }
    /// The bound values in slot order, or the first unset slot as an error.
    pub fn snapshot(&self) -> Result<Vec<Value>> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.clone().ok_or_else(|| ContinuumError::UnboundParameter {
                    index: i + 1,
                    name: self.slots.slots[i].name.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positional(n: usize) -> Arc<ParameterSlots> {
        let mut slots = ParameterSlots::new();
        for _ in 0..n {
            slots.declare(&ParameterRef::Positional).unwrap();
        }
        Arc::new(slots)
    }

    #[test]
    fn index_bounds() {
        let mut bindings = ParameterBindings::new(positional(1));
        assert_eq!(bindings.bind(0, 1), Err(ContinuumError::IndexOutOfRange { index: 0 }));
        assert_eq!(
            bindings.bind(2, 1).unwrap_err().to_string(),
            "Invalid substitution parameter index of 2 supplied, the maximum for this statement is 1"
        );
        bindings.bind(1, 1).unwrap();
        assert_eq!(bindings.snapshot().unwrap(), vec![Value::Int(1)]);
    }

    #[test]
    fn first_unset_slot_is_reported() {
        let mut bindings = ParameterBindings::new(positional(3));
        bindings.bind(2, "x").unwrap();
        assert_eq!(
            bindings.snapshot(),
            Err(ContinuumError::UnboundParameter { index: 1, name: None })
        );
        bindings.bind(1, "x").unwrap();
        assert!(matches!(bindings.snapshot(), Err(ContinuumError::UnboundParameter { index: 3, .. })));
    }

    #[test]
    fn names_share_slots_and_do_not_mix() {
        let mut slots = ParameterSlots::new();
        assert_eq!(slots.declare(&ParameterRef::Named("p".into())).unwrap(), 0);
        assert_eq!(slots.declare(&ParameterRef::Named("q".into())).unwrap(), 1);
        assert_eq!(slots.declare(&ParameterRef::Named("p".into())).unwrap(), 0);
        assert_eq!(slots.declare(&ParameterRef::Positional), Err(ContinuumError::InconsistentParameterNaming));
        let mut bindings = ParameterBindings::new(Arc::new(slots));
        assert!(matches!(bindings.bind(1, 5), Err(ContinuumError::ParameterStyleMismatch { .. })));
        assert_eq!(bindings.bind("r", 5), Err(ContinuumError::UnknownName { name: "r".into() }));
        assert!(bindings.bind("q", 5).is_ok());
    }

    #[test]
    fn statements_without_parameters_refuse_binding() {
        let mut bindings = ParameterBindings::new(Arc::new(ParameterSlots::new()));
        assert_eq!(bindings.bind(1, 1), Err(ContinuumError::NoParameters));
        assert_eq!(bindings.snapshot(), Ok(vec![]));
    }
}
