
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContinuumError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Statement does not have substitution parameters indicated by the '?' character")]
    NoParameters,
    #[error("Substitution parameter index starts at 1")]
    IndexOutOfRange { index: usize },
    #[error("Invalid substitution parameter index of {index} supplied, the maximum for this statement is {max}")]
    IndexExceedsDeclaredMax { index: usize, max: usize },
    #[error("Unknown substitution parameter name '{name}'")]
    UnknownName { name: String },
    #[error("Substitution parameters of this statement are {expected}, cannot bind by {supplied}")]
    ParameterStyleMismatch { expected: &'static str, supplied: &'static str },
    #[error("Inconsistent use of substitution parameters, expecting all substitutions to either all provide a name or provide no name")]
    InconsistentParameterNaming,
    #[error("Invalid use of substitution parameters marked by '?' in statement, use the prepare method to prepare statements with substitution parameters")]
    ParametersRequirePrepare,
    #[error("Substitution parameter value for index {index} not set, please provide a value for this parameter")]
    UnboundParameter { index: usize, name: Option<String> },
    #[error("Failed to validate filter expression '{expression}': Implicit conversion from datatype '{from}' to '{to}' is not allowed")]
    TypeMismatch { expression: String, from: String, to: String },
    #[error("Failed to resolve property '{name}'")]
    UnknownAttribute { name: String },
    #[error("Ambiguous table column '{column}' should be prefixed by a stream name")]
    AmbiguousColumn { column: String },
    #[error("Event type '{0}' is not known")]
    UnknownType(String),
    #[error("Relation '{0}' is not known")]
    UnknownRelation(String),
    #[error("Context '{0}' is not known")]
    UnknownContext(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid time period: {0}")]
    InvalidTimePeriod(String),
    #[error("Unique index violation, relation '{relation}' already has a row for key {key}")]
    KeyViolation { relation: String, key: String },
    #[error("Expected {expected} values but received {actual}")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("Accumulator '{kind}' cannot remove a value it never received")]
    AccumulatorUnderflow { kind: &'static str },
    #[error("Evaluation error: {0}")]
    Evaluation(String),
    #[error("Statement '{0}' has been destroyed")]
    Destroyed(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, ContinuumError>;

// Helper conversions
impl From<config::ConfigError> for ContinuumError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl<T> From<std::sync::PoisonError<T>> for ContinuumError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
