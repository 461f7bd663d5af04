//! Continuum – the continuous-query evaluation core of a complex event processor.
//!
//! Events of registered types are sent into an [`engine::Engine`], which keeps
//! the results of its statements incrementally up to date and hands batches of
//! inserted and removed rows to listeners.
//!
//! The core is built from a few cooperating parts:
//! * [`parameter`] – substitution parameter slots of a prepared statement and
//!   the bindings that are snapshotted into its filters on activation.
//! * [`calendar`] – time periods with calendar-variable units and the deltas
//!   they produce relative to a concrete timestamp.
//! * [`aggregation`] and [`relation`] – incremental accumulators and the named
//!   windows and tables whose columns may be accumulators.
//! * [`output`] – the output batcher that rate limits what a statement emits.
//! * [`context`] – partitions of statement state that start and end on events
//!   or time, and the termination protocol that makes that safe under
//!   concurrently sending threads.
//!
//! Query text is not parsed here. Statements are described with the builder
//! structures in [`filter`] and [`statement`], which is what a query compiler
//! front end would hand over.
//!
//! ## Quick Start
//! ```
//! use std::sync::Arc;
//! use continuum::datatype::ValueType;
//! use continuum::engine::Engine;
//! use continuum::filter::Expr;
//! use continuum::interface::CollectingListener;
//! use continuum::schema::Attribute;
//! use continuum::statement::{SelectSpec, StatementSpec};
//!
//! let engine = Engine::with_defaults();
//! engine.register_type("SupportBean", vec![
//!     Attribute::new("theString", ValueType::String),
//!     Attribute::new("intPrimitive", ValueType::Integer),
//! ]).unwrap();
//! let spec = SelectSpec::from("SupportBean").filter(Expr::attr("intPrimitive").gt(Expr::lit(10)));
//! let statement = engine.create_statement(StatementSpec::Select(spec)).unwrap();
//! let listener = Arc::new(CollectingListener::new());
//! statement.add_listener(listener.clone());
//! let event = engine.event("SupportBean").unwrap()
//!     .with("theString", "E1").unwrap()
//!     .with("intPrimitive", 20).unwrap()
//!     .build().unwrap();
//! engine.send(event).unwrap();
//! assert_eq!(listener.inserted_rows().len(), 1);
//! ```

pub mod aggregation;
pub mod calendar;
pub mod config;
pub mod context;
pub mod datatype;
pub mod engine;
pub mod error;
pub mod filter;
pub mod interface;
pub mod output;
pub mod parameter;
pub mod relation;
pub mod schema;
pub mod statement;

// we will use a fast hashing algo for hashmaps and hashsets where keys are values
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;

pub type OtherHasher = BuildHasherDefault<SeaHasher>;

pub use error::{ContinuumError, Result};
