// A small walk through the engine: a keyed totals table fed by an
// into-table statement, a correlated lookup, and a context whose partitions
// report their final count when they end.
//
//   continuum [config.toml]
//
// Batches are printed as JSON lines.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use continuum::aggregation::AggregateKind;
use continuum::calendar::TimePeriod;
use continuum::config::EngineConfig;
use continuum::context::{ContextSpec, EndCondition, StartCondition};
use continuum::datatype::ValueType;
use continuum::engine::Engine;
use continuum::filter::{Expr, Subselect};
use continuum::interface::OutputBatch;
use continuum::output::{OutputPolicy, OutputSpec};
use continuum::relation::{ColumnSpec, RelationSpec};
use continuum::schema::Attribute;
use continuum::statement::SelectSpec;

fn print_batch(batch: &OutputBatch) {
    let rows = |rows: &[continuum::schema::Event]| rows.iter().map(|r| r.to_string()).collect::<Vec<_>>();
    println!(
        "{}",
        json!({
            "statement": batch.statement_name,
            "partition": batch.partition.0,
            "terminal": batch.terminal,
            "inserted": rows(&batch.inserted),
            "removed": rows(&batch.removed),
        })
    );
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load(path.as_deref())?;
    let engine = Engine::new(config);

    engine.register_type(
        "SupportBean",
        vec![
            Attribute::new("theString", ValueType::String),
            Attribute::new("intPrimitive", ValueType::Integer),
        ],
    )?;
    engine.register_type("Lookup", vec![Attribute::new("key", ValueType::String)])?;
    engine.register_type("Marker", vec![Attribute::new("id", ValueType::Integer)])?;

    engine.create_relation(
        &RelationSpec::new("TotalsTable")
            .column(ColumnSpec::plain("theString", ValueType::String))
            .column(ColumnSpec::aggregate("total", AggregateKind::Sum, ValueType::Integer))
            .primary_key(&["theString"]),
    )?;
    engine.create_statement(
        SelectSpec::from("SupportBean")
            .select_as(Expr::sum(Expr::attr("intPrimitive")), "total")
            .group_by(Expr::attr("theString"))
            .into_table("TotalsTable"),
    )?;
    let lookup = engine.create_statement(
        SelectSpec::from("Lookup").alias("l").select(Expr::attr("key")).select_as(
            Expr::subselect(
                Subselect::from("TotalsTable", Expr::attr("total"))
                    .filter(Expr::attr("theString").eq(Expr::qualified("l", "key"))),
            ),
            "total",
        ),
    )?;
    lookup.add_listener(Arc::new(print_batch));

    engine.declare_context(&ContextSpec::new(
        "TwoSeconds",
        StartCondition::on("Marker"),
        EndCondition::After(TimePeriod::seconds(2)),
    ))?;
    let counts = engine.create_statement(
        SelectSpec::from("SupportBean")
            .named("countPerPartition")
            .select_as(Expr::count_star(), "cnt")
            .output(OutputSpec::new(OutputPolicy::Last).only_when_terminated())
            .context("TwoSeconds"),
    )?;
    counts.add_listener(Arc::new(print_batch));

    let start = engine.current_time();
    engine.send(engine.event("Marker")?.with("id", 1)?.build()?)?;
    for (i, key) in ["E1", "E2", "E1", "E3", "E1"].iter().enumerate() {
        let event = engine
            .event("SupportBean")?
            .with("theString", *key)?
            .with("intPrimitive", (i as i32 + 1) * 10)?
            .build()?;
        engine.send(event)?;
    }
    for key in ["E1", "E2", "E3", "E4"] {
        engine.send(engine.event("Lookup")?.with("key", key)?.build()?)?;
    }
    engine.advance_time(start + 2000);
    info!(statements = engine.statements().len(), "demo finished");
    engine.shutdown();
    Ok(())
}
