use std::sync::Arc;

use continuum::calendar::TimePeriod;
use continuum::datatype::{Value, ValueType};
use continuum::engine::Engine;
use continuum::error::ContinuumError;
use continuum::filter::Expr;
use continuum::interface::CollectingListener;
use continuum::output::{OutputPolicy, OutputSpec};
use continuum::schema::{Attribute, Event};
use continuum::statement::{DataWindow, SelectSpec};

fn setup() -> Engine {
    let engine = Engine::with_defaults();
    engine
        .register_type(
            "SupportBean",
            vec![
                Attribute::new("theString", ValueType::String),
                Attribute::new("intPrimitive", ValueType::Integer),
            ],
        )
        .expect("type registers");
    engine
}

fn bean(engine: &Engine, s: &str, i: i32) -> Event {
    engine
        .event("SupportBean")
        .expect("known type")
        .with("theString", s)
        .expect("attribute")
        .with("intPrimitive", i)
        .expect("attribute")
        .build()
        .expect("valid event")
}

fn totals_per_key(output: OutputSpec) -> SelectSpec {
    SelectSpec::from("SupportBean")
        .select(Expr::attr("theString"))
        .select_as(Expr::sum(Expr::attr("intPrimitive")), "total")
        .group_by(Expr::attr("theString"))
        .output(output)
}

// With compaction the held changeset never grows beyond one row per key.
#[test]
fn compacted_last_holds_one_row_per_key() {
    let engine = setup();
    let every_minute = || OutputSpec::new(OutputPolicy::Last).every(TimePeriod::minutes(1));
    let compacted = engine.create_statement(totals_per_key(every_minute().compacted())).expect("compacted");
    let plain = engine.create_statement(totals_per_key(every_minute())).expect("uncompacted");
    let listener = Arc::new(CollectingListener::new());
    compacted.add_listener(listener.clone());

    for i in 0..1000 {
        let key = ["E1", "E2", "E3"][i % 3];
        engine.send(bean(&engine, key, 1)).expect("sent");
        assert!(compacted.pending_rows() <= 3);
    }
    assert_eq!(compacted.pending_rows(), 3);
    assert_eq!(plain.pending_rows(), 1000);
    assert!(listener.is_empty());

    engine.advance_time(60_000);
    let rows = listener.inserted_rows();
    let totals: Vec<(Value, Value)> = rows
        .iter()
        .map(|r| (r.value(0).clone(), r.value(1).clone()))
        .collect();
    assert_eq!(
        totals,
        vec![
            (Value::from("E1"), Value::Int(334)),
            (Value::from("E2"), Value::Int(333)),
            (Value::from("E3"), Value::Int(333)),
        ]
    );
    assert_eq!(compacted.pending_rows(), 0);
    assert_eq!(plain.pending_rows(), 0);
}

#[test]
fn compaction_cannot_be_ordered() {
    let engine = setup();
    let err = engine
        .create_statement(
            totals_per_key(OutputSpec::new(OutputPolicy::Last).every_events(5).compacted())
                .order_by("total", true),
        )
        .err()
        .expect("rejected");
    assert!(matches!(err, ContinuumError::Validation(_)));
    assert!(err.to_string().contains("The ENABLE_OUTPUTLIMIT_OPT hint is not supported with order-by"));
}

#[test]
fn first_forwards_immediately_once_per_batch() {
    let engine = setup();
    let statement = engine
        .create_statement(totals_per_key(OutputSpec::new(OutputPolicy::First).every_events(3)))
        .expect("statement");
    let listener = Arc::new(CollectingListener::new());
    statement.add_listener(listener.clone());

    engine.send(bean(&engine, "E1", 1)).expect("sent");
    assert_eq!(listener.len(), 1, "the first row is not held");
    engine.send(bean(&engine, "E1", 2)).expect("sent");
    assert_eq!(listener.len(), 1, "E1 was already forwarded in this batch");
    engine.send(bean(&engine, "E2", 3)).expect("sent");
    // the third event closes the batch, so E1 is forwarded again
    engine.send(bean(&engine, "E1", 4)).expect("sent");
    let rows = listener.inserted_rows();
    let totals: Vec<Value> = rows.iter().map(|r| r.value(1).clone()).collect();
    assert_eq!(totals, vec![Value::Int(1), Value::Int(3), Value::Int(7)]);
}

#[test]
fn snapshot_re_materializes_the_window() {
    let engine = setup();
    let statement = engine
        .create_statement(
            SelectSpec::from("SupportBean")
                .window(DataWindow::Length(2))
                .output(OutputSpec::new(OutputPolicy::Snapshot).every_events(3)),
        )
        .expect("statement");
    let listener = Arc::new(CollectingListener::new());
    statement.add_listener(listener.clone());
    for (s, i) in [("E1", 1), ("E2", 2), ("E3", 3)] {
        engine.send(bean(&engine, s, i)).expect("sent");
    }
    let batches = listener.batches();
    assert_eq!(batches.len(), 1);
    let names: Vec<Value> = batches[0].inserted.iter().map(|r| r.value(0).clone()).collect();
    assert_eq!(names, vec![Value::from("E2"), Value::from("E3")]);
    assert!(batches[0].removed.is_empty());
}

// Jumping engine time across many boundaries yields a single batch.
#[test]
fn time_jump_flushes_once() {
    let engine = setup();
    let statement = engine
        .create_statement(SelectSpec::from("SupportBean").output(OutputSpec::new(OutputPolicy::All).every(TimePeriod::seconds(1))))
        .expect("statement");
    let listener = Arc::new(CollectingListener::new());
    statement.add_listener(listener.clone());
    engine.send(bean(&engine, "E1", 1)).expect("sent");
    engine.send(bean(&engine, "E2", 2)).expect("sent");
    engine.advance_time(999);
    assert!(listener.is_empty());
    engine.advance_time(10_500);
    assert_eq!(listener.len(), 1);
    assert_eq!(listener.inserted_rows().len(), 2);
    engine.advance_time(10_900);
    engine.advance_time(11_000);
    assert_eq!(listener.len(), 1, "empty periods are not delivered");
}

#[test]
fn ordered_batches() {
    let engine = setup();
    let statement = engine
        .create_statement(
            SelectSpec::from("SupportBean")
                .order_by("intPrimitive", true)
                .output(OutputSpec::new(OutputPolicy::All).every_events(3)),
        )
        .expect("statement");
    let listener = Arc::new(CollectingListener::new());
    statement.add_listener(listener.clone());
    for (s, i) in [("E1", 2), ("E2", 7), ("E3", 4)] {
        engine.send(bean(&engine, s, i)).expect("sent");
    }
    let values: Vec<Value> = listener.inserted_rows().iter().map(|r| r.value(1).clone()).collect();
    assert_eq!(values, vec![Value::Int(7), Value::Int(4), Value::Int(2)]);
}

// A snapshot boundary re-posts the window even when nothing arrived since the
// previous one.
#[test]
fn snapshot_posts_at_every_boundary() {
    let engine = setup();
    let statement = engine
        .create_statement(
            SelectSpec::from("SupportBean")
                .window(DataWindow::Length(3))
                .output(OutputSpec::new(OutputPolicy::Snapshot).every(TimePeriod::seconds(1))),
        )
        .expect("statement");
    let listener = Arc::new(CollectingListener::new());
    statement.add_listener(listener.clone());
    engine.advance_time(1_000);
    assert!(listener.is_empty(), "an empty window posts nothing");

    engine.send(bean(&engine, "E1", 1)).expect("sent");
    engine.send(bean(&engine, "E2", 2)).expect("sent");
    for now in [2_000, 3_000, 4_000, 5_000] {
        engine.advance_time(now);
    }
    let batches = listener.batches();
    assert_eq!(batches.len(), 4, "one snapshot per period");
    for batch in &batches {
        let names: Vec<Value> = batch.inserted.iter().map(|r| r.value(0).clone()).collect();
        assert_eq!(names, vec![Value::from("E1"), Value::from("E2")]);
    }
}
