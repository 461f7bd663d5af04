use std::collections::HashMap;
use std::sync::Arc;

use continuum::aggregation::AggregateKind;
use continuum::datatype::{Value, ValueType};
use continuum::engine::Engine;
use continuum::filter::{Expr, Subselect};
use continuum::interface::CollectingListener;
use continuum::relation::{ColumnSpec, RelationSpec, Retention};
use continuum::schema::{Attribute, Event};
use continuum::statement::SelectSpec;

const KEYS: i32 = 1000;
const ROUNDS: i32 = 3;

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
        .register_type("Lookup", vec![Attribute::new("key", ValueType::String)])
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

fn totals_per_key() -> SelectSpec {
    SelectSpec::from("SupportBean")
        .select_as(Expr::sum(Expr::attr("intPrimitive")), "total")
        .group_by(Expr::attr("theString"))
}

// Feeds every key a few times, then asks for each key's total through a
// correlated subselect against `relation`.
fn lookup_all(engine: &Engine, relation: &str) -> HashMap<String, Value> {
    for round in 0..ROUNDS {
        for k in 0..KEYS {
            engine.send(bean(engine, &format!("K{}", k), k + round)).expect("sent");
        }
    }
    let lookup = engine
        .create_statement(
            SelectSpec::from("Lookup").alias("l").select(Expr::attr("key")).select_as(
                Expr::subselect(
                    Subselect::from(relation, Expr::attr("total"))
                        .filter(Expr::attr("theString").eq(Expr::qualified("l", "key"))),
                ),
                "total",
            ),
        )
        .expect("lookup");
    let listener = Arc::new(CollectingListener::new());
    lookup.add_listener(listener.clone());
    for k in 0..KEYS {
        let event = engine
            .event("Lookup")
            .expect("known type")
            .with("key", format!("K{}", k).as_str())
            .expect("attribute")
            .build()
            .expect("valid event");
        engine.send(event).expect("sent");
    }
    listener
        .inserted_rows()
        .into_iter()
        .map(|row| {
            let key = row.get_as::<String>("key").expect("key is a string");
            (key, row.get("total").cloned().unwrap_or(Value::Null))
        })
        .collect()
}

fn assert_exact(totals: &HashMap<String, Value>) {
    assert_eq!(totals.len(), KEYS as usize);
    for k in 0..KEYS {
        let expected = ROUNDS * k + (0..ROUNDS).sum::<i32>();
        assert_eq!(totals.get(&format!("K{}", k)), Some(&Value::Int(expected)), "key K{}", k);
    }
}

#[test]
fn unique_window_of_latest_totals() {
    let engine = setup();
    engine
        .create_relation(
            &RelationSpec::new("LatestTotals")
                .column(ColumnSpec::plain("theString", ValueType::String))
                .column(ColumnSpec::plain("total", ValueType::Integer))
                .retain(Retention::Unique("theString".into())),
        )
        .expect("window");
    engine
        .create_statement(
            SelectSpec::from("SupportBean")
                .select(Expr::attr("theString"))
                .select_as(Expr::sum(Expr::attr("intPrimitive")), "total")
                .group_by(Expr::attr("theString"))
                .insert_into("LatestTotals"),
        )
        .expect("insert into");
    let totals = lookup_all(&engine, "LatestTotals");
    assert_exact(&totals);
    let window = engine.relation("LatestTotals").expect("window");
    assert_eq!(window.read().expect("readable").len(), KEYS as usize);
}

#[test]
fn keyed_table_of_totals() {
    let engine = setup();
    engine
        .create_relation(
            &RelationSpec::new("TotalsTable")
                .column(ColumnSpec::plain("theString", ValueType::String))
                .column(ColumnSpec::aggregate("total", AggregateKind::Sum, ValueType::Integer))
                .primary_key(&["theString"]),
        )
        .expect("table");
    engine
        .create_statement(totals_per_key().into_table("TotalsTable"))
        .expect("into table");
    let totals = lookup_all(&engine, "TotalsTable");
    assert_exact(&totals);

    // unknown keys find nothing
    let table = engine.relation("TotalsTable").expect("table");
    assert!(table.read().expect("readable").get_by_key(&[Value::from("missing")]).is_none());
}
