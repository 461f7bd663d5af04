use std::sync::Arc;

use continuum::calendar::{parse_iso, CalendarDelta, TimePeriod};
use continuum::config::EngineConfig;
use continuum::datatype::ValueType;
use continuum::engine::Engine;
use continuum::error::ContinuumError;
use continuum::filter::Expr;
use continuum::interface::CollectingListener;
use continuum::output::{OutputPolicy, OutputSpec};
use continuum::schema::Attribute;
use continuum::statement::SelectSpec;

const DAY: i64 = 24 * 60 * 60 * 1000;

fn at(text: &str) -> i64 {
    parse_iso(text).expect("iso timestamp")
}

#[test]
fn one_month_from_mid_february_is_four_weeks() {
    let month = CalendarDelta::new(TimePeriod::months(1)).expect("valid period");
    assert_eq!(month.delta_add(at("2002-02-15T09:00:00.000")).expect("delta"), 28 * DAY);
    assert_eq!(month.delta_subtract(at("2002-03-15T09:00:00.000")).expect("delta"), 28 * DAY);
}

// Timestamps too far apart to subtract are an error, not a panic.
#[test]
fn far_apart_timestamps_report_overflow() {
    let second = CalendarDelta::new(TimePeriod::seconds(1)).expect("valid period");
    let err = second.delta_add_with_reference(i64::MAX, i64::MIN).expect_err("span overflows");
    assert!(matches!(err, ContinuumError::Evaluation(_)));
    assert!(err.to_string().contains("overflows"), "{}", err);
    assert!(second.delta_add_with_reference(i64::MIN, i64::MAX).is_err());

    let month = CalendarDelta::new(TimePeriod::months(1)).expect("valid period");
    assert!(month.delta_add_with_reference(i64::MIN, i64::MAX).is_err());
    assert!(month.delta_add_with_reference(i64::MAX, i64::MIN).is_err());

    // close to the edge but representable still works
    let near = second.delta_add_with_reference(i64::MAX - 10, i64::MAX - 2_510).expect("fits");
    assert_eq!(near.delta, 500);
    assert_eq!(near.last_reference, i64::MAX - 510);
}

// Whatever anchor of the same recurrence is handed in, the answer is the one
// the immediately preceding anchor gives.
#[test]
fn re_anchoring_converges() {
    let month = CalendarDelta::new(TimePeriod::months(1)).expect("valid period");
    let anchor = at("2002-02-15T09:00:00.000");
    let currents = [
        "2002-02-15T09:00:00.000",
        "2002-02-28T23:59:59.999",
        "2002-03-15T08:59:59.999",
        "2002-03-15T09:00:00.000",
        "2002-07-01T00:00:00.000",
    ];
    for current in currents {
        let current = at(current);
        let expected = month.delta_add_with_reference(current, anchor).expect("near anchor");
        for steps in [-1200, -37, -1, 1, 12, 600, 10_000] {
            let far = TimePeriod::months(1).add_to(anchor, steps).expect("anchor in range");
            let got = month.delta_add_with_reference(current, far).expect("far anchor");
            assert_eq!(got, expected, "anchor moved by {} months", steps);
        }
        assert!(expected.last_reference <= current);
        assert_eq!(current + expected.delta, TimePeriod::months(1).add_to(expected.last_reference, 1).expect("next"));
    }
}

#[test]
fn years_include_leap_days() {
    let year = CalendarDelta::new(TimePeriod::years(1)).expect("valid period");
    assert_eq!(year.delta_add(at("2003-06-01T00:00:00.000")).expect("delta"), 366 * DAY);
    assert_eq!(year.delta_add(at("2001-06-01T00:00:00.000")).expect("delta"), 365 * DAY);
}

#[test]
fn periods_parse_from_text() {
    let period = TimePeriod::parse("1 month").expect("parses");
    assert!(period.is_calendar());
    assert!(!TimePeriod::parse("2 seconds").expect("parses").is_calendar());
    assert!(CalendarDelta::new(TimePeriod::seconds(0)).is_err());
}

// A monthly output boundary lands on the same day of every month.
#[test]
fn monthly_output_follows_the_calendar() {
    let config = EngineConfig {
        start_time_ms: at("2002-02-15T09:00:00.000"),
        ..EngineConfig::default()
    };
    let engine = Engine::new(config);
    engine
        .register_type("Tick", vec![Attribute::new("n", ValueType::Integer)])
        .expect("type registers");
    let statement = engine
        .create_statement(
            SelectSpec::from("Tick")
                .select_as(Expr::count_star(), "cnt")
                .output(OutputSpec::new(OutputPolicy::Last).every(TimePeriod::months(1))),
        )
        .expect("statement");
    let listener = Arc::new(CollectingListener::new());
    statement.add_listener(listener.clone());
    let tick = |n: i32| engine.event("Tick").expect("type").with("n", n).expect("n").build().expect("event");

    engine.send(tick(1)).expect("sent");
    engine.advance_time(at("2002-03-15T08:59:59.999"));
    assert!(listener.is_empty(), "28 days have not passed yet");
    engine.advance_time(at("2002-03-15T09:00:00.000"));
    assert_eq!(listener.len(), 1);

    engine.send(tick(2)).expect("sent");
    engine.advance_time(at("2002-04-14T09:00:00.000"));
    assert_eq!(listener.len(), 1, "March has 31 days");
    engine.advance_time(at("2002-04-15T09:00:00.000"));
    assert_eq!(listener.len(), 2);
    let rows = listener.inserted_rows();
    assert_eq!(rows[1].get_as::<i64>("cnt"), Some(2));
}
