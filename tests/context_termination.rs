use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use continuum::calendar::TimePeriod;
use continuum::context::{ContextSpec, EndCondition, StartCondition};
use continuum::datatype::ValueType;
use continuum::engine::{Engine, StatementHandle};
use continuum::filter::Expr;
use continuum::interface::{CollectingListener, OutputBatch};
use continuum::output::{OutputPolicy, OutputSpec};
use continuum::schema::{Attribute, Event};
use continuum::statement::SelectSpec;

fn b_attributes() -> Vec<Attribute> {
    vec![Attribute::new("n", ValueType::Integer), Attribute::new("k", ValueType::Integer)]
}

fn setup() -> Engine {
    let engine = Engine::with_defaults();
    engine
        .register_type("A", vec![Attribute::new("id", ValueType::Integer)])
        .expect("type registers");
    engine
        .register_type("B", b_attributes())
        .expect("type registers");
    engine
        .declare_context(&ContextSpec::new(
            "Window2s",
            StartCondition::on("A"),
            EndCondition::After(TimePeriod::seconds(2)),
        ))
        .expect("context");
    engine
}

fn counting(engine: &Engine) -> StatementHandle {
    engine
        .create_statement(
            SelectSpec::from("B")
                .select_as(Expr::count_star(), "cnt")
                .output(OutputSpec::new(OutputPolicy::Last).only_when_terminated())
                .context("Window2s"),
        )
        .expect("statement")
}

fn grouped_snapshot(engine: &Engine) -> StatementHandle {
    engine
        .create_statement(
            SelectSpec::from("B")
                .select(Expr::attr("k"))
                .select_as(Expr::count_star(), "cnt")
                .group_by(Expr::attr("k"))
                .output(OutputSpec::new(OutputPolicy::Snapshot).only_when_terminated())
                .context("Window2s"),
        )
        .expect("statement")
}

fn a(engine: &Engine, id: i32) -> Event {
    engine.event("A").expect("type").with("id", id).expect("id").build().expect("event")
}

fn b(engine: &Engine, n: i32) -> Event {
    engine
        .event("B")
        .expect("type")
        .with("n", n)
        .expect("n")
        .with("k", n % 10)
        .expect("k")
        .build()
        .expect("event")
}

fn terminal_batches_per_partition(batches: &[OutputBatch]) -> HashMap<u64, usize> {
    let mut seen = HashMap::new();
    for batch in batches.iter().filter(|b| b.terminal) {
        *seen.entry(batch.partition.0).or_insert(0) += 1;
    }
    seen
}

#[test]
fn each_partition_reports_its_own_count() {
    let engine = setup();
    let statement = counting(&engine);
    let listener = Arc::new(CollectingListener::new());
    statement.add_listener(listener.clone());

    engine.send(b(&engine, 0)).expect("sent");
    engine.send(a(&engine, 1)).expect("sent");
    for n in 0..3 {
        engine.send(b(&engine, n)).expect("sent");
    }
    engine.advance_time(1_000);
    // a second start is ignored while the first partition lives
    engine.send(a(&engine, 2)).expect("sent");
    engine.send(b(&engine, 3)).expect("sent");
    assert!(listener.is_empty());
    engine.advance_time(2_000);
    let batches = listener.take();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].terminal);
    assert_eq!(batches[0].inserted[0].get_as::<i64>("cnt"), Some(4));

    engine.send(a(&engine, 3)).expect("sent");
    engine.send(b(&engine, 4)).expect("sent");
    engine.shutdown();
    let batches = listener.take();
    assert_eq!(batches.len(), 1, "shutdown ends the live partition");
    assert_eq!(batches[0].inserted[0].get_as::<i64>("cnt"), Some(1));
    let context = engine.context("Window2s").expect("context");
    assert_eq!(context.partitions_started(), 2);
    assert!(context.live_partitions().is_empty());
}

// Sends from several threads against a ticking clock, then shuts down and
// checks that each partition ended with exactly one terminal batch.
fn hammer(threads: usize, events_per_thread: usize, statement: fn(&Engine) -> StatementHandle) -> Vec<OutputBatch> {
    let engine = setup();
    let statement = statement(&engine);
    let listener = Arc::new(CollectingListener::new());
    statement.add_listener(listener.clone());

    let done = Arc::new(AtomicBool::new(false));
    let barrier = Arc::new(Barrier::new(threads + 1));
    let clock = {
        let engine = engine.clone();
        let done = Arc::clone(&done);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut now = 0;
            while !done.load(Ordering::SeqCst) {
                now += 250;
                engine.advance_time(now);
                thread::yield_now();
            }
        })
    };
    let senders: Vec<_> = (0..threads)
        .map(|t| {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for n in 0..events_per_thread {
                    let event = if n % 100 == 0 { a(&engine, t as i32) } else { b(&engine, n as i32) };
                    engine.send(event).expect("sent");
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().expect("sender finished");
    }
    done.store(true, Ordering::SeqCst);
    clock.join().expect("clock finished");
    engine.shutdown();

    let batches = listener.batches();
    let per_partition = terminal_batches_per_partition(&batches);
    let context = engine.context("Window2s").expect("context");
    assert_eq!(per_partition.len() as u64, context.partitions_started());
    assert!(per_partition.values().all(|n| *n == 1), "one terminal flush per partition");
    assert!(batches.iter().all(|b| b.terminal), "nothing is delivered before a partition ends");
    let counted: i64 = batches
        .iter()
        .flat_map(|b| b.inserted.iter())
        .filter_map(|r| r.get_as::<i64>("cnt"))
        .sum();
    assert!(counted <= (threads * events_per_thread) as i64);
    batches
}

#[test]
fn terminal_flushes_happen_once_under_contention() {
    let batches = hammer(4, 20_000, counting);
    assert!(batches.iter().all(|b| b.inserted.len() <= 1));
}

#[test]
#[ignore]
fn terminal_flushes_happen_once_under_heavy_contention() {
    hammer(8, 2_000_000, counting);
}

// A grouped snapshot taken at termination holds one row per group the
// partition saw, and comes once per partition.
#[test]
fn grouped_snapshots_terminate_once_under_contention() {
    let batches = hammer(4, 20_000, grouped_snapshot);
    assert!(batches.iter().any(|b| !b.inserted.is_empty()));
    for batch in &batches {
        let mut keys: Vec<i32> = batch.inserted.iter().filter_map(|r| r.get_as::<i32>("k")).collect();
        assert_eq!(keys.len(), batch.inserted.len());
        assert!(keys.iter().all(|k| (0..10).contains(k)));
        let rows = keys.len();
        keys.dedup();
        assert_eq!(keys.len(), rows, "groups come sorted and once each");
        assert!(batch.inserted.iter().all(|r| r.get_as::<i64>("cnt").is_some_and(|c| c > 0)));
    }
}

// Once destroy returns the listener is never called again, even while other
// threads keep sending.
#[test]
fn destroy_stops_delivery() {
    let engine = Engine::with_defaults();
    engine.register_type("B", b_attributes()).expect("type registers");
    let statement = engine.create_statement(SelectSpec::from("B")).expect("statement");
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        statement.add_listener(Arc::new(move |_: &OutputBatch| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
    }
    let running = Arc::new(AtomicBool::new(true));
    let senders: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            let running = Arc::clone(&running);
            thread::spawn(move || {
                let mut n = 0;
                while running.load(Ordering::SeqCst) {
                    engine.send(b(&engine, n)).expect("sent");
                    n += 1;
                }
            })
        })
        .collect();
    while calls.load(Ordering::SeqCst) < 100 {
        thread::yield_now();
    }
    statement.destroy();
    let after_destroy = calls.load(Ordering::SeqCst);
    for _ in 0..1000 {
        thread::yield_now();
    }
    running.store(false, Ordering::SeqCst);
    for sender in senders {
        sender.join().expect("sender finished");
    }
    assert!(statement.is_destroyed());
    assert_eq!(calls.load(Ordering::SeqCst), after_destroy);
    assert!(engine.statements().is_empty());
}
