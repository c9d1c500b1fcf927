//! Request on one context, answer on another.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use courier_core::{RequestState, Responder, request, request_method};

use crate::common::{host, pump_recv, worker};

#[test]
fn doubling_runs_on_worker_and_answers_on_origin() {
    let mut origin = host("origin");
    let ctx_a = worker("ctxA");
    let origin_thread = thread::current().id();

    let (tx, rx) = mpsc::channel();
    let ticket = request(
        ctx_a.handle(),
        |responder: Responder<(i32, thread::ThreadId)>, x: i32| {
            responder
                .invoke((x * 2, thread::current().id()))
                .unwrap();
        },
        7,
    )
    .unwrap()
    .response(origin.handle(), move |(doubled, computed_on)| {
        tx.send((doubled, computed_on, thread::current().id()))
            .unwrap();
    })
    .unwrap();

    let (doubled, computed_on, delivered_on) = pump_recv(&mut origin, &rx);
    assert_eq!(doubled, 14);
    assert_eq!(computed_on, ctx_a.thread_id());
    assert_eq!(delivered_on, origin_thread);
    assert_eq!(ticket.state(), RequestState::Delivered);
}

#[test]
#[allow(clippy::approx_constant, clippy::float_cmp)]
fn two_values_arrive_together() {
    let mut origin = host("origin");
    let ctx_a = worker("ctxA");

    let (tx, rx) = mpsc::channel();
    request(
        ctx_a.handle(),
        |responder: Responder<(f64, f64)>, ()| responder.invoke((3.14, 32.64)).unwrap(),
        (),
    )
    .unwrap()
    .response(origin.handle(), move |pair| tx.send(pair).unwrap())
    .unwrap();

    assert_eq!(pump_recv(&mut origin, &rx), (3.14, 32.64));
}

#[test]
fn answer_may_target_a_third_context() {
    let ctx_a = worker("ctxA");
    let ctx_b = worker("ctxB");

    let (tx, rx) = mpsc::channel();
    request(
        ctx_a.handle(),
        |responder: Responder<String>, name: String| {
            responder.invoke(format!("hello {name}")).unwrap();
        },
        "courier".to_string(),
    )
    .unwrap()
    .response(ctx_b.handle(), move |greeting| {
        tx.send((greeting, thread::current().id())).unwrap();
    })
    .unwrap();

    let (greeting, delivered_on) = rx.recv_timeout(crate::common::WAIT).unwrap();
    assert_eq!(greeting, "hello courier");
    assert_eq!(delivered_on, ctx_b.thread_id());
}

struct Ledger {
    entries: Mutex<Vec<String>>,
}

impl Ledger {
    fn append(&self, responder: Responder<usize>, entry: String) {
        let mut entries = self.entries.lock().unwrap();
        entries.push(entry);
        responder.invoke(entries.len()).unwrap();
    }
}

#[test]
fn method_requests_share_one_object() {
    let mut origin = host("origin");
    let ctx_a = worker("ctxA");
    let ledger = Arc::new(Ledger {
        entries: Mutex::new(Vec::new()),
    });

    let (tx, rx) = mpsc::channel();
    for entry in ["a", "b", "c"] {
        let tx = tx.clone();
        request_method(
            ctx_a.handle(),
            ledger.clone(),
            Ledger::append,
            entry.to_string(),
        )
        .unwrap()
        .response(origin.handle(), move |len| tx.send(len).unwrap())
        .unwrap();
    }

    let lens: Vec<usize> = (0..3).map(|_| pump_recv(&mut origin, &rx)).collect();
    assert_eq!(lens, vec![1, 2, 3]);
    assert_eq!(*ledger.entries.lock().unwrap(), vec!["a", "b", "c"]);
}

#[test]
fn worker_on_the_same_context_as_origin() {
    let mut origin = host("origin");

    let (tx, rx) = mpsc::channel();
    request(
        origin.handle(),
        |responder: Responder<u8>, n: u8| responder.invoke(n + 1).unwrap(),
        41,
    )
    .unwrap()
    .response(origin.handle(), move |n| tx.send(n).unwrap())
    .unwrap();

    assert_eq!(pump_recv(&mut origin, &rx), 42);
}
