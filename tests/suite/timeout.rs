//! A timeout built on top of the core: a watchdog holds a clone of the
//! responder and races the worker; whoever invokes first wins.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use courier_core::{DispatchError, Responder, request};

use crate::common::{WAIT, host, pump_quiet, pump_recv, worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Found(u32),
    TimedOut,
}

/// Answer `TimedOut` once `fire` is signalled, reporting the invoke result.
fn watchdog(
    responder: Responder<Lookup>,
    fire: mpsc::Receiver<()>,
) -> thread::JoinHandle<Result<(), DispatchError>> {
    thread::spawn(move || {
        fire.recv().unwrap();
        responder.invoke(Lookup::TimedOut)
    })
}

#[test]
fn watchdog_wins_when_the_worker_is_slow() {
    let mut origin = host("origin");
    let ctx_a = worker("ctxA");
    let (fire_tx, fire_rx) = mpsc::channel();
    let (watchdog_tx, watchdog_rx) = mpsc::channel();
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let (late_tx, late_rx) = mpsc::channel();

    let (tx, rx) = mpsc::channel();
    request(
        ctx_a.handle(),
        move |responder: Responder<Lookup>, key: u32| {
            watchdog_tx
                .send(watchdog(responder.clone(), fire_rx))
                .unwrap();
            gate_rx.recv().unwrap();
            late_tx.send(responder.invoke(Lookup::Found(key))).unwrap();
        },
        9,
    )
    .unwrap()
    .response(origin.handle(), move |answer| tx.send(answer).unwrap())
    .unwrap();

    let watchdog = watchdog_rx.recv_timeout(WAIT).unwrap();
    fire_tx.send(()).unwrap();
    assert_eq!(watchdog.join().unwrap(), Ok(()));
    assert_eq!(pump_recv(&mut origin, &rx), Lookup::TimedOut);

    gate_tx.send(()).unwrap();
    assert!(matches!(
        late_rx.recv_timeout(WAIT).unwrap(),
        Err(DispatchError::AlreadyInvoked { .. })
    ));
    pump_quiet(&mut origin, &rx, Duration::from_millis(50));
}

#[test]
fn worker_wins_when_it_answers_first() {
    let mut origin = host("origin");
    let ctx_a = worker("ctxA");
    let (fire_tx, fire_rx) = mpsc::channel();
    let (watchdog_tx, watchdog_rx) = mpsc::channel();

    let (tx, rx) = mpsc::channel();
    request(
        ctx_a.handle(),
        move |responder: Responder<Lookup>, key: u32| {
            watchdog_tx
                .send(watchdog(responder.clone(), fire_rx))
                .unwrap();
            responder.invoke(Lookup::Found(key * 10)).unwrap();
        },
        7,
    )
    .unwrap()
    .response(origin.handle(), move |answer| tx.send(answer).unwrap())
    .unwrap();

    assert_eq!(pump_recv(&mut origin, &rx), Lookup::Found(70));

    let watchdog = watchdog_rx.recv_timeout(WAIT).unwrap();
    fire_tx.send(()).unwrap();
    assert!(matches!(
        watchdog.join().unwrap(),
        Err(DispatchError::AlreadyInvoked { .. })
    ));
    pump_quiet(&mut origin, &rx, Duration::from_millis(50));
}
