//! FIFO per producer, exactly-once delivery under load.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use courier_core::{ContextHandle, Responder, ShutdownMode, post, request};

use crate::common::{WAIT, worker};

#[test]
fn each_producer_sees_its_own_posts_in_order() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 500;

    let consumer = worker("consumer");
    let seen = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let target = consumer.handle().clone();
            let seen = seen.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let seen = seen.clone();
                    post(
                        &target,
                        move |entry: (usize, usize)| seen.lock().unwrap().push(entry),
                        (producer, seq),
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let stats = consumer.shutdown(ShutdownMode::Drain);
    assert_eq!(stats.executed, (PRODUCERS * PER_PRODUCER) as u64);

    let seen = seen.lock().unwrap();
    for producer in 0..PRODUCERS {
        let order: Vec<usize> = seen
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(order, (0..PER_PRODUCER).collect::<Vec<_>>());
    }
}

#[test]
fn tasks_only_observe_completed_pushes() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 200;

    let consumer = worker("consumer");
    let violations = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let target = consumer.handle().clone();
            let violations = violations.clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    // Written before the push, read relaxed by the task: only
                    // the push itself orders the two.
                    let staged = Arc::new(AtomicUsize::new(usize::MAX));
                    let pushed = Arc::new(AtomicBool::new(false));
                    staged.store(producer * PER_PRODUCER + seq, Ordering::Relaxed);

                    let task_staged = staged.clone();
                    let task_pushed = pushed.clone();
                    let violations = violations.clone();
                    post(
                        &target,
                        move |expected: usize| {
                            if task_staged.load(Ordering::Relaxed) != expected {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            // The producer's post must return while this runs.
                            let deadline = Instant::now() + WAIT;
                            while !task_pushed.load(Ordering::Acquire) {
                                if Instant::now() >= deadline {
                                    violations.fetch_add(1, Ordering::SeqCst);
                                    return;
                                }
                                thread::yield_now();
                            }
                        },
                        producer * PER_PRODUCER + seq,
                    )
                    .unwrap();
                    pushed.store(true, Ordering::Release);
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let stats = consumer.shutdown(ShutdownMode::Drain);
    assert_eq!(stats.executed, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.panicked, 0);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

#[test]
fn stress_every_request_answered_once_on_its_origin() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250;

    let target = worker("target");
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|i| worker(&format!("producer-{i}")))
        .collect();
    let (done_tx, done_rx) = mpsc::channel();

    for (index, producer) in producers.iter().enumerate() {
        let target = target.handle().clone();
        let done = done_tx.clone();
        producer
            .handle()
            .post_fn("produce", move || {
                let origin = ContextHandle::current().unwrap();
                let received = Arc::new(Mutex::new(Vec::with_capacity(PER_PRODUCER)));
                for seq in 0..PER_PRODUCER {
                    let received = received.clone();
                    let origin_check = origin.clone();
                    let done = done.clone();
                    request(
                        &target,
                        |responder: Responder<(usize, usize)>, (index, seq): (usize, usize)| {
                            responder.invoke((index, seq)).unwrap();
                        },
                        (index, seq),
                    )
                    .unwrap()
                    .response(&origin, move |answer| {
                        assert!(origin_check.is_current());
                        let mut received = received.lock().unwrap();
                        received.push(answer);
                        if received.len() == PER_PRODUCER {
                            done.send((index, received.clone())).unwrap();
                        }
                    })
                    .unwrap();
                }
            })
            .unwrap();
    }
    drop(done_tx);

    for _ in 0..PRODUCERS {
        let (index, received) = done_rx.recv_timeout(WAIT).unwrap();
        let expected: Vec<(usize, usize)> = (0..PER_PRODUCER).map(|seq| (index, seq)).collect();
        assert_eq!(received, expected, "producer {index}");
    }

    for producer in producers {
        let stats = producer.shutdown(ShutdownMode::Drain);
        assert_eq!(stats.panicked, 0);
        // One produce task plus one continuation per request.
        assert_eq!(stats.executed, 1 + PER_PRODUCER as u64);
    }
    let stats = target.shutdown(ShutdownMode::Drain);
    assert_eq!(stats.executed, (PRODUCERS * PER_PRODUCER) as u64);
}

#[test]
fn posts_and_requests_share_one_fifo() {
    let target = worker("target");
    let answers = worker("answers");
    let log = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    for i in 0..10 {
        let log = log.clone();
        if i % 2 == 0 {
            post(target.handle(), move |i: i32| log.lock().unwrap().push(i), i).unwrap();
        } else {
            let tx = tx.clone();
            request(
                target.handle(),
                move |responder: Responder<()>, i: i32| {
                    log.lock().unwrap().push(i);
                    responder.invoke(()).unwrap();
                },
                i,
            )
            .unwrap()
            .response(answers.handle(), move |()| tx.send(()).unwrap())
            .unwrap();
        }
    }

    for _ in 0..5 {
        rx.recv_timeout(WAIT).unwrap();
    }
    target.shutdown(ShutdownMode::Drain);
    assert_eq!(*log.lock().unwrap(), (0..10).collect::<Vec<_>>());
}
