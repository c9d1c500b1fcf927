//! Courier CLI - drives the dispatch core through a few end-to-end scenarios.
//!
//! The main thread attaches a [`HostContext`] and acts as the requester; work
//! runs on dedicated [`ThreadContext`]s.
//!
//! ```text
//! main (HostContext) --request--> worker (ThreadContext)
//!        ^                              |
//!        +------- response task --------+
//! ```
//!
//! Logs go to stderr and are filtered through `RUST_LOG` (default `warn`).

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result, bail, ensure};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use courier_config::CourierConfig;
use courier_core::{
    ContextHandle, HostContext, PumpStatus, Responder, ShutdownMode, ThreadContext, post,
    request,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Post work across threads and route the answers back")]
struct Cli {
    /// Config file to use instead of ~/.courier/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Double a number on a worker thread and print it on the main thread
    Roundtrip {
        #[arg(default_value_t = 7)]
        value: i64,
    },
    /// Answer with two values at once
    Pair,
    /// Several producer contexts each issue many requests to one worker
    Stress {
        #[arg(default_value_t = 4)]
        producers: usize,
        #[arg(default_value_t = 1000)]
        requests: usize,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap_or_else(|_| EnvFilter::new("error"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<CourierConfig> {
    let loaded = match path {
        Some(path) => Some(
            CourierConfig::load_from(path)
                .with_context(|| format!("loading {}", path.display()))?
                .with_context(|| format!("config file {} does not exist", path.display()))?,
        ),
        None => CourierConfig::load()?,
    };
    if loaded.is_none() {
        tracing::debug!("No config file found, using defaults");
    }
    Ok(loaded.unwrap_or_default())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Roundtrip { value: 7 }) {
        Command::Roundtrip { value } => roundtrip(&config, value),
        Command::Pair => pair(&config),
        Command::Stress {
            producers,
            requests,
        } => stress(&config, producers, requests),
    }
}

/// Pump `host` until `replies` yields a value.
///
/// A disconnected channel means the callback was dropped without running.
fn await_reply<T>(
    host: &mut HostContext,
    budget: usize,
    replies: &mpsc::Receiver<T>,
) -> Result<T> {
    let deadline = Instant::now() + REPLY_TIMEOUT;
    loop {
        match replies.try_recv() {
            Ok(value) => return Ok(value),
            Err(TryRecvError::Disconnected) => bail!("response dropped before delivery"),
            Err(TryRecvError::Empty) => {}
        }
        ensure!(Instant::now() < deadline, "timed out waiting for a response");
        if let PumpStatus::Stopped { mode, .. } = host.wait_and_pump(POLL_INTERVAL, budget) {
            bail!("host context stopped ({})", mode.label());
        }
    }
}

fn roundtrip(config: &CourierConfig, value: i64) -> Result<()> {
    let mut host = HostContext::attach(config.context("main"))?;
    let worker = ThreadContext::start(config.context("worker"))?;
    let main_thread = thread::current().id();

    let (reply_tx, reply_rx) = mpsc::channel::<(i64, ThreadId, ThreadId)>();
    request(
        worker.handle(),
        |responder: Responder<(i64, ThreadId)>, x: i64| {
            let computed_on = thread::current().id();
            if let Err(err) = responder.invoke((x * 2, computed_on)) {
                tracing::warn!("Doubling result not delivered: {err}");
            }
        },
        value,
    )?
    .response(host.handle(), move |(doubled, computed_on)| {
        send_or_warn(
            &reply_tx,
            (doubled, computed_on, thread::current().id()),
            "doubling result",
        );
    })?;

    let (doubled, computed_on, delivered_on) =
        await_reply(&mut host, config.host_drain_budget(), &reply_rx)?;
    ensure!(
        computed_on == worker.thread_id(),
        "work ran off the worker thread"
    );
    ensure!(delivered_on == main_thread, "callback ran off the main thread");
    println!("{value} -> {doubled}");

    worker.shutdown(ShutdownMode::Drain);
    Ok(())
}

#[allow(clippy::approx_constant)]
fn pair(config: &CourierConfig) -> Result<()> {
    let mut host = HostContext::attach(config.context("main"))?;
    let worker = ThreadContext::start(config.context("worker"))?;

    let (reply_tx, reply_rx) = mpsc::channel();
    request(
        worker.handle(),
        |responder: Responder<(f64, f64)>, ()| {
            if let Err(err) = responder.invoke((3.14, 32.64)) {
                tracing::warn!("Pair not delivered: {err}");
            }
        },
        (),
    )?
    .response(host.handle(), move |(a, b): (f64, f64)| {
        send_or_warn(&reply_tx, (a, b), "pair");
    })?;

    let (a, b) = await_reply(&mut host, config.host_drain_budget(), &reply_rx)?;
    println!("({a}, {b})");

    worker.shutdown(ShutdownMode::Drain);
    Ok(())
}

#[derive(Debug)]
struct ProducerReport {
    producer: usize,
    received: usize,
    in_order: bool,
    checksum: u64,
}

#[derive(Default)]
struct Tally {
    received: usize,
    next_expected: usize,
    in_order: bool,
    checksum: u64,
}

impl Tally {
    fn record(&mut self, seq: usize, square: u64) {
        self.in_order &= seq == self.next_expected;
        self.next_expected = seq + 1;
        self.received += 1;
        self.checksum = self.checksum.wrapping_add(square);
    }
}

/// Sum of `n * n` for `n` in `0..count`, wrapping on overflow.
fn checksum_of_squares(count: usize) -> u64 {
    (0..count as u64).fold(0u64, |acc, n| acc.wrapping_add(n.wrapping_mul(n)))
}

/// Hand a value to the waiting main thread; returns whether anyone received it.
fn send_or_warn<T>(tx: &mpsc::Sender<T>, value: T, what: &str) -> bool {
    match tx.send(value) {
        Ok(()) => true,
        Err(_) => {
            tracing::warn!("Main thread stopped waiting; {what} dropped");
            false
        }
    }
}

fn stress(config: &CourierConfig, producers: usize, per_producer: usize) -> Result<()> {
    ensure!(producers > 0, "need at least one producer");
    ensure!(per_producer > 0, "need at least one request per producer");

    let mut host = HostContext::attach(config.context("main"))?;
    let worker = ThreadContext::start(config.context("worker"))?;
    let started = Instant::now();

    let (report_tx, report_rx) = mpsc::channel();
    let mut contexts = Vec::with_capacity(producers);
    for producer in 0..producers {
        let context = ThreadContext::start(config.context(&format!("producer-{producer}")))?;
        let worker_handle = worker.handle().clone();
        let host_handle = host.handle().clone();
        let reports = report_tx.clone();
        context.handle().post_fn("produce", move || {
            produce(producer, per_producer, &worker_handle, host_handle, reports);
        })?;
        contexts.push(context);
    }
    drop(report_tx);

    let expected_checksum = checksum_of_squares(per_producer);
    let mut total = 0;
    for _ in 0..producers {
        let report = await_reply(&mut host, config.host_drain_budget(), &report_rx)?;
        tracing::debug!(?report, "Producer finished");
        ensure!(
            report.in_order,
            "producer {} saw responses out of order",
            report.producer
        );
        ensure!(
            report.checksum == expected_checksum,
            "producer {} got wrong answers",
            report.producer
        );
        total += report.received;
    }

    for context in contexts {
        context.shutdown(ShutdownMode::Drain);
    }
    let stats = worker.shutdown(ShutdownMode::Drain);
    println!(
        "{total} responses from {producers} producers in {:.1?} (worker ran {} tasks)",
        started.elapsed(),
        stats.executed
    );
    Ok(())
}

/// Runs on a producer context: issue `count` requests, collect the answers
/// here, then report to the host.
fn produce(
    producer: usize,
    count: usize,
    worker: &ContextHandle,
    host: ContextHandle,
    reports: mpsc::Sender<ProducerReport>,
) {
    let Some(origin) = ContextHandle::current() else {
        tracing::error!(producer, "Producer is not running on a context");
        return;
    };
    let tally = Arc::new(Mutex::new(Tally {
        in_order: true,
        ..Tally::default()
    }));

    for seq in 0..count {
        let pending = match request(
            worker,
            |responder: Responder<(usize, u64)>, seq: usize| {
                let n = seq as u64;
                if let Err(err) = responder.invoke((seq, n.wrapping_mul(n))) {
                    tracing::warn!("Square not delivered: {err}");
                }
            },
            seq,
        ) {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!(producer, "Worker unavailable: {err}");
                return;
            }
        };

        let tally = tally.clone();
        let host = host.clone();
        let reports = reports.clone();
        let registered = pending.response(&origin, move |(seq, square)| {
            let mut tally = tally.lock().unwrap_or_else(PoisonError::into_inner);
            tally.record(seq, square);
            if tally.received < count {
                return;
            }
            let report = ProducerReport {
                producer,
                received: tally.received,
                in_order: tally.in_order,
                checksum: tally.checksum,
            };
            let sent = post(
                &host,
                move |(reports, report): (mpsc::Sender<ProducerReport>, ProducerReport)| {
                    send_or_warn(&reports, report, "producer report");
                },
                (reports, report),
            );
            if let Err(err) = sent {
                tracing::warn!(producer, "Report not delivered: {err}");
            }
        });
        if let Err(err) = registered {
            tracing::error!(producer, "Could not register response: {err}");
            return;
        }
    }
}
