//! The per-thread task queue.
//!
//! Many threads push, exactly one thread pops. Built on an unbounded tokio
//! channel: `push` never blocks, `blocking_recv` parks the owner while the
//! queue is empty, and `try_recv` serves host loops that must not block.
//!
//! Shutdown travels through the queue itself as a stop marker, so the owner
//! wakes up for it like for any task. The first close fixes the queue's
//! mode; under `Discard` that mode is checked before every task, so work
//! queued ahead of the marker is dropped rather than run.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use courier_types::{ContextId, DispatchError, ShutdownMode};

use crate::task::{Task, TaskOutcome};

type Waker = Arc<dyn Fn() + Send + Sync + 'static>;

enum Envelope {
    Run(Task),
    Stop(ShutdownMode),
}

/// Execution counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Tasks that ran, including ones that panicked.
    pub executed: u64,
    /// Tasks that panicked while running.
    pub panicked: u64,
    /// Tasks dropped unexecuted by a discarding shutdown.
    pub discarded: u64,
}

/// Result of a non-blocking pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStatus {
    /// The queue is empty after running `ran` tasks.
    Idle { ran: usize },
    /// The budget ran out with tasks still waiting.
    Pending { ran: usize },
    /// A stop marker was reached; no further tasks will run.
    Stopped { ran: usize, mode: ShutdownMode },
}

impl PumpStatus {
    #[must_use]
    pub fn ran(self) -> usize {
        match self {
            Self::Idle { ran } | Self::Pending { ran } | Self::Stopped { ran, .. } => ran,
        }
    }
}

const OPEN: u8 = 0;
const DRAINING: u8 = 1;
const DISCARDING: u8 = 2;

struct QueueShared {
    context: ContextId,
    /// `OPEN`, or the mode of the close that won.
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
    executed: AtomicU64,
    panicked: AtomicU64,
    discarded: AtomicU64,
}

/// Producer half. Cheap to clone, safe to use from any thread.
#[derive(Clone)]
pub struct QueueSender {
    tx: mpsc::UnboundedSender<Envelope>,
    shared: Arc<QueueShared>,
}

/// Consumer half, owned by the single thread that runs the tasks.
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<QueueShared>,
    stopped: Option<ShutdownMode>,
}

/// Create the queue for `context`.
#[must_use]
pub fn task_queue(context: ContextId) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(QueueShared {
        context,
        state: AtomicU8::new(OPEN),
        waker: Mutex::new(None),
        executed: AtomicU64::new(0),
        panicked: AtomicU64::new(0),
        discarded: AtomicU64::new(0),
    });
    (
        QueueSender {
            tx,
            shared: shared.clone(),
        },
        QueueReceiver {
            rx,
            shared,
            stopped: None,
        },
    )
}

impl QueueShared {
    fn stats(&self) -> ContextStats {
        ContextStats {
            executed: self.executed.load(Ordering::Acquire),
            panicked: self.panicked.load(Ordering::Acquire),
            discarded: self.discarded.load(Ordering::Acquire),
        }
    }

    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    fn is_discarding(&self) -> bool {
        self.state.load(Ordering::Acquire) == DISCARDING
    }

    fn wake(&self) {
        let waker = self
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(waker) = waker {
            waker();
        }
    }
}

impl QueueSender {
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.shared.context
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.shared.is_open() && !self.tx.is_closed()
    }

    /// Append `task` to the tail and wake the owner.
    pub fn push(&self, task: Task) -> Result<(), DispatchError> {
        let closed = DispatchError::QueueClosed {
            context: self.shared.context,
        };
        if !self.shared.is_open() {
            return Err(closed);
        }
        self.tx.send(Envelope::Run(task)).map_err(|_| closed)?;
        self.shared.wake();
        Ok(())
    }

    /// Stop accepting tasks and enqueue the stop marker.
    ///
    /// Returns `false` if the queue was already closing.
    pub fn close(&self, mode: ShutdownMode) -> bool {
        let closed = match mode {
            ShutdownMode::Drain => DRAINING,
            ShutdownMode::Discard => DISCARDING,
        };
        // One transition: whoever observes the close also observes its mode,
        // and a losing close leaves the winner's mode untouched.
        if self
            .shared
            .state
            .compare_exchange(OPEN, closed, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // A receiver that is already gone has nothing left to stop.
        let _ = self.tx.send(Envelope::Stop(mode));
        self.shared.wake();
        true
    }

    /// Install the hook called after every successful push.
    ///
    /// Hosts that run their own loop use this to schedule a pump.
    pub fn set_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .shared
            .waker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(waker));
    }

    #[must_use]
    pub fn stats(&self) -> ContextStats {
        self.shared.stats()
    }

    /// Whether both senders feed the same queue.
    #[must_use]
    pub fn same_queue(&self, other: &QueueSender) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl QueueReceiver {
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.shared.context
    }

    /// The mode the queue stopped with, once a stop marker has been consumed.
    #[must_use]
    pub fn stopped(&self) -> Option<ShutdownMode> {
        self.stopped
    }

    /// Run tasks in FIFO order until a stop marker arrives.
    ///
    /// Parks the calling thread whenever the queue is empty. Must not be
    /// called from inside an async runtime.
    pub fn drain_and_run(&mut self) -> ShutdownMode {
        if let Some(mode) = self.stopped {
            return mode;
        }
        loop {
            match self.rx.blocking_recv() {
                Some(Envelope::Run(task)) => {
                    self.handle(task);
                }
                Some(Envelope::Stop(mode)) => {
                    self.finish(mode);
                    return mode;
                }
                None => {
                    // Every sender is gone; nothing can arrive any more.
                    self.stopped = Some(ShutdownMode::Drain);
                    return ShutdownMode::Drain;
                }
            }
        }
    }

    /// Run at most `budget` ready tasks without blocking.
    pub fn run_pending(&mut self, budget: usize) -> PumpStatus {
        if let Some(mode) = self.stopped {
            return PumpStatus::Stopped { ran: 0, mode };
        }
        let mut ran = 0;
        while ran < budget {
            match self.rx.try_recv() {
                Ok(Envelope::Run(task)) => {
                    if self.handle(task) {
                        ran += 1;
                    }
                }
                Ok(Envelope::Stop(mode)) => {
                    self.finish(mode);
                    return PumpStatus::Stopped { ran, mode };
                }
                Err(mpsc::error::TryRecvError::Empty) => return PumpStatus::Idle { ran },
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.stopped = Some(ShutdownMode::Drain);
                    return PumpStatus::Stopped {
                        ran,
                        mode: ShutdownMode::Drain,
                    };
                }
            }
        }
        if self.rx.is_empty() {
            PumpStatus::Idle { ran }
        } else {
            PumpStatus::Pending { ran }
        }
    }

    /// Run `task`, or drop it if a discarding shutdown is under way.
    ///
    /// Returns whether the task ran.
    fn handle(&self, task: Task) -> bool {
        if self.shared.is_discarding() {
            drop(task);
            self.shared.discarded.fetch_add(1, Ordering::AcqRel);
            false
        } else {
            self.execute(task);
            true
        }
    }

    fn execute(&self, task: Task) {
        let id = task.id();
        let label = task.label();
        tracing::trace!(context = %self.shared.context, task = %id, label, "Running task");
        let outcome = task.run();
        self.shared.executed.fetch_add(1, Ordering::AcqRel);
        if let TaskOutcome::Panicked(message) = outcome {
            self.shared.panicked.fetch_add(1, Ordering::AcqRel);
            tracing::error!(
                context = %self.shared.context,
                task = %id,
                label,
                "Task panicked: {message}"
            );
        }
    }

    /// Handle everything still queued behind the stop marker.
    ///
    /// Pushes that raced the close can land behind the marker; they run under
    /// `Drain` and are dropped under `Discard` like everything else.
    fn finish(&mut self, mode: ShutdownMode) {
        self.rx.close();
        while let Ok(envelope) = self.rx.try_recv() {
            if let Envelope::Run(task) = envelope {
                self.handle(task);
            }
        }
        let discarded = self.shared.discarded.load(Ordering::Acquire);
        if discarded > 0 {
            tracing::warn!(
                context = %self.shared.context,
                discarded,
                "Discarded queued tasks on shutdown"
            );
        }
        tracing::debug!(context = %self.shared.context, mode = mode.label(), "Queue stopped");
        self.stopped = Some(mode);
    }
}
