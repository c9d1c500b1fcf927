//! Owned, one-shot units of work.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

use courier_types::TaskId;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A callable with everything it needs moved inside.
///
/// A task is owned by whoever posted it until the queue takes it, then by the
/// queue, then by the thread that runs it. `run` consumes it, so it executes
/// at most once.
pub struct Task {
    id: TaskId,
    label: &'static str,
    job: Job,
}

/// What happened when a task ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// The task panicked; the payload rendered as text.
    Panicked(String),
}

impl Task {
    pub fn new<F>(label: &'static str, job: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: TaskId::new(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            label,
            job: Box::new(job),
        }
    }

    /// Bind `work` and its owned arguments into one task.
    ///
    /// Multiple arguments travel as a tuple. `A: Send` plus the move into the
    /// closure is what guarantees the posting thread keeps no alias.
    pub fn bind<A, W>(label: &'static str, work: W, args: A) -> Self
    where
        A: Send + 'static,
        W: FnOnce(A) + Send + 'static,
    {
        Self::new(label, move || work(args))
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Execute the task, containing any panic it raises.
    pub fn run(self) -> TaskOutcome {
        match catch_unwind(AssertUnwindSafe(self.job)) {
            Ok(()) => TaskOutcome::Completed,
            Err(payload) => TaskOutcome::Panicked(panic_payload_to_string(&payload)),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

fn panic_payload_to_string(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
