//! Thread contexts: a thread plus the queue it drains.
//!
//! Two flavours share one handle type:
//!
//! - [`ThreadContext`] owns a dedicated OS thread that parks on its queue.
//! - [`HostContext`] attaches a queue to a thread owned by someone else (an
//!   application main loop); the host pumps it explicitly.
//!
//! Everything that posts work holds a [`ContextHandle`], which refers to a
//! context by identity and never keeps its thread alive.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use thiserror::Error;

use courier_types::{ContextId, DispatchError, ShutdownMode, TaskId};

use crate::queue::{ContextStats, PumpStatus, QueueReceiver, QueueSender, task_queue};
use crate::task::Task;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<ContextHandle>> = const { RefCell::new(None) };
}

fn next_context_id() -> ContextId {
    ContextId::new(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Marks the current thread as running `handle`'s loop until dropped.
struct CurrentGuard {
    previous: Option<ContextHandle>,
}

impl CurrentGuard {
    fn enter(handle: ContextHandle) -> Self {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(handle));
        Self { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The slot may already be gone during thread-local teardown.
        let _ = CURRENT.try_with(|current| *current.borrow_mut() = previous);
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to spawn thread for context '{name}'")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Settings for one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    name: String,
    stack_size: Option<usize>,
    shutdown: ShutdownMode,
}

impl ContextConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stack_size: None,
            shutdown: ShutdownMode::Drain,
        }
    }

    /// Stack size for a dedicated thread. Ignored by host contexts.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Mode used when the context is dropped without an explicit shutdown.
    pub fn with_shutdown(mut self, mode: ShutdownMode) -> Self {
        self.shutdown = mode;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    #[must_use]
    pub fn shutdown(&self) -> ShutdownMode {
        self.shutdown
    }
}

/// Reference to a context by identity.
///
/// Cloning is cheap. Holding a handle does not keep the context running:
/// once it shuts down every post through any handle fails with
/// [`DispatchError::ContextStopped`].
#[derive(Clone)]
pub struct ContextHandle {
    name: Arc<str>,
    queue: QueueSender,
}

impl ContextHandle {
    fn new(name: &str, queue: QueueSender) -> Self {
        Self {
            name: Arc::from(name),
            queue,
        }
    }

    /// The context whose loop is running on this thread, if any.
    #[must_use]
    pub fn current() -> Option<ContextHandle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    #[must_use]
    pub fn id(&self) -> ContextId {
        self.queue.context()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.queue.is_accepting()
    }

    /// Whether the calling thread is this context's thread.
    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .is_some_and(|handle| handle == self)
        })
    }

    /// Queue `task` for this context. Never blocks.
    pub fn post(&self, task: Task) -> Result<(), DispatchError> {
        self.queue
            .push(task)
            .map_err(DispatchError::into_context_stopped)
    }

    /// Queue a closure for this context.
    pub fn post_fn<F>(&self, label: &'static str, job: F) -> Result<TaskId, DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Task::new(label, job);
        let id = task.id();
        self.post(task)?;
        Ok(id)
    }

    #[must_use]
    pub fn stats(&self) -> ContextStats {
        self.queue.stats()
    }

    fn close(&self, mode: ShutdownMode) -> bool {
        self.queue.close(mode)
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.queue.same_queue(&other.queue)
    }
}

impl Eq for ContextHandle {}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id())
            .field("name", &&*self.name)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// A dedicated thread draining its own queue.
///
/// The thread parks while the queue is empty. Dropping the context shuts it
/// down with the configured mode and joins the thread.
pub struct ThreadContext {
    handle: ContextHandle,
    thread_id: ThreadId,
    join: Option<JoinHandle<()>>,
    shutdown: ShutdownMode,
}

impl ThreadContext {
    /// Spawn the thread and enter its run loop.
    pub fn start(config: ContextConfig) -> Result<Self, StartError> {
        let id = next_context_id();
        let (sender, receiver) = task_queue(id);
        let handle = ContextHandle::new(config.name(), sender);

        let mut builder = thread::Builder::new().name(config.name().to_string());
        if let Some(bytes) = config.stack_size() {
            builder = builder.stack_size(bytes);
        }

        let loop_handle = handle.clone();
        let join = builder
            .spawn(move || run_loop(loop_handle, receiver))
            .map_err(|source| StartError::Spawn {
                name: config.name().to_string(),
                source,
            })?;

        tracing::debug!(context = %id, name = config.name(), "Thread context started");

        Ok(Self {
            handle,
            thread_id: join.thread().id(),
            join: Some(join),
            shutdown: config.shutdown(),
        })
    }

    #[must_use]
    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Stop the context and wait for its thread to exit.
    pub fn shutdown(mut self, mode: ShutdownMode) -> ContextStats {
        self.stop(mode);
        self.handle.stats()
    }

    fn stop(&mut self, mode: ShutdownMode) {
        self.handle.close(mode);
        let Some(join) = self.join.take() else {
            return;
        };
        if join.thread().id() == thread::current().id() {
            // Stopped from one of its own tasks: the loop exits once that
            // task returns, joining here would deadlock.
            tracing::warn!(context = %self.handle.id(), "Context stopped from its own thread");
            return;
        }
        if join.join().is_err() {
            tracing::warn!(context = %self.handle.id(), "Context thread panicked");
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.stop(self.shutdown);
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadContext")
            .field("handle", &self.handle)
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

fn run_loop(handle: ContextHandle, mut receiver: QueueReceiver) {
    let id = handle.id();
    let _current = CurrentGuard::enter(handle);
    let mode = receiver.drain_and_run();
    tracing::debug!(context = %id, mode = mode.label(), "Thread context exited");
}

/// A queue attached to a thread the application already owns.
///
/// The host either runs its own loop and calls [`pump`](Self::pump) when the
/// waker fires, or lets [`wait_and_pump`](Self::wait_and_pump) park the thread
/// until work arrives. Bound to the attaching thread; not `Send`.
pub struct HostContext {
    handle: ContextHandle,
    receiver: QueueReceiver,
    shutdown: ShutdownMode,
    current: Option<CurrentGuard>,
    _not_send: PhantomData<*const ()>,
}

impl HostContext {
    /// Attach a new context to the calling thread.
    ///
    /// The default waker unparks this thread; [`set_waker`](Self::set_waker)
    /// replaces it.
    pub fn attach(config: ContextConfig) -> Result<Self, DispatchError> {
        if let Some(existing) = ContextHandle::current() {
            return Err(DispatchError::AlreadyAttached {
                context: existing.id(),
            });
        }

        let id = next_context_id();
        let (sender, receiver) = task_queue(id);
        let host_thread = thread::current();
        sender.set_waker(move || host_thread.unpark());

        let handle = ContextHandle::new(config.name(), sender);
        let current = CurrentGuard::enter(handle.clone());
        tracing::debug!(context = %id, name = config.name(), "Host context attached");

        Ok(Self {
            handle,
            receiver,
            shutdown: config.shutdown(),
            current: Some(current),
            _not_send: PhantomData,
        })
    }

    #[must_use]
    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    /// Replace the wake hook, called from the pushing thread after every post.
    pub fn set_waker<F>(&self, waker: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handle.queue.set_waker(waker);
    }

    /// Run at most `budget` ready tasks without blocking.
    pub fn pump(&mut self, budget: usize) -> PumpStatus {
        self.receiver.run_pending(budget)
    }

    /// Run ready tasks until the queue is empty.
    ///
    /// Tasks that post back to this context extend the run.
    pub fn run_until_idle(&mut self) -> usize {
        self.receiver.run_pending(usize::MAX).ran()
    }

    /// Pump, parking up to `timeout` first if nothing is ready.
    ///
    /// Only the default waker unparks the thread early.
    pub fn wait_and_pump(&mut self, timeout: Duration, budget: usize) -> PumpStatus {
        let status = self.pump(budget);
        if status != (PumpStatus::Idle { ran: 0 }) {
            return status;
        }
        thread::park_timeout(timeout);
        self.pump(budget)
    }

    /// Stop accepting work and settle what is queued according to `mode`.
    pub fn shutdown(mut self, mode: ShutdownMode) -> ContextStats {
        self.stop(mode);
        self.handle.stats()
    }

    fn stop(&mut self, mode: ShutdownMode) {
        if self.handle.close(mode) {
            self.receiver.run_pending(usize::MAX);
        }
        self.current.take();
    }
}

impl Drop for HostContext {
    fn drop(&mut self) {
        self.stop(self.shutdown);
    }
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
