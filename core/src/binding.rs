//! Response bindings: the one-shot path from a worker back to its requester.
//!
//! A request creates one shared [`Binding`]. The worker side holds it through
//! [`Responder`] (clonable, first `invoke` wins), the requester side through
//! [`PendingResponse`] and then [`ResponseTicket`]. Answer and callback may
//! arrive in either order:
//!
//! - callback first: the slot is armed, `invoke` posts the continuation.
//! - answer first: the values are parked, `response` posts the continuation.
//!
//! Either way the continuation is an ordinary task on the receiving context,
//! so the callback runs on that context's thread, in its queue order.
//!
//! No user code (callbacks, value destructors) ever runs while the slot lock
//! is held.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use courier_types::{ContextId, DispatchError, RequestId, RequestState, TaskId};

use crate::context::ContextHandle;
use crate::task::Task;

type Callback<R> = Box<dyn FnOnce(R) + Send + 'static>;

enum Slot<R> {
    /// No answer, no listener.
    Waiting,
    /// A callback is registered for delivery on `receiver`.
    Armed {
        receiver: ContextHandle,
        callback: Callback<R>,
    },
    /// The worker answered before anyone listened.
    Parked(R),
    /// The requester will never listen; an answer is dropped on arrival.
    Abandoned,
    /// Values handed to a continuation, or the binding was released.
    Settled,
}

struct Inner<R> {
    slot: Slot<R>,
    state: RequestState,
}

pub(crate) struct Binding<R: Send + 'static> {
    request: RequestId,
    invoked: AtomicBool,
    inner: Mutex<Inner<R>>,
}

impl<R: Send + 'static> Binding<R> {
    pub(crate) fn new(request: RequestId) -> Arc<Self> {
        Arc::new(Self {
            request,
            invoked: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                slot: Slot::Waiting,
                state: RequestState::Posted,
            }),
        })
    }

    // Tasks never run under this lock, so a poisoned guard holds consistent data.
    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> RequestState {
        self.lock().state
    }

    fn set_state(&self, state: RequestState) {
        self.lock().state = state;
    }

    fn mark_executing(&self) {
        let mut inner = self.lock();
        if inner.state == RequestState::Posted {
            inner.state = RequestState::Executing;
        }
    }

    fn invoke(self: &Arc<Self>, values: R) -> Result<(), DispatchError> {
        if self.invoked.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::AlreadyInvoked {
                request: self.request,
            });
        }

        let (receiver, callback) = {
            let mut inner = self.lock();
            match mem::replace(&mut inner.slot, Slot::Settled) {
                Slot::Waiting => {
                    inner.slot = Slot::Parked(values);
                    inner.state = RequestState::Invoked;
                    return Ok(());
                }
                Slot::Armed { receiver, callback } => {
                    inner.state = RequestState::ContinuationPosted;
                    (receiver, callback)
                }
                Slot::Abandoned => {
                    inner.state = RequestState::Dropped;
                    tracing::trace!(request = %self.request, "Answer to abandoned request dropped");
                    return Ok(());
                }
                other @ (Slot::Parked(_) | Slot::Settled) => {
                    inner.slot = other;
                    return Err(DispatchError::AlreadyInvoked {
                        request: self.request,
                    });
                }
            }
        };

        self.deliver(&receiver, callback, values)
    }

    fn register(
        self: &Arc<Self>,
        receiver: &ContextHandle,
        callback: Callback<R>,
    ) -> Result<(), DispatchError> {
        if !receiver.is_accepting() {
            self.abandon();
            return Err(DispatchError::ContextStopped {
                context: receiver.id(),
            });
        }

        let values = {
            let mut inner = self.lock();
            match mem::replace(&mut inner.slot, Slot::Settled) {
                Slot::Waiting => {
                    inner.slot = Slot::Armed {
                        receiver: receiver.clone(),
                        callback,
                    };
                    return Ok(());
                }
                Slot::Parked(values) => {
                    inner.state = RequestState::ContinuationPosted;
                    values
                }
                other => {
                    inner.slot = other;
                    return Err(DispatchError::NoPendingBinding {
                        request: self.request,
                    });
                }
            }
        };

        self.deliver(receiver, callback, values)
    }

    /// Post the continuation. On failure the continuation is dropped inside
    /// the post, which settles the request as `Dropped`.
    fn deliver(
        self: &Arc<Self>,
        receiver: &ContextHandle,
        callback: Callback<R>,
        values: R,
    ) -> Result<(), DispatchError> {
        let continuation = Continuation {
            binding: Arc::clone(self),
            payload: Some((callback, values)),
        };
        match receiver.post(Task::new("response", move || continuation.run())) {
            Ok(()) => {
                tracing::trace!(request = %self.request, context = %receiver.id(), "Response posted");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    request = %self.request,
                    context = %receiver.id(),
                    "Response could not be delivered: {err}"
                );
                Err(err)
            }
        }
    }

    /// The requester gave up listening.
    fn abandon(&self) {
        let parked = {
            let mut inner = self.lock();
            match mem::replace(&mut inner.slot, Slot::Settled) {
                Slot::Waiting => {
                    inner.slot = Slot::Abandoned;
                    None
                }
                Slot::Parked(values) => {
                    inner.state = RequestState::Dropped;
                    Some(values)
                }
                other => {
                    inner.slot = other;
                    None
                }
            }
        };
        drop(parked);
    }

    /// Every responder is gone.
    fn release(&self) {
        if self.invoked.load(Ordering::Acquire) {
            return;
        }
        let callback = {
            let mut inner = self.lock();
            inner.state = RequestState::Dropped;
            match mem::replace(&mut inner.slot, Slot::Settled) {
                Slot::Armed { callback, .. } => Some(callback),
                _ => None,
            }
        };
        drop(callback);
        tracing::trace!(request = %self.request, "Request dropped without a response");
    }
}

/// The task body that runs a callback on the receiving thread.
struct Continuation<R: Send + 'static> {
    binding: Arc<Binding<R>>,
    payload: Option<(Callback<R>, R)>,
}

impl<R: Send + 'static> Continuation<R> {
    fn run(mut self) {
        if let Some((callback, values)) = self.payload.take() {
            self.binding.set_state(RequestState::Delivered);
            callback(values);
        }
    }
}

impl<R: Send + 'static> Drop for Continuation<R> {
    fn drop(&mut self) {
        // Never ran: rejected by the post or discarded by a shutdown.
        if self.payload.is_some() {
            self.binding.set_state(RequestState::Dropped);
        }
    }
}

struct ResponderGuard<R: Send + 'static> {
    binding: Arc<Binding<R>>,
}

impl<R: Send + 'static> Drop for ResponderGuard<R> {
    fn drop(&mut self) {
        self.binding.release();
    }
}

/// Worker-side end of a response binding.
///
/// Handed to the worker routine as its first argument. It may be invoked
/// synchronously, moved into deferred work, or cloned so several parties can
/// race to answer: the first `invoke` wins and every later one returns
/// [`DispatchError::AlreadyInvoked`]. When the last clone drops without an
/// invoke, the request settles as [`RequestState::Dropped`] and no callback
/// ever runs.
pub struct Responder<R: Send + 'static> {
    guard: Arc<ResponderGuard<R>>,
}

impl<R: Send + 'static> Responder<R> {
    pub(crate) fn new(binding: Arc<Binding<R>>) -> Self {
        Self {
            guard: Arc::new(ResponderGuard { binding }),
        }
    }

    #[must_use]
    pub fn request(&self) -> RequestId {
        self.guard.binding.request
    }

    #[must_use]
    pub fn is_invoked(&self) -> bool {
        self.guard.binding.invoked.load(Ordering::Acquire)
    }

    /// Send `values` back to the requester's receiving context.
    ///
    /// Fails with `AlreadyInvoked` on every call after the first, and with
    /// `ContextStopped` when the receiving context no longer accepts work (the
    /// values are dropped in that case). Succeeds without effect when the
    /// requester has stopped listening.
    pub fn invoke(&self, values: R) -> Result<(), DispatchError> {
        self.guard.binding.invoke(values)
    }

    pub(crate) fn mark_executing(&self) {
        self.guard.binding.mark_executing();
    }
}

impl<R: Send + 'static> Clone for Responder<R> {
    fn clone(&self) -> Self {
        Self {
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<R: Send + 'static> fmt::Debug for Responder<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("request", &self.request())
            .field("invoked", &self.is_invoked())
            .finish()
    }
}

/// Requester-side handle returned by [`request`](crate::request).
///
/// [`response`](Self::response) is the only way to observe the answer.
/// Dropping it without registering means the answer is discarded.
pub struct PendingResponse<R: Send + 'static> {
    binding: Option<Arc<Binding<R>>>,
    request: RequestId,
    task: TaskId,
    target: ContextId,
}

impl<R: Send + 'static> PendingResponse<R> {
    pub(crate) fn new(
        binding: Arc<Binding<R>>,
        request: RequestId,
        task: TaskId,
        target: ContextId,
    ) -> Self {
        Self {
            binding: Some(binding),
            request,
            task,
            target,
        }
    }

    #[must_use]
    pub fn request(&self) -> RequestId {
        self.request
    }

    /// The task carrying the worker routine.
    #[must_use]
    pub fn task(&self) -> TaskId {
        self.task
    }

    #[must_use]
    pub fn target(&self) -> ContextId {
        self.target
    }

    #[must_use]
    pub fn state(&self) -> RequestState {
        self.binding
            .as_ref()
            .map_or(RequestState::Dropped, |binding| binding.state())
    }

    /// Register `callback` to run on `receiving` with the worker's answer.
    ///
    /// If the worker already answered, the continuation is posted right away.
    /// Fails with `NoPendingBinding` if the worker finished without answering,
    /// and with `ContextStopped` if `receiving` no longer accepts work.
    pub fn response<F>(
        mut self,
        receiving: &ContextHandle,
        callback: F,
    ) -> Result<ResponseTicket<R>, DispatchError>
    where
        F: FnOnce(R) + Send + 'static,
    {
        let Some(binding) = self.binding.take() else {
            return Err(DispatchError::NoPendingBinding {
                request: self.request,
            });
        };
        binding.register(receiving, Box::new(callback))?;
        Ok(ResponseTicket { binding })
    }
}

impl<R: Send + 'static> Drop for PendingResponse<R> {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.abandon();
        }
    }
}

impl<R: Send + 'static> fmt::Debug for PendingResponse<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingResponse")
            .field("request", &self.request)
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Observes a request after its callback is registered.
pub struct ResponseTicket<R: Send + 'static> {
    binding: Arc<Binding<R>>,
}

impl<R: Send + 'static> ResponseTicket<R> {
    #[must_use]
    pub fn request(&self) -> RequestId {
        self.binding.request
    }

    #[must_use]
    pub fn state(&self) -> RequestState {
        self.binding.state()
    }

    /// Delivered or dropped; nothing further will happen.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.state().is_terminal()
    }
}

impl<R: Send + 'static> fmt::Debug for ResponseTicket<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseTicket")
            .field("request", &self.request())
            .field("state", &self.state())
            .finish()
    }
}
