//! The dispatcher: bind work and arguments into a task and post it.
//!
//! Every entry point takes its arguments by value (`A: Send + 'static`,
//! several arguments as a tuple), so once a call returns the posting thread
//! holds no alias to anything the worker will touch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use courier_types::{DispatchError, RequestId, TaskId};

use crate::binding::{Binding, PendingResponse, Responder};
use crate::context::ContextHandle;
use crate::task::Task;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Fire-and-forget: run `work(args)` on `target`. No answer comes back.
pub fn post<A, W>(target: &ContextHandle, work: W, args: A) -> Result<TaskId, DispatchError>
where
    A: Send + 'static,
    W: FnOnce(A) + Send + 'static,
{
    let task = Task::bind("post", work, args);
    let id = task.id();
    target
        .post(task)
        .map_err(DispatchError::into_target_unavailable)?;
    tracing::trace!(task = %id, target = %target.id(), "Posted");
    Ok(id)
}

/// Fire-and-forget call of a method on an object shared with `target`.
pub fn post_method<T, A>(
    target: &ContextHandle,
    receiver: Arc<T>,
    method: fn(&T, A),
    args: A,
) -> Result<TaskId, DispatchError>
where
    T: Send + Sync + 'static,
    A: Send + 'static,
{
    post(target, move |args| method(&receiver, args), args)
}

/// Run `work(responder, args)` on `target` and hand back the requester side.
///
/// The worker answers through the [`Responder`]; the answer is observed by
/// calling [`PendingResponse::response`] with the context that should run the
/// callback. Fails with `TargetUnavailable` if `target` is not accepting
/// work, in which case nothing was posted.
pub fn request<A, R, W>(
    target: &ContextHandle,
    work: W,
    args: A,
) -> Result<PendingResponse<R>, DispatchError>
where
    A: Send + 'static,
    R: Send + 'static,
    W: FnOnce(Responder<R>, A) + Send + 'static,
{
    let request = RequestId::new(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed));
    let binding = Binding::new(request);
    let responder = Responder::new(binding.clone());

    let task = Task::new("request", move || {
        responder.mark_executing();
        work(responder, args);
    });
    let task_id = task.id();
    target
        .post(task)
        .map_err(DispatchError::into_target_unavailable)?;

    tracing::debug!(
        request = %request,
        task = %task_id,
        target = %target.id(),
        origin = ?ContextHandle::current().map(|origin| origin.id()),
        "Request posted"
    );
    Ok(PendingResponse::new(binding, request, task_id, target.id()))
}

/// [`request`] for a member-style worker routine: `method(&receiver, responder, args)`.
pub fn request_method<T, A, R>(
    target: &ContextHandle,
    receiver: Arc<T>,
    method: fn(&T, Responder<R>, A),
    args: A,
) -> Result<PendingResponse<R>, DispatchError>
where
    T: Send + Sync + 'static,
    A: Send + 'static,
    R: Send + 'static,
{
    request(
        target,
        move |responder, args| method(&receiver, responder, args),
        args,
    )
}
