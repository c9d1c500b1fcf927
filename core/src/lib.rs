//! Cross-thread request/response dispatch.
//!
//! # Architecture
//!
//! ```text
//! request(target, work, args) ──Task──▶ target queue ──▶ target thread runs work(responder, args)
//!                                                                  │
//!                                            responder.invoke(values)
//!                                                                  │
//! callback(values) ◀── receiving thread ◀── receiving queue ◀──Task─┘
//! ```
//!
//! - [`Task`]: an owned closure with its arguments moved in.
//! - [`task_queue`]: the MPSC FIFO a single thread drains.
//! - [`ThreadContext`]: a dedicated OS thread parked on its queue.
//! - [`HostContext`]: a queue attached to a thread someone else owns (a GUI
//!   main loop, a test thread) which pumps it explicitly.
//! - [`Responder`]: the one-shot binding that carries an answer home.
//! - [`request`] / [`post`]: the dispatcher.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // DispatchError variants are documented at the type

mod binding;
mod context;
mod dispatch;
mod queue;
mod task;

pub use binding::{PendingResponse, Responder, ResponseTicket};
pub use context::{ContextConfig, ContextHandle, HostContext, StartError, ThreadContext};
pub use dispatch::{post, post_method, request, request_method};
pub use queue::{ContextStats, PumpStatus, QueueReceiver, QueueSender, task_queue};
pub use task::{Task, TaskOutcome};

pub use courier_types::{ContextId, DispatchError, RequestId, RequestState, ShutdownMode, TaskId};
