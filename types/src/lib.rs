//! Core domain types for Courier.
//!
//! This crate contains pure domain types with no IO, no threads, and minimal
//! dependencies. The dispatch core, the configuration loader and the binary
//! all speak in these terms.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod error;
mod ids;
mod lifecycle;

pub use error::DispatchError;
pub use ids::{ContextId, RequestId, TaskId};
pub use lifecycle::{RequestState, ShutdownMode};
