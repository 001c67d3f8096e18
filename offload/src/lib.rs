//! offload - completion-tracked asynchronous calls over the urpc
//! transport.
//!
//! A [`Context`] turns remote function calls into request identifiers:
//! application code submits with [`Context::call_async`], keeps working,
//! and later collects the result with [`Context::peek_result`] or
//! [`Context::wait_result`]. There is no background thread; the transport
//! makes progress cooperatively inside those calls, one direction feeding
//! the other:
//!
//! ```text
//! call_async ──► pending ──submit──► in-flight ──reply──► completions
//!                  ▲                    │                     │
//!                  └── host-side cmds ──┘     peek / wait ◄───┘
//! ```
//!
//! Per context, replies arrive in submission order, and a host-side call
//! ([`Context::call_host_async`]) only runs once every earlier remote
//! call has been replied to, so it observes their effects.

mod args;
mod command;
mod context;

pub use args::{ArgsView, CallArgs};
pub use context::Context;

/// Status of a submitted request, as surfaced by `peek_result` and
/// `wait_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// The call finished and its return value is valid.
    Ok,
    /// The callee raised; the return value carries the exception code.
    Exception,
    /// The call never reached the callee or the context broke down.
    Error,
    /// No reply yet.
    Unfinished,
}

/// Request id returned when a submission is rejected.
pub const REQUEST_ID_INVALID: u64 = u64::MAX;
