//! Delayed-echo client.
//!
//! - `Channel`: one long-lived connection shared by concurrent calls
//! - `call`: issue one request, cancelling siblings on success
//! - `Dispatcher`: fan out N calls and drain for a fixed period

mod call;
mod channel;
mod dispatcher;

pub use call::{call, CallOutcome};
pub use channel::Channel;
pub use dispatcher::{DispatchConfig, DispatchReport, DispatchState, Dispatcher};
