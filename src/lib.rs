//! snippets-rpc: a delayed-echo RPC server and a fan-out client
//!
//! The server exposes one operation, `Echo(name, delay_ms)`, which waits
//! `delay_ms` then answers `"Hello " + name`. Calls are multiplexed over a
//! single TCP connection and each is handled on its own task.
//!
//! The client opens one channel, launches N concurrent calls that share a
//! single cancellation token, and waits a fixed drain period. The first
//! call to succeed triggers the token, cancelling every sibling still in
//! flight; failures cancel nothing.

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod service;

pub use cancel::CancellationToken;
pub use error::RpcError;
pub use protocol::{Request, Response};
