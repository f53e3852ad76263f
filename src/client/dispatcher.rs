//! Fan-out of N concurrent calls sharing one cancellation token.
//!
//! A cycle moves `Idle → Dispatching → Draining → Terminated` exactly once.
//! The drain period is a fixed wait, not a join: whatever is still in
//! flight when it ends is aborted and reported as abandoned.

use super::call::{call, CallOutcome};
use super::Channel;
use crate::cancel::CancellationToken;
use crate::error::RpcError;
use crate::protocol::Request;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Parameters of one dispatch cycle.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Server address (host:port)
    pub addr: String,
    /// Number of concurrent calls
    pub count: usize,
    /// Request `i` is named `"<name_prefix> <i>"`
    pub name_prefix: String,
    /// Request `i` waits `delay_step * (i + 1)`
    pub delay_step: Duration,
    /// Fixed wait after launching before abandoning outstanding calls
    pub drain_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            addr: "localhost:50051".to_string(),
            count: 10,
            name_prefix: "world".to_string(),
            delay_step: Duration::from_millis(1000),
            drain_timeout: Duration::from_secs(3),
        }
    }
}

impl DispatchConfig {
    /// Deterministic request for call `index`.
    pub fn request(&self, index: usize) -> Request {
        let step = i64::try_from(self.delay_step.as_millis()).unwrap_or(i64::MAX);
        let factor = i64::try_from(index + 1).unwrap_or(i64::MAX);
        Request {
            name: format!("{} {}", self.name_prefix, index),
            delay_ms: step.saturating_mul(factor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Dispatching,
    Draining { timeout: Duration },
    Terminated,
}

/// Tally of a finished cycle.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub launched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Still in flight when the drain period ended.
    pub abandoned: usize,
    /// Calls that finished before termination, ordered by index.
    pub outcomes: Vec<CallOutcome>,
}

impl DispatchReport {
    fn record(&mut self, outcome: CallOutcome) {
        if outcome.is_success() {
            self.succeeded += 1;
        } else if outcome.is_cancelled() {
            self.cancelled += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn outcome(&self, index: usize) -> Option<&CallOutcome> {
        self.outcomes.iter().find(|o| o.index == index)
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    state: DispatchState,
    history: Vec<DispatchState>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Dispatcher {
            config,
            state: DispatchState::Idle,
            history: vec![DispatchState::Idle],
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[DispatchState] {
        &self.history
    }

    fn transition(&mut self, next: DispatchState) {
        debug!(from = ?self.state, to = ?next, "Dispatcher state");
        self.state = next;
        self.history.push(next);
    }

    /// Run the cycle. Only a failure to open the channel is an error; per-call
    /// failures land in the report.
    ///
    /// A dispatcher runs once. Calling `run` again after it has left `Idle`
    /// fails with `InvalidArgument` and leaves the state untouched.
    pub async fn run(&mut self) -> Result<DispatchReport, RpcError> {
        if self.state != DispatchState::Idle {
            return Err(RpcError::InvalidArgument(format!(
                "dispatch cycle already ran, state is {:?}",
                self.state
            )));
        }

        let channel = match Channel::connect(&self.config.addr).await {
            Ok(channel) => channel,
            Err(e) => {
                self.transition(DispatchState::Terminated);
                return Err(e);
            }
        };

        self.transition(DispatchState::Dispatching);
        let token = CancellationToken::new();
        let mut calls = JoinSet::new();

        for index in 0..self.config.count {
            let request = self.config.request(index);
            info!(call = index, delay_ms = request.delay_ms, "Dispatching");

            let channel = channel.clone();
            let token = token.clone();
            calls.spawn(async move { call(&channel, &token, index, request).await });
        }

        let timeout = self.config.drain_timeout;
        self.transition(DispatchState::Draining { timeout });
        tokio::time::sleep(timeout).await;

        let mut report = DispatchReport {
            launched: self.config.count,
            ..DispatchReport::default()
        };
        while let Some(joined) = calls.try_join_next() {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    warn!(error = %e, "Call task failed");
                    report.failed += 1;
                }
            }
        }
        report.abandoned = calls.len();
        calls.abort_all();
        channel.close();
        drop(token);
        report.outcomes.sort_by_key(|o| o.index);

        self.transition(DispatchState::Terminated);
        info!(
            launched = report.launched,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            abandoned = report.abandoned,
            "Finished"
        );

        Ok(report)
    }
}
