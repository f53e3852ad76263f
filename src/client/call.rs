//! Single-call wrapper used by the dispatcher.

use super::Channel;
use crate::cancel::CancellationToken;
use crate::error::RpcError;
use crate::protocol::{Request, Response};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What happened to one call of a dispatch cycle.
#[derive(Debug)]
pub struct CallOutcome {
    pub index: usize,
    pub delay_ms: i64,
    pub result: Result<Response, RpcError>,
    /// Time from issuing the call to its resolution.
    pub elapsed: Duration,
    /// This call was the one that triggered the shared token.
    pub triggered_cancel: bool,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.result, Err(RpcError::Cancelled))
    }
}

/// Issue `request` and log the result.
///
/// A success triggers `token`, which cancels every sibling call still
/// waiting in the same cycle. A failure leaves the token alone.
pub async fn call(
    channel: &Channel,
    token: &CancellationToken,
    index: usize,
    request: Request,
) -> CallOutcome {
    let delay_ms = request.delay_ms;
    let started = Instant::now();
    let result = channel.echo(&request, token).await;
    let elapsed = started.elapsed();

    let triggered_cancel = match &result {
        Ok(response) => {
            info!(call = index, delay_ms, message = %response.message, "Greeting");
            let triggered = token.cancel();
            if triggered {
                debug!(call = index, "Cancelling sibling calls");
            }
            triggered
        }
        Err(e) => {
            warn!(call = index, delay_ms, error = %e, "Could not greet");
            false
        }
    };

    CallOutcome {
        index,
        delay_ms,
        result,
        elapsed,
        triggered_cancel,
    }
}
