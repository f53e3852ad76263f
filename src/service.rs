//! The delayed-echo operation.

use crate::error::RpcError;
use crate::protocol::{Request, Response};
use chrono::Local;
use std::time::Duration;
use tracing::info;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Wait `delay_ms` then greet `name`.
///
/// Only the calling task is suspended. A negative delay is rejected
/// without sleeping.
pub async fn echo(request: &Request) -> Result<Response, RpcError> {
    if request.delay_ms < 0 {
        return Err(RpcError::InvalidArgument(format!(
            "delay_ms must be non-negative, got {}",
            request.delay_ms
        )));
    }

    info!(
        delay_ms = request.delay_ms,
        name = %request.name,
        timestamp = %Local::now().format(DATE_FORMAT),
        "echo request"
    );

    tokio::time::sleep(Duration::from_millis(request.delay_ms as u64)).await;

    Ok(Response {
        message: format!("Hello {}", request.name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_replies_immediately() {
        let start = Instant::now();
        let response = echo(&Request::new("world", 0)).await.unwrap();
        assert_eq!(response.message, "Hello world");
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_full_delay() {
        let start = Instant::now();
        let response = echo(&Request::new("slow", 250)).await.unwrap();
        assert_eq!(response.message, "Hello slow");
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_delay_rejected_without_sleeping() {
        let start = Instant::now();
        let err = echo(&Request::new("x", -5)).await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_do_not_block_each_other() {
        let start = Instant::now();
        let slow = tokio::spawn(async { echo(&Request::new("slow", 5_000)).await });
        let fast = echo(&Request::new("fast", 10)).await.unwrap();

        assert_eq!(fast.message, "Hello fast");
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(slow.await.unwrap().unwrap().message, "Hello slow");
    }
}
