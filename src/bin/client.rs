//! snippets-client: fan out concurrent delayed-echo calls
//!
//! Usage: `snippets-client [NAME]`. Sends NAME-prefixed requests with
//! increasing delays, then exits after the drain period.

use snippets_rpc::client::Dispatcher;
use snippets_rpc::config::ClientConfig;
use snippets_rpc::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::load()?;
    logging::init(&config.log_level);

    info!(
        addr = %config.dispatch.addr,
        count = config.dispatch.count,
        name = %config.dispatch.name_prefix,
        drain_ms = config.dispatch.drain_timeout.as_millis() as u64,
        "Starting dispatch cycle"
    );

    let mut dispatcher = Dispatcher::new(config.dispatch);
    match dispatcher.run().await {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(error = %e, "Did not connect");
            Err(e.into())
        }
    }
}
