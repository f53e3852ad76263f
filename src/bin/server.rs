//! snippets-server: delayed-echo RPC server
//!
//! Binds `127.0.0.1:50051` unless told otherwise and serves until killed.

use snippets_rpc::config::ServerConfig;
use snippets_rpc::logging;
use snippets_rpc::server::Server;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;
    logging::init(&config.log_level);

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        "Starting snippets server"
    );

    Server::new(config).run().await?;
    Ok(())
}
