use snippets_rpc::config::ServerConfig;
use snippets_rpc::server::Server;
use std::net::SocketAddr;

/// Start a server on an ephemeral port and return its address.
pub async fn start_server() -> SocketAddr {
    let config = ServerConfig {
        listen: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    };
    let bound = Server::new(config).bind().await.unwrap();
    let addr = bound.local_addr();
    tokio::spawn(bound.serve());
    addr
}
