//! TCP server for the delayed-echo protocol.
//!
//! Each connection is read by one task. Every `ECHO` frame is handled on
//! its own spawned task, so a long delay never holds up other calls on the
//! same connection. Replies are funnelled through a single writer task.

use crate::config::ServerConfig;
use crate::protocol::{self, Frame, FrameReader, StatusCode, CONNECTION_ID};
use crate::service;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Requests in flight on one connection, by call id.
type InFlight = Arc<Mutex<HashMap<u64, AbortHandle>>>;

/// Server instance
pub struct Server {
    config: ServerConfig,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            connection_limit,
        }
    }

    /// Bind the configured address without accepting yet.
    pub async fn bind(self) -> io::Result<BoundServer> {
        let addr = tokio::net::lookup_host(&self.config.listen)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("could not resolve {}", self.config.listen),
                )
            })?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        Ok(BoundServer {
            listener,
            local_addr,
            connection_limit: self.connection_limit,
        })
    }

    /// Bind and serve until the listener fails.
    pub async fn run(self) -> io::Result<()> {
        self.bind().await?.serve().await
    }
}

/// A server whose listener is bound and ready to accept.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    connection_limit: Arc<Semaphore>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections
    pub async fn serve(self) -> io::Result<()> {
        loop {
            // Wait for a connection slot
            let permit = self
                .connection_limit
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream).await {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Handle a single client connection
async fn handle_connection(stream: TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(protocol::write_frames(writer, rx));

    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let result = read_frames(reader, &tx, &in_flight).await;

    // The peer is gone; nobody is left to receive the replies.
    for (_, handle) in lock(&in_flight).drain() {
        handle.abort();
    }
    drop(tx);

    match writer_task.await {
        Ok(Err(e)) => debug!(error = %e, "Writer stopped"),
        Err(e) => warn!(error = %e, "Writer task failed"),
        Ok(Ok(())) => {}
    }

    result
}

async fn read_frames(
    reader: OwnedReadHalf,
    tx: &mpsc::UnboundedSender<Frame>,
    in_flight: &InFlight,
) -> io::Result<()> {
    let mut frames = FrameReader::new(reader);

    while let Some(next) = frames.next().await? {
        match next {
            Ok(frame) => {
                trace!(?frame, "Processing frame");
                dispatch(frame, tx, in_flight);
            }
            Err(e) => {
                warn!(error = %e, "Parse error");
                let _ = tx.send(Frame::Error {
                    id: CONNECTION_ID,
                    code: StatusCode::InvalidArgument,
                    detail: e.to_string(),
                });
            }
        }
    }

    trace!("Connection closed by client");
    Ok(())
}

fn dispatch(frame: Frame, tx: &mpsc::UnboundedSender<Frame>, in_flight: &InFlight) {
    match frame {
        Frame::Echo { id, request } => {
            let tx = tx.clone();
            let registry = Arc::clone(in_flight);

            // Hold the lock across spawn so the task cannot deregister before it is registered.
            let mut requests = lock(in_flight);
            let handle = tokio::spawn(async move {
                let result = service::echo(&request).await;
                lock(&registry).remove(&id);

                let reply = match result {
                    Ok(response) => Frame::Ok { id, response },
                    Err(e) => {
                        debug!(id, delay_ms = request.delay_ms, error = %e, "Echo failed");
                        Frame::Error {
                            id,
                            code: e.status_code(),
                            detail: e.detail(),
                        }
                    }
                };
                let _ = tx.send(reply);
            });

            if let Some(previous) = requests.insert(id, handle.abort_handle()) {
                warn!(id, "Duplicate call id, abandoning the earlier call");
                previous.abort();
            }
        }

        Frame::Cancel { id } => {
            if let Some(handle) = lock(in_flight).remove(&id) {
                handle.abort();
                debug!(id, "Call cancelled by client");
            }
        }

        reply @ (Frame::Ok { .. } | Frame::Error { .. }) => {
            let _ = tx.send(Frame::Error {
                id: reply.id(),
                code: StatusCode::InvalidArgument,
                detail: "unexpected reply frame".to_string(),
            });
        }
    }
}

fn lock(in_flight: &InFlight) -> std::sync::MutexGuard<'_, HashMap<u64, AbortHandle>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn start() -> SocketAddr {
        let config = ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let bound = Server::new(config).bind().await.unwrap();
        let addr = bound.local_addr();
        tokio::spawn(bound.serve());
        addr
    }

    async fn read_line<R: tokio::io::AsyncRead + Unpin>(reader: &mut BufReader<R>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let addr = start().await;
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_raw_echo_exchange() {
        let addr = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(b"ECHO 1 0 world\r\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "OK 1 Hello world\r\n");

        writer.write_all(b"ECHO 2 -5 x\r\n").await.unwrap();
        let line = read_line(&mut reader).await;
        assert!(line.starts_with("ERROR 2 INVALID_ARGUMENT"), "{}", line);
    }

    #[tokio::test]
    async fn test_slow_call_does_not_block_fast_call() {
        let addr = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer
            .write_all(b"ECHO 1 2000 slow\r\nECHO 2 0 fast\r\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut reader).await, "OK 2 Hello fast\r\n");
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_connection() {
        let addr = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(b"HELLO\r\nECHO 3 0 again\r\n").await.unwrap();
        let line = read_line(&mut reader).await;
        assert!(line.starts_with("ERROR 0 INVALID_ARGUMENT"), "{}", line);
        assert_eq!(read_line(&mut reader).await, "OK 3 Hello again\r\n");
    }

    #[tokio::test]
    async fn test_cancel_suppresses_reply() {
        let addr = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer
            .write_all(b"ECHO 1 300 gone\r\nCANCEL 1\r\nECHO 2 500 kept\r\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut reader).await, "OK 2 Hello kept\r\n");
    }

    #[tokio::test]
    async fn test_oversized_line_reported_once() {
        let addr = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut line = b"ECHO 1 0 ".to_vec();
        line.extend(std::iter::repeat(b'a').take(4 * 1024 * 1024));
        line.extend_from_slice(b"\r\nECHO 2 0 after\r\n");
        writer.write_all(&line).await.unwrap();

        assert_eq!(
            read_line(&mut reader).await,
            "ERROR 0 INVALID_ARGUMENT line too long\r\n"
        );
        assert_eq!(read_line(&mut reader).await, "OK 2 Hello after\r\n");
    }
}
