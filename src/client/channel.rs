//! One multiplexed connection to the server.
//!
//! A `Channel` owns a reader task that routes replies to waiting callers by
//! call id, and a writer task that serialises outgoing frames. Clones share
//! the same connection.

use crate::cancel::CancellationToken;
use crate::error::RpcError;
use crate::protocol::{
    self, Frame, FrameReader, Request, Response, CONNECTION_ID, MAX_LINE_LENGTH,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

type Reply = Result<Response, RpcError>;

#[derive(Default)]
struct Pending {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    closed: AtomicBool,
}

impl Pending {
    fn waiters(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, id: u64, reply: Reply) {
        match self.waiters().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => trace!(id, "Reply for a call nobody is waiting on"),
        }
    }

    /// Mark closed, then fail everyone still waiting.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, waiter) in self.waiters().drain() {
            let _ = waiter.send(Err(RpcError::channel_closed()));
        }
    }
}

struct Inner {
    outgoing: mpsc::UnboundedSender<Frame>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.pending.close();
    }
}

/// Client end of the delayed-echo connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Open the connection. Fails with `RpcError::Connection`.
    pub async fn connect(addr: &str) -> Result<Channel, RpcError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(RpcError::Connection)?;
        stream.set_nodelay(true).map_err(RpcError::Connection)?;
        let peer = stream.peer_addr().map_err(RpcError::Connection)?;
        debug!(peer = %peer, "Connected");

        let (reader, writer) = stream.into_split();
        let (outgoing, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Pending::default());

        let writer = tokio::spawn({
            let pending = Arc::clone(&pending);
            async move {
                if let Err(e) = protocol::write_frames(writer, rx).await {
                    debug!(error = %e, "Writer stopped");
                }
                pending.close();
            }
        });
        let reader = tokio::spawn(read_replies(reader, Arc::clone(&pending)));

        Ok(Channel {
            inner: Arc::new(Inner {
                outgoing,
                pending,
                next_id: AtomicU64::new(CONNECTION_ID + 1),
                reader: reader.abort_handle(),
                writer: writer.abort_handle(),
            }),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pending.closed.load(Ordering::SeqCst)
    }

    /// Close the connection for every clone. Outstanding calls fail.
    pub fn close(&self) {
        self.inner.reader.abort();
        self.inner.writer.abort();
        self.inner.pending.close();
    }

    /// Issue one echo call and wait for its reply or for `token` to fire.
    ///
    /// When the token wins, the server is told to drop the call.
    pub async fn echo(
        &self,
        request: &Request,
        token: &CancellationToken,
    ) -> Result<Response, RpcError> {
        if token.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        if request.name.contains(['\r', '\n']) {
            return Err(RpcError::InvalidArgument(
                "name must not contain line breaks".to_string(),
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::Echo {
            id,
            request: request.clone(),
        };
        // The reply repeats the name, so it has to fit on a line as well.
        let reply_len = format!("OK {} Hello ", id).len() + request.name.len();
        if frame.line_len().max(reply_len) > MAX_LINE_LENGTH {
            return Err(RpcError::InvalidArgument(format!(
                "name of {} bytes does not fit in a {} byte line",
                request.name.len(),
                MAX_LINE_LENGTH
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.inner.pending.waiters().insert(id, tx);
        let guard = CallGuard {
            channel: &self.inner,
            id,
        };

        if self.is_closed() {
            return Err(RpcError::channel_closed());
        }
        if self.inner.outgoing.send(frame).is_err() {
            return Err(RpcError::channel_closed());
        }

        let result = tokio::select! {
            reply = rx => reply.unwrap_or_else(|_| Err(RpcError::channel_closed())),
            _ = token.cancelled() => Err(RpcError::Cancelled),
        };
        drop(guard);
        result
    }
}

/// Tells the server to drop a call that is abandoned while still pending,
/// whether through cancellation or because the calling task was aborted.
struct CallGuard<'a> {
    channel: &'a Inner,
    id: u64,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let abandoned = self.channel.pending.waiters().remove(&self.id).is_some();
        if abandoned && !self.channel.pending.closed.load(Ordering::SeqCst) {
            let _ = self.channel.outgoing.send(Frame::Cancel { id: self.id });
        }
    }
}

async fn read_replies(reader: OwnedReadHalf, pending: Arc<Pending>) {
    let mut frames = FrameReader::new(reader);

    loop {
        match frames.next().await {
            Ok(Some(Ok(frame))) => match frame {
                Frame::Ok { id, response } => pending.complete(id, Ok(response)),
                Frame::Error {
                    id: CONNECTION_ID,
                    code,
                    detail,
                } => warn!(%code, detail = %detail, "Server reported a connection error"),
                Frame::Error { id, code, detail } => {
                    pending.complete(id, Err(RpcError::from_status(code, detail)))
                }
                other => warn!(id = other.id(), frame = ?other, "Unexpected frame from server"),
            },
            Ok(Some(Err(e))) => warn!(error = %e, "Unparseable reply"),
            Ok(None) => {
                debug!("Connection closed by server");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Read failed");
                break;
            }
        }
    }

    pending.close();
}
