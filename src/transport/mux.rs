//! Session-multiplexer adapter.
//!
//! Turns one byte stream into many logical sub-streams using yamux.
//! The poll-based `yamux::Connection` must be driven from a single
//! place, so each session runs one driver task; `open()` round-trips a
//! request through it and `accept()` reads from its inbound queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;

use futures::future::poll_fn;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::PollSender;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::BoxedIo;

/// A logical sub-stream of a session, as a tokio byte stream.
pub(crate) type SubStream = Compat<yamux::Stream>;

/// Queue depth for inbound sub-streams awaiting `accept()`.
const INCOMING_QUEUE: usize = 64;

enum Command {
    Open(oneshot::Sender<Result<yamux::Stream>>),
    Close,
}

/// One multiplexed session over a physical link.
///
/// At most one session exists per transport link; either peer may open
/// sub-streams on it.
pub(crate) struct MuxSession {
    cmd_tx: mpsc::Sender<Command>,
    incoming_rx: Mutex<mpsc::Receiver<yamux::Stream>>,
    closed: Arc<AtomicBool>,
}

impl MuxSession {
    /// Construct the client side of a session.
    pub(crate) fn client(io: BoxedIo) -> Self {
        Self::start(io, yamux::Mode::Client)
    }

    /// Construct the server side of a session.
    pub(crate) fn server(io: BoxedIo) -> Self {
        Self::start(io, yamux::Mode::Server)
    }

    fn start(io: BoxedIo, mode: yamux::Mode) -> Self {
        let connection = yamux::Connection::new(io.compat(), yamux::Config::default(), mode);

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let closed = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&closed);
        tokio::spawn(async move {
            drive(connection, cmd_rx, incoming_tx).await;
            flag.store(true, Ordering::Release);
        });

        Self {
            cmd_tx,
            incoming_rx: Mutex::new(incoming_rx),
            closed,
        }
    }

    /// Whether the session's driver has terminated.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open a new outbound sub-stream.
    pub(crate) async fn open(&self) -> Result<SubStream> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open(tx))
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        let stream = rx.await.map_err(|_| Error::ConnectionClosed)??;
        Ok(stream.compat())
    }

    /// Accept the next inbound sub-stream.
    pub(crate) async fn accept(&self) -> Result<SubStream> {
        let stream = self
            .incoming_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)?;
        Ok(stream.compat())
    }

    /// Close the session; outstanding sub-streams fail.
    pub(crate) async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

/// Drive the yamux connection: fulfil open requests, forward inbound
/// sub-streams, and keep the connection's internal I/O progressing.
async fn drive<S>(
    mut connection: yamux::Connection<S>,
    mut cmd_rx: mpsc::Receiver<Command>,
    incoming_tx: mpsc::Sender<yamux::Stream>,
) where
    S: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
    let mut incoming_tx = PollSender::new(incoming_tx);
    let mut pending_open: Option<oneshot::Sender<Result<yamux::Stream>>> = None;
    let mut parked_inbound: Option<yamux::Stream> = None;
    let mut closing = false;

    poll_fn::<(), _>(|cx| {
        loop {
            if closing {
                return match connection.poll_close(cx) {
                    Poll::Ready(_) => Poll::Ready(()),
                    Poll::Pending => Poll::Pending,
                };
            }

            // Hand a parked inbound sub-stream to the acceptor before
            // pulling more off the wire.
            if let Some(stream) = parked_inbound.take() {
                match incoming_tx.poll_reserve(cx) {
                    Poll::Ready(Ok(())) => {
                        if incoming_tx.send_item(stream).is_err() {
                            closing = true;
                        }
                        continue;
                    }
                    Poll::Ready(Err(_)) => {
                        closing = true;
                        continue;
                    }
                    Poll::Pending => {
                        parked_inbound = Some(stream);
                    }
                }
            }

            if let Some(reply) = pending_open.take() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(Ok(stream)) => {
                        let _ = reply.send(Ok(stream));
                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        let _ = reply.send(Err(e.into()));
                        closing = true;
                        continue;
                    }
                    Poll::Pending => {
                        pending_open = Some(reply);
                    }
                }
            } else {
                match cmd_rx.poll_recv(cx) {
                    Poll::Ready(Some(Command::Open(reply))) => {
                        pending_open = Some(reply);
                        continue;
                    }
                    Poll::Ready(Some(Command::Close)) | Poll::Ready(None) => {
                        closing = true;
                        continue;
                    }
                    Poll::Pending => {}
                }
            }

            if parked_inbound.is_some() {
                // Acceptor is saturated; let its queue drain first.
                return Poll::Pending;
            }

            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    parked_inbound = Some(stream);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!("session ended: {e}");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            MuxSession::client(Box::new(a)),
            MuxSession::server(Box::new(b)),
        )
    }

    #[tokio::test]
    async fn test_open_accept_round_trip() {
        let (client, server) = session_pair();

        let server_task = tokio::spawn(async move {
            let mut sub = server.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sub.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            sub.write_all(b"world").await.unwrap();
            sub.flush().await.unwrap();
            server
        });

        let mut sub = client.open().await.unwrap();
        sub.write_all(b"hello").await.unwrap();
        sub.flush().await.unwrap();
        let mut buf = [0u8; 5];
        sub.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_many_concurrent_substreams() {
        let (client, server) = session_pair();
        let server = Arc::new(server);

        let echo = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                loop {
                    let Ok(mut sub) = server.accept().await else {
                        break;
                    };
                    tokio::spawn(async move {
                        let mut buf = Vec::new();
                        if sub.read_to_end(&mut buf).await.is_ok() {
                            let _ = sub.write_all(&buf).await;
                            let _ = sub.shutdown().await;
                        }
                    });
                }
            })
        };

        let mut tasks = Vec::new();
        let client = Arc::new(client);
        for i in 0..10u8 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                let mut sub = client.open().await.unwrap();
                sub.write_all(&[i; 32]).await.unwrap();
                sub.shutdown().await.unwrap();
                let mut buf = Vec::new();
                sub.read_to_end(&mut buf).await.unwrap();
                assert_eq!(buf, vec![i; 32]);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        client.close().await;
        echo.abort();
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (client, _server) = session_pair();
        client.close().await;
        // The driver drains the close command and winds down; an open
        // afterwards must fail rather than hang.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(client.open().await.is_err());
    }

    #[tokio::test]
    async fn test_accept_fails_when_peer_drops() {
        let (client, server) = session_pair();
        drop(client);
        // Client handle dropped: its command channel closes, the driver
        // closes the link, and the server sees the session end.
        let r = server.accept().await;
        assert!(r.is_err());
    }
}
