//! Call connection over a multiplexed sub-stream.
//!
//! One reader task per call decodes inbound frames into a bounded
//! queue; the write half sits behind a lock so any task holding the
//! call may send. The first fatal condition (carrier error, remote
//! ERROR frame, local close) is latched and returned from every
//! subsequent operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::codec::{framed, PayloadCodec};
use crate::error::{Error, Result};
use crate::message::WireMessage;
use crate::method::Method;
use crate::transport::mux::SubStream;
use crate::transport::Call;

/// Inbound frame queue depth per call.
const INBOUND_QUEUE: usize = 16;

/// Call connection bound to one sub-stream of a session.
pub(crate) struct StreamCall {
    writer: Mutex<WriteHalf<SubStream>>,
    inbound: Mutex<mpsc::Receiver<WireMessage>>,
    sticky: Arc<StdMutex<Option<Error>>>,
    /// Receive direction latched at end of stream.
    eof: AtomicBool,
    closed: AtomicBool,
    codec: PayloadCodec,
    reader: JoinHandle<()>,
}

impl StreamCall {
    /// Wrap a sub-stream and start its reader task.
    pub(crate) fn spawn(sub: SubStream, codec: PayloadCodec) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(sub);
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let sticky = Arc::new(StdMutex::new(None));

        let reader = tokio::spawn(read_loop(read_half, codec, tx, Arc::clone(&sticky)));

        Arc::new(Self {
            writer: Mutex::new(write_half),
            inbound: Mutex::new(rx),
            sticky,
            eof: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            codec,
            reader,
        })
    }

    fn sticky_err(&self) -> Option<Error> {
        self.sticky.lock().unwrap().clone()
    }

    fn latch(&self, err: Error) -> Error {
        let mut slot = self.sticky.lock().unwrap();
        slot.get_or_insert(err).clone()
    }

    /// Send any control frame (INVOKE, ACK, CLOSE, ERROR).
    pub(crate) async fn send_control(&self, msg: WireMessage) -> Result<()> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = framed::write_frame(&mut *writer, self.codec, &msg).await {
            return Err(self.latch(e));
        }
        Ok(())
    }

    /// Receive the method identity opening a server-side call.
    ///
    /// The first frame of a call must be INVOKE; anything else is a
    /// protocol violation.
    pub(crate) async fn recv_invoke(&self) -> Result<Method> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }

        let msg = self.inbound.lock().await.recv().await;
        match msg {
            None => Err(self.sticky_err().unwrap_or(Error::ConnectionClosed)),
            Some(msg) if msg.is_invoke() => msg
                .method()
                .ok_or_else(|| self.latch(Error::InvalidMessage)),
            Some(msg) if msg.is_error() => {
                Err(self.latch(msg.as_error().unwrap_or(Error::InvalidMessage)))
            }
            Some(_) => Err(self.latch(Error::ProtocolViolation)),
        }
    }
}

#[async_trait]
impl Call for StreamCall {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.send_control(WireMessage::data(data)).await
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        if let Some(e) = self.sticky_err() {
            return Err(e);
        }
        if self.eof.load(Ordering::Acquire) {
            return Ok(None);
        }

        let msg = self.inbound.lock().await.recv().await;
        match msg {
            // Reader finished: clean EOF unless it latched an error.
            None => match self.sticky_err() {
                Some(e) => Err(e),
                None => {
                    self.eof.store(true, Ordering::Release);
                    Ok(None)
                }
            },
            Some(msg) if msg.is_close() => {
                self.eof.store(true, Ordering::Release);
                Ok(None)
            }
            Some(msg) if msg.is_data() => Ok(Some(msg.data)),
            Some(msg) if msg.is_error() => Err(self.latch(msg.as_error().unwrap_or(Error::InvalidMessage))),
            // INVOKE or ACK in the data path.
            Some(_) => Err(self.latch(Error::ProtocolViolation)),
        }
    }

    async fn send_close(&self) -> Result<()> {
        self.send_control(WireMessage::close()).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.latch(Error::ConnectionClosed);
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }

    fn codec(&self) -> PayloadCodec {
        self.codec
    }
}

impl Drop for StreamCall {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Decode inbound frames onto the queue until EOF or a fatal error.
async fn read_loop(
    mut reader: ReadHalf<SubStream>,
    codec: PayloadCodec,
    tx: mpsc::Sender<WireMessage>,
    sticky: Arc<StdMutex<Option<Error>>>,
) {
    loop {
        match framed::read_frame(&mut reader, codec).await {
            Ok(Some(msg)) => {
                let fatal = msg.is_error();
                if fatal {
                    let err = msg.as_error().unwrap_or(Error::InvalidMessage);
                    sticky.lock().unwrap().get_or_insert(err);
                }
                if tx.send(msg).await.is_err() {
                    return;
                }
                if fatal {
                    return;
                }
            }
            // Clean EOF: dropping the sender ends the queue.
            Ok(None) => return,
            Err(e) => {
                sticky.lock().unwrap().get_or_insert(e);
                return;
            }
        }
    }
}
