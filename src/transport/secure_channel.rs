//! The secure channel adapter between a byte stream and the state machine.
//!
//! A [`SecureChannel`] owns both halves of an established stream: records
//! are written through a length-prefix codec behind an output lock, and a
//! read-loop task decodes inbound records into FSM events. The read loop is
//! gated on [`SecureChannel::bind_fsm`] because the TLS worker starts
//! reading before the owning connection has finished wiring.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{
    fsm::{Fsm, FsmEvent, SharedFsm},
    messages::IdscpMessage,
};

/// Upper bound on one record body; a `Data` payload can be sizable but a
/// record must still fit in memory on both ends.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

type BoxedWrite = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LengthDelimitedCodec>;

/// Contract the state machine holds on its transport.
#[async_trait]
pub trait SecureChannelEndpoint: Send + Sync {
    /// Write one record; `false` when the channel is no longer usable.
    async fn send(&self, record: Vec<u8>) -> bool;
    /// Tear the channel down; safe to call any number of times.
    fn close(&self);
    fn is_connected(&self) -> bool;
    fn remote_peer(&self) -> String;
    /// DER certificate the peer authenticated with, if the stream has one.
    fn peer_certificate(&self) -> Option<&[u8]>;
}

pub struct SecureChannel {
    writer: Arc<Mutex<BoxedWrite>>,
    connected: AtomicBool,
    remote: String,
    peer_certificate: Option<Vec<u8>>,
    bind: StdMutex<Option<oneshot::Sender<SharedFsm>>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl SecureChannel {
    /// Split the stream and start the read loop. The loop delivers nothing
    /// until [`bind_fsm`](Self::bind_fsm) is called.
    pub fn spawn<S>(stream: S, remote: String, peer_certificate: Option<Vec<u8>>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = LengthDelimitedCodec::builder()
            .length_field_type::<u32>()
            .max_frame_length(MAX_RECORD_LEN)
            .new_codec();

        let (read_half, write_half) = tokio::io::split(stream);
        let framed_read = FramedRead::new(read_half, codec.clone());
        let write_half: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);
        let framed_write = FramedWrite::new(write_half, codec);

        let (bind_tx, bind_rx) = oneshot::channel();
        let channel = Arc::new(SecureChannel {
            writer: Arc::new(Mutex::new(framed_write)),
            connected: AtomicBool::new(true),
            remote,
            peer_certificate,
            bind: StdMutex::new(Some(bind_tx)),
            reader: StdMutex::new(None),
        });

        let reader = tokio::spawn(read_loop(channel.clone(), framed_read, bind_rx));
        *channel.reader.lock().expect("reader slot") = Some(reader);

        channel
    }

    /// Release the inbound gate. Records received before this point are
    /// waiting in the stream's buffers, not dropped.
    pub fn bind_fsm(&self, fsm: SharedFsm) {
        if let Some(bind) = self.bind.lock().expect("bind slot").take() {
            let _ = bind.send(fsm);
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SecureChannelEndpoint for SecureChannel {
    async fn send(&self, record: Vec<u8>) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = self.writer.lock().await;
        match writer.send(Bytes::from(record)).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(remote = %self.remote, "record write failed: {err}");
                self.mark_disconnected();
                false
            }
        }
    }

    fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.reader.lock().expect("reader slot").take() {
            reader.abort();
        }
        // flush a close_notify on a best-effort basis
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let _ = writer.lock().await.get_mut().shutdown().await;
        });
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn remote_peer(&self) -> String {
        self.remote.clone()
    }

    fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_certificate.as_deref()
    }
}

async fn read_loop<R>(
    channel: Arc<SecureChannel>,
    mut records: FramedRead<R, LengthDelimitedCodec>,
    bind: oneshot::Receiver<SharedFsm>,
) where
    R: AsyncRead + Unpin,
{
    // the gate: no event reaches the FSM before the connection is wired up
    let Ok(fsm) = bind.await else {
        return;
    };

    loop {
        match records.next().await {
            Some(Ok(record)) => match IdscpMessage::decode(&record) {
                Ok(message) => {
                    tracing::trace!(
                        remote = %channel.remote,
                        variant = message.variant(),
                        "record received"
                    );
                    Fsm::dispatch(&fsm, FsmEvent::Message(message)).await;
                }
                Err(err) => {
                    tracing::warn!(remote = %channel.remote, "malformed record: {err}");
                    channel.mark_disconnected();
                    Fsm::dispatch(&fsm, FsmEvent::ChannelError(format!("malformed record: {err}")))
                        .await;
                    return;
                }
            },
            Some(Err(err)) => {
                channel.mark_disconnected();
                Fsm::dispatch(&fsm, FsmEvent::ChannelError(err.to_string())).await;
                return;
            }
            None => {
                channel.mark_disconnected();
                Fsm::dispatch(&fsm, FsmEvent::ChannelClosed).await;
                return;
            }
        }
    }
}
