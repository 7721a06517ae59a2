//! Message channel between the control side and a worker.
//!
//! A channel endpoint is a [`MessageSender`] for outbound messages plus a
//! [`MessageReceiver`] for inbound ones. Two transports sit behind the same
//! types:
//!
//! - **Local**: an unbounded tokio mpsc pair, for workers running on a thread
//!   of this process. Messages (and any bitmap they own) move by value.
//! - **Framed**: length-prefixed JSON over an `AsyncRead`/`AsyncWrite` pair,
//!   for workers in another process. Each frame is a 4-byte big-endian length
//!   followed by the payload.
//!
//! Sending never blocks: framed messages are encoded on the caller's task and
//! handed to a writer task. Each direction preserves enqueue order; nothing is
//! promised across directions.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ChannelError;

/// Default upper bound for a single framed message (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Sender
// ─────────────────────────────────────────────────────────────────────────────

enum SenderInner<M> {
    Local(mpsc::UnboundedSender<M>),
    Framed {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        max_frame_len: usize,
    },
}

/// Sending half of a channel endpoint.
pub struct MessageSender<M> {
    inner: SenderInner<M>,
}

impl<M> Clone for MessageSender<M> {
    fn clone(&self) -> Self {
        let inner = match &self.inner {
            SenderInner::Local(tx) => SenderInner::Local(tx.clone()),
            SenderInner::Framed { tx, max_frame_len } => SenderInner::Framed {
                tx: tx.clone(),
                max_frame_len: *max_frame_len,
            },
        };
        Self { inner }
    }
}

impl<M: Serialize> MessageSender<M> {
    /// Enqueue a message for the peer.
    ///
    /// Fails with [`ChannelError::Closed`] once the peer is gone, and with
    /// [`ChannelError::Transfer`] when the message cannot be handed off
    /// (encoding failed or the frame exceeds the transport limit). In both
    /// cases the message, including any bitmap it owns, is dropped here.
    pub fn send(&self, msg: M) -> Result<(), ChannelError> {
        match &self.inner {
            SenderInner::Local(tx) => tx.send(msg).map_err(|_| ChannelError::Closed),
            SenderInner::Framed { tx, max_frame_len } => {
                if tx.is_closed() {
                    return Err(ChannelError::Closed);
                }
                let payload =
                    serde_json::to_vec(&msg).map_err(|e| ChannelError::Transfer(e.to_string()))?;
                if payload.len() > *max_frame_len {
                    return Err(ChannelError::Transfer(format!(
                        "frame of {} bytes exceeds limit of {} bytes",
                        payload.len(),
                        max_frame_len
                    )));
                }
                tx.send(payload).map_err(|_| ChannelError::Closed)
            }
        }
    }

    /// Whether the peer has gone away.
    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SenderInner::Local(tx) => tx.is_closed(),
            SenderInner::Framed { tx, .. } => tx.is_closed(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receiver
// ─────────────────────────────────────────────────────────────────────────────

/// Receiving half of a channel endpoint.
pub struct MessageReceiver<M> {
    rx: mpsc::UnboundedReceiver<M>,
}

impl<M: Send + 'static> MessageReceiver<M> {
    /// Wait for the next message. `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    /// Take a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }

    /// Install the delivery callback.
    ///
    /// Consumes the receiver, so a channel has at most one handler. The
    /// handler runs once per message, in order, on a spawned task that ends
    /// when the peer closes.
    pub fn on_message<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(M) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(msg) = self.rx.recv().await {
                handler(msg);
            }
        })
    }
}

/// Both halves of one side of a channel.
pub struct Endpoint<Out, In> {
    pub sender: MessageSender<Out>,
    pub receiver: MessageReceiver<In>,
}

impl<Out, In> Endpoint<Out, In> {
    pub fn split(self) -> (MessageSender<Out>, MessageReceiver<In>) {
        (self.sender, self.receiver)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Local transport
// ─────────────────────────────────────────────────────────────────────────────

/// One-directional in-process channel.
pub fn local_pair<M>() -> (MessageSender<M>, MessageReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MessageSender {
            inner: SenderInner::Local(tx),
        },
        MessageReceiver { rx },
    )
}

/// Connected in-process endpoints: what one sends the other receives.
pub fn local_link<A, B>() -> (Endpoint<A, B>, Endpoint<B, A>) {
    let (a_tx, a_rx) = local_pair::<A>();
    let (b_tx, b_rx) = local_pair::<B>();
    (
        Endpoint {
            sender: a_tx,
            receiver: b_rx,
        },
        Endpoint {
            sender: b_tx,
            receiver: a_rx,
        },
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Framed transport
// ─────────────────────────────────────────────────────────────────────────────

/// Build an endpoint over a byte stream pair.
///
/// Spawns a reader and a writer task on the current tokio runtime. Undecodable
/// frames are logged and skipped; a read error or EOF closes the receiver.
pub fn framed<Out, In, R, W>(reader: R, writer: W, max_frame_len: usize) -> Endpoint<Out, In>
where
    Out: Serialize,
    In: DeserializeOwned + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<In>();

    tokio::spawn(write_loop(writer, out_rx));
    tokio::spawn(read_loop(reader, in_tx, max_frame_len));

    Endpoint {
        sender: MessageSender {
            inner: SenderInner::Framed {
                tx: out_tx,
                max_frame_len,
            },
        },
        receiver: MessageReceiver { rx: in_rx },
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &payload).await {
            tracing::warn!("Framed channel write failed: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop<R, In>(mut reader: R, tx: mpsc::UnboundedSender<In>, max_frame_len: usize)
where
    R: AsyncRead + Unpin,
    In: DeserializeOwned,
{
    loop {
        match read_frame(&mut reader, max_frame_len).await {
            Ok(Some(payload)) => match serde_json::from_slice::<In>(&payload) {
                Ok(msg) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!("Dropping undecodable frame: {}", e),
            },
            Ok(None) => {
                tracing::debug!("Framed channel reached EOF");
                break;
            }
            Err(e) => {
                tracing::warn!("Framed channel read failed: {}", e);
                break;
            }
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| ChannelError::Transfer(format!("frame of {} bytes too large", payload.len())))?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| ChannelError::Io(e.to_string()))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| ChannelError::Io(e.to_string()))?;
    writer.flush().await.map_err(|e| ChannelError::Io(e.to_string()))
}

/// Read one length-prefixed frame. `Ok(None)` on a clean EOF.
pub async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<Option<Vec<u8>>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ChannelError::Io(e.to_string())),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(ChannelError::Codec("empty frame".into()));
    }
    if len > max_frame_len {
        return Err(ChannelError::Codec(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            len, max_frame_len
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ChannelError::Io(e.to_string()))?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use marker_protocol::{Bitmap, ControlMessage, WorkerMessage};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_local_preserves_order() {
        let (tx, mut rx) = local_pair::<WorkerMessage>();
        for frame_id in 0..5 {
            tx.send(WorkerMessage::FrameComplete { frame_id }).unwrap();
        }
        for expected in 0..5 {
            assert_eq!(rx.recv().await, Some(WorkerMessage::FrameComplete { frame_id: expected }));
        }
    }

    #[tokio::test]
    async fn test_local_send_after_peer_dropped() {
        let (tx, rx) = local_pair::<WorkerMessage>();
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(tx.send(WorkerMessage::Ready), Err(ChannelError::Closed)));
    }

    #[tokio::test]
    async fn test_on_message_delivers_in_order() {
        let (tx, rx) = local_pair::<WorkerMessage>();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let task = rx.on_message(move |msg| {
            let _ = seen_tx.send(msg);
        });

        tx.send(WorkerMessage::Ready).unwrap();
        tx.send(WorkerMessage::error("boom")).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(seen_rx.recv().await, Some(WorkerMessage::Ready));
        assert_eq!(seen_rx.recv().await, Some(WorkerMessage::error("boom")));
        assert_eq!(seen_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_framed_round_trip_both_directions() {
        let (control_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(control_io);
        let (wr, ww) = tokio::io::split(worker_io);

        let control: Endpoint<ControlMessage, WorkerMessage> = framed(cr, cw, DEFAULT_MAX_FRAME_LEN);
        let worker: Endpoint<WorkerMessage, ControlMessage> = framed(wr, ww, DEFAULT_MAX_FRAME_LEN);
        let (control_tx, mut control_rx) = control.split();
        let (worker_tx, mut worker_rx) = worker.split();

        control_tx
            .send(ControlMessage::ProcessFrame {
                frame_id: 1,
                bitmap: Some(Bitmap::filled(2, 1, [1, 2, 3, 4])),
                width: 2,
                height: 1,
            })
            .unwrap();
        match worker_rx.recv().await {
            Some(ControlMessage::ProcessFrame { frame_id: 1, bitmap: Some(bitmap), .. }) => {
                assert_eq!(bitmap.pixels(), &[1, 2, 3, 4, 1, 2, 3, 4]);
            }
            other => panic!("unexpected {other:?}"),
        }

        worker_tx.send(WorkerMessage::FrameComplete { frame_id: 1 }).unwrap();
        assert_eq!(control_rx.recv().await, Some(WorkerMessage::FrameComplete { frame_id: 1 }));
    }

    #[tokio::test]
    async fn test_framed_oversized_message_is_transfer_error() {
        let (control_io, _worker_io) = tokio::io::duplex(1024);
        let (cr, cw) = tokio::io::split(control_io);
        let control: Endpoint<ControlMessage, WorkerMessage> = framed(cr, cw, 256);

        let releases = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&releases);
        let bitmap = Bitmap::filled(16, 16, [0; 4]).with_release_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let result = control.sender.send(ControlMessage::ProcessFrame {
            frame_id: 7,
            bitmap: Some(bitmap),
            width: 16,
            height: 16,
        });
        assert!(matches!(result, Err(ChannelError::Transfer(_))));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let mut bytes: &[u8] = &[0, 0, 1, 0, b'x'];
        let err = read_frame(&mut bytes, 16).await.unwrap_err();
        assert!(matches!(err, ChannelError::Codec(_)));

        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, 16).await.unwrap().is_none());
    }
}
