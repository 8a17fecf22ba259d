//! WebSocket to byte-stream bridge
//!
//! Presents a framed WebSocket as `AsyncRead + AsyncWrite` so it can be wired
//! straight into an exec session's stdin/stdout.
//!
//! Inbound frames are pumped by a single background task into a one-slot
//! channel. A slow reader therefore stalls the pump, which stops reading
//! from the socket: untrusted input is never buffered beyond one frame.
//! Outbound writes go straight to the socket, one frame per write. A UTF-8
//! character cut off at the end of a write is held back and completed by the
//! next one, so text output keeps arriving as text frames.

use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::extract::ws::{CloseFrame, Message};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Normal closure
const CLOSE_NORMAL: u16 = 1000;

/// Frames handed from the pump to the reader at a time
const HANDOFF_CAPACITY: usize = 1;

/// Byte-stream view over a WebSocket-like connection
///
/// Reads return inbound payloads in arrival order and end with EOF once the
/// peer closes or the connection fails. Each write becomes at most one
/// outbound frame.
/// Dropping the bridge stops the pump and releases the connection.
pub struct StreamBridge<S> {
    sink: SplitSink<S, Message>,
    incoming: mpsc::Receiver<Bytes>,
    pending: Bytes,
    /// Incomplete UTF-8 sequence from the end of the last write
    held: Vec<u8>,
    pump: JoinHandle<()>,
}

impl<S, E> StreamBridge<S>
where
    S: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Take ownership of `socket` and start the inbound pump
    pub fn new(socket: S) -> Self {
        let (sink, stream) = socket.split();
        let (tx, incoming) = mpsc::channel(HANDOFF_CAPACITY);
        let pump = tokio::spawn(pump_frames(stream, tx));

        Self {
            sink,
            incoming,
            pending: Bytes::new(),
            held: Vec::new(),
            pump,
        }
    }

    /// Send a text frame directly on the connection
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), E> {
        self.send_held().await?;
        self.sink.send(Message::Text(text.into().into())).await
    }

    /// Send any held-back partial character as it is
    async fn send_held(&mut self) -> Result<(), E> {
        if self.held.is_empty() {
            return Ok(());
        }
        let held = std::mem::take(&mut self.held);
        self.sink.send(Message::Binary(held.into())).await
    }

    /// Send a normal close frame and close the outbound half
    ///
    /// Errors are ignored: the peer may already be gone.
    pub async fn close(&mut self) {
        let _ = self.send_held().await;
        let frame = CloseFrame {
            code: CLOSE_NORMAL,
            reason: "".into(),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        let _ = self.sink.close().await;
    }
}

impl<S> Drop for StreamBridge<S> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Forward inbound payloads until the peer closes or the connection fails
async fn pump_frames<R, E>(mut frames: R, tx: mpsc::Sender<Bytes>)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::error::Error,
{
    while let Some(frame) = frames.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(frame)) => {
                debug!(code = ?frame.as_ref().map(|f| f.code), "Peer closed bridge connection");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Bridge connection receive failed");
                break;
            }
        };

        // A zero-length read means EOF, so empty frames carry nothing
        if payload.is_empty() {
            continue;
        }

        if tx.send(payload).await.is_err() {
            trace!("Bridge reader dropped, stopping pump");
            break;
        }
    }
}

/// Frame to send for `data`, and the trailing bytes to hold for the next write
///
/// Valid UTF-8 becomes a text frame. A character cut off at the very end is
/// held back; if nothing precedes it there is no frame yet. Data that can
/// never be UTF-8 goes out whole as a binary frame.
fn outbound_frame(data: &[u8]) -> (Option<Message>, &[u8]) {
    match std::str::from_utf8(data) {
        Ok(text) => (Some(Message::Text(text.to_owned().into())), &[]),
        Err(e) if e.error_len().is_none() => {
            let (valid, tail) = data.split_at(e.valid_up_to());
            let frame = (!valid.is_empty())
                .then(|| Message::Text(String::from_utf8_lossy(valid).into_owned().into()));
            (frame, tail)
        }
        Err(_) => (Some(Message::Binary(Bytes::copy_from_slice(data))), &[]),
    }
}

impl<S> AsyncRead for StreamBridge<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pending.is_empty() {
            match ready!(this.incoming.poll_recv(cx)) {
                Some(payload) => this.pending = payload,
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = this.pending.len().min(buf.remaining());
        let chunk = this.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl<S, E> AsyncWrite for StreamBridge<S>
where
    S: Sink<Message, Error = E>,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        let joined: Cow<'_, [u8]> = if this.held.is_empty() {
            Cow::Borrowed(data)
        } else {
            let mut joined = this.held.clone();
            joined.extend_from_slice(data);
            Cow::Owned(joined)
        };

        let (frame, tail) = outbound_frame(&joined);
        let Some(frame) = frame else {
            this.held = tail.to_vec();
            return Poll::Ready(Ok(data.len()));
        };

        ready!(this.sink.poll_ready_unpin(cx)).map_err(io::Error::other)?;
        this.sink
            .start_send_unpin(frame)
            .map_err(io::Error::other)?;
        this.held = tail.to_vec();

        // Push the frame out now; a pending flush is finished by the next call
        if let Poll::Ready(Err(e)) = this.sink.poll_flush_unpin(cx) {
            return Poll::Ready(Err(io::Error::other(e)));
        }

        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .sink
            .poll_flush_unpin(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.held.is_empty() {
            ready!(this.sink.poll_ready_unpin(cx)).map_err(io::Error::other)?;
            let held = std::mem::take(&mut this.held);
            this.sink
                .start_send_unpin(Message::Binary(held.into()))
                .map_err(io::Error::other)?;
        }
        this.sink.poll_close_unpin(cx).map_err(io::Error::other)
    }
}
