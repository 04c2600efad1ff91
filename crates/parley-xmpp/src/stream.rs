//! Byte-level plumbing under a session.
//!
//! Reading happens on the session task through the decoder. Writing is done
//! by a dedicated writer task fed by an unbounded queue, so any task holding
//! a [`Mailbox`] can deliver to the peer without touching the socket.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{trace, Instrument};
use uuid::Uuid;

use crate::packet::Packet;
use crate::XmppError;

/// Anything a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased transport, plain or encrypted.
pub type BoxedIo = Box<dyn AsyncStream>;

/// An accepted or dialed connection.
pub struct Transport {
    pub io: BoxedIo,
    pub peer: Option<SocketAddr>,
    /// Unique per connection, used to correlate logs and registrations
    pub id: Uuid,
}

impl Transport {
    pub fn new(io: impl AsyncStream + 'static) -> Self {
        Self {
            io: Box::new(io),
            peer: None,
            id: Uuid::new_v4(),
        }
    }

    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            io: Box::new(stream),
            peer,
            id: Uuid::new_v4(),
        }
    }
}

const CLOSING_TAG: &str = "</stream:stream>";

/// A cloneable handle for queueing output on a session.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: UnboundedSender<Vec<u8>>,
}

impl Mailbox {
    pub fn new(tx: UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Queue a packet for the peer.
    pub fn deliver(&self, packet: &Packet) -> Result<(), XmppError> {
        self.tx
            .send(packet.to_xml().into_bytes())
            .map_err(|_| XmppError::SessionClosed)
    }

    /// The session's writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The owning side of a session's output queue.
///
/// Tracks whether the closing tag went out, so it is written at most once.
#[derive(Debug)]
pub struct Outbound {
    tx: Option<UnboundedSender<Vec<u8>>>,
    stop: CancellationToken,
    closing_sent: bool,
}

impl Outbound {
    /// Queue a packet.
    pub fn send(&mut self, packet: &Packet) -> Result<(), XmppError> {
        self.send_raw(packet.to_xml())
    }

    /// Queue raw markup. Fails once the closing tag has been queued.
    pub fn send_raw(&mut self, xml: impl Into<String>) -> Result<(), XmppError> {
        if self.closing_sent {
            return Err(XmppError::SessionClosed);
        }
        let tx = self.tx.as_ref().ok_or(XmppError::SessionClosed)?;
        tx.send(xml.into().into_bytes())
            .map_err(|_| XmppError::SessionClosed)
    }

    /// Queue `</stream:stream>` unless it already was. Returns whether it was queued now.
    pub fn send_closing_tag(&mut self) -> Result<bool, XmppError> {
        if self.closing_sent {
            return Ok(false);
        }
        self.send_raw(CLOSING_TAG)?;
        self.closing_sent = true;
        Ok(true)
    }

    pub fn closing_sent(&self) -> bool {
        self.closing_sent
    }

    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn mailbox(&self) -> Option<Mailbox> {
        self.tx.clone().map(Mailbox::new)
    }

    /// A handle that does not keep the queue alive, for keepalives.
    pub fn probe(&self) -> Option<WeakUnboundedSender<Vec<u8>>> {
        self.tx.as_ref().map(UnboundedSender::downgrade)
    }

    /// Stop accepting output. The writer drains what is queued and exits.
    pub fn close(&mut self) {
        self.tx = None;
        self.stop.cancel();
    }
}

/// Start the writer task for `writer`.
///
/// The task returns the writer once [`Outbound::close`] has been called and
/// the queue is drained, so the transport can be reassembled (for TLS).
pub fn spawn_writer<W>(mut writer: W) -> (Outbound, JoinHandle<io::Result<W>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let stop = CancellationToken::new();
    let outbound = Outbound {
        tx: Some(tx),
        stop: stop.clone(),
        closing_sent: false,
    };

    let task = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    biased;
                    frame = rx.recv() => match frame {
                        Some(bytes) => {
                            if write_batch(&mut writer, &mut rx, bytes).await? {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = stop.cancelled() => {
                        while let Ok(bytes) = rx.try_recv() {
                            if write_frame(&mut writer, &mut rx, &bytes).await? {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            writer.flush().await?;
            trace!("writer finished");
            Ok(writer)
        }
        .in_current_span(),
    );

    (outbound, task)
}

/// Write `first` and whatever else is already queued, then flush once.
///
/// Returns `true` once the closing tag has been written.
async fn write_batch<W: AsyncWrite + Unpin>(
    writer: &mut W,
    rx: &mut UnboundedReceiver<Vec<u8>>,
    first: Vec<u8>,
) -> io::Result<bool> {
    trace!(bytes = first.len(), "writing");
    let mut finished = write_frame(writer, rx, &first).await?;
    while !finished {
        match rx.try_recv() {
            Ok(more) => finished = write_frame(writer, rx, &more).await?,
            Err(_) => break,
        }
    }
    writer.flush().await?;
    Ok(finished)
}

/// Write one frame. Nothing is written after the closing tag: the queue is
/// closed and whatever other handles managed to queue is dropped.
async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    rx: &mut UnboundedReceiver<Vec<u8>>,
    bytes: &[u8],
) -> io::Result<bool> {
    writer.write_all(bytes).await?;
    if bytes != CLOSING_TAG.as_bytes() {
        return Ok(false);
    }
    rx.close();
    while rx.try_recv().is_ok() {}
    trace!("closing tag written");
    Ok(true)
}

/// A reader that sends a single space to the peer whenever the inbound side
/// has been idle for a full period.
pub struct IdleProbe<R> {
    inner: R,
    idle: Option<(Duration, Pin<Box<Sleep>>)>,
    probe: Option<WeakUnboundedSender<Vec<u8>>>,
}

impl<R> IdleProbe<R> {
    /// Wrap `inner`. A `period` of `None` disables the probe.
    pub fn new(
        inner: R,
        period: Option<Duration>,
        probe: Option<WeakUnboundedSender<Vec<u8>>>,
    ) -> Self {
        Self {
            inner,
            idle: period.map(|period| (period, Box::pin(tokio::time::sleep(period)))),
            probe,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for IdleProbe<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if let Some((period, sleep)) = &mut this.idle {
                    sleep.as_mut().reset(Instant::now() + *period);
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                if let Some((period, sleep)) = &mut this.idle {
                    while sleep.as_mut().poll(cx).is_ready() {
                        if let Some(tx) = this.probe.as_ref().and_then(WeakUnboundedSender::upgrade) {
                            trace!("sending whitespace keepalive");
                            let _ = tx.send(b" ".to_vec());
                        }
                        sleep.as_mut().reset(Instant::now() + *period);
                    }
                }
                Poll::Pending
            }
        }
    }
}
