//! WebSocket channel wrapper used as a bidirectional byte stream

use crate::error::Error;
use crate::message::ControlPacket;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{tungstenite::Message as WsMessage, WebSocketStream};

fn ws_to_io(err: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// A proxy session: a WebSocket channel past its control handshake.
///
/// During the handshake the session exchanges one [`ControlPacket`] per text
/// frame via [`read_packet`](Session::read_packet) and
/// [`write_packet`](Session::write_packet). Afterwards it behaves as a plain
/// byte stream through its [`AsyncRead`] and [`AsyncWrite`] implementations:
/// each write becomes exactly one binary frame, and reads concatenate
/// incoming frames. A frame larger than the caller's buffer is returned
/// partially and the remainder is retained for the next read, so the stream
/// stays byte-faithful even though frame boundaries are not preserved.
#[derive(Debug)]
pub struct Session<S> {
    /// Correlation id assigned at registration or dialout
    pub id: i64,

    ws: WebSocketStream<S>,

    /// Bytes left over from a frame that overflowed the caller's buffer
    buffer: Vec<u8>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established WebSocket channel
    pub fn new(id: i64, ws: WebSocketStream<S>) -> Self {
        Session {
            id,
            ws,
            buffer: Vec::new(),
        }
    }

    /// Read exactly one control frame.
    ///
    /// Callers enforce handshake deadlines by wrapping this in
    /// `tokio::time::timeout`. A closed channel is an error here: the
    /// handshake requires a reply.
    pub async fn read_packet(&mut self) -> Result<ControlPacket, Error> {
        loop {
            match self.ws.next().await {
                Some(Ok(message)) => match message {
                    WsMessage::Text(_) | WsMessage::Binary(_) => {
                        return Ok(ControlPacket::decode(&message.into_data())?);
                    }
                    WsMessage::Close(_) => {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "channel closed during handshake",
                        )));
                    }
                    _ => continue,
                },
                Some(Err(err)) => return Err(err.into()),
                None => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "channel closed during handshake",
                    )));
                }
            }
        }
    }

    /// Write one control frame as a single text frame
    pub async fn write_packet(&mut self, packet: &ControlPacket) -> Result<(), Error> {
        let text = packet.encode()?;
        self.ws.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    /// Close the channel, best effort
    pub async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

impl<S> AsyncRead for Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.buffer.is_empty() {
            let n = this.buffer.len().min(buf.remaining());
            buf.put_slice(&this.buffer[..n]);
            this.buffer.drain(..n);
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut this.ws).poll_next(cx) {
                Poll::Ready(Some(Ok(message))) => match message {
                    WsMessage::Text(_) | WsMessage::Binary(_) => {
                        let data = message.into_data();
                        if data.is_empty() {
                            continue;
                        }
                        let n = data.len().min(buf.remaining());
                        buf.put_slice(&data[..n]);
                        if n < data.len() {
                            this.buffer.extend_from_slice(&data[n..]);
                        }
                        return Poll::Ready(Ok(()));
                    }
                    // Close frame or stream end is EOF for the byte stream
                    WsMessage::Close(_) => return Poll::Ready(Ok(())),
                    _ => continue,
                },
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(ws_to_io(err))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match Pin::new(&mut this.ws).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(err)) => return Poll::Ready(Err(ws_to_io(err))),
            Poll::Pending => return Poll::Pending,
        }

        if let Err(err) = Pin::new(&mut this.ws).start_send(WsMessage::Binary(buf.to_vec())) {
            return Poll::Ready(Err(ws_to_io(err)));
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.ws).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(err)) => Poll::Ready(Err(ws_to_io(err))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.ws).poll_close(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            // The peer may already be gone; shutdown is best effort
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}
