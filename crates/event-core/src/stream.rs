//! JSON event streams
//!
//! Signaling sockets carry concatenated JSON objects with no delimiter.
//! The reader accumulates bytes and yields each complete top-level object;
//! the writer serializes one object per send.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::api::EventMessage;
use crate::error::{Error, Result};

/// Upper bound for a single signaling message.
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Reading half of an event stream.
pub struct EventReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> EventReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Read the next event. Returns `Ok(None)` on clean end of stream.
    pub async fn recv(&mut self) -> Result<Option<EventMessage>> {
        loop {
            if let Some((msg, consumed)) = Self::decode(&self.buf)? {
                self.buf.advance(consumed);
                trace!(event = %msg.event, "received event");
                return Ok(Some(msg));
            }

            if self.buf.len() > MAX_EVENT_BYTES {
                return Err(Error::Protocol(format!(
                    "event exceeds {} bytes",
                    MAX_EVENT_BYTES
                )));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(Error::Protocol(
                    "stream closed inside a partial event".to_string(),
                ));
            }
        }
    }

    /// Try to decode one complete object from the front of `buf`.
    fn decode(buf: &[u8]) -> Result<Option<(EventMessage, usize)>> {
        let mut iter = serde_json::Deserializer::from_slice(buf).into_iter::<EventMessage>();
        match iter.next() {
            Some(Ok(msg)) => Ok(Some((msg, iter.byte_offset()))),
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(Error::Json(e)),
            None => Ok(None),
        }
    }
}

/// Writing half of an event stream.
pub struct EventWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> EventWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, msg: &EventMessage) -> Result<()> {
        let encoded = serde_json::to_vec(msg)?;
        self.inner.write_all(&encoded).await?;
        self.inner.flush().await?;
        trace!(event = %msg.event, bytes = encoded.len(), "sent event");
        Ok(())
    }
}

/// Split a TCP signaling socket into event halves.
pub fn split_tcp(stream: TcpStream) -> (EventReader<OwnedReadHalf>, EventWriter<OwnedWriteHalf>) {
    let (r, w) = stream.into_split();
    (EventReader::new(r), EventWriter::new(w))
}

/// Split any duplex I/O object (e.g. a TLS stream) into event halves.
pub fn split_io<S: AsyncRead + AsyncWrite>(
    stream: S,
) -> (EventReader<ReadHalf<S>>, EventWriter<WriteHalf<S>>) {
    let (r, w) = tokio::io::split(stream);
    (EventReader::new(r), EventWriter::new(w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_and_receive_single_event() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut tx) = split_io(client);
        let (mut rx, _) = split_io(server);

        let msg = EventMessage::request("state", json!({}));
        tx.send(&msg).await.unwrap();

        let got = rx.recv().await.unwrap().unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_concatenated_events_without_delimiter() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut tx) = split_io(client);
        let (mut rx, _) = split_io(server);

        let first = EventMessage::request("join", json!({"loop": "alpha"}));
        let second = EventMessage::request("leave", json!({"loop": "alpha"}));
        tx.send(&first).await.unwrap();
        tx.send(&second).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap(), first);
        assert_eq!(rx.recv().await.unwrap().unwrap(), second);
    }

    #[tokio::test]
    async fn test_partial_write_completes_later() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (mut rx, _) = split_io(server);

        let msg = EventMessage::request("volume", json!({"loop": "a", "volume": 70}));
        let encoded = serde_json::to_vec(&msg).unwrap();
        let (head, tail) = encoded.split_at(encoded.len() / 2);

        client.write_all(head).await.unwrap();
        client.flush().await.unwrap();

        let read = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;

        client.write_all(tail).await.unwrap();
        client.flush().await.unwrap();

        let got = read.await.unwrap().unwrap().unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_clean_close_yields_none() {
        let (client, server) = tokio::io::duplex(64);
        let (mut rx, _) = split_io(server);
        drop(client);
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_garbage_is_a_protocol_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let (mut rx, _) = split_io(server);
        client.write_all(b"not json at all").await.unwrap();
        client.flush().await.unwrap();
        assert!(rx.recv().await.is_err());
    }
}
