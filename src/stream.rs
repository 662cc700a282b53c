//! Buffered postgres message stream.
use bytes::{Buf, Bytes, BytesMut};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{
    Result,
    postgres::{BackendMessage, BackendProtocol, FrontendProtocol, frontend},
    transport::PgTransport,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Buffered connection to postgres.
///
/// Wraps an already-connected duplex socket; connection establishment and
/// authentication happen elsewhere.
#[derive(Debug)]
pub struct PgStream<S> {
    socket: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> PgStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
        }
    }

    /// Gracefully terminate the session.
    pub async fn close(mut self) -> io::Result<()> {
        PgTransport::send(&mut self, frontend::Terminate);
        PgTransport::flush(&mut self).await?;
        self.socket.shutdown().await
    }

    /// Take one complete message frame off the read buffer, if any.
    fn try_frame(&mut self) -> Option<(u8, Bytes)> {
        let mut header = self.read_buf.get(..5)?;

        let msgtype = header.get_u8();
        let len = header.get_i32() as usize;

        if self.read_buf.len() - 1/*msgtype*/ < len {
            self.read_buf.reserve(1 + len);
            return None;
        }

        self.read_buf.advance(5);
        let body = self.read_buf.split_to(len - 4).freeze();
        Some((msgtype, body))
    }

    async fn fill(&mut self) -> io::Result<()> {
        self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
        let read = self.socket.read_buf(&mut self.read_buf).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "postgres closed the connection",
            ));
        }
        Ok(())
    }
}

impl<S> PgTransport for PgStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn send<F: FrontendProtocol>(&mut self, message: F) {
        log::trace!("(F)'{}'", F::MSGTYPE as char);
        frontend::write(message, &mut self.write_buf);
    }

    async fn flush(&mut self) -> io::Result<()> {
        while self.write_buf.has_remaining() {
            self.socket.write_all_buf(&mut self.write_buf).await?;
        }
        self.socket.flush().await
    }

    async fn recv(&mut self) -> Result<BackendMessage> {
        loop {
            let Some((msgtype, body)) = self.try_frame() else {
                self.fill().await?;
                continue;
            };
            let message = BackendMessage::decode(msgtype, body)?;
            log::trace!("(B){message:?}");
            return Ok(message);
        }
    }

    async fn peek(&mut self) -> Result<u8> {
        while self.read_buf.is_empty() {
            self.fill().await?;
        }
        Ok(self.read_buf[0])
    }

    fn has_pending(&mut self) -> bool {
        if !self.read_buf.is_empty() {
            return true;
        }

        // Probe the socket without registering for wakeup.
        self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
        let mut cx = Context::from_waker(Waker::noop());
        let mut buf = ReadBuf::uninit(self.read_buf.spare_capacity_mut());
        match Pin::new(&mut self.socket).poll_read(&mut cx, &mut buf) {
            Poll::Ready(Ok(())) => {
                let filled = buf.filled().len();
                // SAFETY: poll_read initialized `filled` bytes of the spare capacity
                unsafe { self.read_buf.set_len(self.read_buf.len() + filled) };
                filled > 0
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::mock;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut stream = PgStream::new(client);

        stream.send(frontend::Sync);
        stream.flush().await.unwrap();

        let mut sent = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut sent).await.unwrap();
        assert_eq!(&sent, b"S\x00\x00\x00\x04");

        let (msgtype, body) = mock::ready_for_query(b'I');
        let mut frame = BytesMut::with_capacity(5 + body.len());
        bytes::BufMut::put_u8(&mut frame, msgtype);
        bytes::BufMut::put_i32(&mut frame, 4 + body.len() as i32);
        bytes::BufMut::put_slice(&mut frame, &body);
        tokio::io::AsyncWriteExt::write_all(&mut server, &frame).await.unwrap();

        assert_eq!(stream.peek().await.unwrap(), b'Z');
        assert!(stream.has_pending());
        match stream.recv().await.unwrap() {
            BackendMessage::ReadyForQuery(rfq) => assert_eq!(rfq.status, b'I'),
            f => panic!("unexpected message {:?}", f),
        }
        assert!(!stream.has_pending());
    }
}
