//! Connection tee (§4.F): wraps a socket so every byte the caller reads or
//! writes passes verbatim through, while an exact copy of each direction is
//! mirrored into its own in-memory pipe for the capture pipeline.
//!
//! Grounded in the `b0cal-miel` `TcpCapture`/`StreamRecorder` pattern (buffer
//! both directions, forward untouched, record a copy) — generalised here
//! from a full-duplex proxy relay to an in-process `AsyncRead`/`AsyncWrite`
//! wrapper with the mirror delivered over `tokio::io::duplex` pipes instead
//! of a second socket.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

/// Default duplex-pipe buffer; large enough that the background forwarder
/// rarely applies backpressure to the caller's real I/O.
pub const DEFAULT_PIPE_CAPACITY: usize = 256 * 1024;

/// The two pipe-reader ends the capture pipeline consumes: bytes the caller
/// wrote (the request side) and bytes the caller read (the response side).
pub struct TeePipes {
    pub request_reader: DuplexStream,
    pub response_reader: DuplexStream,
}

/// Wraps `inner`, mirroring reads into `response_reader` and writes into
/// `request_reader` of the returned [`TeePipes`].
pub struct TeeStream<S> {
    inner: S,
    write_mirror: mpsc::UnboundedSender<Vec<u8>>,
    read_mirror: mpsc::UnboundedSender<Vec<u8>>,
}

impl<S> TeeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn wrap(inner: S, pipe_capacity: usize) -> (Self, TeePipes) {
        let (request_writer, request_reader) = tokio::io::duplex(pipe_capacity);
        let (response_writer, response_reader) = tokio::io::duplex(pipe_capacity);

        let (write_mirror, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (read_mirror, read_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(forward(write_rx, request_writer));
        tokio::spawn(forward(read_rx, response_writer));

        (
            Self {
                inner,
                write_mirror,
                read_mirror,
            },
            TeePipes {
                request_reader,
                response_reader,
            },
        )
    }
}

/// Drain mirrored chunks into `sink` in order; closes the pipe when the tee
/// is dropped or the sink itself errors out.
async fn forward(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut sink: DuplexStream) {
    while let Some(chunk) = rx.recv().await {
        if sink.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = sink.shutdown().await;
}

impl<S> AsyncRead for TeeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let after = buf.filled().len();
            if after > before {
                let _ = this.read_mirror.send(buf.filled()[before..after].to_vec());
            }
        }
        result
    }
}

impl<S> AsyncWrite for TeeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            let _ = this.write_mirror.send(buf[..*n].to_vec());
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn mirrors_writes_into_request_pipe() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (mut tee, mut pipes) = TeeStream::wrap(client, 4096);

        tokio::spawn(async move {
            let mut buf = [0u8; 5];
            server.read_exact(&mut buf).await.unwrap();
        });

        tee.write_all(b"hello").await.unwrap();
        tee.flush().await.unwrap();

        let mut mirrored = [0u8; 5];
        pipes.request_reader.read_exact(&mut mirrored).await.unwrap();
        assert_eq!(&mirrored, b"hello");
    }

    #[tokio::test]
    async fn mirrors_reads_into_response_pipe() {
        let (raw, mut server) = tokio::io::duplex(4096);
        let (mut tee, mut pipes) = TeeStream::wrap(raw, 4096);
        tokio::spawn(async move {
            server.write_all(b"world").await.unwrap();
        });

        let mut buf = [0u8; 5];
        tee.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        let mut mirrored = [0u8; 5];
        pipes.response_reader.read_exact(&mut mirrored).await.unwrap();
        assert_eq!(&mirrored, b"world");
    }
}
