//! Byte-counting pass-through wrapper for streams and HTTP bodies.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Buf;
use hyper::body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

pin_project! {
    /// Counts the bytes that pass through a reader or an HTTP body without
    /// altering data, errors or end-of-stream.
    ///
    /// The counter is plain state owned by whoever polls the wrapper: one
    /// instance per tunnel direction or per body, never shared between tasks.
    #[derive(Debug)]
    pub struct TrafficCounter<R> {
        #[pin]
        inner: R,
        bytes_read: u64,
    }
}

impl<R> TrafficCounter<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }

    /// Total bytes produced so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl<R: AsyncRead> AsyncRead for TrafficCounter<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let polled = this.inner.poll_read(cx, buf);
        *this.bytes_read += (buf.filled().len() - before) as u64;
        polled
    }
}

impl<B: Body> Body for TrafficCounter<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);
        if let Poll::Ready(Some(Ok(frame))) = &polled {
            // Trailers pass through uncounted.
            if let Some(data) = frame.data_ref() {
                *this.bytes_read += data.remaining() as u64;
            }
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty, Full};
    use tokio::io::AsyncReadExt;

    use super::*;

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }
    }

    #[tokio::test]
    async fn test_counts_reads_until_eof() {
        let mut reader = TrafficCounter::new(&b"hello tunnel"[..]);
        let mut small = [0u8; 5];

        let n = reader.read(&mut small).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(reader.bytes_read(), 5);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b" tunnel");
        assert_eq!(reader.bytes_read(), 12);

        // EOF is passed through and does not change the total.
        assert_eq!(reader.read(&mut small).await.unwrap(), 0);
        assert_eq!(reader.bytes_read(), 12);
    }

    #[tokio::test]
    async fn test_errors_propagate_unchanged() {
        let mut reader = TrafficCounter::new(FailingReader);
        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(reader.bytes_read(), 0);
    }

    #[tokio::test]
    async fn test_counts_body_frames() {
        let mut body = TrafficCounter::new(Full::new(Bytes::from_static(b"0123456789")));
        let collected = (&mut body).collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"0123456789");
        assert_eq!(body.bytes_read(), 10);
        assert!(body.is_end_stream());
    }

    #[tokio::test]
    async fn test_empty_body() {
        let mut body = TrafficCounter::new(Empty::<Bytes>::new());
        let collected = (&mut body).collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
        assert_eq!(body.bytes_read(), 0);
    }
}
