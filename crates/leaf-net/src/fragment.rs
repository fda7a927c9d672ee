//! TLS Fragmentation
//!
//! Splits selected writes of a stream into small chunks with short pauses
//! in between, so middleboxes that inspect the first TLS record (SNI) in a
//! single segment cannot reassemble it cheaply.
//!
//! Writes are numbered from 1. A write whose number falls in
//! `packets` is accepted whole, then drained to the inner stream in chunks
//! of a random size from `length`, sleeping a random `interval` (ms)
//! between chunks. Other writes pass straight through.

use leaf_config::{FragmentSpec, IntRange};
use rand::Rng;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Buffered write being drained in chunks
struct Pending {
    data: Vec<u8>,
    offset: usize,
    delay: Option<Pin<Box<Sleep>>>,
}

/// Stream wrapper applying a [`FragmentSpec`] to its writes
pub struct FragmentStream<S> {
    inner: S,
    spec: Option<FragmentSpec>,
    writes: u64,
    pending: Option<Pending>,
}

impl<S> FragmentStream<S> {
    pub fn new(inner: S, spec: FragmentSpec) -> Self {
        Self::with_spec(inner, Some(spec))
    }

    /// Wrap with an optional spec; `None` passes every write through
    pub fn with_spec(inner: S, spec: Option<FragmentSpec>) -> Self {
        Self {
            inner,
            spec,
            writes: 0,
            pending: None,
        }
    }

    /// Number of writes accepted so far
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Uniform sample from a validated range, clamped at zero
fn sample(range: IntRange) -> u64 {
    let start = range.start.max(0) as u64;
    let end = range.end.max(0) as u64;
    if end <= start {
        return start;
    }
    rand::thread_rng().gen_range(start..=end)
}

impl<S: AsyncWrite + Unpin> FragmentStream<S> {
    fn poll_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let Some(pending) = self.pending.as_mut() else {
                return Poll::Ready(Ok(()));
            };

            if let Some(delay) = pending.delay.as_mut() {
                ready!(delay.as_mut().poll(cx));
                pending.delay = None;
            }

            if pending.offset >= pending.data.len() {
                self.pending = None;
                return Poll::Ready(Ok(()));
            }

            let Some(spec) = self.spec else {
                return Poll::Ready(Ok(()));
            };
            let remaining = pending.data.len() - pending.offset;
            let chunk = (sample(spec.length) as usize).clamp(1, remaining);
            let end = pending.offset + chunk;

            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &pending.data[pending.offset..end]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            pending.offset += n;

            if pending.offset < pending.data.len() {
                let ms = sample(spec.interval);
                if ms > 0 {
                    pending.delay = Some(Box::pin(tokio::time::sleep(Duration::from_millis(ms))));
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_pending(cx))?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let number = this.writes + 1;
        if this.spec.is_some_and(|s| s.packets.contains(number as i64)) {
            this.writes = number;
            this.pending = Some(Pending {
                data: buf.to_vec(),
                offset: 0,
                delay: None,
            });
            // Start draining now; the rest completes on the next write or flush.
            if let Poll::Ready(Err(e)) = this.poll_pending(cx) {
                return Poll::Ready(Err(e));
            }
            return Poll::Ready(Ok(buf.len()));
        }

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.writes = number;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    /// Records the size of every write it receives
    #[derive(Default)]
    struct Recorder {
        chunks: Vec<usize>,
        bytes: Vec<u8>,
    }

    impl AsyncWrite for Recorder {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            this.chunks.push(buf.len());
            this.bytes.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn spec(packets: (i64, i64), length: (i64, i64), interval: (i64, i64)) -> FragmentSpec {
        FragmentSpec {
            packets: IntRange::new(packets.0, packets.1),
            length: IntRange::new(length.0, length.1),
            interval: IntRange::new(interval.0, interval.1),
        }
    }

    #[tokio::test]
    async fn test_first_write_is_split() {
        let mut stream = FragmentStream::new(Recorder::default(), spec((0, 1), (5, 10), (0, 0)));
        let hello: Vec<u8> = (0..100u8).collect();

        stream.write_all(&hello).await.unwrap();
        stream.write_all(&[7u8; 50]).await.unwrap();
        stream.flush().await.unwrap();

        let rec = stream.into_inner();
        let (first, rest) = rec.chunks.split_at(rec.chunks.len() - 1);
        assert!(first.len() >= 10);
        assert_eq!(first.iter().sum::<usize>(), 100);
        // All but the tail chunk respect the lower bound.
        assert!(first[..first.len() - 1].iter().all(|&c| (5..=10).contains(&c)));
        assert_eq!(rest, &[50]);
        assert_eq!(&rec.bytes[..100], &hello[..]);
    }

    #[tokio::test]
    async fn test_packet_window() {
        let mut stream = FragmentStream::new(Recorder::default(), spec((2, 2), (1, 1), (0, 0)));
        stream.write_all(b"abc").await.unwrap();
        stream.write_all(b"defg").await.unwrap();
        stream.write_all(b"hi").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(stream.writes(), 3);
        let rec = stream.into_inner();
        assert_eq!(rec.chunks, vec![3, 1, 1, 1, 1, 2]);
        assert_eq!(rec.bytes, b"abcdefghi");
    }

    #[tokio::test]
    async fn test_interval_delays_chunks() {
        let mut stream = FragmentStream::new(Recorder::default(), spec((1, 1), (2, 2), (5, 5)));
        let started = tokio::time::Instant::now();
        stream.write_all(&[1u8; 8]).await.unwrap();
        stream.flush().await.unwrap();

        // Four chunks, three pauses.
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(stream.into_inner().chunks, vec![2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_passthrough() {
        let mut stream = FragmentStream::with_spec(Recorder::default(), None);
        stream.write_all(&[0u8; 64]).await.unwrap();
        stream.write_all(&[1u8; 16]).await.unwrap();
        assert_eq!(stream.into_inner().chunks, vec![64, 16]);
    }

    #[test]
    fn test_sample_bounds() {
        for _ in 0..100 {
            let v = sample(IntRange::new(6, 19));
            assert!((6..=19).contains(&v));
        }
        assert_eq!(sample(IntRange::new(3, 3)), 3);
    }
}
