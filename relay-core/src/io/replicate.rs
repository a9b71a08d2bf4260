//! # Replicating Reader
//!
//! Fans one byte source out to several independent read cursors. Every cursor
//! observes the exact byte sequence of the source from offset zero; the
//! manager buffers only the span between the slowest and the fastest live
//! cursor, so the cost of the tee is confined to however far the cursors
//! drift apart.
//!
//! The intended pattern is "peek the start, then forward the whole thing":
//! one cursor reads a prefix and is dropped, after which the survivor reads
//! straight from the source without touching the buffer at all.
//!
//! Cursors dropped mid-stream release the bytes they were pinning. A cursor
//! abandoned without being dropped keeps the buffer growing, so handles must
//! not be leaked.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, ReadBuf};

struct CursorState {
    id: usize,
    /// Absolute stream offset; monotonically non-decreasing.
    offset: u64,
}

struct ManagerState<R> {
    source: R,
    /// Bytes from absolute offset `base` up to `base + buf.len()`.
    buf: Vec<u8>,
    base: u64,
    cursors: Vec<CursorState>,
    /// Sticky: once the source reports end-of-stream it is never polled again.
    eof: bool,
    /// Tasks parked at the furthest offset while the source was pending.
    waiters: Vec<Waker>,
}

struct Manager<R> {
    state: Mutex<ManagerState<R>>,
}

/// One independent read view over a replicated source.
pub struct ReplicateReader<R> {
    manager: Arc<Manager<R>>,
    id: usize,
}

/// Replicates `source` into `N` cursors, all starting at offset zero.
pub fn replicate<R, const N: usize>(source: R) -> [ReplicateReader<R>; N]
where
    R: AsyncRead + Unpin,
{
    let manager = Arc::new(Manager {
        state: Mutex::new(ManagerState {
            source,
            buf: Vec::new(),
            base: 0,
            cursors: (0..N).map(|id| CursorState { id, offset: 0 }).collect(),
            eof: false,
            waiters: Vec::new(),
        }),
    });
    std::array::from_fn(|id| ReplicateReader {
        manager: manager.clone(),
        id,
    })
}

impl<R> ManagerState<R> {
    /// Absolute offset of the first byte not yet pulled from the source.
    fn furthest(&self) -> u64 {
        self.base + self.buf.len() as u64
    }

    fn offset_of(&self, id: usize) -> u64 {
        self.cursors
            .iter()
            .find(|c| c.id == id)
            .expect("live cursor is registered")
            .offset
    }

    fn advance(&mut self, id: usize, n: u64) {
        let cursor = self
            .cursors
            .iter_mut()
            .find(|c| c.id == id)
            .expect("live cursor is registered");
        cursor.offset += n;
    }

    fn wake_all(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }

    /// Copies buffered bytes at the cursor's offset into `dst` and advances.
    fn read_from_buf(&mut self, id: usize, dst: &mut ReadBuf<'_>) {
        let start = (self.offset_of(id) - self.base) as usize;
        let n = dst.remaining().min(self.buf.len() - start);
        dst.put_slice(&self.buf[start..start + n]);
        self.advance(id, n as u64);
        self.reclaim();
    }

    /// Drops the prefix no cursor can reach once it outweighs the retained
    /// suffix, amortizing the copy-down.
    fn reclaim(&mut self) {
        let min_off = match self.cursors.iter().map(|c| c.offset).min() {
            Some(min_off) => min_off,
            None => return,
        };
        if self.base + self.furthest() < 2 * min_off {
            let reclaimable = (min_off - self.base) as usize;
            self.buf.drain(..reclaimable);
            self.base = min_off;
        }
    }
}

impl<R: AsyncRead + Unpin> ManagerState<R> {
    /// Polls the source into `dst`, honoring the sticky EOF. Returns the
    /// number of fresh bytes. Errors are handed to the calling cursor only;
    /// other cursors re-observe the error on their own next pull.
    fn poll_source(&mut self, cx: &mut Context<'_>, dst: &mut ReadBuf<'_>) -> Poll<io::Result<usize>> {
        if self.eof {
            return Poll::Ready(Ok(0));
        }
        let before = dst.filled().len();
        match Pin::new(&mut self.source).poll_read(cx, dst) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => {
                self.wake_all();
                Poll::Ready(Err(err))
            }
            Poll::Ready(Ok(())) => {
                let n = dst.filled().len() - before;
                if n == 0 {
                    self.eof = true;
                }
                Poll::Ready(Ok(n))
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReplicateReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut state = this.manager.state.lock().unwrap();

        if dst.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let offset = state.offset_of(this.id);
        if offset < state.furthest() {
            state.read_from_buf(this.id, dst);
            return Poll::Ready(Ok(()));
        }

        // At the furthest offset: pull fresh bytes from the source while
        // holding the lock, which serializes upstream reads.
        let sole = state.cursors.len() == 1;
        match state.poll_source(cx, dst) {
            Poll::Pending => {
                state.waiters.push(cx.waker().clone());
                Poll::Pending
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Ready(Ok(0)) => {
                state.wake_all();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(n)) => {
                if !sole {
                    // Retain the fresh bytes for the cursors that lag behind.
                    let filled = dst.filled();
                    let fresh = &filled[filled.len() - n..];
                    state.buf.extend_from_slice(fresh);
                    state.advance(this.id, n as u64);
                }
                state.wake_all();
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl<R> Drop for ReplicateReader<R> {
    fn drop(&mut self) {
        let mut state = self.manager.state.lock().unwrap();
        state.cursors.retain(|c| c.id != self.id);
        state.reclaim();
        // The dropped cursor may have been the one registered with the
        // source; parked cursors must re-poll it themselves.
        state.wake_all();
    }
}

#[cfg(test)]
impl<R> ReplicateReader<R> {
    fn buffered(&self) -> usize {
        self.manager.state.lock().unwrap().buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

    #[tokio::test]
    async fn partial_read_then_drop_does_not_affect_other_cursors() {
        let [mut c0, mut c1] = replicate::<_, 2>(ALPHABET);

        let mut head = [0u8; 10];
        c0.read_exact(&mut head).await.unwrap();
        drop(c0);

        let mut rest = Vec::new();
        c1.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, ALPHABET);
    }

    #[tokio::test]
    async fn concurrent_cursors_drain_identical_bytes() {
        let source: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let cursors = replicate::<_, 20>(std::io::Cursor::new(source.clone()));

        let mut tasks = Vec::new();
        for (i, mut cursor) in cursors.into_iter().enumerate() {
            tasks.push(tokio::spawn(async move {
                let mut out = Vec::new();
                let mut chunk = vec![0u8; i % 7 + 1];
                loop {
                    let n = cursor.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    out.extend_from_slice(&chunk[..n]);
                }
                out
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), source);
        }
    }

    #[tokio::test]
    async fn lockstep_consumers_keep_the_buffer_bounded() {
        let source = vec![7u8; 4096];
        let [mut c0, mut c1] = replicate::<_, 2>(std::io::Cursor::new(source));

        let mut chunk = [0u8; 16];
        loop {
            let n = c0.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            c1.read_exact(&mut chunk[..n]).await.unwrap();
            assert!(c0.buffered() <= 32);
        }
    }

    #[tokio::test]
    async fn surviving_cursor_reads_without_buffering() {
        let source = vec![3u8; 1024];
        let [mut c0, c1] = replicate::<_, 2>(std::io::Cursor::new(source.clone()));
        drop(c1);

        let mut out = Vec::new();
        c0.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, source);
        assert_eq!(c0.buffered(), 0);
    }

    #[tokio::test]
    async fn cursors_track_a_source_that_arrives_in_bursts() {
        let (mut tx, rx) = tokio::io::duplex(8);
        let [mut c0, mut c1] = replicate::<_, 2>(rx);

        let writer = tokio::spawn(async move {
            for chunk in [&b"hel"[..], b"lo ", b"wor", b"ld!"] {
                tx.write_all(chunk).await.unwrap();
            }
        });
        let first = tokio::spawn(async move {
            let mut out = Vec::new();
            c0.read_to_end(&mut out).await.unwrap();
            out
        });
        let second = tokio::spawn(async move {
            let mut out = Vec::new();
            c1.read_to_end(&mut out).await.unwrap();
            out
        });

        writer.await.unwrap();
        assert_eq!(first.await.unwrap(), b"hello world!");
        assert_eq!(second.await.unwrap(), b"hello world!");
    }
}
