//! Append-only byte chain used for connection I/O buffers.
//!
//! A [`ByteChain`] is a rope of [`Bytes`] segments: appending never copies
//! an owned segment, dropping a consumed prefix is O(segments), and the
//! segment list maps directly onto `iovec`s for vectored writes.

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};

/// A cheap slice-of-slices byte buffer with O(1) append and cheap prefix
/// removal.
#[derive(Default)]
pub struct ByteChain {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl ByteChain {
    pub fn new() -> Self {
        ByteChain::default()
    }

    /// Total buffered bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append an owned segment without copying.
    pub fn append(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_back(data);
    }

    /// Append by copying a slice.
    pub fn append_slice(&mut self, data: &[u8]) {
        self.append(Bytes::copy_from_slice(data));
    }

    /// Move every segment of `other` onto the end of `self`.
    pub fn append_chain(&mut self, other: &mut ByteChain) {
        self.len += other.len;
        self.segments.append(&mut other.segments);
        other.len = 0;
    }

    /// Drop the first `n` bytes. Whole consumed segments are released;
    /// a partially consumed segment is advanced in place.
    pub fn drop_front(&mut self, mut n: usize) {
        debug_assert!(n <= self.len, "drop_front past end of chain");
        self.len -= n.min(self.len);
        while n > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            if front.len() <= n {
                n -= front.len();
                self.segments.pop_front();
            } else {
                *front = front.slice(n..);
                n = 0;
            }
        }
    }

    /// Detach the first `n` bytes as a contiguous [`Bytes`]. Cheap when the
    /// request falls within the first segment.
    pub fn split_to(&mut self, n: usize) -> Bytes {
        debug_assert!(n <= self.len, "split_to past end of chain");
        let n = n.min(self.len);
        if n == 0 {
            return Bytes::new();
        }
        if let Some(front) = self.segments.front_mut() {
            if front.len() >= n {
                self.len -= n;
                let out = front.split_to(n);
                if front.is_empty() {
                    self.segments.pop_front();
                }
                return out;
            }
        }
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let front = self.segments.front_mut().expect("chain length mismatch");
            if front.len() <= remaining {
                remaining -= front.len();
                out.extend_from_slice(front);
                self.segments.pop_front();
            } else {
                out.extend_from_slice(&front[..remaining]);
                *front = front.slice(remaining..);
                remaining = 0;
            }
        }
        self.len -= n;
        out.freeze()
    }

    /// Detach the entire contents as a contiguous [`Bytes`].
    pub fn take_all(&mut self) -> Bytes {
        self.split_to(self.len)
    }

    /// Iterate the segments in order, without consuming them.
    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    /// Copy the contents into a `Vec<u8>` without consuming them.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }
}

/// Reading consumes from the front of the chain.
impl io::Read for ByteChain {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(front) = self.segments.front_mut() else {
            return Ok(0);
        };
        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front[..n]);
        if front.len() == n {
            self.segments.pop_front();
        } else {
            *front = front.slice(n..);
        }
        self.len -= n;
        Ok(n)
    }
}

/// Writing appends a copy to the back of the chain.
impl io::Write for ByteChain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for ByteChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteChain")
            .field("len", &self.len)
            .field("segments", &self.segments.len())
            .finish()
    }
}
