use bytes::{Buf, Bytes};
use std::collections::VecDeque;

/// Segmented write queue.
///
/// Outbound bytes are held as refcounted segments and consumed from the
/// front as the socket accepts them, so draining advances a cursor instead
/// of re-slicing the head of one large contiguous buffer.
#[derive(Debug, Default)]
pub struct WriteQueue {
    segs: VecDeque<Bytes>,
    len: usize,
}

impl WriteQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
        }
    }

    /// Total queued bytes across all segments.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segs.push_back(bytes);
    }

    /// Contiguous view of the front segment, if any.
    #[must_use]
    pub fn front(&self) -> Option<&[u8]> {
        self.segs.front().map(Bytes::as_ref)
    }

    /// Advance the queue by `n` bytes, dropping fully-consumed segments.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    pub fn advance(&mut self, mut n: usize) {
        assert!(n <= self.len);
        self.len -= n;

        while n > 0 {
            let Some(mut front) = self.segs.pop_front() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                continue;
            }
            // partially consumed
            front.advance(n);
            self.segs.push_front(front);
            break;
        }
    }

    pub fn clear(&mut self) {
        self.segs.clear();
        self.len = 0;
    }
}
