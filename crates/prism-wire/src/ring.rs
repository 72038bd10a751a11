//! Fixed-capacity buffers between the codec and the socket.
//!
//! Bytes wait in a bounded FIFO per direction; file descriptors ride in
//! small side queues. Inbound descriptors are tagged with the byte
//! offset they arrived at so a message discarded without decoding can
//! drop the descriptors delivered inside it.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;

use crate::error::{Result, WireError};

/// Capacity of each byte buffer.
pub const WIRE_BUFFER_CAPACITY: usize = 4096;

/// Maximum file descriptors queued per direction.
pub const MAX_FDS_IN_FLIGHT: usize = 32;

/// Bounded byte FIFO with peek/consume semantics.
#[derive(Debug)]
pub struct WireBuffer {
    data: VecDeque<u8>,
}

impl Default for WireBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl WireBuffer {
    pub fn new() -> Self {
        WireBuffer {
            data: VecDeque::with_capacity(WIRE_BUFFER_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Free space before the buffer is full.
    pub fn space(&self) -> usize {
        WIRE_BUFFER_CAPACITY - self.data.len()
    }

    /// Append as much of `src` as fits; the return value is how much
    /// was taken. A short count signals back-pressure to the caller.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let take = src.len().min(self.space());
        self.data.extend(&src[..take]);
        take
    }

    /// Copy the next `dst.len()` bytes without consuming them.
    pub fn copy(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() > self.data.len() {
            return Err(WireError::WouldBlock);
        }
        let (front, back) = self.data.as_slices();
        if dst.len() <= front.len() {
            dst.copy_from_slice(&front[..dst.len()]);
        } else {
            let split = front.len();
            let dst_len = dst.len();
            dst[..split].copy_from_slice(front);
            dst[split..].copy_from_slice(&back[..dst_len - split]);
        }
        Ok(())
    }

    /// Release `n` bytes previously validated by [`copy`](Self::copy).
    pub fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.data.len() {
            return Err(WireError::BadArgument {
                reason: "consume beyond buffered data",
            });
        }
        self.data.drain(..n);
        Ok(())
    }

    /// Contiguous views of the buffered bytes, front first.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        self.data.as_slices()
    }
}

/// Inbound descriptor queue; each entry remembers the total-stream
/// byte offset at which it was delivered.
#[derive(Debug, Default)]
pub struct InFdBuffer {
    fds: VecDeque<(u64, OwnedFd)>,
}

impl InFdBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn push(&mut self, offset: u64, fd: OwnedFd) -> Result<()> {
        if self.fds.len() >= MAX_FDS_IN_FLIGHT {
            return Err(WireError::FdOverflow);
        }
        self.fds.push_back((offset, fd));
        Ok(())
    }

    /// Take the oldest descriptor, transferring ownership to the codec.
    pub fn pop(&mut self) -> Option<OwnedFd> {
        self.fds.pop_front().map(|(_, fd)| fd)
    }

    /// Close descriptors delivered before `offset`. Used when bytes are
    /// consumed without decoding, so orphaned descriptors do not leak
    /// into the next message.
    pub fn discard_up_to(&mut self, offset: u64) {
        while matches!(self.fds.front(), Some((delivered, _)) if *delivered < offset) {
            drop(self.fds.pop_front());
        }
    }
}

/// Outbound descriptor queue, drained by the next socket flush.
#[derive(Debug, Default)]
pub struct OutFdBuffer {
    fds: VecDeque<OwnedFd>,
}

impl OutFdBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn push(&mut self, fd: OwnedFd) -> Result<()> {
        if self.fds.len() >= MAX_FDS_IN_FLIGHT {
            return Err(WireError::FdOverflow);
        }
        self.fds.push_back(fd);
        Ok(())
    }

    /// Take every queued descriptor for one ancillary batch.
    pub fn take_all(&mut self) -> Vec<OwnedFd> {
        self.fds.drain(..).collect()
    }

    /// Requeue descriptors after a flush that could not send them.
    pub fn requeue(&mut self, fds: Vec<OwnedFd>) {
        for fd in fds.into_iter().rev() {
            self.fds.push_front(fd);
        }
    }
}
