//! One endpoint's half of a stream socket connection.
//!
//! The connection owns the socket and a bounded buffer per direction.
//! All socket I/O is non-blocking; readiness is the owning endpoint's
//! problem, which reads the [`interest`](Connection::interest) mask
//! back after every operation and re-registers with its poll loop.
//! File descriptors travel as `SCM_RIGHTS` control messages attached
//! at arbitrary byte boundaries; the receive path tags each descriptor
//! with the inbound byte offset it arrived at so discarded messages
//! can drop exactly the descriptors delivered inside them.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::debug;

use crate::codec::{MessageHeader, HEADER_SIZE};
use crate::error::{Result, WireError};
use crate::ring::{InFdBuffer, OutFdBuffer, WireBuffer, MAX_FDS_IN_FLIGHT};

/// Poll-interest bit: the connection wants to read.
pub const READABLE: u32 = 0x01;
/// Poll-interest bit: the connection has buffered output to write.
pub const WRITABLE: u32 = 0x02;

/// Connection lifecycle. `Draining` means the peer half-closed while
/// inbound bytes are still buffered; `Closing` means inbound is empty
/// and only buffered output remains; `Dead` rejects everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Draining,
    Closing,
    Dead,
}

/// Ancillary control buffer sized for [`MAX_FDS_IN_FLIGHT`]
/// descriptors plus the cmsg header, u64-aligned as `cmsg(3)`
/// requires.
const CMSG_BUF_LEN: usize = 256;

#[derive(Debug)]
pub struct Connection {
    fd: OwnedFd,
    input: WireBuffer,
    output: WireBuffer,
    fds_in: InFdBuffer,
    fds_out: OutFdBuffer,
    /// Total bytes ever appended to the inbound buffer.
    in_delivered: u64,
    /// Total inbound bytes consumed by the dispatcher.
    in_consumed: u64,
    state: ConnectionState,
    interest: u32,
}

impl Connection {
    /// Wrap a connected stream socket. The socket is switched to
    /// non-blocking mode; the caller keeps ownership semantics simple
    /// by handing the descriptor over entirely.
    pub fn new(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Connection {
            fd,
            input: WireBuffer::new(),
            output: WireBuffer::new(),
            fds_in: InFdBuffer::new(),
            fds_out: OutFdBuffer::new(),
            in_delivered: 0,
            in_consumed: 0,
            state: ConnectionState::Open,
            interest: READABLE,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current poll interest; recomputed by every buffer operation.
    pub fn interest(&self) -> u32 {
        self.interest
    }

    /// Bytes buffered inbound and not yet consumed.
    pub fn pending(&self) -> usize {
        self.input.len()
    }

    pub fn incoming_fds(&mut self) -> &mut InFdBuffer {
        &mut self.fds_in
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.state == ConnectionState::Dead {
            return Err(WireError::Closed);
        }
        Ok(())
    }

    fn mark_dead(&mut self) {
        self.state = ConnectionState::Dead;
        self.interest = 0;
    }

    fn update_interest(&mut self) {
        if self.state == ConnectionState::Dead {
            self.interest = 0;
            return;
        }
        let mut interest = 0;
        if self.state == ConnectionState::Open && self.input.space() > 0 {
            interest |= READABLE;
        }
        if !self.output.is_empty() {
            interest |= WRITABLE;
        }
        self.interest = interest;
    }

    fn settle_state(&mut self) {
        if self.state == ConnectionState::Draining && self.input.is_empty() {
            self.state = ConnectionState::Closing;
        }
        if self.state == ConnectionState::Closing && self.output.is_empty() {
            self.mark_dead();
        }
        self.update_interest();
    }

    /// Perform at most one non-blocking read and/or write, as directed
    /// by `mask`. Returns the number of inbound bytes buffered after
    /// the operation. Any error other than would-block/interruption is
    /// fatal for the connection.
    pub fn drain(&mut self, mask: u32) -> Result<usize> {
        self.ensure_alive()?;

        if mask & WRITABLE != 0 {
            match self.flush_once() {
                Ok(()) | Err(WireError::WouldBlock) => {}
                Err(err) => {
                    self.mark_dead();
                    return Err(err);
                }
            }
        }

        if mask & READABLE != 0 && self.state == ConnectionState::Open {
            let space = self.input.space();
            if space > 0 {
                let mut scratch = [0u8; crate::ring::WIRE_BUFFER_CAPACITY];
                let mut received = Vec::new();
                match recv_with_fds(self.fd.as_raw_fd(), &mut scratch[..space], &mut received) {
                    Ok(0) => {
                        debug!(fd = self.fd.as_raw_fd(), "peer half-closed");
                        self.state = ConnectionState::Draining;
                    }
                    Ok(n) => {
                        let batch_offset = self.in_delivered;
                        let written = self.input.write(&scratch[..n]);
                        debug_assert_eq!(written, n);
                        self.in_delivered += n as u64;
                        for fd in received {
                            self.fds_in.push(batch_offset, fd)?;
                        }
                    }
                    Err(err) if would_block(&err) || interrupted(&err) => {}
                    Err(err) => {
                        self.mark_dead();
                        return Err(WireError::Io(err));
                    }
                }
            }
        }

        self.settle_state();
        Ok(self.input.len())
    }

    /// Queue a complete encoded message plus its descriptors. When the
    /// outbound buffer cannot hold the bytes, one non-blocking flush is
    /// attempted; if space is still short the message is not queued and
    /// the caller gets would-block with writable interest raised.
    pub fn send(&mut self, bytes: &[u8], fds: Vec<OwnedFd>) -> Result<()> {
        self.ensure_alive()?;

        if bytes.len() > self.output.space() || self.fds_out.len() + fds.len() > MAX_FDS_IN_FLIGHT
        {
            match self.flush_once() {
                Ok(()) | Err(WireError::WouldBlock) => {}
                Err(err) => {
                    self.mark_dead();
                    return Err(err);
                }
            }
        }
        if bytes.len() > self.output.space() {
            self.interest |= WRITABLE;
            return Err(WireError::WouldBlock);
        }
        if self.fds_out.len() + fds.len() > MAX_FDS_IN_FLIGHT {
            return Err(WireError::FdOverflow);
        }

        let written = self.output.write(bytes);
        debug_assert_eq!(written, bytes.len());
        for fd in fds {
            self.fds_out.push(fd)?;
        }
        self.update_interest();
        Ok(())
    }

    /// Write buffered output until empty or the socket stops accepting.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_alive()?;
        while !self.output.is_empty() {
            match self.flush_once() {
                Ok(()) => {}
                Err(WireError::WouldBlock) => {
                    self.interest |= WRITABLE;
                    return Err(WireError::WouldBlock);
                }
                Err(err) => {
                    self.mark_dead();
                    return Err(err);
                }
            }
        }
        self.settle_state();
        Ok(())
    }

    fn flush_once(&mut self) -> Result<()> {
        if self.output.is_empty() {
            return Ok(());
        }
        let fds = self.fds_out.take_all();
        let (front, back) = self.output.as_slices();
        match send_with_fds(self.fd.as_raw_fd(), front, back, &fds) {
            Ok(n) => {
                // A successful sendmsg delivered every attached
                // descriptor; the kernel holds its own references now.
                self.output.consume(n)?;
                self.settle_state();
                Ok(())
            }
            Err(err) if would_block(&err) || interrupted(&err) => {
                self.fds_out.requeue(fds);
                Err(WireError::WouldBlock)
            }
            Err(err) => Err(WireError::Io(err)),
        }
    }

    /// Peek the next message header if one is fully buffered. The
    /// header is validated; a framing violation kills the connection.
    pub fn peek_header(&mut self) -> Result<Option<MessageHeader>> {
        if self.input.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut raw = [0u8; HEADER_SIZE];
        self.input.copy(&mut raw)?;
        let header = MessageHeader::parse(raw);
        if let Err(err) = header.validate() {
            self.mark_dead();
            return Err(err);
        }
        Ok(Some(header))
    }

    /// Whether a whole message of `size` bytes is buffered.
    pub fn has_complete(&self, size: usize) -> bool {
        self.input.len() >= size
    }

    /// Consume a complete message and return its payload (the bytes
    /// after the header).
    pub fn take_message(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; size];
        self.input.copy(&mut bytes)?;
        self.input.consume(size)?;
        self.in_consumed += size as u64;
        bytes.drain(..HEADER_SIZE);
        self.settle_state();
        Ok(bytes)
    }

    /// Consume a complete message without decoding it, closing any
    /// descriptors that were delivered inside its byte range. This is
    /// the zombie-absorption path.
    pub fn discard_message(&mut self, size: usize) -> Result<()> {
        self.input.consume(size)?;
        self.in_consumed += size as u64;
        self.fds_in.discard_up_to(self.in_consumed);
        self.settle_state();
        Ok(())
    }

    /// Block until the socket is ready for `mask`, or `timeout_ms`
    /// elapses (negative means forever). Returns the ready mask.
    pub fn wait(&self, mask: u32, timeout_ms: i32) -> Result<u32> {
        self.ensure_alive()?;
        let mut events = 0i16;
        if mask & READABLE != 0 {
            events |= libc::POLLIN;
        }
        if mask & WRITABLE != 0 {
            events |= libc::POLLOUT;
        }
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events,
            revents: 0,
        };
        loop {
            // SAFETY: `pollfd` is a valid, writable pollfd array of
            // length 1 for the duration of the call.
            let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if interrupted(&err) {
                    continue;
                }
                return Err(WireError::Io(err));
            }
            let mut ready = 0;
            if pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                ready |= READABLE;
            }
            if pollfd.revents & libc::POLLOUT != 0 {
                ready |= WRITABLE;
            }
            return Ok(ready);
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on an owned, open descriptor with valid flag
    // arguments.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(WireError::Io(io::Error::last_os_error()));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(WireError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Non-blocking `recvmsg` collecting `SCM_RIGHTS` descriptors.
fn recv_with_fds(fd: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u64; CMSG_BUF_LEN / 8];

    // SAFETY: msghdr is fully initialized below before use.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = CMSG_BUF_LEN as _;

    // SAFETY: `msg` points at a valid iovec and control buffer that
    // outlive the call; `fd` is an open socket.
    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the kernel filled `msg`'s control area; CMSG_* walk it
    // within the bounds recvmsg reported.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let payload_len =
                    (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let count = payload_len / mem::size_of::<RawFd>();
                for i in 0..count {
                    let mut raw: RawFd = 0;
                    std::ptr::copy_nonoverlapping(
                        data.add(i * mem::size_of::<RawFd>()),
                        (&mut raw as *mut RawFd).cast(),
                        mem::size_of::<RawFd>(),
                    );
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(n as usize)
}

/// Non-blocking `sendmsg` attaching `fds` as one `SCM_RIGHTS` batch.
/// `front`/`back` are the two spans of the outbound ring.
fn send_with_fds(fd: RawFd, front: &[u8], back: &[u8], fds: &[OwnedFd]) -> io::Result<usize> {
    let mut iov = [
        libc::iovec {
            iov_base: front.as_ptr() as *mut _,
            iov_len: front.len(),
        },
        libc::iovec {
            iov_base: back.as_ptr() as *mut _,
            iov_len: back.len(),
        },
    ];
    let iovlen = if back.is_empty() { 1 } else { 2 };

    let mut cmsg_buf = [0u64; CMSG_BUF_LEN / 8];
    // SAFETY: msghdr is fully initialized below before use.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iovlen;

    if !fds.is_empty() {
        // SAFETY: the control buffer is large enough for
        // MAX_FDS_IN_FLIGHT descriptors and properly aligned; CMSG_*
        // macros compute offsets within it.
        unsafe {
            let space = libc::CMSG_SPACE((fds.len() * mem::size_of::<RawFd>()) as u32) as usize;
            debug_assert!(space <= CMSG_BUF_LEN);
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = space as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as u32) as _;
            let data = libc::CMSG_DATA(cmsg);
            for (i, owned) in fds.iter().enumerate() {
                let raw = owned.as_raw_fd();
                std::ptr::copy_nonoverlapping(
                    (&raw as *const RawFd).cast(),
                    data.add(i * mem::size_of::<RawFd>()),
                    mem::size_of::<RawFd>(),
                );
            }
        }
    }

    // SAFETY: `msg` references valid iovecs and (optionally) a valid
    // control buffer; `fd` is an open socket.
    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
