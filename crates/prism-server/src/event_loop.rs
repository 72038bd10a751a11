//! Thin readiness layer over `poll(2)`.
//!
//! The display builds one entry per listening socket and per client
//! connection each turn; the returned masks line up with the input
//! entries. Interruption retries internally so callers only ever see
//! real failures.

use std::io;
use std::os::fd::RawFd;

use prism_wire::{READABLE, WRITABLE};

#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEntry {
    pub fd: RawFd,
    pub mask: u32,
}

/// Wait for readiness on every entry. `timeout_ms` of -1 blocks
/// forever. Returns one ready-mask per entry, index-aligned.
pub(crate) fn poll(entries: &[PollEntry], timeout_ms: i32) -> io::Result<Vec<u32>> {
    let mut fds: Vec<libc::pollfd> = entries
        .iter()
        .map(|entry| {
            let mut events = 0i16;
            if entry.mask & READABLE != 0 {
                events |= libc::POLLIN;
            }
            if entry.mask & WRITABLE != 0 {
                events |= libc::POLLOUT;
            }
            libc::pollfd {
                fd: entry.fd,
                events,
                revents: 0,
            }
        })
        .collect();

    loop {
        // SAFETY: `fds` is a valid, writable pollfd array whose length
        // matches the count passed in.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break;
    }

    Ok(fds
        .iter()
        .map(|pollfd| {
            let mut ready = 0;
            if pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                ready |= READABLE;
            }
            if pollfd.revents & libc::POLLOUT != 0 {
                ready |= WRITABLE;
            }
            ready
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn readable_end_reports_readiness() {
        let (mut writer, reader) = UnixStream::pair().unwrap();
        writer.write_all(b"x").unwrap();

        let entries = [
            PollEntry {
                fd: reader.as_raw_fd(),
                mask: READABLE,
            },
            PollEntry {
                fd: writer.as_raw_fd(),
                mask: WRITABLE,
            },
        ];
        let ready = poll(&entries, 1000).unwrap();
        assert!(ready[0] & READABLE != 0);
        assert!(ready[1] & WRITABLE != 0);
    }

    #[test]
    fn timeout_returns_empty_masks() {
        let (_writer, reader) = UnixStream::pair().unwrap();
        let entries = [PollEntry {
            fd: reader.as_raw_fd(),
            mask: READABLE,
        }];
        let ready = poll(&entries, 0).unwrap();
        assert_eq!(ready[0], 0);
    }
}
