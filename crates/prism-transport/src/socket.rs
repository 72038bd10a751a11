//! Display-socket placement and environment resolution.
//!
//! The socket lives at `$XDG_RUNTIME_DIR/<name>`, where `<name>` falls
//! back to `$WAYLAND_DISPLAY` and then to [`DEFAULT_SOCKET_NAME`]. A
//! client may instead inherit a pre-connected descriptor through
//! `WAYLAND_SOCKET`; the variable is cleared once consumed so child
//! processes do not reuse a descriptor they do not hold.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

/// Socket name used when neither the caller nor `WAYLAND_DISPLAY`
/// provides one.
pub const DEFAULT_SOCKET_NAME: &str = "wayland-0";

/// `sockaddr_un.sun_path` holds this many bytes including the
/// terminator on the supported platforms.
pub const MAX_SOCKET_PATH: usize = 108;

fn resolve_name(name: Option<&str>) -> String {
    match name {
        Some(name) => name.to_string(),
        None => std::env::var("WAYLAND_DISPLAY")
            .unwrap_or_else(|_| DEFAULT_SOCKET_NAME.to_string()),
    }
}

fn check_length(path: PathBuf) -> Result<PathBuf> {
    let len = path.as_os_str().len() + 1; // plus terminator
    if len > MAX_SOCKET_PATH {
        return Err(TransportError::NameTooLong {
            path,
            len,
            max: MAX_SOCKET_PATH,
        });
    }
    Ok(path)
}

/// Resolve the full socket path for a client. Fails when the runtime
/// directory is absent so callers report a real cause rather than a
/// success errno.
pub fn socket_path(name: Option<&str>) -> Result<PathBuf> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .map_err(|_| TransportError::RuntimeDirUnset)?;
    check_length(Path::new(&runtime_dir).join(resolve_name(name)))
}

/// Resolve the socket path for a server, falling back to the current
/// directory with a warning when the runtime dir is unset.
pub fn server_socket_path(name: Option<&str>) -> Result<PathBuf> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| {
        warn!("XDG_RUNTIME_DIR not set, falling back to \".\"");
        ".".to_string()
    });
    check_length(Path::new(&runtime_dir).join(resolve_name(name)))
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on an open descriptor with valid flag arguments.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(TransportError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Obtain a connected display socket.
///
/// Prefers a descriptor inherited through `WAYLAND_SOCKET` (cloexec is
/// set and the variable cleared); otherwise dials
/// `$XDG_RUNTIME_DIR/<name>`.
pub fn connect(name: Option<&str>) -> Result<OwnedFd> {
    if let Ok(value) = std::env::var("WAYLAND_SOCKET") {
        std::env::remove_var("WAYLAND_SOCKET");
        let raw: RawFd = value
            .trim()
            .parse()
            .map_err(|_| TransportError::BadSocketVariable { value })?;
        // SAFETY: the parent process handed this descriptor to us by
        // number; we take sole ownership of it here.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        set_cloexec(fd.as_raw_fd())?;
        debug!(fd = raw, "using socket inherited through WAYLAND_SOCKET");
        return Ok(fd);
    }

    let path = socket_path(name)?;
    let stream = UnixStream::connect(&path).map_err(|source| TransportError::Connect {
        path: path.clone(),
        source,
    })?;
    debug!(?path, "connected to display socket");
    Ok(stream.into())
}

/// A listening display socket. The path is unlinked again on drop, but
/// only while it still names the socket created here.
#[derive(Debug)]
pub struct ListeningSocket {
    listener: UnixListener,
    path: PathBuf,
    /// `(dev, ino)` of the socket file as created; drop-time cleanup
    /// re-stats the path and skips unlinking if the identity changed.
    created_inode: Option<(u64, u64)>,
}

impl ListeningSocket {
    /// Bind and listen under the runtime directory. A stale socket
    /// file left by a previous instance is removed first; any other
    /// kind of file at the path is an error.
    pub fn bind(name: Option<&str>) -> Result<Self> {
        let path = server_socket_path(name)?;

        if path.exists() {
            let metadata =
                std::fs::symlink_metadata(&path).map_err(|source| TransportError::Bind {
                    path: path.clone(),
                    source,
                })?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(|source| TransportError::Bind {
                    path: path.clone(),
                    source,
                })?;
            } else {
                return Err(TransportError::Bind {
                    path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a socket",
                    ),
                });
            }
        }

        let listener = UnixListener::bind(&path).map_err(|source| TransportError::Bind {
            path: path.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;

        let created_metadata =
            std::fs::symlink_metadata(&path).map_err(|source| TransportError::Bind {
                path: path.clone(),
                source,
            })?;
        let created_inode = Some((created_metadata.dev(), created_metadata.ino()));

        info!(?path, "listening on display socket");
        Ok(ListeningSocket {
            listener,
            path,
            created_inode,
        })
    }

    /// Accept one pending connection, or `None` when none is queued.
    pub fn accept(&self) -> Result<Option<OwnedFd>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                debug!(path = ?self.path, "accepted client connection");
                Ok(Some(stream.into()))
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(TransportError::Accept(err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for ListeningSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

impl Drop for ListeningSocket {
    fn drop(&mut self) {
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(
                    path = ?self.path,
                    "socket path identity changed; skipping cleanup"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard};

    // Environment variables are process-global; serialize the tests
    // that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn new(vars: &[(&'static str, Option<&str>)]) -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            let saved = vars
                .iter()
                .map(|&(key, value)| {
                    let old = std::env::var(key).ok();
                    match value {
                        Some(value) => std::env::set_var(key, value),
                        None => std::env::remove_var(key),
                    }
                    (key, old)
                })
                .collect();
            EnvGuard { _lock: lock, saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(value) => std::env::set_var(key, value),
                    None => std::env::remove_var(key),
                }
            }
        }
    }

    fn temp_runtime_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "prism-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    #[test]
    fn client_path_requires_runtime_dir() {
        let _env = EnvGuard::new(&[("XDG_RUNTIME_DIR", None), ("WAYLAND_DISPLAY", None)]);
        assert!(matches!(
            socket_path(None),
            Err(TransportError::RuntimeDirUnset)
        ));
    }

    #[test]
    fn name_defaults_follow_environment() {
        let dir = temp_runtime_dir("names");
        let _env = EnvGuard::new(&[
            ("XDG_RUNTIME_DIR", Some(dir.to_str().unwrap())),
            ("WAYLAND_DISPLAY", Some("wayland-7")),
        ]);

        assert_eq!(socket_path(None).unwrap(), dir.join("wayland-7"));
        assert_eq!(
            socket_path(Some("custom-0")).unwrap(),
            dir.join("custom-0")
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn default_name_used_without_display_variable() {
        let dir = temp_runtime_dir("default");
        let _env = EnvGuard::new(&[
            ("XDG_RUNTIME_DIR", Some(dir.to_str().unwrap())),
            ("WAYLAND_DISPLAY", None),
        ]);

        assert_eq!(
            socket_path(None).unwrap(),
            dir.join(DEFAULT_SOCKET_NAME)
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn oversized_path_is_rejected() {
        let long_dir = format!("/tmp/{}", "a".repeat(120));
        let _env = EnvGuard::new(&[
            ("XDG_RUNTIME_DIR", Some(long_dir.as_str())),
            ("WAYLAND_DISPLAY", None),
        ]);
        assert!(matches!(
            socket_path(None),
            Err(TransportError::NameTooLong { .. })
        ));
    }

    #[test]
    fn bad_socket_variable_is_rejected() {
        let _env = EnvGuard::new(&[("WAYLAND_SOCKET", Some("not-a-number"))]);
        assert!(matches!(
            connect(None),
            Err(TransportError::BadSocketVariable { .. })
        ));
        // The variable must be cleared even on failure.
        assert!(std::env::var("WAYLAND_SOCKET").is_err());
    }

    #[test]
    fn inherited_socket_is_consumed_and_cloexec() {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let raw = theirs.as_raw_fd();
        // Leak `theirs` into a raw fd the connect path will adopt.
        std::mem::forget(theirs);

        let value = raw.to_string();
        let _env = EnvGuard::new(&[("WAYLAND_SOCKET", Some(value.as_str()))]);

        let fd = connect(None).unwrap();
        assert_eq!(fd.as_raw_fd(), raw);
        assert!(std::env::var("WAYLAND_SOCKET").is_err());

        // SAFETY: querying flags on a descriptor we own.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert!(flags >= 0 && flags & libc::FD_CLOEXEC != 0);

        drop(ours);
    }

    #[test]
    fn bind_accept_connect_roundtrip() {
        let dir = temp_runtime_dir("bind");
        let _env = EnvGuard::new(&[
            ("XDG_RUNTIME_DIR", Some(dir.to_str().unwrap())),
            ("WAYLAND_DISPLAY", None),
            ("WAYLAND_SOCKET", None),
        ]);

        let listener = ListeningSocket::bind(Some("test-display")).unwrap();
        assert!(listener.path().exists());
        assert!(listener.accept().unwrap().is_none(), "no client queued yet");

        let client = connect(Some("test-display")).unwrap();
        let accepted = listener.accept().unwrap().expect("client should be queued");
        assert!(client.as_raw_fd() >= 0 && accepted.as_raw_fd() >= 0);

        let path = listener.path().to_path_buf();
        drop(listener);
        assert!(!path.exists(), "socket path should be unlinked on drop");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn drop_does_not_remove_replaced_path() {
        let dir = temp_runtime_dir("drop-race");
        let _env = EnvGuard::new(&[
            ("XDG_RUNTIME_DIR", Some(dir.to_str().unwrap())),
            ("WAYLAND_DISPLAY", None),
        ]);

        let listener = ListeningSocket::bind(Some("raced")).unwrap();
        let path = listener.path().to_path_buf();
        assert!(path.exists());

        // Replace the path while the listener is alive.
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"replacement-file").unwrap();

        drop(listener);
        assert!(
            path.exists(),
            "drop must not remove the path once its identity changed"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn bind_refuses_non_socket_file() {
        let dir = temp_runtime_dir("regular");
        let _env = EnvGuard::new(&[
            ("XDG_RUNTIME_DIR", Some(dir.to_str().unwrap())),
            ("WAYLAND_DISPLAY", None),
        ]);

        std::fs::write(dir.join("blocked"), b"regular file").unwrap();
        assert!(matches!(
            ListeningSocket::bind(Some("blocked")),
            Err(TransportError::Bind { .. })
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
