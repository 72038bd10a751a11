//! Connecting through the filesystem socket, end to end.
//!
//! These tests mutate process environment variables, so they all go
//! through one mutex-guarded helper and restore the previous values on
//! drop.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use prism::client::Client;
use prism::server::Display;
use prism::wire::READABLE;

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
        "prism-it-{tag}-{}-{}",
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
fn client_finds_the_server_through_the_runtime_dir() {
    let dir = temp_runtime_dir("discovery");
    let _env = EnvGuard::new(&[
        ("XDG_RUNTIME_DIR", Some(dir.to_str().unwrap())),
        ("WAYLAND_DISPLAY", None),
        ("WAYLAND_SOCKET", None),
    ]);

    let mut server = Display::create().unwrap();
    server.add_socket(Some("prism-it-0")).unwrap();

    // The stream connects against the listen backlog; the server picks
    // it up on its next turn.
    let mut client = Client::connect(Some("prism-it-0")).unwrap();
    server.dispatch(Some(Duration::ZERO)).unwrap();
    assert_eq!(server.client_ids().len(), 1);

    // One more turn flushes the connection preamble to the client.
    server.dispatch(Some(Duration::ZERO)).unwrap();
    client.iterate(READABLE).unwrap();
    assert!(client.granted_range_base().is_some());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn wayland_display_variable_names_the_socket() {
    let dir = temp_runtime_dir("display-var");
    let _env = EnvGuard::new(&[
        ("XDG_RUNTIME_DIR", Some(dir.to_str().unwrap())),
        ("WAYLAND_DISPLAY", Some("prism-it-1")),
        ("WAYLAND_SOCKET", None),
    ]);

    let mut server = Display::create().unwrap();
    server.add_socket(None).unwrap();
    assert!(dir.join("prism-it-1").exists());

    let _client = Client::connect(None).unwrap();
    server.dispatch(Some(Duration::ZERO)).unwrap();
    assert_eq!(server.client_ids().len(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_runtime_dir_is_a_clean_client_error() {
    let _env = EnvGuard::new(&[
        ("XDG_RUNTIME_DIR", None),
        ("WAYLAND_DISPLAY", None),
        ("WAYLAND_SOCKET", None),
    ]);
    assert!(Client::connect(None).is_err());
}
