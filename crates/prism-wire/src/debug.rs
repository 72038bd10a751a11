//! Human-readable protocol traces.
//!
//! When `WAYLAND_DEBUG` is set, each endpoint prints one line per sent
//! and received message to stderr with the decoded argument tuple.
//! The flag is sampled once at endpoint construction; there is no
//! process-global trace state.

use std::fmt::Write as _;
use std::os::fd::AsRawFd;

use crate::args::Argument;
use crate::interface::MessageDesc;

/// Message direction, for the trace prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Whether tracing was requested through the environment. Empty and
/// `"0"` values count as unset.
pub fn debug_enabled() -> bool {
    std::env::var_os("WAYLAND_DEBUG")
        .map(|value| !value.is_empty() && value != "0")
        .unwrap_or(false)
}

/// Render one trace line: `iface@id.message(arg, arg, ...)`, with a
/// `->` marker on outgoing messages.
pub fn message_trace(
    direction: Direction,
    interface: &str,
    id: u32,
    desc: &MessageDesc,
    args: &[Argument],
) -> String {
    let mut line = String::new();
    if direction == Direction::Send {
        line.push_str("-> ");
    }
    let _ = write!(line, "{interface}@{id}.{}(", desc.name);
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push_str(", ");
        }
        format_arg(&mut line, arg);
    }
    line.push(')');
    line
}

fn format_arg(line: &mut String, arg: &Argument) {
    let _ = match arg {
        Argument::Int(v) => write!(line, "{v}"),
        Argument::Uint(v) => write!(line, "{v}"),
        Argument::Fixed(v) => write!(line, "{v}"),
        Argument::Str(Some(s)) => write!(line, "{:?}", s.to_string_lossy()),
        Argument::Str(None) => write!(line, "nil"),
        Argument::Object(0) => write!(line, "nil"),
        Argument::Object(id) => write!(line, "object@{id}"),
        Argument::NewId(id) => write!(line, "new id @{id}"),
        Argument::Array(data) => write!(line, "array[{}]", data.len()),
        Argument::Fd(fd) => write!(line, "fd {}", fd.as_raw_fd()),
    };
}

/// Print a trace line. Goes straight to stderr so traces appear even
/// without a logging subscriber installed.
pub fn emit(line: &str) {
    eprintln!("{line}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    static DESC: MessageDesc = MessageDesc {
        name: "attach",
        signature: "ouis",
        child_interface: None,
    };

    #[test]
    fn trace_line_shape() {
        let args = vec![
            Argument::Object(4),
            Argument::Uint(7),
            Argument::Int(-2),
            Argument::Str(Some(CString::new("left").unwrap())),
        ];
        let line = message_trace(Direction::Receive, "surface", 9, &DESC, &args);
        assert_eq!(line, "surface@9.attach(object@4, 7, -2, \"left\")");
    }

    #[test]
    fn outgoing_lines_are_marked() {
        let line = message_trace(Direction::Send, "display", 1, &DESC, &[]);
        assert!(line.starts_with("-> display@1.attach("));
    }

    #[test]
    fn nil_objects_and_strings() {
        static S: MessageDesc = MessageDesc {
            name: "m",
            signature: "os",
            child_interface: None,
        };
        let args = vec![Argument::Object(0), Argument::Str(None)];
        let line = message_trace(Direction::Receive, "x", 2, &S, &args);
        assert_eq!(line, "x@2.m(nil, nil)");
    }

    #[test]
    fn exactly_one_line() {
        let args = vec![Argument::Array(vec![0; 9])];
        static A: MessageDesc = MessageDesc {
            name: "data",
            signature: "a",
            child_interface: None,
        };
        let line = message_trace(Direction::Send, "buffer", 3, &A, &args);
        assert!(!line.contains('\n'));
        assert_eq!(line, "-> buffer@3.data(array[9])");
    }
}
