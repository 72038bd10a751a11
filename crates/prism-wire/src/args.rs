use std::ffi::CString;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};

/// Signed 24.8 fixed-point number, the wire representation of
/// fractional coordinates.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed(i32);

impl Fixed {
    pub fn from_raw(raw: i32) -> Self {
        Fixed(raw)
    }

    pub fn from_int(value: i32) -> Self {
        Fixed(value << 8)
    }

    pub fn from_f64(value: f64) -> Self {
        Fixed((value * 256.0).round() as i32)
    }

    pub fn to_raw(self) -> i32 {
        self.0
    }

    /// Truncates toward negative infinity.
    pub fn to_int(self) -> i32 {
        self.0 >> 8
    }

    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }
}

impl fmt::Debug for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fixed({})", self.to_f64())
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// The alphabet of wire signature codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentType {
    /// `i` — signed 32-bit integer.
    Int,
    /// `u` — unsigned 32-bit integer.
    Uint,
    /// `f` — signed 24.8 fixed point.
    Fixed,
    /// `s` — null-terminated string, possibly absent.
    Str,
    /// `o` — reference to an existing object, 0 for null.
    Object,
    /// `n` — id of an object created by this message.
    NewId,
    /// `a` — length-prefixed byte array.
    Array,
    /// `h` — file descriptor carried in ancillary data.
    Fd,
}

impl ArgumentType {
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'i' => Some(ArgumentType::Int),
            'u' => Some(ArgumentType::Uint),
            'f' => Some(ArgumentType::Fixed),
            's' => Some(ArgumentType::Str),
            'o' => Some(ArgumentType::Object),
            'n' => Some(ArgumentType::NewId),
            'a' => Some(ArgumentType::Array),
            'h' => Some(ArgumentType::Fd),
            _ => None,
        }
    }

    pub fn code(self) -> char {
        match self {
            ArgumentType::Int => 'i',
            ArgumentType::Uint => 'u',
            ArgumentType::Fixed => 'f',
            ArgumentType::Str => 's',
            ArgumentType::Object => 'o',
            ArgumentType::NewId => 'n',
            ArgumentType::Array => 'a',
            ArgumentType::Fd => 'h',
        }
    }
}

/// One decoded or to-be-encoded message argument.
///
/// Object references are carried as raw ids; liveness is resolved
/// against the id map at encode/decode time, never cached. A held
/// file descriptor is owned and closes when the argument is dropped.
#[derive(Debug)]
pub enum Argument {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    Str(Option<CString>),
    Object(u32),
    NewId(u32),
    Array(Vec<u8>),
    Fd(OwnedFd),
}

impl Argument {
    pub fn kind(&self) -> ArgumentType {
        match self {
            Argument::Int(_) => ArgumentType::Int,
            Argument::Uint(_) => ArgumentType::Uint,
            Argument::Fixed(_) => ArgumentType::Fixed,
            Argument::Str(_) => ArgumentType::Str,
            Argument::Object(_) => ArgumentType::Object,
            Argument::NewId(_) => ArgumentType::NewId,
            Argument::Array(_) => ArgumentType::Array,
            Argument::Fd(_) => ArgumentType::Fd,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Argument::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u32> {
        match self {
            Argument::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_fixed(&self) -> Option<Fixed> {
        match self {
            Argument::Fixed(v) => Some(*v),
            _ => None,
        }
    }

    /// The string payload, without the terminator. `None` for a null
    /// string argument or a non-string argument.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Argument::Str(Some(s)) => s.to_str().ok(),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<u32> {
        match self {
            Argument::Object(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_new_id(&self) -> Option<u32> {
        match self {
            Argument::NewId(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[u8]> {
        match self {
            Argument::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_fd(&self) -> Option<&OwnedFd> {
        match self {
            Argument::Fd(fd) => Some(fd),
            _ => None,
        }
    }

    pub fn take_fd(self) -> Option<OwnedFd> {
        match self {
            Argument::Fd(fd) => Some(fd),
            _ => None,
        }
    }
}

impl PartialEq for Argument {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Argument::Int(a), Argument::Int(b)) => a == b,
            (Argument::Uint(a), Argument::Uint(b)) => a == b,
            (Argument::Fixed(a), Argument::Fixed(b)) => a == b,
            (Argument::Str(a), Argument::Str(b)) => a == b,
            (Argument::Object(a), Argument::Object(b)) => a == b,
            (Argument::NewId(a), Argument::NewId(b)) => a == b,
            (Argument::Array(a), Argument::Array(b)) => a == b,
            (Argument::Fd(a), Argument::Fd(b)) => a.as_raw_fd() == b.as_raw_fd(),
            _ => false,
        }
    }
}
