//! Signature-driven message encoding and decoding.
//!
//! Every message is an 8-byte header followed by a padded payload:
//! `receiver: u32`, then `(size << 16) | opcode: u32`, native byte
//! order (the protocol never crosses a host boundary). `size` counts
//! the header and must be a multiple of four.
//!
//! Encoding runs in two phases. [`prepare_message`] validates the
//! argument vector against the signature and allocates-and-registers
//! any fresh new-id, so the caller can trace the resolved message;
//! [`encode_message`] then produces the byte buffer and the ordered
//! list of descriptors to pass. Decoding is strict: any signature
//! violation yields a typed error, and object registrations performed
//! for `n` arguments are rolled back when a later argument fails.

use std::ffi::CString;
use std::os::fd::OwnedFd;

use bytes::BytesMut;

use crate::args::{Argument, ArgumentType, Fixed};
use crate::error::{Result, WireError};
use crate::interface::{Interface, MessageDesc};
use crate::ring::{InFdBuffer, WIRE_BUFFER_CAPACITY};

/// Bytes in the fixed message header.
pub const HEADER_SIZE: usize = 8;

/// Parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub receiver: u32,
    pub opcode: u16,
    /// Total message size including the header.
    pub size: usize,
}

impl MessageHeader {
    pub fn parse(bytes: [u8; HEADER_SIZE]) -> Self {
        let receiver = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let word = u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        MessageHeader {
            receiver,
            opcode: (word & 0xffff) as u16,
            size: (word >> 16) as usize,
        }
    }

    /// Reject sizes the framing rules forbid. A message that can never
    /// fit the wire buffer would stall the connection forever, so it is
    /// a framing error too.
    pub fn validate(&self) -> Result<()> {
        if self.size < HEADER_SIZE || self.size % 4 != 0 || self.size > WIRE_BUFFER_CAPACITY {
            return Err(WireError::Framing {
                id: self.receiver,
                size: self.size,
            });
        }
        Ok(())
    }
}

/// What a registry knows about an id.
#[derive(Debug, Clone, Copy)]
pub enum ObjectStatus {
    Vacant,
    Live(&'static Interface),
    Zombie,
}

/// The codec's seam onto an endpoint's object map.
///
/// The client allocates ids from the client side of the space; the
/// server never allocates during encode (events carry ids of resources
/// created up front).
pub trait ObjectRegistry {
    fn status(&self, id: u32) -> ObjectStatus;

    /// Allocate a fresh local id and register a record for it.
    fn allocate(&mut self, interface: &'static Interface) -> Result<u32>;

    /// Register a record at a peer-nominated id.
    fn register(&mut self, id: u32, interface: &'static Interface) -> Result<()>;

    /// Roll back a registration made during a failed decode.
    fn unregister(&mut self, id: u32);
}

fn signature_types(desc: &MessageDesc) -> Result<Vec<ArgumentType>> {
    desc.signature
        .chars()
        .map(|code| {
            ArgumentType::from_code(code).ok_or(WireError::BadMessage {
                reason: "unknown signature code",
            })
        })
        .collect()
}

/// Validate `args` against the signature and resolve new-id arguments.
///
/// A `NewId(0)` is replaced by a freshly allocated id (registered under
/// the message's child interface before any byte is buffered); the
/// allocated id, if any, is returned. Non-zero new ids and object
/// references must be live in the registry already.
pub fn prepare_message(
    registry: &mut dyn ObjectRegistry,
    desc: &MessageDesc,
    args: &mut [Argument],
) -> Result<Option<u32>> {
    let types = signature_types(desc)?;
    if types.len() != args.len() {
        return Err(WireError::BadArgument {
            reason: "argument count does not match signature",
        });
    }

    let mut allocated = None;
    for (ty, arg) in types.iter().zip(args.iter_mut()) {
        if arg.kind() != *ty {
            return Err(WireError::BadArgument {
                reason: "argument kind does not match signature",
            });
        }
        match *arg {
            Argument::Object(id) if id != 0 => match registry.status(id) {
                ObjectStatus::Live(_) => {}
                _ => return Err(WireError::InvalidObject { id }),
            },
            Argument::NewId(0) => {
                let interface = desc.child_interface.ok_or(WireError::BadArgument {
                    reason: "new-id argument without a child interface",
                })?;
                let id = registry.allocate(interface)?;
                *arg = Argument::NewId(id);
                allocated = Some(id);
            }
            Argument::NewId(id) => match registry.status(id) {
                ObjectStatus::Live(_) => {}
                _ => return Err(WireError::InvalidObject { id }),
            },
            _ => {}
        }
    }
    Ok(allocated)
}

fn put_padding(buf: &mut BytesMut) {
    while buf.len() % 4 != 0 {
        buf.extend_from_slice(&[0]);
    }
}

/// Encode a prepared argument vector into header + payload, splitting
/// off the file descriptors for ancillary transmission.
pub fn encode_message(
    receiver: u32,
    opcode: u16,
    args: Vec<Argument>,
) -> Result<(BytesMut, Vec<OwnedFd>)> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + 32);
    buf.extend_from_slice(&receiver.to_ne_bytes());
    buf.extend_from_slice(&[0; 4]); // opcode/size patched below

    let mut fds = Vec::new();
    for arg in args {
        match arg {
            Argument::Int(v) => buf.extend_from_slice(&v.to_ne_bytes()),
            Argument::Uint(v) => buf.extend_from_slice(&v.to_ne_bytes()),
            Argument::Fixed(v) => buf.extend_from_slice(&v.to_raw().to_ne_bytes()),
            Argument::Str(None) => buf.extend_from_slice(&0u32.to_ne_bytes()),
            Argument::Str(Some(s)) => {
                let bytes = s.as_bytes_with_nul();
                buf.extend_from_slice(&(bytes.len() as u32).to_ne_bytes());
                buf.extend_from_slice(bytes);
                put_padding(&mut buf);
            }
            Argument::Object(id) => buf.extend_from_slice(&id.to_ne_bytes()),
            Argument::NewId(id) => buf.extend_from_slice(&id.to_ne_bytes()),
            Argument::Array(data) => {
                buf.extend_from_slice(&(data.len() as u32).to_ne_bytes());
                buf.extend_from_slice(&data);
                put_padding(&mut buf);
            }
            Argument::Fd(fd) => fds.push(fd),
        }
    }

    let size = buf.len();
    if size > u16::MAX as usize || size > WIRE_BUFFER_CAPACITY {
        return Err(WireError::MessageTooLong { size });
    }
    let word = ((size as u32) << 16) | u32::from(opcode);
    buf[4..8].copy_from_slice(&word.to_ne_bytes());

    Ok((buf, fds))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read_u32(&mut self) -> Result<u32> {
        let end = self.pos.checked_add(4).ok_or(WireError::BadMessage {
            reason: "argument past end of message",
        })?;
        let chunk = self
            .bytes
            .get(self.pos..end)
            .ok_or(WireError::BadMessage {
                reason: "argument past end of message",
            })?;
        self.pos = end;
        Ok(u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes = self.bytes;
        let end = self.pos.checked_add(len).ok_or(WireError::BadMessage {
            reason: "length exceeds message size",
        })?;
        let chunk = bytes.get(self.pos..end).ok_or(WireError::BadMessage {
            reason: "length exceeds message size",
        })?;
        self.pos = end;
        Ok(chunk)
    }

    fn skip_padding(&mut self) -> Result<()> {
        while self.pos % 4 != 0 {
            if self.pos >= self.bytes.len() {
                return Err(WireError::BadMessage {
                    reason: "missing padding",
                });
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn finished(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// Decode a message payload (the bytes after the header) into an
/// argument vector.
///
/// `n` arguments with a known child interface are registered in the
/// registry before the handler runs; if a later argument fails, those
/// registrations are rolled back and any popped descriptors close with
/// the partial vector.
pub fn decode_message(
    registry: &mut dyn ObjectRegistry,
    desc: &MessageDesc,
    payload: &[u8],
    fds: &mut InFdBuffer,
) -> Result<Vec<Argument>> {
    let mut created = Vec::new();
    let result = decode_inner(registry, desc, payload, fds, &mut created);
    if result.is_err() {
        for id in created {
            registry.unregister(id);
        }
    }
    result
}

fn decode_inner(
    registry: &mut dyn ObjectRegistry,
    desc: &MessageDesc,
    payload: &[u8],
    fds: &mut InFdBuffer,
    created: &mut Vec<u32>,
) -> Result<Vec<Argument>> {
    let types = signature_types(desc)?;
    let mut cursor = Cursor {
        bytes: payload,
        pos: 0,
    };
    let mut args = Vec::with_capacity(types.len());

    for ty in types {
        let arg = match ty {
            ArgumentType::Int => Argument::Int(cursor.read_u32()? as i32),
            ArgumentType::Uint => Argument::Uint(cursor.read_u32()?),
            ArgumentType::Fixed => Argument::Fixed(Fixed::from_raw(cursor.read_u32()? as i32)),
            ArgumentType::Str => {
                let len = cursor.read_u32()? as usize;
                if len == 0 {
                    Argument::Str(None)
                } else {
                    let bytes = cursor.read_bytes(len)?;
                    cursor.skip_padding()?;
                    let s = CString::from_vec_with_nul(bytes.to_vec()).map_err(|_| {
                        WireError::BadMessage {
                            reason: "string is not null-terminated",
                        }
                    })?;
                    Argument::Str(Some(s))
                }
            }
            ArgumentType::Object => {
                let id = cursor.read_u32()?;
                if id != 0 {
                    match registry.status(id) {
                        ObjectStatus::Live(_) => {}
                        _ => return Err(WireError::InvalidObject { id }),
                    }
                }
                Argument::Object(id)
            }
            ArgumentType::NewId => {
                let id = cursor.read_u32()?;
                if id != 0 {
                    if let Some(interface) = desc.child_interface {
                        registry.register(id, interface)?;
                        created.push(id);
                    }
                }
                Argument::NewId(id)
            }
            ArgumentType::Array => {
                let len = cursor.read_u32()? as usize;
                let bytes = cursor.read_bytes(len)?;
                cursor.skip_padding()?;
                Argument::Array(bytes.to_vec())
            }
            ArgumentType::Fd => Argument::Fd(fds.pop().ok_or(WireError::MissingFd)?),
        };
        args.push(arg);
    }

    if !cursor.finished() {
        return Err(WireError::BadMessage {
            reason: "trailing bytes after last argument",
        });
    }
    Ok(args)
}
