// guacgate-protocol: Guacamole wire-protocol instruction codec
//
// An instruction is a sequence of length-prefixed UTF-8 elements separated
// by commas and terminated by a semicolon:
//
//   <len>.<element>,<len>.<element>,...;
//
// The first element is the opcode; the rest are arguments. Lengths count
// Unicode code points, not bytes: "1.é" is a single two-byte element with
// length prefix 1. Getting this wrong desyncs guacd on the first non-ASCII
// argument.

mod reader;

pub use reader::{InstructionReader, MAX_ELEMENT_LENGTH};

use bytes::{BufMut, Bytes, BytesMut};
use std::str;

// Wire delimiters
pub const INST_TERM: u8 = b';';
pub const ARG_SEP: u8 = b',';
pub const ELEM_SEP: u8 = b'.';

/// A fully parsed Guacamole instruction with owned strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            opcode: opcode.into(),
            args,
        }
    }

    /// Create a `select` instruction for protocol selection or session join.
    pub fn select(target: &str) -> Self {
        Self::new("select", vec![target.to_string()])
    }

    /// Create a `connect` instruction with positional parameter values.
    pub fn connect(values: Vec<String>) -> Self {
        Self::new("connect", values)
    }

    /// Create an `args` instruction listing parameter names.
    pub fn args(names: &[&str]) -> Self {
        Self::new("args", names.iter().map(|s| s.to_string()).collect())
    }

    /// Create a `ready` instruction carrying the assigned connection id.
    pub fn ready(connection_id: &str) -> Self {
        Self::new("ready", vec![connection_id.to_string()])
    }

    /// Create an `error` instruction with a message and numeric status code.
    pub fn error(message: &str, code: u32) -> Self {
        Self::new("error", vec![message.to_string(), code.to_string()])
    }

    /// Encode into wire format.
    ///
    /// Length prefixes are measured in Unicode code points.
    pub fn encode(&self) -> Bytes {
        let estimated = self.opcode.len()
            + self.args.iter().map(|a| a.len() + 8).sum::<usize>()
            + 16;
        let mut buf = BytesMut::with_capacity(estimated);
        put_element(&mut buf, &self.opcode);
        for arg in &self.args {
            buf.put_u8(ARG_SEP);
            put_element(&mut buf, arg);
        }
        buf.put_u8(INST_TERM);
        buf.freeze()
    }

    /// Decode a single complete instruction, including the trailing `;`.
    ///
    /// The input must contain exactly one instruction; trailing data is a
    /// `CodecError`. Use [`InstructionReader`] for streams.
    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        let mut reader = InstructionReader::new();
        reader.push(raw);
        let instruction = reader
            .next_instruction()?
            .ok_or(CodecError::Incomplete)?;
        if !reader.is_empty() {
            return Err(CodecError::TrailingData);
        }
        Ok(instruction)
    }
}

fn put_element(buf: &mut BytesMut, element: &str) {
    buf.put_slice(element.chars().count().to_string().as_bytes());
    buf.put_u8(ELEM_SEP);
    buf.put_slice(element.as_bytes());
}

/// Codec failure. Any variant other than [`CodecError::Incomplete`] is
/// unrecoverable for the stream that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The buffer ends before a complete instruction. Streaming callers
    /// treat this as "feed more bytes"; it is only surfaced by one-shot
    /// decoding.
    #[error("incomplete instruction")]
    Incomplete,

    /// An element length prefix is missing or not a decimal integer.
    #[error("invalid element length prefix")]
    InvalidLength,

    /// An element declares more code points than the codec permits.
    #[error("element of {0} code points exceeds maximum of {MAX_ELEMENT_LENGTH}")]
    ElementTooLarge(usize),

    /// The byte after an element was neither `,` nor `;`.
    #[error("expected ',' or ';' after element, found byte 0x{0:02x}")]
    InvalidSeparator(u8),

    /// The instruction is not valid UTF-8.
    #[error("instruction is not valid UTF-8")]
    InvalidUtf8,

    /// One-shot decoding found bytes after the instruction terminator.
    #[error("unexpected data after instruction terminator")]
    TrailingData,
}

impl From<str::Utf8Error> for CodecError {
    fn from(_: str::Utf8Error) -> Self {
        CodecError::InvalidUtf8
    }
}
