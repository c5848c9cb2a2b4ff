// Streaming instruction decoder.
//
// Scans a growable byte buffer for complete instructions without copying
// element data. Partial input stays buffered until the terminating ';'
// arrives; the scan is restarted from the buffer head on each call, which
// is cheap because instructions are small relative to socket reads.

use bytes::{Buf, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::{CodecError, Instruction, ARG_SEP, ELEM_SEP, INST_TERM};

/// Maximum element length in code points (1 MiB). Elements declaring more
/// are rejected before any buffering is attempted, bounding memory use on
/// hostile input.
pub const MAX_ELEMENT_LENGTH: usize = 1024 * 1024;

/// Outcome of scanning the buffer head for one instruction.
enum Scan {
    /// A complete instruction occupies `buf[..end]` (terminator included),
    /// with elements at the given byte ranges.
    Complete {
        end: usize,
        elements: SmallVec<[(usize, usize); 8]>,
    },
    /// More bytes are required.
    Incomplete,
}

/// Stateful streaming decoder for the Guacamole instruction format.
///
/// Feed raw bytes with [`push`](Self::push), then drain complete
/// instructions with [`next_frame`](Self::next_frame) (raw bytes, for
/// verbatim forwarding) or [`next_instruction`](Self::next_instruction)
/// (parsed). The two may be mixed freely; each call consumes at most one
/// instruction.
///
/// Any error other than needing more input is terminal for the stream.
#[derive(Debug, Default)]
pub struct InstructionReader {
    buf: BytesMut,
}

impl InstructionReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Append raw bytes received from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True when no undecoded bytes remain.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of buffered, not-yet-decoded bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Remove and return the next complete instruction as raw wire bytes,
    /// terminator included. Returns `Ok(None)` until one is fully buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        match scan(&self.buf)? {
            Scan::Incomplete => Ok(None),
            Scan::Complete { end, .. } => {
                let frame = self.buf.split_to(end).freeze();
                Ok(Some(frame))
            }
        }
    }

    /// Remove and return the next complete instruction, parsed.
    pub fn next_instruction(&mut self) -> Result<Option<Instruction>, CodecError> {
        match scan(&self.buf)? {
            Scan::Incomplete => Ok(None),
            Scan::Complete { end, elements } => {
                let mut parts = elements.iter().map(|&(start, stop)| {
                    // Scan already validated UTF-8 over the whole instruction.
                    element_str(&self.buf[start..stop]).to_string()
                });
                let opcode = parts.next().unwrap_or_default();
                let args: Vec<String> = parts.collect();
                self.buf.advance(end);
                Ok(Some(Instruction { opcode, args }))
            }
        }
    }
}

fn element_str(bytes: &[u8]) -> &str {
    // Elements are only referenced after scan() has validated the
    // instruction as UTF-8, and element boundaries fall on char boundaries
    // by construction (the scanner advances char-wise).
    std::str::from_utf8(bytes).unwrap_or("")
}

/// Scan the buffer head for one complete instruction, validating structure
/// and UTF-8 as it goes. Byte-position based like the rest of the wire
/// code, but element lengths are counted in code points.
fn scan(buf: &[u8]) -> Result<Scan, CodecError> {
    if buf.is_empty() {
        return Ok(Scan::Incomplete);
    }

    let mut pos = 0usize;
    let mut elements: SmallVec<[(usize, usize); 8]> = SmallVec::new();

    loop {
        // Decimal length prefix up to '.'
        let mut length = 0usize;
        let mut digits = 0usize;
        loop {
            match buf.get(pos) {
                None => return Ok(Scan::Incomplete),
                Some(&b) if b.is_ascii_digit() => {
                    length = length * 10 + (b - b'0') as usize;
                    if length > MAX_ELEMENT_LENGTH {
                        return Err(CodecError::ElementTooLarge(length));
                    }
                    digits += 1;
                    pos += 1;
                }
                Some(&b) if b == ELEM_SEP => {
                    if digits == 0 {
                        return Err(CodecError::InvalidLength);
                    }
                    pos += 1;
                    break;
                }
                Some(_) => return Err(CodecError::InvalidLength),
            }
        }

        // Exactly `length` code points of element data.
        let start = pos;
        for _ in 0..length {
            match next_char_width(buf, pos)? {
                None => return Ok(Scan::Incomplete),
                Some(width) => pos += width,
            }
        }
        elements.push((start, pos));

        // Separator decides between more elements and end of instruction.
        match buf.get(pos) {
            None => return Ok(Scan::Incomplete),
            Some(&ARG_SEP) => {
                pos += 1;
            }
            Some(&INST_TERM) => {
                pos += 1;
                return Ok(Scan::Complete { end: pos, elements });
            }
            Some(&other) => return Err(CodecError::InvalidSeparator(other)),
        }
    }
}

/// Width in bytes of the UTF-8 code point starting at `pos`, or `None` when
/// the buffer ends before the code point is complete.
fn next_char_width(buf: &[u8], pos: usize) -> Result<Option<usize>, CodecError> {
    let lead = match buf.get(pos) {
        None => return Ok(None),
        Some(&b) => b,
    };
    let width = match lead {
        0x00..=0x7f => 1,
        0xc2..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf4 => 4,
        _ => return Err(CodecError::InvalidUtf8),
    };
    if pos + width > buf.len() {
        // Complete what we can see: the continuation bytes present so far
        // must still look like continuations.
        for &b in &buf[pos + 1..] {
            if b & 0xc0 != 0x80 {
                return Err(CodecError::InvalidUtf8);
            }
        }
        return Ok(None);
    }
    for &b in &buf[pos + 1..pos + width] {
        if b & 0xc0 != 0x80 {
            return Err(CodecError::InvalidUtf8);
        }
    }
    // Reject overlong/surrogate forms the width table lets through.
    if std::str::from_utf8(&buf[pos..pos + width]).is_err() {
        return Err(CodecError::InvalidUtf8);
    }
    Ok(Some(width))
}
