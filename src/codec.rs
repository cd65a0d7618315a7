//! Newline framing for the text protocol.
//!
//! Peers exchange `\n` terminated ASCII lines. TCP hands us whatever chunking
//! it likes, so [`LineCodec`] keeps the unterminated tail of the stream
//! between calls and only yields a line once its newline has arrived.
//!
//! ```text
//! feed("ONE tacos\nTWO are good.\nTHREE usua")  -> ["ONE tacos", "TWO are good."]
//! feed("lly.\n")                              -> ["THREE usually."]
//! ```
//!
//! Framing is positional: every `\n` ends a line, and the text between two
//! newlines is delivered even when it trims down to nothing.

use bytes::{BufMut, BytesMut};

/// Substitute for input bytes outside 7-bit ASCII.
pub const REPLACEMENT_CHAR: char = char::REPLACEMENT_CHARACTER;
/// Substitute for outgoing characters outside 7-bit ASCII.
pub const ENCODE_REPLACEMENT: u8 = b'?';

#[derive(Debug, Default, Clone)]
pub struct LineCodec {
    pending: String,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `raw` and returns every line completed by it, in order.
    ///
    /// Each returned line is trimmed of surrounding whitespace, so a trailing
    /// `\r` from CRLF peers disappears. Bytes that are not ASCII decode to
    /// [`REPLACEMENT_CHAR`]; decoding never fails.
    pub fn feed(&mut self, raw: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in raw {
            if byte == b'\n' {
                let line = std::mem::take(&mut self.pending);
                lines.push(line.trim().to_string());
            } else if byte.is_ascii() {
                self.pending.push(byte as char);
            } else {
                self.pending.push(REPLACEMENT_CHAR);
            }
        }
        lines
    }

    /// Text received since the last newline.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Appends the wire form of `line` to `dst`: ASCII, `\n` terminated.
    ///
    /// A line that already ends in `\n` is not terminated twice. Returns the
    /// number of bytes written.
    pub fn encode(line: &str, dst: &mut BytesMut) -> usize {
        let needs_terminator = !line.ends_with('\n');
        let len = line.chars().count() + usize::from(needs_terminator);
        dst.reserve(len);
        for ch in line.chars() {
            if ch.is_ascii() {
                dst.put_u8(ch as u8);
            } else {
                dst.put_u8(ENCODE_REPLACEMENT);
            }
        }
        if needs_terminator {
            dst.put_u8(b'\n');
        }
        len
    }

    /// Convenience wrapper around [`encode`](Self::encode) for a fresh buffer.
    pub fn encode_to_bytes(line: &str) -> BytesMut {
        let mut dst = BytesMut::new();
        Self::encode(line, &mut dst);
        dst
    }
}
