// NetAscii is the text encoding TFTP uses for every string field on the wire: filenames, mode
// strings, option names and values, and error messages.
//
// On the wire a line ends with CR LF. A carriage return that is not part of a line ending is
// escaped as CR NUL. Hosts keep their own line separator and convert on the way in and out.
//
// Translation rules when going to the wire:
// - LF not preceded by CR becomes CR LF
// - CR not followed by LF or NUL becomes CR NUL (including a CR at the very end)
// - CR LF and CR NUL pass through untouched
//
// Translation rules when coming from the wire:
// - CR NUL becomes CR
// - CR LF becomes the host line separator (nothing to do when the host already uses CR LF)
// - any other NUL is dropped

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

pub const CHAR_CR: u8 = b'\r';
pub const CHAR_LF: u8 = b'\n';
pub const CHAR_NULL: u8 = 0x00;

#[cfg(windows)]
const HOST_LINE_SEPARATOR: &[u8] = b"\r\n";
#[cfg(not(windows))]
const HOST_LINE_SEPARATOR: &[u8] = b"\n";

/// Errors raised while pulling a NetAscii field out of a packet buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetAsciiError {
    #[error("field {field} starting at offset {offset} is not NUL terminated")]
    MissingTerminator { offset: usize, field: usize },

    #[error("field at offset {offset} is not valid UTF-8")]
    InvalidText { offset: usize },
}

/// A string together with its NetAscii wire form.
///
/// Two values compare equal when their wire forms are equal, so a value decoded off the wire is
/// equal to the value it was encoded from.
#[derive(Clone, Default)]
pub struct NetAscii {
    original: String,
    value: String,
}

impl NetAscii {
    pub fn new(original: &str) -> NetAscii {
        NetAscii {
            original: original.to_string(),
            value: to_wire(original),
        }
    }

    /// Builds a value out of text that is already in wire form.
    pub fn from_wire_form(wire: &str) -> NetAscii {
        NetAscii {
            original: from_wire(wire),
            value: wire.to_string(),
        }
    }

    /// Reads a NUL terminated field out of a packet buffer.
    ///
    /// Starting at `offset`, `skip_nulls` terminated fields are skipped and the next one is
    /// returned, so `from_bytes(buf, off, 1)` returns the second field of a `name\0value\0` pair.
    pub fn from_bytes(buf: &[u8], offset: usize, skip_nulls: usize) -> Result<NetAscii, NetAsciiError> {
        let mut start = offset;
        for field in 0..skip_nulls {
            let end = find_terminator(buf, start).ok_or(NetAsciiError::MissingTerminator { offset, field })?;
            start = end + 1;
        }

        let end = find_terminator(buf, start)
            .ok_or(NetAsciiError::MissingTerminator { offset, field: skip_nulls })?;
        let text = std::str::from_utf8(&buf[start..end]).map_err(|_| NetAsciiError::InvalidText { offset: start })?;
        Ok(NetAscii::from_wire_form(text))
    }

    /// The host form of the string.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// The wire form of the string.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_bytes()
    }

    /// Length of the wire form in bytes, not counting the terminator.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl PartialEq for NetAscii {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for NetAscii {}

impl PartialOrd for NetAscii {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NetAscii {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl Hash for NetAscii {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Debug for NetAscii {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl fmt::Display for NetAscii {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.original)
    }
}

/// Finds the NUL that terminates the field starting at `start`.
///
/// A NUL directly after a CR is the escape for a bare carriage return and belongs to the field.
fn find_terminator(buf: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    while i < buf.len() {
        if buf[i] == CHAR_NULL && !(i > start && buf[i - 1] == CHAR_CR) {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Converts host text to its NetAscii wire form.
pub fn to_wire(host: &str) -> String {
    let bytes = host.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 8);

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            CHAR_CR => {
                out.push(CHAR_CR);
                match bytes.get(i + 1) {
                    Some(&CHAR_LF) | Some(&CHAR_NULL) => {}
                    _ => out.push(CHAR_NULL),
                }
            }
            CHAR_LF => {
                if i == 0 || bytes[i - 1] != CHAR_CR {
                    out.push(CHAR_CR);
                }
                out.push(CHAR_LF);
            }
            _ => out.push(b),
        }
    }

    // Only ASCII control bytes were inserted, so the result is still UTF-8.
    String::from_utf8(out).unwrap_or_default()
}

/// Converts NetAscii wire text back to host text.
pub fn from_wire(wire: &str) -> String {
    from_wire_with_separator(wire, HOST_LINE_SEPARATOR)
}

fn from_wire_with_separator(wire: &str, separator: &[u8]) -> String {
    let collapse = separator != b"\r\n";
    let bytes = wire.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            CHAR_CR if collapse && bytes.get(i + 1) == Some(&CHAR_LF) => {
                out.extend_from_slice(separator);
                i += 2;
            }
            CHAR_CR if bytes.get(i + 1) == Some(&CHAR_NULL) => {
                out.push(CHAR_CR);
                i += 2;
            }
            CHAR_NULL => i += 1,
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).unwrap_or_default()
}
