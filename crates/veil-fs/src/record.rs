//! Bounds-checked parsing of packed `linux_dirent64` records.
//!
//! ```text
//! offset  size  field
//!      0     8  d_ino
//!      8     8  d_off
//!     16     2  d_reclen   (length of the whole record, padding included)
//!     18     1  d_type
//!     19     *  d_name     (NUL-terminated, NUL-padded up to d_reclen)
//! ```
//!
//! Record boundaries come only from `d_reclen`. The name ends at its first
//! NUL, never at the record end.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;

use crate::error::{StreamError, StreamResult};

/// Size of the fixed part of a record, up to the start of the name.
pub const HEADER_LEN: usize = 19;

const RECLEN_OFFSET: usize = 16;
const TYPE_OFFSET: usize = 18;

/// One record as found in the buffer. Borrows its name from the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub ino: u64,
    pub off: i64,
    pub reclen: u16,
    pub kind: u8,
    pub name: &'a [u8],
}

/// Forward-only reader over the filled part of a record buffer.
#[derive(Debug)]
pub struct RecordCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self::at(buf, 0)
    }

    /// Resume at `pos`, an offset previously returned by [`position`](Self::position).
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self {
            buf,
            pos: pos.min(buf.len()),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Parse the record at the current position and step past it.
    /// `Ok(None)` once the buffer is used up.
    pub fn next_record(&mut self) -> StreamResult<Option<RawRecord<'a>>> {
        let offset = self.pos;
        let rest = &self.buf[offset..];
        if rest.is_empty() {
            return Ok(None);
        }
        let malformed = |reason| StreamError::MalformedRecord { offset, reason };

        if rest.len() < HEADER_LEN {
            return Err(malformed("truncated record header"));
        }
        let reclen = u16::from_ne_bytes([rest[RECLEN_OFFSET], rest[RECLEN_OFFSET + 1]]);
        let len = usize::from(reclen);
        if len <= HEADER_LEN {
            return Err(malformed("record length shorter than header"));
        }
        if len > rest.len() {
            return Err(malformed("record runs past buffer"));
        }

        let mut ino = [0u8; 8];
        ino.copy_from_slice(&rest[0..8]);
        let mut off = [0u8; 8];
        off.copy_from_slice(&rest[8..16]);

        let name_field = &rest[HEADER_LEN..len];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_field.len());
        if name_len == 0 {
            return Err(malformed("empty entry name"));
        }

        self.pos += len;
        Ok(Some(RawRecord {
            ino: u64::from_ne_bytes(ino),
            off: i64::from_ne_bytes(off),
            reclen,
            kind: rest[TYPE_OFFSET],
            name: &name_field[..name_len],
        }))
    }
}

// ---------------------------------------------------------------------------
// DirEntry: the externally visible shape
// ---------------------------------------------------------------------------

/// A record that passed policy, as handed to the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    /// File type bits (`S_IFMT` part of `st_mode`).
    pub mode: u32,
    pub name: OsString,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// `ls -l` style type character.
    pub fn kind_char(&self) -> char {
        match self.mode & libc::S_IFMT {
            libc::S_IFDIR => 'd',
            libc::S_IFLNK => 'l',
            libc::S_IFREG => '-',
            libc::S_IFCHR => 'c',
            libc::S_IFBLK => 'b',
            libc::S_IFIFO => 'p',
            libc::S_IFSOCK => 's',
            _ => '?',
        }
    }
}

impl From<&RawRecord<'_>> for DirEntry {
    fn from(record: &RawRecord<'_>) -> Self {
        Self {
            ino: record.ino,
            mode: u32::from(record.kind) << 12,
            name: OsString::from_vec(record.name.to_vec()),
        }
    }
}

/// Append one record laid out as the kernel would, 8-byte aligned.
#[cfg(test)]
pub(crate) fn encode_record(buf: &mut Vec<u8>, ino: u64, kind: u8, name: &str) {
    let reclen = (HEADER_LEN + name.len() + 1 + 7) & !7;
    let start = buf.len();
    buf.extend_from_slice(&ino.to_ne_bytes());
    buf.extend_from_slice(&((start + reclen) as i64).to_ne_bytes());
    buf.extend_from_slice(&(reclen as u16).to_ne_bytes());
    buf.push(kind);
    buf.extend_from_slice(name.as_bytes());
    buf.resize(start + reclen, 0);
}
