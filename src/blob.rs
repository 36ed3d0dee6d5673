//! Blob table: the variable-length string/blob store embedded in the header.
//!
//! Entries are `[u16 LE length][bytes]` and are addressed by the offset of
//! their length prefix.  Offset 0 means "no value", so the buffer always
//! starts with one null pad byte.  Strings are stored null-terminated;
//! [`BlobTable::lookup_str`] strips the terminator again.

use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// The serialized table is padded to a multiple of this.
pub const BLOB_ALIGN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobTable {
    buf:     Vec<u8>,
    entries: BTreeSet<u32>,
}

impl Default for BlobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobTable {
    pub fn new() -> Self {
        Self { buf: vec![0u8], entries: BTreeSet::new() }
    }

    /// Append a string, null-terminated.
    pub fn add_string(&mut self, s: &[u8]) -> Result<u32> {
        let mut data = Vec::with_capacity(s.len() + 1);
        data.extend_from_slice(s);
        data.push(0);
        self.add_blob(&data)
    }

    /// Append raw bytes; returns the offset of the entry's length prefix.
    pub fn add_blob(&mut self, data: &[u8]) -> Result<u32> {
        let len = u16::try_from(data.len()).map_err(|_| Error::BlobTooLarge(data.len()))?;
        let offset = u32::try_from(self.buf.len())
            .map_err(|_| Error::BlobTooLarge(self.buf.len()))?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(data);
        self.entries.insert(offset);
        Ok(offset)
    }

    pub fn lookup(&self, offset: u32) -> Option<&[u8]> {
        if !self.entries.contains(&offset) {
            return None;
        }
        let start = offset as usize;
        let len = u16::from_le_bytes([self.buf[start], self.buf[start + 1]]) as usize;
        Some(&self.buf[start + 2..start + 2 + len])
    }

    /// Look up a string entry, dropping trailing null bytes.
    pub fn lookup_str(&self, offset: u32) -> Option<&[u8]> {
        self.lookup(offset).map(|b| {
            let end = b.iter().rposition(|&c| c != 0).map_or(0, |p| p + 1);
            &b[..end]
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of [`serialize`](Self::serialize)'s output.
    pub fn serialized_len(&self) -> usize {
        self.buf.len().div_ceil(BLOB_ALIGN) * BLOB_ALIGN
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.buf.clone();
        out.resize(self.serialized_len(), 0);
        out
    }

    /// Rebuild a table from its serialized form.  Entries whose payload
    /// would run past the end of the buffer are not recorded.
    pub fn parse(buf: &[u8]) -> Self {
        let mut entries = BTreeSet::new();
        let mut pos = 1usize;
        while pos + 2 <= buf.len() {
            let len = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
            if pos + 2 + len <= buf.len() {
                entries.insert(pos as u32);
            }
            pos += 2 + len;
        }
        let buf = if buf.is_empty() { vec![0u8] } else { buf.to_vec() };
        Self { buf, entries }
    }
}
