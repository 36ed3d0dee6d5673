//! Fixed-size record plumbing shared by the header and extent codecs.
//!
//! Every structure in a VMA file has a length known before it is read, so
//! decoding is always "fill a buffer of exactly N bytes, then parse it".
//! [`RecordReader`] does the filling and tracks the absolute stream offset
//! so that short reads and checksum failures can say *where* they happened.
//!
//! # Checksums
//! Header and extent checksums are MD5 over the encoded record with the
//! 16-byte checksum field zeroed.  [`md5_with_zeroed`] computes exactly that
//! over an already-encoded buffer; callers re-encode with the field cleared
//! rather than keeping the raw bytes they decoded.

use std::io::{self, Read};
use std::ops::Range;

use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// Sequential reader that knows its absolute offset.
pub struct RecordReader<R: Read> {
    inner:  R,
    offset: u64,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_offset(inner, 0)
    }

    pub fn with_offset(inner: R, offset: u64) -> Self {
        Self { inner, offset }
    }

    /// Absolute offset of the next byte to be read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Fill `buf` completely or fail with [`Error::Truncated`] carrying the
    /// offset at which the read started and how many bytes were available.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let start = self.offset;
        let got = read_full(&mut self.inner, buf)?;
        self.offset += got as u64;
        if got < buf.len() {
            return Err(Error::Truncated {
                offset:    start,
                expected:  buf.len(),
                available: got,
            });
        }
        Ok(())
    }

    /// Read a record of `len` bytes into a fresh buffer.
    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Read until `buf` is full or the source is exhausted; returns bytes read.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// MD5 of `data` with the bytes in `field` treated as zero.
pub fn md5_with_zeroed(data: &[u8], field: Range<usize>) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(&data[..field.start]);
    hasher.update(vec![0u8; field.len()]);
    hasher.update(&data[field.end..]);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn short_read_reports_start_offset() {
        let mut r = RecordReader::new(Cursor::new(vec![1u8; 10]));
        let mut buf = [0u8; 6];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(r.offset(), 6);
        match r.read_exact(&mut buf) {
            Err(Error::Truncated { offset, expected, available }) => {
                assert_eq!((offset, expected, available), (6, 6, 4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_stream_is_clean_eof() {
        let mut r = RecordReader::new(Cursor::new(Vec::<u8>::new()));
        let err = r.read_vec(512).unwrap_err();
        assert!(err.is_clean_eof());
    }

    #[test]
    fn zeroed_field_ignores_its_content() {
        let mut a = vec![7u8; 64];
        let b = a.clone();
        a[16..32].fill(0xff);
        assert_eq!(md5_with_zeroed(&a, 16..32), md5_with_zeroed(&b, 16..32));
        a[40] ^= 1;
        assert_ne!(md5_with_zeroed(&a, 16..32), md5_with_zeroed(&b, 16..32));
    }
}
