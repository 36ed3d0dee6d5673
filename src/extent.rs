//! Extents: a 512-byte checksummed header holding up to 59 block-info words,
//! followed by the present 4 KiB blocks of those entries in the same order.
//!
//! ```text
//! 0    magic "VMAE"
//! 4    reserved        u16
//! 6    block_count     u16   number of 4 KiB payload blocks
//! 8    archive uuid    16 B
//! 24   md5             16 B  over bytes 0..512 with this field zeroed
//! 40   blockinfo[59]   u64 each
//! 512  payload
//! ```

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::block::{BlockGroup, BlockInfo, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::record::{md5_with_zeroed, RecordReader};

pub const EXTENT_MAGIC: &[u8; 4] = b"VMAE";
pub const BLOCKS_PER_EXTENT: usize = 59;
pub const EXTENT_HEADER_SIZE: usize = 512;

const MD5_FIELD: std::ops::Range<usize> = 24..40;
const BLOCKINFO_AT: usize = 40;

// ── ExtentHeader ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentHeader {
    pub block_count: u16,
    pub uuid:        [u8; 16],
    pub md5sum:      [u8; 16],
    pub blockinfo:   [BlockInfo; BLOCKS_PER_EXTENT],
}

impl ExtentHeader {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// The 512-byte header; the reserved field stays zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; EXTENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(EXTENT_MAGIC);
        BigEndian::write_u16(&mut buf[6..8], self.block_count);
        buf[8..24].copy_from_slice(&self.uuid);
        buf[MD5_FIELD].copy_from_slice(&self.md5sum);
        let words: Vec<u64> = self.blockinfo.iter().map(|b| b.to_u64()).collect();
        BigEndian::write_u64_into(&words, &mut buf[BLOCKINFO_AT..]);
        buf
    }

    pub fn checksum(&self) -> [u8; 16] {
        md5_with_zeroed(&self.encode(), MD5_FIELD)
    }

    /// Decode without verification; `offset` is only used for errors.
    pub fn decode(buf: &[u8], offset: u64) -> Result<Self> {
        if buf.len() < EXTENT_HEADER_SIZE {
            return Err(Error::Truncated {
                offset,
                expected:  EXTENT_HEADER_SIZE,
                available: buf.len(),
            });
        }
        let mut r = Cursor::new(buf);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != EXTENT_MAGIC {
            return Err(Error::BadMagic { what: "extent", offset });
        }
        let _reserved = r.read_u16::<BigEndian>()?;
        let block_count = r.read_u16::<BigEndian>()?;
        let mut uuid = [0u8; 16];
        r.read_exact(&mut uuid)?;
        let mut md5sum = [0u8; 16];
        r.read_exact(&mut md5sum)?;
        let mut blockinfo = [BlockInfo::default(); BLOCKS_PER_EXTENT];
        for info in blockinfo.iter_mut() {
            *info = BlockInfo::read(&mut r)?;
        }
        Ok(Self { block_count, uuid, md5sum, blockinfo })
    }

    /// Read, decode and verify the next extent header.  A zero-byte read
    /// surfaces as `Truncated { available: 0 }`, which callers treat as the
    /// end of the cluster stream.
    pub fn read<R: Read>(reader: &mut RecordReader<R>) -> Result<Self> {
        let offset = reader.offset();
        let buf = reader.read_vec(EXTENT_HEADER_SIZE)?;
        let header = Self::decode(&buf, offset)?;
        if header.encode() != buf {
            return Err(Error::corrupt(offset, "reserved extent header bits are set"));
        }
        if header.checksum() != header.md5sum {
            return Err(Error::ChecksumMismatch { what: "extent", offset });
        }
        let present: usize = header.blockinfo.iter().map(|b| b.present()).sum();
        if present != header.block_count as usize {
            return Err(Error::corrupt(offset, format!(
                "block count {} but block info masks cover {present} blocks",
                header.block_count)));
        }
        Ok(header)
    }

    /// Payload bytes that follow this header.
    pub fn payload_len(&self) -> usize {
        self.block_count as usize * BLOCK_SIZE
    }
}

// ── Extent (write side) ───────────────────────────────────────────────────────

/// Accumulates block groups until the extent is full.
#[derive(Debug, Clone)]
pub struct Extent {
    uuid:   [u8; 16],
    groups: Vec<BlockGroup>,
}

impl Extent {
    pub fn new(uuid: [u8; 16]) -> Self {
        Self { uuid, groups: Vec::with_capacity(BLOCKS_PER_EXTENT) }
    }

    /// Add one cluster.  Returns `true` once the extent is full and must be
    /// flushed before anything else is added.
    pub fn add(&mut self, dev_id: u8, cluster: u32, data: &[u8]) -> bool {
        let mut group = BlockGroup::new(dev_id, cluster);
        group.add(data);
        self.push(group)
    }

    pub fn push(&mut self, group: BlockGroup) -> bool {
        debug_assert!(self.groups.len() < BLOCKS_PER_EXTENT);
        self.groups.push(group);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.groups.len() >= BLOCKS_PER_EXTENT
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn groups(&self) -> &[BlockGroup] {
        &self.groups
    }

    pub fn header(&self) -> ExtentHeader {
        let mut blockinfo = [BlockInfo::default(); BLOCKS_PER_EXTENT];
        for (slot, group) in blockinfo.iter_mut().zip(&self.groups) {
            *slot = group.info();
        }
        let block_count = self.groups.iter().map(|g| g.present()).sum::<usize>() as u16;
        let mut header = ExtentHeader { block_count, uuid: self.uuid, md5sum: [0u8; 16], blockinfo };
        header.md5sum = header.checksum();
        header
    }

    /// Header plus payload, or nothing at all for an empty extent.
    pub fn serialize(&self) -> Vec<u8> {
        if self.groups.is_empty() {
            return Vec::new();
        }
        let header = self.header();
        let mut out = header.encode();
        out.reserve(header.payload_len());
        for group in &self.groups {
            out.extend_from_slice(group.get_blocks());
        }
        out
    }

    /// Drop the accumulated groups, keeping the archive id.
    pub fn clear(&mut self) {
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CLUSTER_SIZE;
    use proptest::prelude::*;

    const UUID: [u8; 16] = [0xab; 16];

    fn sample_extent() -> Extent {
        let mut e = Extent::new(UUID);
        let mut data = vec![0u8; CLUSTER_SIZE];
        data[0] = 1;
        data[5 * BLOCK_SIZE] = 2;
        e.add(1, 0, &data);
        e.add(1, 1, &vec![0u8; CLUSTER_SIZE]);
        e.add(2, 0, &[3u8; 100]);
        e
    }

    fn parse(bytes: &[u8]) -> Result<ExtentHeader> {
        ExtentHeader::read(&mut RecordReader::new(Cursor::new(bytes)))
    }

    #[test]
    fn empty_extent_serializes_to_nothing() {
        assert!(Extent::new(UUID).serialize().is_empty());
    }

    #[test]
    fn full_signal_at_capacity() {
        let mut e = Extent::new(UUID);
        for i in 0..BLOCKS_PER_EXTENT as u32 - 1 {
            assert!(!e.add(1, i, &[]));
        }
        assert!(e.add(1, 58, &[]));
        assert_eq!(e.len(), BLOCKS_PER_EXTENT);
    }

    #[test]
    fn layout_and_roundtrip() {
        let e = sample_extent();
        let bytes = e.serialize();
        assert_eq!(bytes.len(), EXTENT_HEADER_SIZE + 3 * BLOCK_SIZE);
        assert_eq!(&bytes[..4], EXTENT_MAGIC);
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 3);
        assert_eq!(&bytes[8..24], &UUID);

        let header = parse(&bytes).unwrap();
        assert_eq!(header, e.header());
        assert_eq!(header.encode(), bytes[..EXTENT_HEADER_SIZE]);
        assert_eq!(header.blockinfo[0], BlockInfo { mask: 0b10_0001, dev_id: 1, cluster: 0 });
        assert_eq!(header.blockinfo[1], BlockInfo { mask: 0, dev_id: 1, cluster: 1 });
        assert_eq!(header.blockinfo[3], BlockInfo::default());
        assert_eq!(&bytes[40..48], &0x0021_0001_0000_0000u64.to_be_bytes());
        assert_eq!(&bytes[56..64], &0x0001_0002_0000_0000u64.to_be_bytes());
        assert_eq!(bytes[EXTENT_HEADER_SIZE], 1);
        assert_eq!(bytes[EXTENT_HEADER_SIZE + BLOCK_SIZE], 2);
        assert_eq!(bytes[EXTENT_HEADER_SIZE + 2 * BLOCK_SIZE], 3);
    }

    #[test]
    fn block_count_mismatch_is_corrupt() {
        let e = sample_extent();
        let mut header = e.header();
        header.block_count = 4;
        header.md5sum = header.checksum();
        assert!(matches!(parse(&header.encode()), Err(Error::Corrupt { offset: 0, .. })));
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample_extent().serialize();
        bytes[3] = b'X';
        assert!(matches!(parse(&bytes), Err(Error::BadMagic { what: "extent", .. })));
    }

    proptest! {
        #[test]
        fn any_bit_flip_in_header_is_detected(byte in 0usize..EXTENT_HEADER_SIZE, bit in 0u8..8) {
            let mut bytes = sample_extent().serialize();
            bytes[byte] ^= 1 << bit;
            let rejected = matches!(
                parse(&bytes),
                Err(Error::ChecksumMismatch { .. })
                    | Err(Error::Corrupt { .. })
                    | Err(Error::BadMagic { .. })
            );
            prop_assert!(rejected);
        }
    }
}
