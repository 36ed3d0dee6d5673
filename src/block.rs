use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Read};

/// Bytes per sub-block; the unit of hole detection.
pub const BLOCK_SIZE: usize = 4096;
pub const BLOCKS_PER_CLUSTER: usize = 16;
/// Bytes per cluster (64 KiB).
pub const CLUSTER_SIZE: usize = BLOCK_SIZE * BLOCKS_PER_CLUSTER;

/// One packed 64-bit block-info word of an extent header:
/// `mask << 48 | reserved << 40 | dev_id << 32 | cluster`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInfo {
    pub mask:    u16,
    pub dev_id:  u8,
    pub cluster: u32,
}

impl BlockInfo {
    pub fn to_u64(self) -> u64 {
        (self.mask as u64) << 48 | (self.dev_id as u64) << 32 | self.cluster as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            mask:    (v >> 48) as u16,
            dev_id:  ((v >> 32) & 0xff) as u8,
            cluster: v as u32,
        }
    }

    /// Number of 4 KiB blocks stored for this entry.
    pub fn present(self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(Self::from_u64(reader.read_u64::<BigEndian>()?))
    }
}

/// One 64 KiB cluster of one device: a presence mask plus the non-zero
/// 4 KiB blocks, stored compactly in mask order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGroup {
    pub dev_id:  u8,
    pub cluster: u32,
    mask:        u16,
    blocks:      Vec<u8>,
}

impl BlockGroup {
    pub fn new(dev_id: u8, cluster: u32) -> Self {
        Self { dev_id, cluster, mask: 0, blocks: Vec::new() }
    }

    /// Rebuild a group from a block-info word and its compact payload.
    pub fn from_parts(info: BlockInfo, blocks: Vec<u8>) -> Self {
        debug_assert_eq!(blocks.len(), info.present() * BLOCK_SIZE);
        Self { dev_id: info.dev_id, cluster: info.cluster, mask: info.mask, blocks }
    }

    /// Split `data` into sixteen 4 KiB blocks and keep the non-zero ones.
    /// Missing tail bytes count as zero.  Returns how many blocks are present.
    pub fn add(&mut self, data: &[u8]) -> usize {
        debug_assert!(data.len() <= CLUSTER_SIZE);
        self.mask = 0;
        self.blocks.clear();
        for (i, chunk) in data.chunks(BLOCK_SIZE).take(BLOCKS_PER_CLUSTER).enumerate() {
            if chunk.iter().all(|&b| b == 0) {
                continue;
            }
            self.mask |= 1 << i;
            self.blocks.extend_from_slice(chunk);
            self.blocks.resize(self.blocks.len().next_multiple_of(BLOCK_SIZE), 0);
        }
        self.present()
    }

    pub fn mask(&self) -> u16 {
        self.mask
    }

    pub fn present(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo { mask: self.mask, dev_id: self.dev_id, cluster: self.cluster }
    }

    /// Sub-block `i`, or `None` for a hole.
    pub fn block(&self, i: usize) -> Option<&[u8]> {
        if i >= BLOCKS_PER_CLUSTER || self.mask & (1 << i) == 0 {
            return None;
        }
        let slot = (self.mask & ((1u16 << i) - 1)).count_ones() as usize;
        Some(&self.blocks[slot * BLOCK_SIZE..(slot + 1) * BLOCK_SIZE])
    }

    /// Compact form: present blocks only, concatenated in mask order.
    pub fn get_blocks(&self) -> &[u8] {
        &self.blocks
    }

    /// Logical form: the full 64 KiB with holes as zeros.
    pub fn get_cluster(&self) -> Vec<u8> {
        let mut out = vec![0u8; CLUSTER_SIZE];
        for i in 0..BLOCKS_PER_CLUSTER {
            if let Some(block) = self.block(i) {
                out[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE].copy_from_slice(block);
            }
        }
        out
    }

    /// Byte offset of this cluster within its device.
    pub fn device_offset(&self) -> u64 {
        self.cluster as u64 * CLUSTER_SIZE as u64
    }
}
