//! Streaming archive engine: cluster reader and archive writer.
//!
//! # Reader
//! [`ArchiveReader`] reads and verifies the header, then hands the rest of
//! the stream to a [`ClusterReader`]: a forward-only iterator of
//! [`BlockGroup`]s.  Extent headers are parsed one at a time and a group's
//! payload is only pulled from the stream when the iterator reaches it, so
//! peak memory is one extent header plus one cluster.
//!
//! A short read of exactly zero bytes where the next extent header would
//! start is the end of the archive.  Any other short read is corruption.
//!
//! # Writer
//! [`ArchiveWriter`] writes the header up front, then packs clusters into
//! extents of up to 59 block groups and flushes each one as it fills.  The
//! final partial extent is flushed by [`ArchiveWriter::finish`]; an empty
//! one is dropped.
//!
//! # Endianness
//! All record integers are big-endian; see `header.rs` and `extent.rs`.

use std::collections::VecDeque;
use std::io::{Read, Write};

use log::{debug, info};
use serde::Serialize;

use crate::block::{BlockGroup, BlockInfo, BLOCK_SIZE, BLOCKS_PER_CLUSTER, CLUSTER_SIZE};
use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentHeader};
use crate::header::{ArchiveHeader, MAX_DEVICES};
use crate::record::{read_full, RecordReader};
use crate::reorder::{Reorder, ReorderConfig};

// ── Statistics ───────────────────────────────────────────────────────────────

/// Counters gathered while streaming clusters in or out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub extents:     u64,
    pub clusters:    u64,
    /// 4 KiB blocks stored.
    pub data_blocks: u64,
    /// 4 KiB blocks recorded as holes.
    pub hole_blocks: u64,
}

impl StreamStats {
    fn count(&mut self, group: &BlockGroup) {
        self.clusters += 1;
        self.data_blocks += group.present() as u64;
        self.hole_blocks += (BLOCKS_PER_CLUSTER - group.present()) as u64;
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct ArchiveReader<R: Read> {
    reader:     RecordReader<R>,
    pub header: ArchiveHeader,
}

impl<R: Read> ArchiveReader<R> {
    /// Read and verify the header.  The stream must be positioned at the
    /// start of the archive.
    pub fn new(reader: R) -> Result<Self> {
        let mut reader = RecordReader::new(reader);
        let header = ArchiveHeader::read(&mut reader)?;
        debug!(
            "header: uuid={} devices={} configs={}",
            header.uuid, header.devices.len(), header.configs.len()
        );
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// Block groups in on-disk order.
    pub fn clusters(self) -> ClusterReader<R> {
        ClusterReader::new(self.reader, &self.header)
    }

    /// Block groups in strictly ascending cluster order per device.  Fails
    /// up front if `config` is inconsistent.
    pub fn ordered_clusters(self, config: ReorderConfig) -> Result<Reorder<ClusterReader<R>>> {
        Reorder::new(self.clusters(), config)
    }

    /// Walk the whole archive, checking every extent.
    pub fn verify(self) -> Result<StreamStats> {
        let mut clusters = self.clusters();
        for group in clusters.by_ref() {
            group?;
        }
        let stats = clusters.stats();
        info!("verified {} extents, {} clusters", stats.extents, stats.clusters);
        Ok(stats)
    }
}

/// Clusters of one device already read, one bit each.  The bitmap grows
/// with the highest cluster seen, never past the declared size.
#[derive(Debug)]
struct SeenClusters {
    clusters: u64,
    bits:     Vec<u64>,
}

impl SeenClusters {
    fn new(clusters: u64) -> Self {
        Self { clusters, bits: Vec::new() }
    }

    /// Mark `cluster` as read; `false` if it already was.
    fn insert(&mut self, cluster: u32) -> bool {
        let (word, bit) = (cluster as usize / 64, cluster % 64);
        if word >= self.bits.len() {
            self.bits.resize(word + 1, 0);
        }
        let fresh = self.bits[word] & (1 << bit) == 0;
        self.bits[word] |= 1 << bit;
        fresh
    }
}

/// Lazy iterator over the block groups of an archive's extents.
///
/// Yields an error at most once; after that, or after the clean end of the
/// stream, it only returns `None`.
pub struct ClusterReader<R: Read> {
    reader:  RecordReader<R>,
    uuid:    [u8; 16],
    /// Indexed by device id; `None` for ids missing from the header.
    devices: Vec<Option<SeenClusters>>,
    /// Block infos of the current extent not yet yielded, with the offset
    /// of the extent header they came from.
    pending: VecDeque<BlockInfo>,
    extent_offset: u64,
    stats:   StreamStats,
    done:    bool,
}

impl<R: Read> ClusterReader<R> {
    pub fn new(reader: RecordReader<R>, header: &ArchiveHeader) -> Self {
        let mut devices: Vec<Option<SeenClusters>> = (0..MAX_DEVICES).map(|_| None).collect();
        for dev in &header.devices {
            devices[dev.id as usize] = Some(SeenClusters::new(dev.cluster_count()));
        }
        Self {
            reader,
            uuid: *header.uuid.as_bytes(),
            devices,
            pending: VecDeque::new(),
            extent_offset: 0,
            stats: StreamStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Parse the next extent header.  `Ok(false)` means clean end of stream.
    fn next_extent(&mut self) -> Result<bool> {
        let offset = self.reader.offset();
        let header = match ExtentHeader::read(&mut self.reader) {
            Ok(h) => h,
            Err(e) if e.is_clean_eof() => return Ok(false),
            Err(e) => return Err(e),
        };
        if header.uuid != self.uuid {
            return Err(Error::corrupt(offset, "extent archive id does not match header"));
        }
        self.stats.extents += 1;
        self.extent_offset = offset;
        self.pending.extend(header.blockinfo.iter().copied());
        Ok(true)
    }

    fn next_group(&mut self) -> Result<Option<BlockGroup>> {
        loop {
            let info = match self.pending.pop_front() {
                Some(info) => info,
                None => {
                    if !self.next_extent()? {
                        return Ok(None);
                    }
                    continue;
                }
            };
            let blocks = self.reader.read_vec(info.present() * BLOCK_SIZE)?;
            if info.dev_id == 0 {
                continue;
            }
            let Some(seen) = self.devices[info.dev_id as usize].as_mut() else {
                return Err(Error::corrupt(self.extent_offset, format!(
                    "cluster {} references unknown device {}", info.cluster, info.dev_id)));
            };
            if info.cluster as u64 >= seen.clusters {
                return Err(Error::corrupt(self.extent_offset, format!(
                    "cluster {} beyond the {} clusters of device {}",
                    info.cluster, seen.clusters, info.dev_id)));
            }
            if !seen.insert(info.cluster) {
                return Err(Error::DuplicateCluster { device: info.dev_id, cluster: info.cluster });
            }
            let group = BlockGroup::from_parts(info, blocks);
            self.stats.count(&group);
            return Ok(Some(group));
        }
    }
}

impl<R: Read> Iterator for ClusterReader<R> {
    type Item = Result<BlockGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_group() {
            Ok(Some(group)) => Some(Ok(group)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct ArchiveWriter<W: Write> {
    writer:     W,
    pub header: ArchiveHeader,
    extent:     Extent,
    stats:      StreamStats,
}

impl<W: Write> ArchiveWriter<W> {
    /// Write `header` and get ready to accept clusters.
    pub fn new(mut writer: W, header: ArchiveHeader) -> Result<Self> {
        let len = header.write(&mut writer)?;
        debug!("wrote {len} byte header for {}", header.uuid);
        let extent = Extent::new(*header.uuid.as_bytes());
        Ok(Self { writer, header, extent, stats: StreamStats::default() })
    }

    /// Add the cluster `cluster` of device `dev_id`; `data` may be shorter
    /// than a cluster at the end of a device.
    pub fn add_cluster(&mut self, dev_id: u8, cluster: u32, data: &[u8]) -> Result<()> {
        let dev = self.header.device(dev_id).ok_or_else(|| Error::InvalidDevice {
            device: dev_id,
            reason: "not in device table".into(),
        })?;
        if cluster as u64 >= dev.cluster_count() {
            return Err(Error::InvalidDevice {
                device: dev_id,
                reason: format!("cluster {cluster} beyond declared size {}", dev.size),
            });
        }
        if data.len() > CLUSTER_SIZE {
            return Err(Error::InvalidDevice {
                device: dev_id,
                reason: format!("cluster {cluster} is {} bytes", data.len()),
            });
        }
        if self.extent.add(dev_id, cluster, data) {
            self.flush_extent()?;
        }
        Ok(())
    }

    /// Add a block group in its logical form, so the presence mask is
    /// derived again from the data.
    pub fn add_group(&mut self, group: &BlockGroup) -> Result<()> {
        self.add_cluster(group.dev_id, group.cluster, &group.get_cluster())
    }

    /// Stream a whole device payload, cluster by cluster, from `reader`.
    /// The payload must be exactly the device's declared size.
    pub fn write_device<R: Read>(&mut self, dev_id: u8, mut reader: R) -> Result<u64> {
        let size = self
            .header
            .device(dev_id)
            .map(|d| d.size)
            .ok_or_else(|| Error::InvalidDevice { device: dev_id, reason: "not in device table".into() })?;
        let mut buf = vec![0u8; CLUSTER_SIZE];
        let mut total = 0u64;
        let mut cluster = 0u32;
        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > size {
                return Err(Error::InvalidDevice {
                    device: dev_id,
                    reason: format!("payload larger than declared size {size}"),
                });
            }
            self.add_cluster(dev_id, cluster, &buf[..n])?;
            cluster += 1;
            if n < CLUSTER_SIZE {
                break;
            }
        }
        if total != size {
            return Err(Error::InvalidDevice {
                device: dev_id,
                reason: format!("payload is {total} bytes, declared {size}"),
            });
        }
        Ok(total)
    }

    fn flush_extent(&mut self) -> Result<()> {
        let bytes = self.extent.serialize();
        if bytes.is_empty() {
            return Ok(());
        }
        self.writer.write_all(&bytes)?;
        for group in self.extent.groups() {
            self.stats.count(group);
        }
        self.stats.extents += 1;
        debug!("flushed extent {} ({} groups, {} bytes)", self.stats.extents, self.extent.len(), bytes.len());
        self.extent.clear();
        Ok(())
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Flush the final partial extent and return the sink.
    pub fn finish(mut self) -> Result<(W, StreamStats)> {
        self.flush_extent()?;
        self.writer.flush()?;
        Ok((self.writer, self.stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{BLOCKS_PER_EXTENT, EXTENT_HEADER_SIZE};
    use crate::header::HEADER_SIZE;
    use std::io::Cursor;
    use uuid::Uuid;

    fn header(devices: &[(&str, u64)]) -> ArchiveHeader {
        let mut h = ArchiveHeader::new(Uuid::from_bytes([0x42; 16]), 1_600_000_000);
        h.add_config("qemu-server.conf", b"name: test\n".to_vec()).unwrap();
        for (name, size) in devices {
            h.add_device(name, *size).unwrap();
        }
        h
    }

    fn payload(clusters: usize, seed: u8) -> Vec<u8> {
        (0..clusters * CLUSTER_SIZE).map(|i| (i / BLOCK_SIZE) as u8 ^ seed | 1).collect()
    }

    fn write(h: ArchiveHeader, devices: &[Vec<u8>]) -> Vec<u8> {
        let mut w = ArchiveWriter::new(Vec::new(), h).unwrap();
        for (i, data) in devices.iter().enumerate() {
            w.write_device(i as u8 + 1, &data[..]).unwrap();
        }
        w.finish().unwrap().0
    }

    fn read_all(bytes: &[u8]) -> Result<Vec<BlockGroup>> {
        ArchiveReader::new(Cursor::new(bytes))?.clusters().collect()
    }

    #[test]
    fn writes_and_reads_back() {
        let data = payload(3, 7);
        let bytes = write(header(&[("drive-scsi0", data.len() as u64)]), &[data.clone()]);
        let groups = read_all(&bytes).unwrap();
        assert_eq!(groups.len(), 3);
        let joined: Vec<u8> = groups.iter().flat_map(|g| g.get_cluster()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn extents_split_at_capacity() {
        let clusters = BLOCKS_PER_EXTENT + 1;
        let data = vec![0u8; clusters * CLUSTER_SIZE];
        let h = header(&[("drive-scsi0", data.len() as u64)]);
        let header_len = h.to_bytes().unwrap().len();
        let bytes = write(h, &[data]);
        // All-zero clusters store no payload.
        assert_eq!(bytes.len(), header_len + 2 * EXTENT_HEADER_SIZE);
        let mut reader = ArchiveReader::new(Cursor::new(&bytes[..])).unwrap().clusters();
        assert_eq!(reader.by_ref().count(), clusters);
        assert_eq!(reader.stats().extents, 2);
        assert_eq!(reader.stats().hole_blocks, (clusters * BLOCKS_PER_CLUSTER) as u64);
    }

    #[test]
    fn short_final_cluster() {
        let mut data = payload(1, 3);
        data.extend_from_slice(&[9u8; 5000]);
        let bytes = write(header(&[("drive-scsi0", data.len() as u64)]), &[data]);
        let groups = read_all(&bytes).unwrap();
        assert_eq!(groups[1].mask(), 0b11);
        assert_eq!(groups[1].get_cluster()[5000..].iter().filter(|&&b| b != 0).count(), 0);
    }

    #[test]
    fn payload_size_must_match_declaration() {
        let h = header(&[("drive-scsi0", 2 * CLUSTER_SIZE as u64)]);
        let mut w = ArchiveWriter::new(Vec::new(), h).unwrap();
        assert!(matches!(
            w.write_device(1, &payload(1, 0)[..]),
            Err(Error::InvalidDevice { device: 1, .. })
        ));
        assert!(w.add_cluster(2, 0, &[]).is_err());
        assert!(w.add_cluster(1, 2, &[]).is_err());
    }

    #[test]
    fn truncated_payload_is_fatal() {
        let data = payload(2, 1);
        let bytes = write(header(&[("drive-scsi0", data.len() as u64)]), &[data]);
        let cut = &bytes[..bytes.len() - 100];
        assert!(matches!(read_all(cut), Err(Error::Truncated { .. })));
    }

    #[test]
    fn truncated_extent_header_is_fatal() {
        let data = payload(1, 1);
        let h = header(&[("drive-scsi0", data.len() as u64)]);
        let header_len = h.to_bytes().unwrap().len();
        let bytes = write(h, &[data]);
        let cut = &bytes[..header_len + 100];
        match read_all(cut) {
            Err(Error::Truncated { offset, available, .. }) => {
                assert_eq!(offset, header_len as u64);
                assert_eq!(available, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_cluster_is_fatal() {
        let h = header(&[("drive-scsi0", 2 * CLUSTER_SIZE as u64)]);
        let mut w = ArchiveWriter::new(Vec::new(), h).unwrap();
        w.add_cluster(1, 0, &[1u8; 10]).unwrap();
        w.add_cluster(1, 1, &[2u8; 10]).unwrap();
        w.add_cluster(1, 0, &[3u8; 10]).unwrap();
        let bytes = w.finish().unwrap().0;
        assert!(matches!(
            read_all(&bytes),
            Err(Error::DuplicateCluster { device: 1, cluster: 0 })
        ));
    }

    #[test]
    fn cluster_beyond_declared_size_fails_verify() {
        let h = header(&[("drive-a", CLUSTER_SIZE as u64)]);
        let mut bytes = h.to_bytes().unwrap();
        let mut extent = Extent::new(*h.uuid.as_bytes());
        extent.add(1, 5, &[1u8; 10]);
        bytes.extend_from_slice(&extent.serialize());

        let err = ArchiveReader::new(Cursor::new(&bytes[..])).unwrap().verify().unwrap_err();
        match err {
            Error::Corrupt { offset, reason } => {
                assert_eq!(offset, h.to_bytes().unwrap().len() as u64);
                assert!(reason.contains("cluster 5"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_far_into_large_device_is_fatal() {
        let h = header(&[("drive-scsi0", 1 << 40)]);
        let mut w = ArchiveWriter::new(Vec::new(), h).unwrap();
        w.add_cluster(1, 16_000_000, &[1u8; 10]).unwrap();
        w.add_cluster(1, 3, &[2u8; 10]).unwrap();
        w.add_cluster(1, 16_000_000, &[3u8; 10]).unwrap();
        let bytes = w.finish().unwrap().0;
        assert!(matches!(
            read_all(&bytes),
            Err(Error::DuplicateCluster { device: 1, cluster: 16_000_000 })
        ));
    }

    #[test]
    fn seen_clusters_bitmap() {
        let mut seen = SeenClusters::new(200);
        assert!(seen.insert(0));
        assert!(seen.insert(130));
        assert!(!seen.insert(130));
        assert!(seen.insert(63));
        assert!(seen.insert(64));
        assert!(!seen.insert(0));
        assert_eq!(seen.bits.len(), 3);
    }

    #[test]
    fn foreign_extent_id_is_corrupt() {
        let data = payload(1, 1);
        let h = header(&[("drive-scsi0", data.len() as u64)]);
        let mut bytes = write(h.clone(), &[data.clone()]);
        let mut other = h;
        other.uuid = Uuid::from_bytes([0x43; 16]);
        let foreign = write(other, &[data]);
        let header_len = HEADER_SIZE + 512;
        bytes.extend_from_slice(&foreign[header_len..]);
        assert!(matches!(read_all(&bytes), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn reader_stops_after_error() {
        let data = payload(1, 1);
        let bytes = write(header(&[("drive-scsi0", data.len() as u64)]), &[data]);
        let mut reader = ArchiveReader::new(Cursor::new(&bytes[..bytes.len() - 1])).unwrap().clusters();
        assert!(reader.next().unwrap().is_err());
        assert!(reader.next().is_none());
    }
}
