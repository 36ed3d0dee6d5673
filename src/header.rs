//! Archive header: the 12288-byte fixed record followed by the blob table.
//!
//! Two layers:
//! - [`HeaderRecord`] is the pointer-level record exactly as laid out on
//!   disk.  `decode` and `encode` are inverses; checksum verification
//!   re-encodes with the checksum field cleared.
//! - [`ArchiveHeader`] is the resolved view: archive id, creation time,
//!   named configs and devices.  Building the on-disk form assigns blob
//!   table offsets in table order, so equal headers encode to equal bytes.
//!
//! All integers are big-endian.  Reserved regions are written as zero and
//! not retained on decode.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use log::warn;
use uuid::Uuid;

use crate::blob::BlobTable;
use crate::error::{Error, Result};
use crate::record::{md5_with_zeroed, RecordReader};

pub const MAGIC: &[u8; 4] = b"VMA\0";
pub const VERSION: u32 = 1;
/// Size of the fixed header record; the blob table starts here.
pub const HEADER_SIZE: usize = 12288;
pub const MAX_CONFIGS: usize = 256;
/// Device table slots, including the reserved slot 0.
pub const MAX_DEVICES: usize = 256;
pub const DEVICE_INFO_SIZE: usize = 32;

/// The id the optimizer stamps on order-normalized archives.
pub const CANONICAL_UUID: [u8; 16] = [
    0x12, 0x34, 0x56, 0x78, 0xaa, 0xbb, 0xcc, 0xdd,
    0xee, 0xff, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff,
];

const MD5_FIELD: std::ops::Range<usize> = 32..48;
const RESERVED_LEN: usize = 1984;
const CONFIG_NAMES_AT: usize = 2044;
const CONFIG_DATA_AT: usize = CONFIG_NAMES_AT + 4 * MAX_CONFIGS;
const DEVICES_AT: usize = 4096;

// ── HeaderRecord ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceSlot {
    pub name_ptr: u32,
    pub size:     u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRecord {
    pub magic:              [u8; 4],
    pub version:            u32,
    pub uuid:               [u8; 16],
    pub ctime:              i64,
    pub md5sum:             [u8; 16],
    pub blob_buffer_offset: u32,
    pub blob_buffer_size:   u32,
    pub header_size:        u32,
    pub config_names:       [u32; MAX_CONFIGS],
    pub config_data:        [u32; MAX_CONFIGS],
    pub devices:            [DeviceSlot; MAX_DEVICES],
}

impl HeaderRecord {
    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// The fixed record; reserved regions stay zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buf[4..8], self.version);
        buf[8..24].copy_from_slice(&self.uuid);
        BigEndian::write_i64(&mut buf[24..32], self.ctime);
        buf[MD5_FIELD].copy_from_slice(&self.md5sum);
        BigEndian::write_u32(&mut buf[48..52], self.blob_buffer_offset);
        BigEndian::write_u32(&mut buf[52..56], self.blob_buffer_size);
        BigEndian::write_u32(&mut buf[56..60], self.header_size);
        BigEndian::write_u32_into(&self.config_names, &mut buf[CONFIG_NAMES_AT..CONFIG_DATA_AT]);
        BigEndian::write_u32_into(&self.config_data, &mut buf[CONFIG_DATA_AT..CONFIG_DATA_AT + 4 * MAX_CONFIGS]);
        for (i, dev) in self.devices.iter().enumerate() {
            let at = DEVICES_AT + i * DEVICE_INFO_SIZE;
            BigEndian::write_u32(&mut buf[at..at + 4], dev.name_ptr);
            BigEndian::write_u64(&mut buf[at + 8..at + 16], dev.size);
        }
        buf
    }

    /// Decode the fixed record.  Checks magic and version only; pointers
    /// and the checksum are validated once the blob table is available.
    pub fn decode(buf: &[u8], offset: u64) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Truncated { offset, expected: HEADER_SIZE, available: buf.len() });
        }
        let mut r = Cursor::new(buf);
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::BadMagic { what: "header", offset });
        }
        let version = r.read_u32::<BigEndian>()?;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let mut uuid = [0u8; 16];
        r.read_exact(&mut uuid)?;
        let ctime = r.read_i64::<BigEndian>()?;
        let mut md5sum = [0u8; 16];
        r.read_exact(&mut md5sum)?;
        let blob_buffer_offset = r.read_u32::<BigEndian>()?;
        let blob_buffer_size = r.read_u32::<BigEndian>()?;
        let header_size = r.read_u32::<BigEndian>()?;
        r.set_position(r.position() + RESERVED_LEN as u64);

        let mut config_names = [0u32; MAX_CONFIGS];
        for ptr in config_names.iter_mut() {
            *ptr = r.read_u32::<BigEndian>()?;
        }
        let mut config_data = [0u32; MAX_CONFIGS];
        for ptr in config_data.iter_mut() {
            *ptr = r.read_u32::<BigEndian>()?;
        }
        let _reserved = r.read_u32::<BigEndian>()?;

        let mut devices = [DeviceSlot::default(); MAX_DEVICES];
        for dev in devices.iter_mut() {
            dev.name_ptr = r.read_u32::<BigEndian>()?;
            let _reserved = r.read_u32::<BigEndian>()?;
            dev.size = r.read_u64::<BigEndian>()?;
            r.set_position(r.position() + 16);
        }

        Ok(Self {
            magic,
            version,
            uuid,
            ctime,
            md5sum,
            blob_buffer_offset,
            blob_buffer_size,
            header_size,
            config_names,
            config_data,
            devices,
        })
    }

    /// MD5 over this record plus `blob` with the checksum field zeroed.
    pub fn checksum(&self, blob: &[u8]) -> [u8; 16] {
        let mut buf = self.encode();
        buf.extend_from_slice(blob);
        md5_with_zeroed(&buf, MD5_FIELD)
    }
}

// ── ArchiveHeader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// 1..=255, the device's slot in the device table.
    pub id:   u8,
    pub name: String,
    pub size: u64,
}

impl DeviceInfo {
    /// Number of clusters needed to cover the declared size.
    pub fn cluster_count(&self) -> u64 {
        self.size.div_ceil(crate::block::CLUSTER_SIZE as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub uuid:    Uuid,
    /// Creation time, seconds since the epoch.
    pub ctime:   i64,
    pub configs: Vec<ConfigEntry>,
    pub devices: Vec<DeviceInfo>,
}

impl ArchiveHeader {
    pub fn new(uuid: Uuid, ctime: i64) -> Self {
        Self { uuid, ctime, configs: Vec::new(), devices: Vec::new() }
    }

    pub fn is_canonical(&self) -> bool {
        self.uuid.as_bytes() == &CANONICAL_UUID
    }

    pub fn add_config(&mut self, name: &str, data: Vec<u8>) -> Result<()> {
        validate_name(name)?;
        if self.configs.len() >= MAX_CONFIGS {
            return Err(Error::Capacity { what: "configs", limit: MAX_CONFIGS });
        }
        if self.config(name).is_some() {
            return Err(Error::Config(format!("duplicate config {name:?}")));
        }
        self.configs.push(ConfigEntry { name: name.to_owned(), data });
        Ok(())
    }

    pub fn config(&self, name: &str) -> Option<&ConfigEntry> {
        self.configs.iter().find(|c| c.name == name)
    }

    pub fn config_mut(&mut self, name: &str) -> Option<&mut ConfigEntry> {
        self.configs.iter_mut().find(|c| c.name == name)
    }

    /// Register a device under the next free id (starting at 1).
    pub fn add_device(&mut self, name: &str, size: u64) -> Result<u8> {
        validate_name(name)?;
        let next = self.devices.iter().map(|d| d.id as usize).max().unwrap_or(0) + 1;
        if next >= MAX_DEVICES {
            return Err(Error::Capacity { what: "devices", limit: MAX_DEVICES - 1 });
        }
        let id = next as u8;
        if size == 0 {
            return Err(Error::InvalidDevice { device: id, reason: "size is zero".into() });
        }
        if self.devices.iter().any(|d| d.name == name) {
            return Err(Error::InvalidDevice { device: id, reason: format!("duplicate name {name:?}") });
        }
        self.devices.push(DeviceInfo { id, name: name.to_owned(), size });
        Ok(id)
    }

    pub fn device(&self, id: u8) -> Option<&DeviceInfo> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Build the pointer-level record and blob table, checksum filled in.
    pub fn to_record(&self) -> Result<(HeaderRecord, BlobTable)> {
        let mut blobs = BlobTable::new();
        let mut config_names = [0u32; MAX_CONFIGS];
        let mut config_data = [0u32; MAX_CONFIGS];
        if self.configs.len() > MAX_CONFIGS {
            return Err(Error::Capacity { what: "configs", limit: MAX_CONFIGS });
        }
        for (slot, cfg) in self.configs.iter().enumerate() {
            config_names[slot] = blobs.add_string(cfg.name.as_bytes())?;
            config_data[slot] = blobs.add_blob(&cfg.data)?;
        }

        let mut devices = [DeviceSlot::default(); MAX_DEVICES];
        for dev in &self.devices {
            if dev.id == 0 || dev.size == 0 {
                return Err(Error::InvalidDevice { device: dev.id, reason: "empty slot".into() });
            }
            let slot = &mut devices[dev.id as usize];
            if slot.size != 0 {
                return Err(Error::InvalidDevice { device: dev.id, reason: "id used twice".into() });
            }
            *slot = DeviceSlot { name_ptr: blobs.add_string(dev.name.as_bytes())?, size: dev.size };
        }

        let blob_size = blobs.serialized_len();
        let header_size = u32::try_from(HEADER_SIZE + blob_size)
            .map_err(|_| Error::BlobTooLarge(blob_size))?;
        let mut record = HeaderRecord {
            magic:              *MAGIC,
            version:            VERSION,
            uuid:               *self.uuid.as_bytes(),
            ctime:              self.ctime,
            md5sum:             [0u8; 16],
            blob_buffer_offset: HEADER_SIZE as u32,
            blob_buffer_size:   blob_size as u32,
            header_size,
            config_names,
            config_data,
            devices,
        };
        record.md5sum = record.checksum(&blobs.serialize());
        Ok((record, blobs))
    }

    /// Serialize header record plus blob table.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let (record, blobs) = self.to_record()?;
        let mut out = record.encode();
        out.extend_from_slice(&blobs.serialize());
        Ok(out)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<usize> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        Ok(bytes.len())
    }

    /// Read and verify a header from the start of `reader`.
    pub fn read<R: Read>(reader: &mut RecordReader<R>) -> Result<Self> {
        let offset = reader.offset();
        let fixed = reader.read_vec(HEADER_SIZE)?;
        let record = HeaderRecord::decode(&fixed, offset)?;
        if record.encode() != fixed {
            return Err(Error::corrupt(offset, "reserved header bytes are set"));
        }

        if record.blob_buffer_offset as usize != HEADER_SIZE {
            return Err(Error::corrupt(offset, format!(
                "blob table offset {} (expected {HEADER_SIZE})", record.blob_buffer_offset)));
        }
        let blob_size = record.blob_buffer_size as usize;
        if record.header_size as usize != HEADER_SIZE + blob_size {
            return Err(Error::corrupt(offset, format!(
                "header size {} does not match blob table size {blob_size}", record.header_size)));
        }
        let blob_bytes = reader.read_vec(blob_size)?;

        if record.checksum(&blob_bytes) != record.md5sum {
            return Err(Error::ChecksumMismatch { what: "header", offset });
        }
        Self::from_record(&record, &BlobTable::parse(&blob_bytes), offset)
    }

    /// Resolve every pointer of a verified record through its blob table.
    pub fn from_record(record: &HeaderRecord, blobs: &BlobTable, offset: u64) -> Result<Self> {
        let mut header = Self::new(Uuid::from_bytes(record.uuid), record.ctime);

        for (slot, (&name_ptr, &data_ptr)) in
            record.config_names.iter().zip(record.config_data.iter()).enumerate()
        {
            if name_ptr == 0 {
                continue;
            }
            let name = blobs.lookup_str(name_ptr).ok_or_else(|| {
                Error::corrupt(offset, format!("config slot {slot} name pointer {name_ptr}"))
            })?;
            let data = match blobs.lookup(data_ptr) {
                Some(d) => d.to_vec(),
                None => {
                    warn!("config slot {slot} has no data blob (pointer {data_ptr})");
                    Vec::new()
                }
            };
            header.configs.push(ConfigEntry {
                name: String::from_utf8_lossy(name).into_owned(),
                data,
            });
        }

        for (id, slot) in record.devices.iter().enumerate() {
            if slot.size == 0 {
                continue;
            }
            if id == 0 {
                return Err(Error::corrupt(offset, "device slot 0 is reserved"));
            }
            let name = blobs.lookup_str(slot.name_ptr).ok_or_else(|| {
                Error::corrupt(offset, format!("device {id} name pointer {}", slot.name_ptr))
            })?;
            header.devices.push(DeviceInfo {
                id:   id as u8,
                name: String::from_utf8_lossy(name).into_owned(),
                size: slot.size,
            });
        }
        Ok(header)
    }
}

/// Names end up as file names on unpack, so keep them to one path component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(Error::InvalidName(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArchiveHeader {
        let mut h = ArchiveHeader::new(Uuid::from_bytes([7u8; 16]), 1_700_000_000);
        h.add_config("qemu-server.conf", b"name: vm100\nmemory: 2048\n".to_vec()).unwrap();
        h.add_config("qemu-server.fw", b"[OPTIONS]\nenable: 1\n".to_vec()).unwrap();
        h.add_device("drive-scsi0", 3 * 65536).unwrap();
        h.add_device("drive-efidisk0", 131072).unwrap();
        h
    }

    fn parse(bytes: &[u8]) -> Result<ArchiveHeader> {
        ArchiveHeader::read(&mut RecordReader::new(Cursor::new(bytes)))
    }

    #[test]
    fn record_is_fixed_size() {
        let (record, blobs) = sample().to_record().unwrap();
        assert_eq!(record.encode().len(), HEADER_SIZE);
        assert_eq!(record.header_size as usize, HEADER_SIZE + blobs.serialized_len());
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let h = sample();
        let bytes = h.to_bytes().unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
        assert_eq!(parsed.device(1).unwrap().name, "drive-scsi0");
        assert_eq!(parsed.device(2).unwrap().cluster_count(), 2);
    }

    #[test]
    fn record_decode_encode_inverse() {
        let bytes = sample().to_bytes().unwrap();
        let record = HeaderRecord::decode(&bytes, 0).unwrap();
        assert_eq!(record.encode(), bytes[..HEADER_SIZE]);
    }

    #[test]
    fn record_fields_at_fixed_offsets() {
        let h = sample();
        let bytes = h.to_bytes().unwrap();
        let (record, _) = h.to_record().unwrap();
        let be32 = |at: usize| u32::from_be_bytes(bytes[at..at + 4].try_into().unwrap());
        assert_eq!(be32(4), VERSION);
        assert_eq!(&bytes[8..24], &[7u8; 16]);
        assert_eq!(i64::from_be_bytes(bytes[24..32].try_into().unwrap()), 1_700_000_000);
        assert_eq!(bytes[32..48], record.md5sum);
        assert_eq!(be32(48), HEADER_SIZE as u32);
        assert_eq!(be32(56) as usize, bytes.len());
        assert!(bytes[60..2044].iter().all(|&b| b == 0));
        assert_eq!(be32(2044), record.config_names[0]);
        assert_eq!(be32(3068 + 4), record.config_data[1]);
        let dev1 = 4096 + DEVICE_INFO_SIZE;
        assert_eq!(be32(dev1), record.devices[1].name_ptr);
        assert_eq!(u64::from_be_bytes(bytes[dev1 + 8..dev1 + 16].try_into().unwrap()), 3 * 65536);
    }

    #[test]
    fn device_ids_are_sequential() {
        let mut h = ArchiveHeader::new(Uuid::nil(), 0);
        assert_eq!(h.add_device("drive-a", 1).unwrap(), 1);
        assert_eq!(h.add_device("drive-b", 1).unwrap(), 2);
        assert!(h.add_device("drive-c", 0).is_err());
        assert!(h.add_device("drive-a", 5).is_err());
    }

    #[test]
    fn bad_magic_and_version() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(parse(&bytes), Err(Error::BadMagic { offset: 0, .. })));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[7] = 2;
        assert!(matches!(parse(&bytes), Err(Error::UnsupportedVersion(2))));
    }

    #[test]
    fn checksum_field_flip_detected() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[40] ^= 0x01;
        assert!(matches!(parse(&bytes), Err(Error::ChecksumMismatch { what: "header", offset: 0 })));
    }

    #[test]
    fn truncated_header() {
        let bytes = sample().to_bytes().unwrap();
        match parse(&bytes[..HEADER_SIZE + 10]) {
            Err(Error::Truncated { offset, .. }) => assert_eq!(offset, HEADER_SIZE as u64),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn canonical_flag() {
        let mut h = sample();
        assert!(!h.is_canonical());
        h.uuid = Uuid::from_bytes(CANONICAL_UUID);
        assert!(h.is_canonical());
        assert_eq!(hex::encode(CANONICAL_UUID), "12345678aabbccddeeffaabbccddeeff");
    }

    proptest::proptest! {
        #[test]
        fn any_bit_flip_is_rejected(byte in 0usize..HEADER_SIZE + 512, bit in 0u8..8) {
            let mut bytes = sample().to_bytes().unwrap();
            proptest::prop_assume!(byte < bytes.len());
            bytes[byte] ^= 1 << bit;
            let rejected = matches!(
                parse(&bytes),
                Err(Error::ChecksumMismatch { .. })
                    | Err(Error::Corrupt { .. })
                    | Err(Error::BadMagic { .. })
                    | Err(Error::UnsupportedVersion(_))
            );
            proptest::prop_assert!(rejected);
        }
    }

    #[test]
    fn names_are_single_components() {
        assert!(validate_name("drive-scsi0").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "a\0b"] {
            assert!(validate_name(bad).is_err(), "{bad:?}");
        }
    }
}
