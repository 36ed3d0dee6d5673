//! High-level [`Archive`] API, the primary embedding surface.
//!
//! ```no_run
//! use vmadedup::archive::{Archive, PackOptions};
//! use vmadedup::reorder::ReorderConfig;
//!
//! // Pack a directory holding qemu-server.conf and drive-scsi0
//! Archive::pack_dir("vm100", "vm100.vma", &PackOptions::default())?;
//!
//! // Normalize cluster order and archive id in place
//! let ar = Archive::open("vm100.vma")?;
//! ar.optimize("vm100.vma", ReorderConfig::default())?;
//!
//! // Unpack again
//! Archive::open("vm100.vma")?.extract_all("restore")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Every operation that produces a file writes to a temporary sibling and
//! renames it into place only after the whole stream succeeded.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use tempfile::{Builder, NamedTempFile};
use uuid::Uuid;

use crate::block::{BLOCK_SIZE, BLOCKS_PER_CLUSTER};
use crate::conf::GuestConfig;
use crate::error::{Error, Result};
use crate::header::{validate_name, ArchiveHeader, CANONICAL_UUID};
use crate::io_stream::{ArchiveReader, ArchiveWriter, StreamStats};
use crate::reorder::{ReorderConfig, ReorderStats};

/// Files named like this are device payloads when packing a directory.
pub const DRIVE_PREFIX: &str = "drive-";

// ── PackOptions ───────────────────────────────────────────────────────────────

/// Configuration for [`Archive::pack_dir`].
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Defaults to a random v4 id.
    pub archive_id: Option<Uuid>,
    /// Creation time in seconds since the epoch; defaults to now.
    pub ctime:      Option<i64>,
}

// ── ArchiveInfo ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub id:       u8,
    pub name:     String,
    pub size:     u64,
    pub clusters: u64,
}

/// Header summary returned by [`Archive::info`].
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub uuid:      String,
    pub canonical: bool,
    pub ctime:     i64,
    pub created:   Option<String>,
    pub configs:   Vec<ConfigSummary>,
    pub devices:   Vec<DeviceSummary>,
}

impl From<&ArchiveHeader> for ArchiveInfo {
    fn from(h: &ArchiveHeader) -> Self {
        ArchiveInfo {
            uuid:      hex::encode(h.uuid.as_bytes()),
            canonical: h.is_canonical(),
            ctime:     h.ctime,
            created:   DateTime::<Utc>::from_timestamp(h.ctime, 0).map(|t| t.to_rfc3339()),
            configs:   h.configs.iter()
                .map(|c| ConfigSummary { name: c.name.clone(), size: c.data.len() })
                .collect(),
            devices:   h.devices.iter()
                .map(|d| DeviceSummary {
                    id:       d.id,
                    name:     d.name.clone(),
                    size:     d.size,
                    clusters: d.cluster_count(),
                })
                .collect(),
        }
    }
}

// ── Optimizer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizeOutcome {
    /// The source already carries the canonical id; nothing was written.
    AlreadyCanonical,
    Optimized { stats: StreamStats, reorder: ReorderStats },
}

/// Rewrite `src` into `dst` with the canonical archive id and clusters in
/// strictly ascending order per device.
pub fn optimize_stream<R: Read, W: Write>(
    src:    R,
    dst:    W,
    config: ReorderConfig,
) -> Result<OptimizeOutcome> {
    config.validate()?;
    let reader = ArchiveReader::new(src)?;
    if reader.header.is_canonical() {
        info!("archive is already optimized");
        return Ok(OptimizeOutcome::AlreadyCanonical);
    }
    let mut header = reader.header.clone();
    header.uuid = Uuid::from_bytes(CANONICAL_UUID);

    let mut writer = ArchiveWriter::new(dst, header)?;
    let mut groups = reader.ordered_clusters(config)?;
    for group in groups.by_ref() {
        writer.add_group(&group?)?;
    }
    let reorder = groups.stats();
    let (_, stats) = writer.finish()?;
    info!(
        "optimized {} clusters into {} extents ({} device switches, peak cache {})",
        stats.clusters, stats.extents, reorder.switches, reorder.peak_cached
    );
    Ok(OptimizeOutcome::Optimized { stats, reorder })
}

// ── Archive ───────────────────────────────────────────────────────────────────

pub struct Archive {
    path:   PathBuf,
    header: ArchiveHeader,
}

impl Archive {
    /// Open an archive and verify its header.  Extents are only read by the
    /// operations that need them.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let header = ArchiveReader::new(BufReader::new(File::open(&path)?))?.header;
        Ok(Self { path, header })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    pub fn info(&self) -> ArchiveInfo {
        ArchiveInfo::from(&self.header)
    }

    pub fn reader(&self) -> Result<ArchiveReader<BufReader<File>>> {
        ArchiveReader::new(BufReader::new(File::open(&self.path)?))
    }

    pub fn verify(&self) -> Result<StreamStats> {
        self.reader()?.verify()
    }

    // ── Pack ─────────────────────────────────────────────────────────────────

    /// Build an archive from a directory: `drive-*` files become devices,
    /// every other regular file a config blob.  Entries are taken in name
    /// order.
    pub fn pack_dir<P: AsRef<Path>, Q: AsRef<Path>>(
        src:  P,
        dest: Q,
        opts: &PackOptions,
    ) -> Result<StreamStats> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(src.as_ref())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.file_name());

        let mut header = ArchiveHeader::new(
            opts.archive_id.unwrap_or_else(Uuid::new_v4),
            opts.ctime.unwrap_or_else(|| Utc::now().timestamp()),
        );
        let mut drives = Vec::new();
        for entry in entries {
            let name = entry
                .file_name()
                .into_string()
                .map_err(|n| Error::InvalidName(n.to_string_lossy().into_owned()))?;
            if name.starts_with(DRIVE_PREFIX) {
                let id = header.add_device(&name, entry.metadata()?.len())?;
                drives.push((id, entry.path()));
            } else {
                header.add_config(&name, fs::read(entry.path())?)?;
            }
        }

        let stats = write_atomically(dest.as_ref(), |out| {
            let mut writer = ArchiveWriter::new(out, header)?;
            for (id, path) in &drives {
                writer.write_device(*id, BufReader::new(File::open(path)?))?;
                info!("packed {}", path.display());
            }
            Ok(writer.finish()?.1)
        })?;
        info!("created {} ({} clusters)", dest.as_ref().display(), stats.clusters);
        Ok(stats)
    }

    // ── Unpack ───────────────────────────────────────────────────────────────

    /// Extract every config blob and device image into `dest`.
    ///
    /// Everything is staged in a temporary directory first and nothing
    /// becomes visible unless the whole archive read back cleanly.  A `dest`
    /// that does not exist yet appears in one rename.  Into an existing
    /// `dest` the files are renamed one by one; a rename failing there can
    /// leave the earlier ones in place.
    pub fn extract_all<P: AsRef<Path>>(&self, dest: P) -> Result<StreamStats> {
        let dest = dest.as_ref();
        for name in self.header.configs.iter().map(|c| &c.name)
            .chain(self.header.devices.iter().map(|d| &d.name))
        {
            validate_name(name)?;
        }
        let fresh = !dest.exists();
        let staging_parent = if fresh { parent_dir(dest) } else { dest };
        fs::create_dir_all(staging_parent)?;
        let staging = Builder::new().prefix(".vmadedup-").tempdir_in(staging_parent)?;

        for cfg in &self.header.configs {
            fs::write(staging.path().join(&cfg.name), &cfg.data)?;
        }
        let mut disks: HashMap<u8, (File, u64)> = HashMap::new();
        for dev in &self.header.devices {
            let file = File::create(staging.path().join(&dev.name))?;
            file.set_len(dev.size)?;
            disks.insert(dev.id, (file, dev.size));
        }

        let mut clusters = self.reader()?.clusters();
        for group in clusters.by_ref() {
            let group = group?;
            let Some((file, size)) = disks.get_mut(&group.dev_id) else {
                return Err(Error::InvalidDevice { device: group.dev_id, reason: "not in device table".into() });
            };
            let base = group.device_offset();
            if base >= *size {
                return Err(Error::InvalidDevice {
                    device: group.dev_id,
                    reason: format!("cluster {} beyond declared size {size}", group.cluster),
                });
            }
            for i in 0..BLOCKS_PER_CLUSTER {
                let Some(block) = group.block(i) else { continue };
                let offset = base + (i * BLOCK_SIZE) as u64;
                if offset >= *size {
                    break;
                }
                let len = (*size - offset).min(BLOCK_SIZE as u64) as usize;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&block[..len])?;
            }
        }
        for (file, _) in disks.values() {
            file.sync_all()?;
        }
        drop(disks);

        if fresh {
            fs::rename(staging.path(), dest)?;
        } else {
            let names = self.header.configs.iter().map(|c| &c.name)
                .chain(self.header.devices.iter().map(|d| &d.name));
            for name in names {
                fs::rename(staging.path().join(name), dest.join(name))?;
            }
        }
        info!("extracted {} configs and {} devices to {}",
            self.header.configs.len(), self.header.devices.len(), dest.display());
        Ok(clusters.stats())
    }

    // ── Optimize ─────────────────────────────────────────────────────────────

    /// Write the order-normalized form of this archive to `dest`, which may
    /// be the archive's own path.  An already canonical archive is copied
    /// unchanged, or left alone when `dest` is the archive itself.
    pub fn optimize<P: AsRef<Path>>(&self, dest: P, config: ReorderConfig) -> Result<OptimizeOutcome> {
        let dest = dest.as_ref();
        config.validate()?;
        if self.header.is_canonical() {
            if !same_file(&self.path, dest) {
                write_atomically(dest, |out| {
                    io::copy(&mut File::open(&self.path)?, out)?;
                    Ok(())
                })?;
            }
            info!("{} is already optimized", self.path.display());
            return Ok(OptimizeOutcome::AlreadyCanonical);
        }
        let src = BufReader::new(File::open(&self.path)?);
        write_atomically(dest, |out| optimize_stream(src, out, config))
    }

    // ── Guest config ─────────────────────────────────────────────────────────

    pub fn config_value(&self, config: &str, key: &str) -> Result<Option<String>> {
        let entry = self
            .header
            .config(config)
            .ok_or_else(|| Error::Config(format!("no config named {config:?}")))?;
        Ok(GuestConfig::parse(&entry.data)?.get(key).map(str::to_owned))
    }

    /// Rewrite the archive to `dest` with `key` set in config blob `config`.
    /// Clusters are copied in their existing order and the archive id is
    /// kept.
    pub fn set_config_key<P: AsRef<Path>>(
        &self,
        dest:   P,
        config: &str,
        key:    &str,
        value:  &str,
    ) -> Result<StreamStats> {
        let mut header = self.header.clone();
        let entry = header
            .config_mut(config)
            .ok_or_else(|| Error::Config(format!("no config named {config:?}")))?;
        let mut conf = GuestConfig::parse(&entry.data)?;
        conf.set(key, value)?;
        entry.data = conf.to_bytes();

        let reader = self.reader()?;
        write_atomically(dest.as_ref(), |out| {
            let mut writer = ArchiveWriter::new(out, header)?;
            for group in reader.clusters() {
                writer.add_group(&group?)?;
            }
            Ok(writer.finish()?.1)
        })
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Run `f` against a temporary file next to `dest` and rename it over
/// `dest` only if `f` succeeds.  On failure the temporary file is removed
/// and `dest` is untouched.
fn write_atomically<T, F>(dest: &Path, f: F) -> Result<T>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<T>,
{
    let tmp = NamedTempFile::new_in(parent_dir(dest))?;
    let value = {
        let mut out = BufWriter::new(tmp.as_file());
        let value = f(&mut out)?;
        out.flush()?;
        value
    };
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| Error::Io(e.error))?;
    Ok(value)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
