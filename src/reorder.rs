//! Restore strict per-device cluster order from an archive's cluster stream.
//!
//! Writers emit clusters in roughly ascending order, but near the end of one
//! device and the start of the next the two streams interleave, and a
//! device's trailing all-hole clusters may never be stored at all, so "last
//! cluster of device D" cannot be observed directly.
//!
//! [`Reorder`] follows one *current* device at a time.  Every device gets a
//! cache of clusters that arrived ahead of their turn and the index it
//! expects next.  After each input cluster the current device's cache is
//! drained in order.  If the current cache is then empty and another device
//! has buffered at least `switch_threshold` clusters, the current device is
//! declared finished and the other one takes over.  If another device grows
//! past `ceiling` while the current one is still waiting, the boundary is
//! ambiguous and the stream is rejected.  The current device's own backlog
//! is held to the same `ceiling`.
//!
//! Peak memory is the sum of the caches, each bounded by `ceiling`.

use std::collections::{BTreeMap, HashSet, VecDeque};

use log::debug;

use crate::block::BlockGroup;
use crate::error::{Error, Result};

/// Buffered clusters of another device that end the current one.
pub const SWITCH_THRESHOLD: usize = 100;
/// Buffered clusters past which the boundary is considered undecidable.
pub const CACHE_CEILING: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorderConfig {
    /// Clusters another device must have buffered before the current
    /// device, with nothing left to drain, is declared finished.
    pub switch_threshold: usize,
    /// Largest backlog any single device may hold.  Another device past it
    /// is a [`Error::BoundaryAmbiguity`].  The current device past it, still
    /// waiting for a cluster that never came, is an
    /// [`Error::UnresolvedClusters`]; a plain heuristic reducer would keep
    /// buffering there, this one keeps memory bounded instead.
    pub ceiling:          usize,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self { switch_threshold: SWITCH_THRESHOLD, ceiling: CACHE_CEILING }
    }
}

impl ReorderConfig {
    /// Require `1 <= switch_threshold <= ceiling`.
    pub fn validate(&self) -> Result<()> {
        if self.switch_threshold == 0 {
            return Err(Error::Config("switch threshold must be at least 1".into()));
        }
        if self.switch_threshold > self.ceiling {
            return Err(Error::Config(format!(
                "switch threshold {} exceeds cache ceiling {}",
                self.switch_threshold, self.ceiling
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Device boundaries resolved, including the ones at end of stream.
    pub switches:    u32,
    /// Largest number of clusters held across all caches at once.
    pub peak_cached: usize,
}

#[derive(Debug, Default)]
struct DeviceQueue {
    next:  u64,
    cache: BTreeMap<u32, BlockGroup>,
}

pub struct Reorder<I> {
    inner:    I,
    config:   ReorderConfig,
    devices:  BTreeMap<u8, DeviceQueue>,
    finished: HashSet<u8>,
    current:  Option<u8>,
    ready:    VecDeque<BlockGroup>,
    cached:   usize,
    stats:    ReorderStats,
    done:     bool,
}

impl<I> Reorder<I>
where
    I: Iterator<Item = Result<BlockGroup>>,
{
    pub fn new(inner: I, config: ReorderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner,
            config,
            devices:  BTreeMap::new(),
            finished: HashSet::new(),
            current:  None,
            ready:    VecDeque::new(),
            cached:   0,
            stats:    ReorderStats::default(),
            done:     false,
        })
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    fn receive(&mut self, group: BlockGroup) -> Result<()> {
        let dev = group.dev_id;
        if self.finished.contains(&dev) {
            return Err(Error::LateCluster { device: dev, current: self.current.unwrap_or(0) });
        }
        let current = *self.current.get_or_insert(dev);

        let queue = self.devices.entry(dev).or_default();
        if (group.cluster as u64) < queue.next || queue.cache.contains_key(&group.cluster) {
            return Err(Error::DuplicateCluster { device: dev, cluster: group.cluster });
        }
        queue.cache.insert(group.cluster, group);
        self.cached += 1;
        self.stats.peak_cached = self.stats.peak_cached.max(self.cached);

        self.drain(current);
        self.resolve_boundary(current)
    }

    /// Emit the device's cached clusters for as long as they are contiguous.
    fn drain(&mut self, dev: u8) {
        let Some(queue) = self.devices.get_mut(&dev) else { return };
        while let Some(group) = u32::try_from(queue.next).ok().and_then(|n| queue.cache.remove(&n)) {
            self.ready.push_back(group);
            queue.next += 1;
            self.cached -= 1;
        }
    }

    fn cache_len(&self, dev: u8) -> usize {
        self.devices.get(&dev).map_or(0, |q| q.cache.len())
    }

    /// The other device with the most buffered clusters, lowest id on ties.
    fn fullest_other(&self, current: u8) -> Option<(u8, usize)> {
        self.devices
            .iter()
            .filter(|(&id, _)| id != current)
            .map(|(&id, q)| (id, q.cache.len()))
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
    }

    fn switch_to(&mut self, from: u8, to: u8) {
        self.devices.remove(&from);
        self.finished.insert(from);
        self.current = Some(to);
        self.stats.switches += 1;
        debug!("device {from} finished, continuing with device {to}");
        self.drain(to);
    }

    fn resolve_boundary(&mut self, mut current: u8) -> Result<()> {
        loop {
            let own = self.cache_len(current);
            let other = self.fullest_other(current);

            if own == 0 {
                if let Some((next, len)) = other {
                    if len >= self.config.switch_threshold {
                        self.switch_to(current, next);
                        current = next;
                        continue;
                    }
                }
            } else if own > self.config.ceiling {
                let next = self.devices.get(&current).map_or(0, |q| q.next);
                return Err(Error::UnresolvedClusters { device: current, next, pending: own });
            }

            if let Some((dev, cached)) = other {
                if cached > self.config.ceiling {
                    return Err(Error::BoundaryAmbiguity { current, device: dev, cached });
                }
            }
            return Ok(());
        }
    }

    /// End of input: finish the current device, then every device still
    /// holding clusters, fullest first.
    fn finish(&mut self) -> Result<()> {
        while let Some(current) = self.current {
            self.drain(current);
            if let Some(queue) = self.devices.remove(&current) {
                if !queue.cache.is_empty() {
                    return Err(Error::UnresolvedClusters {
                        device:  current,
                        next:    queue.next,
                        pending: queue.cache.len(),
                    });
                }
            }
            self.finished.insert(current);
            self.current = self.fullest_other(current).map(|(id, _)| id);
            if let Some(next) = self.current {
                self.stats.switches += 1;
                debug!("end of stream: device {current} finished, flushing device {next}");
            }
        }
        Ok(())
    }

    fn fail(&mut self, e: Error) -> Option<Result<BlockGroup>> {
        self.done = true;
        self.ready.clear();
        Some(Err(e))
    }
}

impl<I> Iterator for Reorder<I>
where
    I: Iterator<Item = Result<BlockGroup>>,
{
    type Item = Result<BlockGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(group) = self.ready.pop_front() {
                return Some(Ok(group));
            }
            if self.done {
                return None;
            }
            match self.inner.next() {
                Some(Ok(group)) => {
                    if let Err(e) = self.receive(group) {
                        return self.fail(e);
                    }
                }
                Some(Err(e)) => return self.fail(e),
                None => {
                    if let Err(e) = self.finish() {
                        return self.fail(e);
                    }
                    self.done = true;
                }
            }
        }
    }
}
