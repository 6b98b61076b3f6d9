// FATX partition engine: header, chain map and cluster I/O.
// The chain map is the volume's FAT: entry i is 0 when cluster i is
// free, 0xFFFFFFFF when it terminates a chain, and the successor
// cluster index otherwise. Clusters are 1-based on disk.

use std::io::SeekFrom;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};

use xenon_core::{DeviceIo, XenonError};

use super::constants::cluster_values::*;
use super::constants::*;
use super::dirent::Dirent;
use super::timestamps;

/// Geometry flavour. USB volumes derive their layout from a fixed data
/// window instead of packing the file area against the chain map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Regular,
    Usb,
}

pub struct FatxPartition {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub kind: PartitionKind,

    // Header fields.
    pub id: u32,
    pub sectors_per_cluster: u32,
    pub root_cluster: u32,

    // Derived geometry.
    pub cluster_size: u32,
    pub cluster_count: u32,
    pub entry_size: u8,
    pub chain_map_offset: u64,
    pub chain_map_size: u64,
    pub file_area_offset: u64,

    valid: bool,
    chain_map: Vec<u32>,

    // Directory caches; see directory.rs.
    pub(crate) root_cache: Option<Vec<Dirent>>,
    pub(crate) last_dir_cluster: u32,
    pub(crate) last_dir_cache: Option<Vec<Dirent>>,
}

impl FatxPartition {
    pub fn new(name: &str, offset: u64, size: u64, kind: PartitionKind) -> Self {
        Self {
            name: name.to_string(),
            offset,
            size,
            kind,
            id: 0,
            sectors_per_cluster: 0,
            root_cluster: 0,
            cluster_size: 0,
            cluster_count: 0,
            entry_size: 0,
            chain_map_offset: 0,
            chain_map_size: 0,
            file_area_offset: 0,
            valid: false,
            chain_map: Vec::new(),
            root_cache: None,
            last_dir_cluster: 0,
            last_dir_cache: None,
        }
    }

    /// Read a single volume and insist it validates. Use this to mount
    /// a known byte region directly, without device probing.
    pub fn open(
        name: &str,
        offset: u64,
        size: u64,
        kind: PartitionKind,
        io: &mut dyn DeviceIo,
    ) -> Result<Self, XenonError> {
        let mut partition = Self::new(name, offset, size, kind);
        partition.read(io)?;
        if !partition.valid {
            return Err(XenonError::NotFatx(format!(
                "no FATX volume at {:#X}",
                offset
            )));
        }
        Ok(partition)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn dirents_per_cluster(&self) -> u32 {
        self.cluster_size / DIRENT_SIZE as u32
    }

    /// Read the header and chain map. A magic mismatch or nonsensical
    /// geometry marks the partition invalid instead of failing; the
    /// device silently drops such partitions.
    pub fn read(&mut self, io: &mut dyn DeviceIo) -> Result<(), XenonError> {
        self.valid = false;

        io.seek(SeekFrom::Start(self.offset))?;
        let magic = io.read_u32::<BigEndian>()?;
        if magic != FATX_MAGIC {
            warn!(
                "partition '{}' at {:#X}: magic {:#010X} is not FATX",
                self.name, self.offset, magic
            );
            return Ok(());
        }

        self.id = io.read_u32::<BigEndian>()?;
        self.sectors_per_cluster = io.read_u32::<BigEndian>()?;
        self.root_cluster = io.read_u32::<BigEndian>()?;

        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            warn!(
                "partition '{}': bad sectors-per-cluster {}",
                self.name, self.sectors_per_cluster
            );
            return Ok(());
        }

        self.cluster_size = self.sectors_per_cluster * SECTOR_SIZE;
        self.chain_map_offset = self.offset + CHAIN_MAP_OFFSET;

        match self.kind {
            PartitionKind::Regular => {
                self.cluster_count = (self.size / self.cluster_size as u64) as u32;
                self.entry_size = if self.cluster_count < CHAIN_MAP_16_LIMIT {
                    2
                } else {
                    4
                };
                self.chain_map_size = round_up(
                    self.cluster_count as u64 * self.entry_size as u64,
                    CHAIN_MAP_ALIGN,
                );
                self.file_area_offset = self.chain_map_offset + self.chain_map_size;
            }
            PartitionKind::Usb => {
                if self.size <= USB_FILE_AREA_OFFSET {
                    warn!("partition '{}': too small for the USB layout", self.name);
                    return Ok(());
                }
                self.cluster_count =
                    ((self.size - USB_FILE_AREA_OFFSET) / self.cluster_size as u64) as u32;
                self.chain_map_size =
                    round_up(USB_FILE_AREA_OFFSET - CHAIN_MAP_OFFSET, CHAIN_MAP_ALIGN);
                self.file_area_offset = self.offset + USB_FILE_AREA_OFFSET;
                self.entry_size = if self.cluster_count < CHAIN_MAP_16_LIMIT {
                    2
                } else {
                    4
                };
                // The physical layout decides; the marker in the first
                // two map bytes overrides the computed width.
                io.seek(SeekFrom::Start(self.chain_map_offset))?;
                let marker = io.read_u16::<BigEndian>()?;
                self.entry_size = if marker == USB_CHAIN_MAP_16_MARKER { 2 } else { 4 };
            }
        }

        if self.cluster_count < 2 {
            warn!("partition '{}': no usable clusters", self.name);
            return Ok(());
        }

        self.read_chain_map(io)?;
        self.valid = true;

        info!(
            "partition '{}': {} clusters of {:#X} bytes, {}-bit chain map, root at {}",
            self.name,
            self.cluster_count,
            self.cluster_size,
            self.entry_size * 8,
            self.root_cluster
        );
        debug!(
            "partition '{}': chain map at {:#X} ({:#X} bytes), file area at {:#X}",
            self.name, self.chain_map_offset, self.chain_map_size, self.file_area_offset
        );
        Ok(())
    }

    /// Load the chain map into memory, widening 16-bit entries. Any
    /// end-of-chain flavour (top twelve bits set) normalizes to the
    /// uniform sentinel; entry 0 is the media marker and stays raw so a
    /// later rewrite preserves it byte-for-byte.
    fn read_chain_map(&mut self, io: &mut dyn DeviceIo) -> Result<(), XenonError> {
        let entries = self.cluster_count as usize;
        let mut raw = vec![0u8; entries * self.entry_size as usize];
        io.seek(SeekFrom::Start(self.chain_map_offset))?;
        io.read_exact(&mut raw)?;

        let mut map = Vec::with_capacity(entries);
        if self.entry_size == 2 {
            for (index, chunk) in raw.chunks_exact(2).enumerate() {
                let value = u16::from_be_bytes([chunk[0], chunk[1]]);
                if index > 0 && value >= 0xFFF0 {
                    map.push(CLUSTER_LAST);
                } else {
                    map.push(value as u32);
                }
            }
        } else {
            for (index, chunk) in raw.chunks_exact(4).enumerate() {
                let value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if index > 0 && value >= 0xFFFF_FFF0 {
                    map.push(CLUSTER_LAST);
                } else {
                    map.push(value);
                }
            }
        }
        self.chain_map = map;
        Ok(())
    }

    /// Persist the in-memory chain map over its on-disk region.
    pub fn write_chain_map(&mut self, io: &mut dyn DeviceIo) -> Result<(), XenonError> {
        io.seek(SeekFrom::Start(self.chain_map_offset))?;
        let mut raw = Vec::with_capacity(self.chain_map.len() * self.entry_size as usize);
        if self.entry_size == 2 {
            for &value in &self.chain_map {
                raw.write_u16::<BigEndian>(value as u16)?;
            }
        } else {
            for &value in &self.chain_map {
                raw.write_u32::<BigEndian>(value)?;
            }
        }
        io.write_all(&raw)?;
        Ok(())
    }

    fn check_cluster(&self, cluster: u32) -> Result<(), XenonError> {
        if cluster == 0 || cluster >= self.cluster_count {
            Err(XenonError::BadCluster(cluster))
        } else {
            Ok(())
        }
    }

    /// Byte offset of a cluster's data. Clusters are 1-based; cluster 0
    /// never addresses data.
    pub fn cluster_offset(&self, cluster: u32) -> Result<u64, XenonError> {
        self.check_cluster(cluster)?;
        Ok(self.file_area_offset + (cluster as u64 - 1) * self.cluster_size as u64)
    }

    pub fn read_cluster(
        &self,
        io: &mut dyn DeviceIo,
        cluster: u32,
    ) -> Result<Vec<u8>, XenonError> {
        let offset = self.cluster_offset(cluster)?;
        io.seek(SeekFrom::Start(offset))?;
        let mut data = vec![0u8; self.cluster_size as usize];
        io.read_exact(&mut data)?;
        Ok(data)
    }

    pub fn write_cluster(
        &self,
        io: &mut dyn DeviceIo,
        cluster: u32,
        data: &[u8],
    ) -> Result<(), XenonError> {
        debug_assert_eq!(data.len(), self.cluster_size as usize);
        let offset = self.cluster_offset(cluster)?;
        io.seek(SeekFrom::Start(offset))?;
        io.write_all(data)?;
        Ok(())
    }

    pub fn zero_cluster(&self, io: &mut dyn DeviceIo, cluster: u32) -> Result<(), XenonError> {
        self.write_cluster(io, cluster, &vec![0u8; self.cluster_size as usize])
    }

    pub fn next_cluster(&self, cluster: u32) -> Result<u32, XenonError> {
        self.check_cluster(cluster)?;
        Ok(self.chain_map[cluster as usize])
    }

    pub fn set_next_cluster(&mut self, cluster: u32, next: u32) -> Result<(), XenonError> {
        self.check_cluster(cluster)?;
        self.chain_map[cluster as usize] = next;
        Ok(())
    }

    /// Claim the first free cluster. The fresh entry is marked
    /// end-of-chain immediately so an unchained cluster still reads as
    /// taken.
    pub fn allocate_cluster(
        &mut self,
        io: &mut dyn DeviceIo,
        write_map: bool,
    ) -> Result<u32, XenonError> {
        for cluster in 1..self.cluster_count {
            if self.chain_map[cluster as usize] == CLUSTER_FREE {
                self.chain_map[cluster as usize] = CLUSTER_LAST;
                if write_map {
                    self.write_chain_map(io)?;
                }
                return Ok(cluster);
            }
        }
        Err(XenonError::NoSpace(format!(
            "no free clusters in partition '{}'",
            self.name
        )))
    }

    /// Release a chain starting at `start`, at most `limit` clusters.
    /// With `mark_first_as_last` the first cluster survives as the new
    /// chain terminator and only its successors are freed. Returns the
    /// number of clusters freed.
    pub fn free_chain(
        &mut self,
        io: &mut dyn DeviceIo,
        start: u32,
        limit: u32,
        mark_first_as_last: bool,
        write_map: bool,
    ) -> Result<u32, XenonError> {
        self.check_cluster(start)?;
        let mut current = start;

        if mark_first_as_last {
            let next = self.chain_map[start as usize];
            self.chain_map[start as usize] = CLUSTER_LAST;
            if next == CLUSTER_LAST {
                if write_map {
                    self.write_chain_map(io)?;
                }
                return Ok(0);
            }
            current = next;
        }

        let mut freed = 0u32;
        while freed < limit {
            self.check_cluster(current)?;
            let next = self.chain_map[current as usize];
            if next == CLUSTER_FREE {
                // Walked into a cluster nothing chains to.
                return Err(XenonError::BadChain(current));
            }
            self.chain_map[current as usize] = CLUSTER_FREE;
            freed += 1;
            if next == CLUSTER_LAST {
                if freed < limit && limit != u32::MAX {
                    return Err(XenonError::BadChain(current));
                }
                break;
            }
            current = next;
        }

        if write_map {
            self.write_chain_map(io)?;
        }
        Ok(freed)
    }

    /// Follow the chain `steps` links forward from `start`.
    pub fn walk_chain(&self, start: u32, steps: u32) -> Result<u32, XenonError> {
        let mut current = start;
        for _ in 0..steps {
            let next = self.next_cluster(current)?;
            if next == CLUSTER_LAST {
                return Err(XenonError::BadChain(current));
            }
            current = next;
        }
        Ok(current)
    }

    /// Collect a whole chain. Bails out if the chain loops or runs past
    /// the cluster count.
    pub fn cluster_chain(&self, start: u32) -> Result<Vec<u32>, XenonError> {
        let mut chain = Vec::new();
        let mut current = start;
        loop {
            self.check_cluster(current)?;
            chain.push(current);
            if chain.len() > self.cluster_count as usize {
                return Err(XenonError::BadChain(current));
            }
            let next = self.chain_map[current as usize];
            if next == CLUSTER_LAST {
                break;
            }
            if next == CLUSTER_FREE {
                return Err(XenonError::BadChain(current));
            }
            current = next;
        }
        Ok(chain)
    }

    pub fn free_cluster_count(&self) -> u32 {
        let mut free = 0;
        for cluster in 1..self.cluster_count {
            if self.chain_map[cluster as usize] == CLUSTER_FREE {
                free += 1;
            }
        }
        free
    }

    pub fn free_space(&self) -> u64 {
        self.free_cluster_count() as u64 * self.cluster_size as u64
    }

    pub(crate) fn invalidate_dir_caches(&mut self) {
        self.root_cache = None;
        self.last_dir_cache = None;
        self.last_dir_cluster = 0;
    }

    /// Grow or shrink a dirent's cluster chain to cover `new_len`
    /// bytes, then persist the updated size and modified time. The
    /// chain map is written once at the end of the chain surgery.
    pub fn resize_dirent_chain(
        &mut self,
        io: &mut dyn DeviceIo,
        dirent: &mut Dirent,
        new_len: u64,
    ) -> Result<(), XenonError> {
        let old_len = dirent.size as u64;
        if new_len == old_len {
            return Ok(());
        }
        if new_len > u32::MAX as u64 {
            return Err(XenonError::NoSpace(format!(
                "FATX files cannot exceed {} bytes",
                u32::MAX
            )));
        }

        let cluster_size = self.cluster_size as u64;
        let old_count = old_len.div_ceil(cluster_size);
        let new_count = new_len.div_ceil(cluster_size);

        if new_count > old_count {
            let mut needed = new_count - old_count;
            if needed > self.free_cluster_count() as u64 {
                return Err(XenonError::NoSpace(format!(
                    "need {} clusters, {} free in partition '{}'",
                    needed,
                    self.free_cluster_count(),
                    self.name
                )));
            }
            let mut last;
            if dirent.first_cluster == CLUSTER_LAST {
                let first = self.allocate_cluster(io, false)?;
                dirent.first_cluster = first;
                last = first;
                needed -= 1;
            } else {
                last = self.walk_chain(
                    dirent.first_cluster,
                    old_count.saturating_sub(1) as u32,
                )?;
            }
            for _ in 0..needed {
                let fresh = self.allocate_cluster(io, false)?;
                self.set_next_cluster(last, fresh)?;
                last = fresh;
            }
            self.write_chain_map(io)?;
        } else if new_count < old_count && dirent.first_cluster != CLUSTER_LAST {
            let survivor = if new_count == 0 {
                dirent.first_cluster
            } else {
                self.walk_chain(dirent.first_cluster, new_count as u32 - 1)?
            };
            self.free_chain(io, survivor, u32::MAX, true, false)?;
            if new_count == 0 {
                self.chain_map[survivor as usize] = CLUSTER_FREE;
                dirent.first_cluster = CLUSTER_LAST;
            }
            self.write_chain_map(io)?;
        }

        dirent.size = new_len as u32;
        dirent.modified = timestamps::now();
        self.update_dirent(io, dirent)
    }
}

pub(crate) fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::super::formatter;
    use super::*;
    use std::io::Cursor;
    use xenon_core::MemoryIo;

    // 1 MiB volume, 0x800-byte clusters.
    fn test_partition() -> (MemoryIo, FatxPartition) {
        let mut io: MemoryIo = Cursor::new(vec![0u8; 0x10_0000]);
        formatter::format_partition(&mut io, 0, 0x10_0000, 4).unwrap();
        let mut partition = FatxPartition::new("Test", 0, 0x10_0000, PartitionKind::Regular);
        partition.read(&mut io).unwrap();
        assert!(partition.is_valid());
        (io, partition)
    }

    #[test]
    fn geometry_is_derived_from_header() {
        let (_io, partition) = test_partition();
        assert_eq!(partition.cluster_size, 0x800);
        assert_eq!(partition.cluster_count, 0x200);
        assert_eq!(partition.entry_size, 2);
        assert_eq!(partition.chain_map_offset, 0x1000);
        assert_eq!(partition.chain_map_size, 0x1000);
        assert_eq!(partition.file_area_offset, 0x2000);
        assert_eq!(partition.root_cluster, 1);
    }

    #[test]
    fn magic_mismatch_is_not_fatal() {
        let mut io: MemoryIo = Cursor::new(vec![0u8; 0x10_0000]);
        let mut partition = FatxPartition::new("Junk", 0, 0x10_0000, PartitionKind::Regular);
        partition.read(&mut io).unwrap();
        assert!(!partition.is_valid());
    }

    #[test]
    fn open_insists_on_a_volume() {
        let mut io: MemoryIo = Cursor::new(vec![0u8; 0x10_0000]);
        assert!(matches!(
            FatxPartition::open("Junk", 0, 0x10_0000, PartitionKind::Regular, &mut io),
            Err(XenonError::NotFatx(_))
        ));
        formatter::format_partition(&mut io, 0, 0x10_0000, 4).unwrap();
        let partition =
            FatxPartition::open("Data", 0, 0x10_0000, PartitionKind::Regular, &mut io).unwrap();
        assert!(partition.is_valid());
    }

    #[test]
    fn bounded_free_stops_early_and_flags_short_chains() {
        let (mut io, mut partition) = test_partition();
        let a = partition.allocate_cluster(&mut io, false).unwrap();
        let b = partition.allocate_cluster(&mut io, false).unwrap();
        let c = partition.allocate_cluster(&mut io, false).unwrap();
        partition.set_next_cluster(a, b).unwrap();
        partition.set_next_cluster(b, c).unwrap();

        // Limit 2 frees exactly two clusters and leaves the tail.
        let freed = partition.free_chain(&mut io, a, 2, false, false).unwrap();
        assert_eq!(freed, 2);
        assert_eq!(partition.next_cluster(c).unwrap(), CLUSTER_LAST);

        // Asking a bounded walk for more clusters than the chain has
        // is a chain error.
        let d = partition.allocate_cluster(&mut io, false).unwrap();
        assert!(matches!(
            partition.free_chain(&mut io, d, 5, false, false),
            Err(XenonError::BadChain(_))
        ));
    }

    #[test]
    fn walking_into_a_free_cluster_is_a_chain_error() {
        let (mut io, mut partition) = test_partition();
        let a = partition.allocate_cluster(&mut io, false).unwrap();
        // Chain a to a cluster the map says is free.
        partition.set_next_cluster(a, 9).unwrap();
        assert!(matches!(
            partition.free_chain(&mut io, a, u32::MAX, false, false),
            Err(XenonError::BadChain(_))
        ));
    }

    #[test]
    fn allocate_links_and_frees() {
        let (mut io, mut partition) = test_partition();
        let before = partition.free_cluster_count();

        let a = partition.allocate_cluster(&mut io, false).unwrap();
        let b = partition.allocate_cluster(&mut io, false).unwrap();
        let c = partition.allocate_cluster(&mut io, true).unwrap();
        partition.set_next_cluster(a, b).unwrap();
        partition.set_next_cluster(b, c).unwrap();
        assert_eq!(partition.free_cluster_count(), before - 3);
        assert_eq!(partition.cluster_chain(a).unwrap(), vec![a, b, c]);

        let freed = partition.free_chain(&mut io, a, u32::MAX, false, true).unwrap();
        assert_eq!(freed, 3);
        assert_eq!(partition.free_cluster_count(), before);
    }

    #[test]
    fn free_chain_can_keep_the_head() {
        let (mut io, mut partition) = test_partition();
        let a = partition.allocate_cluster(&mut io, false).unwrap();
        let b = partition.allocate_cluster(&mut io, false).unwrap();
        let c = partition.allocate_cluster(&mut io, false).unwrap();
        partition.set_next_cluster(a, b).unwrap();
        partition.set_next_cluster(b, c).unwrap();

        let freed = partition.free_chain(&mut io, a, u32::MAX, true, false).unwrap();
        assert_eq!(freed, 2);
        assert_eq!(partition.next_cluster(a).unwrap(), CLUSTER_LAST);
        assert_eq!(partition.next_cluster(b).unwrap(), CLUSTER_FREE);
        assert_eq!(partition.next_cluster(c).unwrap(), CLUSTER_FREE);
    }

    #[test]
    fn chain_map_survives_a_rewrite() {
        let (mut io, mut partition) = test_partition();
        let a = partition.allocate_cluster(&mut io, false).unwrap();
        let b = partition.allocate_cluster(&mut io, false).unwrap();
        partition.set_next_cluster(a, b).unwrap();
        partition.write_chain_map(&mut io).unwrap();

        let mut reloaded = FatxPartition::new("Test", 0, 0x10_0000, PartitionKind::Regular);
        reloaded.read(&mut io).unwrap();
        assert_eq!(reloaded.next_cluster(a).unwrap(), b);
        assert_eq!(reloaded.next_cluster(b).unwrap(), CLUSTER_LAST);
        assert_eq!(
            reloaded.free_cluster_count(),
            partition.free_cluster_count()
        );
    }

    #[test]
    fn cluster_bounds_are_enforced() {
        let (mut io, mut partition) = test_partition();
        assert!(matches!(
            partition.read_cluster(&mut io, 0),
            Err(XenonError::BadCluster(0))
        ));
        let count = partition.cluster_count;
        assert!(matches!(
            partition.read_cluster(&mut io, count),
            Err(XenonError::BadCluster(_))
        ));
        assert!(matches!(
            partition.set_next_cluster(count + 5, 1),
            Err(XenonError::BadCluster(_))
        ));
    }

    #[test]
    fn free_space_matches_free_clusters() {
        let (mut io, mut partition) = test_partition();
        let free = partition.free_cluster_count();
        assert_eq!(
            partition.free_space(),
            free as u64 * partition.cluster_size as u64
        );
        partition.allocate_cluster(&mut io, false).unwrap();
        assert_eq!(partition.free_cluster_count(), free - 1);
    }

    #[test]
    fn round_up_aligns() {
        assert_eq!(round_up(0, 0x1000), 0);
        assert_eq!(round_up(1, 0x1000), 0x1000);
        assert_eq!(round_up(0x1000, 0x1000), 0x1000);
        assert_eq!(round_up(0x1001, 0x1000), 0x2000);
    }
}
