// FATX device handling: probe the device kind, lay out its partitions,
// and route path-level dirent requests to the right partition.

use std::io::SeekFrom;
use std::path::Path;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use xenon_core::{ChainedIo, DeviceIo, XenonError};

use super::constants::FATX_MAGIC;
use super::dirent::{Dirent, SlotState};
use super::partition::{FatxPartition, PartitionKind};
use super::paths;
use super::stream::{FatxFileStream, FileAccess, FileMode};
use super::timestamps;
use super::validator::{validate_volume, VolumeReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    MemoryCard,
    HardDrive,
    HardDriveDevkit,
    UsbStick,
    Unknown,
}

/// Serializable summary of one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub id: u32,
    pub cluster_size: u32,
    pub cluster_count: u32,
    pub free_clusters: u32,
    pub free_bytes: u64,
}

/// Serializable summary of a whole device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub total_bytes: u64,
    pub device_id: Option<String>,
    pub partitions: Vec<PartitionInfo>,
}

/// One directory listing row with decoded timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryInfo {
    pub name: String,
    pub is_directory: bool,
    pub size: u32,
    pub attributes: u8,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
}

impl EntryInfo {
    fn from_dirent(dirent: &Dirent) -> Self {
        Self {
            name: dirent.name(),
            is_directory: dirent.is_directory(),
            size: if dirent.is_directory() { 0 } else { dirent.size },
            attributes: dirent.attributes,
            created: timestamps::decode_timestamp(dirent.created),
            modified: timestamps::decode_timestamp(dirent.modified),
            accessed: timestamps::decode_timestamp(dirent.accessed),
        }
    }
}

// Probe locations.
const MEMORY_CARD_DATA_OFFSET: u64 = 0x7F_F000;
const HDD_PROBE_OFFSET: u64 = 0x8_0000;
const DEVKIT_MARKER: u32 = 0x0002_0000;

// Hard-drive partition table.
const HDD_DUMP_OFFSET: u64 = 0x8_0000;
const HDD_DUMP_SIZE: u64 = 0x8000_0000;
const HDD_WINDOWS_OFFSET: u64 = 0x8008_0000;
const HDD_WINDOWS_SIZE: u64 = 0xA0E3_0000;
const HDD_SYSTEM_OFFSET: u64 = 0x1_20EB_0000;
const HDD_SYSTEM_SIZE: u64 = 0x1000_0000;
const HDD_DATA_OFFSET: u64 = 0x1_30EB_0000;

// Retail 20 GB drives report this exact size and carry a shorter data
// partition than the arithmetic suggests.
const HDD_20GB_SIZE: u64 = 0x4_AB44_0C00;
const HDD_20GB_DATA_SIZE: u64 = 0x3_77FF_C000;

const DEVKIT_TABLE_OFFSET: u64 = 8;
const DEVKIT_SECTOR_SIZE: u64 = 0x200;

const USB_DEVICE_ID_OFFSET: u64 = 0x228;
const USB_DEVICE_ID_LEN: usize = 20;

pub struct FatxDevice {
    io: Box<dyn DeviceIo>,
    kind: DeviceKind,
    total_len: u64,
    partitions: Vec<FatxPartition>,
    device_id: Option<String>,
}

impl FatxDevice {
    /// Open a device over an already-open byte stream: probe its kind,
    /// lay out the partitions and read each one. Partitions that fail
    /// to validate are dropped from the list.
    pub fn open(mut io: Box<dyn DeviceIo>) -> Result<Self, XenonError> {
        let kind = Self::probe(io.as_mut())?;
        let total_len = io.len()?;
        info!("device probed as {:?} ({} bytes)", kind, total_len);

        let mut device = Self {
            io,
            kind,
            total_len,
            partitions: Vec::new(),
            device_id: None,
        };
        device.load_layout()?;

        if kind == DeviceKind::UsbStick {
            device.device_id = Some(device.read_device_id()?);
            debug!("USB device id: {:?}", device.device_id);
        }

        let io = device.io.as_mut();
        for partition in &mut device.partitions {
            if let Err(err) = partition.read(io) {
                warn!("partition '{}' failed to read: {}", partition.name, err);
            }
        }
        device.partitions.retain(|partition| partition.is_valid());

        if device.partitions.is_empty() && device.kind != DeviceKind::Unknown {
            warn!("no partition of the {:?} layout validated", device.kind);
        }
        Ok(device)
    }

    /// Open a folder of `Data0000..DataNNNN` chunk files as one USB
    /// device spanning their chained contents.
    pub fn open_usb_directory(folder: &Path) -> Result<Self, XenonError> {
        let mut chunk_paths = Vec::new();
        for entry in std::fs::read_dir(folder)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name.len() == 8
                && name.is_ascii()
                && name[..4].eq_ignore_ascii_case("data")
                && name[4..].bytes().all(|b| b.is_ascii_digit())
            {
                chunk_paths.push(entry.path());
            }
        }
        if chunk_paths.is_empty() {
            return Err(XenonError::NotFound(format!(
                "no Data#### files in {}",
                folder.display()
            )));
        }
        chunk_paths.sort();

        info!(
            "opening USB device from {} data files in {}",
            chunk_paths.len(),
            folder.display()
        );
        let mut streams: Vec<Box<dyn DeviceIo>> = Vec::with_capacity(chunk_paths.len());
        for path in &chunk_paths {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)?;
            streams.push(Box::new(file));
        }
        Self::open(Box::new(ChainedIo::new(streams)?))
    }

    fn probe(io: &mut dyn DeviceIo) -> Result<DeviceKind, XenonError> {
        if Self::magic_at(io, 0)? {
            if Self::magic_at(io, MEMORY_CARD_DATA_OFFSET)? {
                return Ok(DeviceKind::MemoryCard);
            }
            return Ok(DeviceKind::UsbStick);
        }
        if Self::magic_at(io, HDD_PROBE_OFFSET)? {
            io.seek(SeekFrom::Start(0))?;
            let marker = io.read_u32::<LittleEndian>()?;
            if marker == DEVKIT_MARKER {
                return Ok(DeviceKind::HardDriveDevkit);
            }
            return Ok(DeviceKind::HardDrive);
        }
        Ok(DeviceKind::Unknown)
    }

    fn magic_at(io: &mut dyn DeviceIo, offset: u64) -> Result<bool, XenonError> {
        if io.len()? < offset + 4 {
            return Ok(false);
        }
        io.seek(SeekFrom::Start(offset))?;
        Ok(io.read_u32::<BigEndian>()? == FATX_MAGIC)
    }

    fn load_layout(&mut self) -> Result<(), XenonError> {
        let total = self.total_len;
        let mut partitions = match self.kind {
            DeviceKind::MemoryCard => vec![
                FatxPartition::new("Cache", 0, MEMORY_CARD_DATA_OFFSET, PartitionKind::Regular),
                FatxPartition::new(
                    "Data",
                    MEMORY_CARD_DATA_OFFSET,
                    total.saturating_sub(MEMORY_CARD_DATA_OFFSET),
                    PartitionKind::Regular,
                ),
            ],
            DeviceKind::HardDrive => vec![
                FatxPartition::new("Dump", HDD_DUMP_OFFSET, HDD_DUMP_SIZE, PartitionKind::Regular),
                FatxPartition::new(
                    "Windows",
                    HDD_WINDOWS_OFFSET,
                    HDD_WINDOWS_SIZE,
                    PartitionKind::Regular,
                ),
                FatxPartition::new(
                    "System",
                    HDD_SYSTEM_OFFSET,
                    HDD_SYSTEM_SIZE,
                    PartitionKind::Regular,
                ),
                FatxPartition::new(
                    "Data",
                    HDD_DATA_OFFSET,
                    total.saturating_sub(HDD_DATA_OFFSET),
                    PartitionKind::Regular,
                ),
            ],
            DeviceKind::HardDriveDevkit => {
                let mut list = vec![
                    FatxPartition::new(
                        "Dump",
                        HDD_DUMP_OFFSET,
                        HDD_DUMP_SIZE,
                        PartitionKind::Regular,
                    ),
                    FatxPartition::new(
                        "Windows",
                        HDD_WINDOWS_OFFSET,
                        HDD_WINDOWS_SIZE,
                        PartitionKind::Regular,
                    ),
                    FatxPartition::new(
                        "System",
                        HDD_SYSTEM_OFFSET,
                        HDD_SYSTEM_SIZE,
                        PartitionKind::Regular,
                    ),
                ];
                list.extend(self.read_devkit_table()?);
                list
            }
            DeviceKind::UsbStick => {
                vec![FatxPartition::new("Data", 0, total, PartitionKind::Usb)]
            }
            DeviceKind::Unknown => Vec::new(),
        };

        // Non-devkit layouts absorb the remaining capacity into the
        // last partition.
        if self.kind != DeviceKind::HardDriveDevkit {
            if let Some(last) = partitions.last_mut() {
                last.size = total.saturating_sub(last.offset);
            }
        }
        if total == HDD_20GB_SIZE {
            if let Some(last) = partitions.last_mut() {
                last.size = HDD_20GB_DATA_SIZE;
            }
        }

        // A partition whose header lies past the device can never read.
        partitions.retain(|partition| {
            let fits = partition.offset + 16 <= total;
            if !fits {
                warn!(
                    "partition '{}' at {:#X} lies past the device end",
                    partition.name, partition.offset
                );
            }
            fits
        });

        self.partitions = partitions;
        Ok(())
    }

    /// Devkit drives carry a partition table at offset 8: pairs of
    /// (sector index, sector count) terminated by a zero index.
    fn read_devkit_table(&mut self) -> Result<Vec<FatxPartition>, XenonError> {
        let io = self.io.as_mut();
        io.seek(SeekFrom::Start(DEVKIT_TABLE_OFFSET))?;
        let mut table = Vec::new();
        while table.len() < 0x20 {
            let sector = io.read_u32::<BigEndian>()?;
            let count = io.read_u32::<BigEndian>()?;
            if sector == 0 {
                break;
            }
            table.push(FatxPartition::new(
                &format!("Partition {}", table.len()),
                sector as u64 * DEVKIT_SECTOR_SIZE,
                count as u64 * DEVKIT_SECTOR_SIZE,
                PartitionKind::Regular,
            ));
        }
        debug!("devkit table: {} partitions", table.len());
        Ok(table)
    }

    /// USB sticks carry a 20-byte device id in the first data file.
    fn read_device_id(&mut self) -> Result<String, XenonError> {
        let io = self.io.as_mut();
        io.seek(SeekFrom::Start(USB_DEVICE_ID_OFFSET))?;
        let mut raw = [0u8; USB_DEVICE_ID_LEN];
        io.read_exact(&mut raw)?;
        Ok(raw.iter().map(|byte| format!("{:02X}", byte)).collect())
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// A device is valid when probing recognized it and at least one
    /// partition validated.
    pub fn is_valid(&self) -> bool {
        self.kind != DeviceKind::Unknown && !self.partitions.is_empty()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn partitions(&self) -> &[FatxPartition] {
        &self.partitions
    }

    pub fn partition_index(&self, name: &str) -> Option<usize> {
        self.partitions
            .iter()
            .position(|partition| partition.name.eq_ignore_ascii_case(name))
    }

    /// Split borrow used by every routed operation: one partition plus
    /// the shared device stream.
    pub fn partition_and_io(
        &mut self,
        index: usize,
    ) -> Result<(&mut FatxPartition, &mut dyn DeviceIo), XenonError> {
        if index >= self.partitions.len() {
            return Err(XenonError::NotFound(format!("partition {}", index)));
        }
        Ok((&mut self.partitions[index], self.io.as_mut()))
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            kind: self.kind,
            total_bytes: self.total_len,
            device_id: self.device_id.clone(),
            partitions: self.partitions.iter().map(Self::partition_info).collect(),
        }
    }

    fn partition_info(partition: &FatxPartition) -> PartitionInfo {
        PartitionInfo {
            name: partition.name.clone(),
            offset: partition.offset,
            size: partition.size,
            id: partition.id,
            cluster_size: partition.cluster_size,
            cluster_count: partition.cluster_count,
            free_clusters: partition.free_cluster_count(),
            free_bytes: partition.free_space(),
        }
    }

    // Path-level operations, routed to one partition.

    pub fn get_dirent(
        &mut self,
        partition: usize,
        path: &str,
    ) -> Result<Option<Dirent>, XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        part.dirent_get(io, path, root)
    }

    pub fn open_file(
        &mut self,
        partition: usize,
        path: &str,
        mode: FileMode,
    ) -> Result<FatxFileStream<'_>, XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        FatxFileStream::open(part, io, path, mode)
    }

    pub fn open_file_read_only(
        &mut self,
        partition: usize,
        path: &str,
    ) -> Result<FatxFileStream<'_>, XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        FatxFileStream::open_with_access(part, io, path, FileMode::Open, FileAccess::ReadOnly)
    }

    /// Read a whole file by path.
    pub fn get_file_data(&mut self, partition: usize, path: &str) -> Result<Vec<u8>, XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let dirent = part
            .dirent_get_typed(io, path, false, root)?
            .ok_or_else(|| XenonError::NotFound(path.to_string()))?;
        part.read_file_data(io, &dirent)
    }

    /// Create or replace a file with the given contents.
    pub fn write_file_data(
        &mut self,
        partition: usize,
        path: &str,
        data: &[u8],
    ) -> Result<(), XenonError> {
        let mut stream = self.open_file(partition, path, FileMode::Create)?;
        use std::io::Write;
        stream.write_all(data)?;
        stream.close()
    }

    /// Create a directory. The parent must already exist.
    pub fn create_directory(
        &mut self,
        partition: usize,
        path: &str,
    ) -> Result<Dirent, XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let normalized = paths::normalize(path);
        if part.dirent_get(io, &normalized, root)?.is_some() {
            return Err(XenonError::AlreadyExists(normalized));
        }
        let (parent, leaf) = paths::parent_and_leaf(&normalized);
        let parent_cluster = if parent.is_empty() {
            root
        } else {
            part.dirent_get_typed(io, parent, true, root)?
                .ok_or_else(|| XenonError::NotFound(parent.to_string()))?
                .first_cluster
        };
        part.create_dirent(io, parent_cluster, leaf, true)
    }

    /// Delete a file, or a directory and everything under it.
    pub fn delete(&mut self, partition: usize, path: &str) -> Result<(), XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let mut dirent = part
            .dirent_get(io, path, root)?
            .ok_or_else(|| XenonError::NotFound(path.to_string()))?;
        part.delete_tree(io, &mut dirent)
    }

    /// Rename an entry in place, rejecting sibling collisions.
    pub fn rename(
        &mut self,
        partition: usize,
        path: &str,
        new_name: &str,
    ) -> Result<(), XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let normalized = paths::normalize(path);
        let mut dirent = part
            .dirent_get(io, &normalized, root)?
            .ok_or_else(|| XenonError::NotFound(normalized.clone()))?;

        let (parent, _) = paths::parent_and_leaf(&normalized);
        let parent_cluster = if parent.is_empty() {
            root
        } else {
            part.dirent_get_typed(io, parent, true, root)?
                .ok_or_else(|| XenonError::NotFound(parent.to_string()))?
                .first_cluster
        };
        let taken = part.read_directory(io, parent_cluster)?.into_iter().any(|entry| {
            entry.state() == SlotState::Valid && entry.name().eq_ignore_ascii_case(new_name)
        });
        if taken {
            return Err(XenonError::AlreadyExists(new_name.to_string()));
        }
        part.rename_dirent(io, &mut dirent, new_name)
    }

    /// Move an entry into another directory on the same partition.
    pub fn move_entry(
        &mut self,
        partition: usize,
        path: &str,
        dest_dir: &str,
    ) -> Result<(), XenonError> {
        let source = paths::normalize(path);
        let dest = paths::normalize(dest_dir);
        if paths::is_same_or_descendant(&source, &dest) {
            return Err(XenonError::Other(format!(
                "cannot move '{}' into its own subtree '{}'",
                source, dest
            )));
        }

        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let mut dirent = part
            .dirent_get(io, &source, root)?
            .ok_or_else(|| XenonError::NotFound(source.clone()))?;
        let dest_cluster = if dest.is_empty() {
            root
        } else {
            part.dirent_get_typed(io, &dest, true, root)?
                .ok_or_else(|| XenonError::NotFound(dest.clone()))?
                .first_cluster
        };

        let name = dirent.name();
        let taken = part.read_directory(io, dest_cluster)?.into_iter().any(|entry| {
            entry.state() == SlotState::Valid && entry.name().eq_ignore_ascii_case(&name)
        });
        if taken {
            return Err(XenonError::AlreadyExists(name));
        }
        part.move_dirent(io, dest_cluster, &mut dirent)?;
        Ok(())
    }

    /// Recursively copy an entry into another directory on the same
    /// partition. Copying a directory into its own subtree is rejected.
    pub fn copy_entry(
        &mut self,
        partition: usize,
        path: &str,
        dest_dir: &str,
    ) -> Result<(), XenonError> {
        let source = paths::normalize(path);
        let dest = paths::normalize(dest_dir);
        if paths::is_same_or_descendant(&source, &dest) {
            return Err(XenonError::Other(format!(
                "cannot copy '{}' into its own subtree '{}'",
                source, dest
            )));
        }

        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let dirent = part
            .dirent_get(io, &source, root)?
            .ok_or_else(|| XenonError::NotFound(source.clone()))?;
        let dest_cluster = if dest.is_empty() {
            root
        } else {
            part.dirent_get_typed(io, &dest, true, root)?
                .ok_or_else(|| XenonError::NotFound(dest.clone()))?
                .first_cluster
        };
        part.copy_dirent(io, &dirent, dest_cluster)?;
        Ok(())
    }

    /// List the live entries of a directory ("" or "\" for the root).
    pub fn list_directory(
        &mut self,
        partition: usize,
        path: &str,
    ) -> Result<Vec<EntryInfo>, XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let normalized = paths::normalize(path);
        let cluster = if normalized.is_empty() {
            root
        } else {
            part.dirent_get_typed(io, &normalized, true, root)?
                .ok_or_else(|| XenonError::NotFound(normalized.clone()))?
                .first_cluster
        };
        Ok(part
            .read_directory(io, cluster)?
            .iter()
            .filter(|entry| entry.state() == SlotState::Valid)
            .map(EntryInfo::from_dirent)
            .collect())
    }

    /// Undelete a soft-deleted entry by its recovered name inside the
    /// given directory. Fails `AlreadyExists` if a live sibling took
    /// the name in the meantime.
    pub fn restore_entry(
        &mut self,
        partition: usize,
        dir_path: &str,
        name: &str,
    ) -> Result<Dirent, XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let normalized = paths::normalize(dir_path);
        let cluster = if normalized.is_empty() {
            root
        } else {
            part.dirent_get_typed(io, &normalized, true, root)?
                .ok_or_else(|| XenonError::NotFound(normalized.clone()))?
                .first_cluster
        };

        let entries = part.read_directory(io, cluster)?;
        if entries.iter().any(|entry| {
            entry.state() == SlotState::Valid && entry.name().eq_ignore_ascii_case(name)
        }) {
            return Err(XenonError::AlreadyExists(name.to_string()));
        }
        let mut deleted = entries
            .into_iter()
            .find(|entry| {
                entry.state() == SlotState::Deleted && entry.name().eq_ignore_ascii_case(name)
            })
            .ok_or_else(|| XenonError::NotFound(format!("deleted entry '{}'", name)))?;
        part.restore_dirent(io, &mut deleted)?;
        Ok(deleted)
    }

    /// Replace an entry's attribute bits (the directory bit is kept
    /// as-is; flipping it would orphan or corrupt the data chain).
    pub fn set_attributes(
        &mut self,
        partition: usize,
        path: &str,
        attributes: u8,
    ) -> Result<(), XenonError> {
        use super::constants::ATTR_DIRECTORY;

        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let mut dirent = part
            .dirent_get(io, path, root)?
            .ok_or_else(|| XenonError::NotFound(path.to_string()))?;
        let directory_bit = dirent.attributes & ATTR_DIRECTORY;
        dirent.attributes = (attributes & !ATTR_DIRECTORY) | directory_bit;
        dirent.modified = timestamps::now();
        part.update_dirent(io, &dirent)
    }

    /// Run the consistency checks over one partition.
    pub fn validate(&mut self, partition: usize) -> Result<VolumeReport, XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        validate_volume(part, io)
    }

    /// Copy an entry (file or directory tree) out to a host directory.
    pub fn extract_to_host(
        &mut self,
        partition: usize,
        path: &str,
        host_dir: &Path,
    ) -> Result<(), XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let dirent = part
            .dirent_get(io, path, root)?
            .ok_or_else(|| XenonError::NotFound(path.to_string()))?;
        extract_dirent(part, io, &dirent, host_dir)
    }

    /// Import a host file or directory tree into the directory at
    /// `dest_dir`. Host names must be valid FATX names.
    pub fn inject_from_host(
        &mut self,
        partition: usize,
        host_path: &Path,
        dest_dir: &str,
    ) -> Result<(), XenonError> {
        let (part, io) = self.partition_and_io(partition)?;
        let root = part.root_cluster;
        let dest = paths::normalize(dest_dir);
        let dest_cluster = if dest.is_empty() {
            root
        } else {
            part.dirent_get_typed(io, &dest, true, root)?
                .ok_or_else(|| XenonError::NotFound(dest.clone()))?
                .first_cluster
        };
        inject_path(part, io, host_path, dest_cluster)
    }

    /// Flush everything down to the backing store.
    pub fn sync(&mut self) -> Result<(), XenonError> {
        self.io.sync()?;
        Ok(())
    }
}

fn extract_dirent(
    part: &mut FatxPartition,
    io: &mut dyn DeviceIo,
    dirent: &Dirent,
    host_dir: &Path,
) -> Result<(), XenonError> {
    let target = host_dir.join(dirent.name());
    if dirent.is_directory() {
        std::fs::create_dir_all(&target)?;
        let children = part.read_directory(io, dirent.first_cluster)?;
        for child in children {
            if child.state() == SlotState::Valid {
                extract_dirent(part, io, &child, &target)?;
            }
        }
    } else {
        let data = part.read_file_data(io, dirent)?;
        std::fs::write(&target, data)?;
        debug!("extracted '{}' to {}", dirent.name(), target.display());
    }
    Ok(())
}

fn inject_path(
    part: &mut FatxPartition,
    io: &mut dyn DeviceIo,
    host_path: &Path,
    dest_cluster: u32,
) -> Result<(), XenonError> {
    let name = host_path
        .file_name()
        .ok_or_else(|| XenonError::InvalidName(format!("{}", host_path.display())))?
        .to_string_lossy()
        .into_owned();

    let collision = part
        .read_directory(io, dest_cluster)?
        .into_iter()
        .any(|entry| {
            entry.state() == SlotState::Valid && entry.name().eq_ignore_ascii_case(&name)
        });
    if collision {
        return Err(XenonError::AlreadyExists(name));
    }

    if host_path.is_dir() {
        let new_dir = part.create_dirent(io, dest_cluster, &name, true)?;
        for entry in std::fs::read_dir(host_path)? {
            inject_path(part, io, &entry?.path(), new_dir.first_cluster)?;
        }
    } else {
        let data = std::fs::read(host_path)?;
        let mut new_file = part.create_dirent(io, dest_cluster, &name, false)?;
        part.write_file_data(io, &mut new_file, &data)?;
        debug!("injected '{}' ({} bytes)", name, data.len());
    }
    Ok(())
}
