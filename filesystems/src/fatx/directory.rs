// Dirent operations on a FATX partition: listing, create, update,
// delete, rename, move, undelete, path lookup and recursive copy.

use log::{debug, info};

use xenon_core::{DeviceIo, XenonError};

use super::constants::cluster_values::*;
use super::constants::*;
use super::dirent::{slot_state, Dirent, SlotState};
use super::names::validate_name;
use super::partition::FatxPartition;
use super::paths;
use super::timestamps;

impl FatxPartition {
    /// List the directory whose chain starts at `cluster`. All live and
    /// soft-deleted entries are collected; the walk stops at the first
    /// empty or malformed slot. Results are cached for the root and for
    /// the most recently requested directory.
    pub fn read_directory(
        &mut self,
        io: &mut dyn DeviceIo,
        cluster: u32,
    ) -> Result<Vec<Dirent>, XenonError> {
        if cluster == self.root_cluster {
            if let Some(cached) = &self.root_cache {
                return Ok(cached.clone());
            }
        } else if cluster == self.last_dir_cluster {
            if let Some(cached) = &self.last_dir_cache {
                return Ok(cached.clone());
            }
        }

        let mut entries = Vec::new();
        let mut current = cluster;
        'walk: loop {
            let data = self.read_cluster(io, current)?;
            for slot in 0..self.dirents_per_cluster() {
                let offset = slot as usize * DIRENT_SIZE;
                let mut entry = Dirent::decode(&data[offset..offset + DIRENT_SIZE]);
                entry.parent_cluster = current;
                entry.slot = slot;
                match entry.state() {
                    SlotState::Empty | SlotState::Invalid => break 'walk,
                    SlotState::Deleted | SlotState::Valid => entries.push(entry),
                }
            }
            let next = self.next_cluster(current)?;
            if next == CLUSTER_LAST {
                break;
            }
            current = next;
        }

        self.last_dir_cluster = cluster;
        self.last_dir_cache = Some(entries.clone());
        if cluster == self.root_cluster {
            self.root_cache = Some(entries.clone());
        }
        Ok(entries)
    }

    /// Find the first reusable slot (empty or soft-deleted) in the
    /// directory chain starting at `parent_cluster`, extending the
    /// directory with a fresh zeroed cluster when it is full.
    fn find_free_slot(
        &mut self,
        io: &mut dyn DeviceIo,
        parent_cluster: u32,
    ) -> Result<(u32, u32), XenonError> {
        let mut current = parent_cluster;
        loop {
            let data = self.read_cluster(io, current)?;
            for slot in 0..self.dirents_per_cluster() {
                let name_len = data[slot as usize * DIRENT_SIZE];
                match slot_state(name_len) {
                    SlotState::Empty | SlotState::Deleted => return Ok((current, slot)),
                    SlotState::Valid | SlotState::Invalid => {}
                }
            }
            let next = self.next_cluster(current)?;
            if next == CLUSTER_LAST {
                let fresh = self.allocate_cluster(io, false)?;
                self.zero_cluster(io, fresh)?;
                self.set_next_cluster(current, fresh)?;
                self.write_chain_map(io)?;
                debug!(
                    "directory at cluster {} extended with cluster {}",
                    parent_cluster, fresh
                );
                return Ok((fresh, 0));
            }
            current = next;
        }
    }

    /// Create a fresh dirent in the directory at `parent_cluster`. New
    /// directories get one zeroed data cluster; new files start with no
    /// data chain at all.
    pub fn create_dirent(
        &mut self,
        io: &mut dyn DeviceIo,
        parent_cluster: u32,
        name: &str,
        is_directory: bool,
    ) -> Result<Dirent, XenonError> {
        validate_name(name)?;
        self.invalidate_dir_caches();

        let (slot_cluster, slot) = self.find_free_slot(io, parent_cluster)?;
        let stamp = timestamps::now();

        let mut dirent = Dirent {
            name_len: 0,
            attributes: if is_directory { ATTR_DIRECTORY } else { ATTR_NONE },
            name: [DIRENT_NAME_PAD; DIRENT_NAME_SIZE],
            first_cluster: CLUSTER_LAST,
            size: 0,
            created: stamp,
            modified: stamp,
            accessed: stamp,
            parent_cluster: slot_cluster,
            slot,
        };
        dirent.set_name(name);

        if is_directory {
            let data_cluster = self.allocate_cluster(io, false)?;
            self.zero_cluster(io, data_cluster)?;
            self.write_chain_map(io)?;
            dirent.first_cluster = data_cluster;
        }

        self.update_dirent(io, &dirent)?;
        debug!(
            "created {} '{}' at cluster {} slot {}",
            if is_directory { "directory" } else { "file" },
            name,
            slot_cluster,
            slot
        );
        Ok(dirent)
    }

    /// Rewrite a dirent's 64-byte slot in place.
    pub fn update_dirent(
        &mut self,
        io: &mut dyn DeviceIo,
        dirent: &Dirent,
    ) -> Result<(), XenonError> {
        let mut data = self.read_cluster(io, dirent.parent_cluster)?;
        let offset = dirent.slot as usize * DIRENT_SIZE;
        dirent.encode(&mut data[offset..offset + DIRENT_SIZE]);
        self.write_cluster(io, dirent.parent_cluster, &data)?;
        self.invalidate_dir_caches();
        Ok(())
    }

    /// Free a dirent's data chain and soft-delete the slot. The name
    /// bytes stay on disk so the entry remains recoverable.
    pub fn delete_dirent(
        &mut self,
        io: &mut dyn DeviceIo,
        dirent: &mut Dirent,
    ) -> Result<(), XenonError> {
        if dirent.first_cluster != CLUSTER_LAST && dirent.first_cluster != 0 {
            self.free_chain(io, dirent.first_cluster, u32::MAX, false, true)?;
        }
        dirent.name_len = NAME_DELETED;
        self.update_dirent(io, dirent)
    }

    /// Delete a dirent and, for directories, everything beneath it.
    pub fn delete_tree(
        &mut self,
        io: &mut dyn DeviceIo,
        dirent: &mut Dirent,
    ) -> Result<(), XenonError> {
        if dirent.is_directory() {
            let children = self.read_directory(io, dirent.first_cluster)?;
            for mut child in children {
                if child.state() == SlotState::Valid {
                    self.delete_tree(io, &mut child)?;
                }
            }
        }
        self.delete_dirent(io, dirent)
    }

    /// Rename a dirent in place and bump its modified/access times.
    pub fn rename_dirent(
        &mut self,
        io: &mut dyn DeviceIo,
        dirent: &mut Dirent,
        new_name: &str,
    ) -> Result<(), XenonError> {
        validate_name(new_name)?;
        dirent.set_name(new_name);
        let stamp = timestamps::now();
        dirent.modified = stamp;
        dirent.accessed = stamp;
        self.update_dirent(io, dirent)
    }

    /// Move a dirent under a new parent directory. The target slot
    /// inherits the data chain; the source slot is soft-deleted with
    /// its first cluster erased, so a later undelete of the source can
    /// never resurrect a chain that now belongs to the moved entry.
    pub fn move_dirent(
        &mut self,
        io: &mut dyn DeviceIo,
        new_parent_cluster: u32,
        dirent: &mut Dirent,
    ) -> Result<Dirent, XenonError> {
        if dirent.parent_cluster == new_parent_cluster {
            return Ok(dirent.clone());
        }

        let (slot_cluster, slot) = self.find_free_slot(io, new_parent_cluster)?;
        let mut moved = dirent.clone();
        moved.parent_cluster = slot_cluster;
        moved.slot = slot;
        self.update_dirent(io, &moved)?;

        dirent.name_len = NAME_DELETED;
        dirent.first_cluster = CLUSTER_LAST;
        self.update_dirent(io, dirent)?;
        Ok(moved)
    }

    /// Bring a soft-deleted dirent back, re-deriving its name length
    /// from the preserved name bytes. The data chain is whatever the
    /// slot still points at; a moved-away or wiped source comes back as
    /// an empty file.
    pub fn restore_dirent(
        &mut self,
        io: &mut dyn DeviceIo,
        dirent: &mut Dirent,
    ) -> Result<(), XenonError> {
        if dirent.state() != SlotState::Deleted {
            return Err(XenonError::Other(format!(
                "'{}' is not a deleted entry",
                dirent.name()
            )));
        }
        let len = dirent.recovered_name_len();
        if len == 0 || len > DIRENT_NAME_SIZE {
            return Err(XenonError::InvalidName(
                "deleted entry has no recoverable name".into(),
            ));
        }
        dirent.name_len = len as u8;
        if dirent.first_cluster == 0 {
            dirent.first_cluster = CLUSTER_LAST;
        }
        self.update_dirent(io, dirent)
    }

    /// Resolve a path (relative to the directory at `cluster`) to its
    /// dirent. Soft-deleted entries never match; missing components
    /// yield `None`.
    pub fn dirent_get(
        &mut self,
        io: &mut dyn DeviceIo,
        path: &str,
        cluster: u32,
    ) -> Result<Option<Dirent>, XenonError> {
        self.lookup(io, path, cluster, None)
    }

    /// Like [`FatxPartition::dirent_get`] but the final component must
    /// additionally be a directory (`want_directory`) or a file.
    pub fn dirent_get_typed(
        &mut self,
        io: &mut dyn DeviceIo,
        path: &str,
        want_directory: bool,
        cluster: u32,
    ) -> Result<Option<Dirent>, XenonError> {
        self.lookup(io, path, cluster, Some(want_directory))
    }

    fn lookup(
        &mut self,
        io: &mut dyn DeviceIo,
        path: &str,
        cluster: u32,
        want_directory: Option<bool>,
    ) -> Result<Option<Dirent>, XenonError> {
        let normalized = paths::normalize(path);
        let components = paths::components(&normalized);
        if components.is_empty() {
            // The root is not itself a dirent.
            return Ok(None);
        }

        let mut current = cluster;
        for (index, component) in components.iter().enumerate() {
            let entries = self.read_directory(io, current)?;
            let found = entries.into_iter().find(|entry| {
                entry.state() == SlotState::Valid
                    && entry.name().eq_ignore_ascii_case(component)
            });
            let entry = match found {
                Some(entry) => entry,
                None => return Ok(None),
            };

            if index + 1 == components.len() {
                if let Some(want_dir) = want_directory {
                    if entry.is_directory() != want_dir {
                        return Ok(None);
                    }
                }
                return Ok(Some(entry));
            }
            if !entry.is_directory() {
                return Ok(None);
            }
            current = entry.first_cluster;
        }
        unreachable!("component loop always returns");
    }

    /// Read a file's entire contents.
    pub fn read_file_data(
        &mut self,
        io: &mut dyn DeviceIo,
        dirent: &Dirent,
    ) -> Result<Vec<u8>, XenonError> {
        if dirent.size == 0 || dirent.first_cluster == CLUSTER_LAST {
            return Ok(Vec::new());
        }
        let mut data = Vec::with_capacity(dirent.size as usize);
        for cluster in self.cluster_chain(dirent.first_cluster)? {
            data.extend_from_slice(&self.read_cluster(io, cluster)?);
            if data.len() >= dirent.size as usize {
                break;
            }
        }
        data.truncate(dirent.size as usize);
        Ok(data)
    }

    /// Replace a file's contents, resizing its chain to fit.
    pub fn write_file_data(
        &mut self,
        io: &mut dyn DeviceIo,
        dirent: &mut Dirent,
        data: &[u8],
    ) -> Result<(), XenonError> {
        self.resize_dirent_chain(io, dirent, data.len() as u64)?;
        if data.is_empty() {
            return Ok(());
        }
        let cluster_size = self.cluster_size as usize;
        let chain = self.cluster_chain(dirent.first_cluster)?;
        for (cluster, chunk) in chain.into_iter().zip(data.chunks(cluster_size)) {
            let mut block = vec![0u8; cluster_size];
            block[..chunk.len()].copy_from_slice(chunk);
            self.write_cluster(io, cluster, &block)?;
        }
        Ok(())
    }

    /// Recursively copy a dirent into the directory at
    /// `dest_parent_cluster`. Fails with `AlreadyExists` on a name
    /// collision at any level. Descendant cycles are the caller's
    /// responsibility; path-level wrappers reject them before the walk
    /// starts.
    pub fn copy_dirent(
        &mut self,
        io: &mut dyn DeviceIo,
        source: &Dirent,
        dest_parent_cluster: u32,
    ) -> Result<Dirent, XenonError> {
        let name = source.name();
        let collision = self
            .read_directory(io, dest_parent_cluster)?
            .into_iter()
            .any(|entry| {
                entry.state() == SlotState::Valid && entry.name().eq_ignore_ascii_case(&name)
            });
        if collision {
            return Err(XenonError::AlreadyExists(name));
        }

        if source.is_directory() {
            let new_dir = self.create_dirent(io, dest_parent_cluster, &name, true)?;
            let children = self.read_directory(io, source.first_cluster)?;
            for child in children {
                if child.state() == SlotState::Valid {
                    self.copy_dirent(io, &child, new_dir.first_cluster)?;
                }
            }
            Ok(new_dir)
        } else {
            let mut new_file = self.create_dirent(io, dest_parent_cluster, &name, false)?;
            let data = self.read_file_data(io, source)?;
            self.write_file_data(io, &mut new_file, &data)?;
            info!("copied '{}' ({} bytes)", name, data.len());
            Ok(new_file)
        }
    }
}
