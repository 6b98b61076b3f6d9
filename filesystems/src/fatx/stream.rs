// Seekable file stream backed by one dirent's cluster chain.
// Reads and writes go through a cluster-sized cache; the cache is
// flushed before every cluster transition and on close. Length changes
// delegate the chain surgery to the partition.

use std::io::{self, Read, Seek, SeekFrom, Write};

use log::debug;

use xenon_core::{DeviceIo, XenonError};

use super::constants::cluster_values::*;
use super::dirent::Dirent;
use super::partition::FatxPartition;
use super::paths;
use super::timestamps;

/// How to open a dirent stream. Enumerated explicitly; these are FATX
/// semantics, not a host filesystem's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// The file must exist; position starts at 0.
    Open,
    /// Create the file, truncating and re-stamping it if it exists.
    Create,
    /// Create the file; fail if it already exists.
    CreateNew,
    /// Open the file, creating it first if missing.
    OpenOrCreate,
    /// Open the file and drop its contents.
    Truncate,
    /// Open or create, then position at the end.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    ReadOnly,
    ReadWrite,
}

pub struct FatxFileStream<'a> {
    partition: &'a mut FatxPartition,
    io: &'a mut dyn DeviceIo,
    dirent: Dirent,
    position: u64,
    current_cluster: u32,
    clusters_in: u32,
    cache: Vec<u8>,
    cache_loaded: bool,
    cache_dirty: bool,
    file_modified: bool,
    read_only: bool,
    closed: bool,
}

impl<'a> FatxFileStream<'a> {
    pub fn open(
        partition: &'a mut FatxPartition,
        io: &'a mut dyn DeviceIo,
        path: &str,
        mode: FileMode,
    ) -> Result<Self, XenonError> {
        Self::open_with_access(partition, io, path, mode, FileAccess::ReadWrite)
    }

    pub fn open_with_access(
        partition: &'a mut FatxPartition,
        io: &'a mut dyn DeviceIo,
        path: &str,
        mode: FileMode,
        access: FileAccess,
    ) -> Result<Self, XenonError> {
        if access == FileAccess::ReadOnly && mode != FileMode::Open {
            return Err(XenonError::UnsupportedMode(format!(
                "{:?} requires write access",
                mode
            )));
        }

        let normalized = paths::normalize(path);
        let root = partition.root_cluster;
        let existing = partition.dirent_get(io, &normalized, root)?;
        if let Some(entry) = &existing {
            if entry.is_directory() {
                return Err(XenonError::Other(format!(
                    "'{}' is a directory",
                    normalized
                )));
            }
        }

        let (dirent, truncate_existing) = match (existing, mode) {
            (Some(_), FileMode::CreateNew) => {
                return Err(XenonError::AlreadyExists(normalized));
            }
            (Some(entry), FileMode::Create) => (entry, true),
            (Some(entry), FileMode::Truncate) => (entry, true),
            (Some(entry), _) => (entry, false),
            (None, FileMode::Open) | (None, FileMode::Truncate) => {
                return Err(XenonError::NotFound(normalized));
            }
            (None, _) => {
                let (parent, leaf) = paths::parent_and_leaf(&normalized);
                let parent_cluster = if parent.is_empty() {
                    root
                } else {
                    partition
                        .dirent_get_typed(io, parent, true, root)?
                        .ok_or_else(|| XenonError::NotFound(parent.to_string()))?
                        .first_cluster
                };
                (partition.create_dirent(io, parent_cluster, leaf, false)?, false)
            }
        };

        debug!(
            "opened '{}' ({:?}, {} bytes) on partition '{}'",
            normalized, mode, dirent.size, partition.name
        );

        let mut stream = Self {
            partition,
            io,
            dirent,
            position: 0,
            current_cluster: CLUSTER_LAST,
            clusters_in: 0,
            cache: Vec::new(),
            cache_loaded: false,
            cache_dirty: false,
            file_modified: false,
            read_only: access == FileAccess::ReadOnly,
            closed: false,
        };
        stream.current_cluster = stream.dirent.first_cluster;

        if truncate_existing {
            stream.set_length(0)?;
            if mode == FileMode::Create {
                stream.dirent.created = timestamps::now();
                stream
                    .partition
                    .update_dirent(&mut *stream.io, &stream.dirent)?;
            }
        }
        if mode == FileMode::Append {
            let len = stream.len();
            stream.seek_to(len)?;
        }
        Ok(stream)
    }

    pub fn len(&self) -> u64 {
        self.dirent.size as u64
    }

    pub fn is_empty(&self) -> bool {
        self.dirent.size == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn dirent(&self) -> &Dirent {
        &self.dirent
    }

    fn cluster_size(&self) -> u64 {
        self.partition.cluster_size as u64
    }

    fn flush_cache(&mut self) -> Result<(), XenonError> {
        if self.cache_loaded && self.cache_dirty {
            self.partition
                .write_cluster(&mut *self.io, self.current_cluster, &self.cache)?;
            self.cache_dirty = false;
        }
        Ok(())
    }

    fn drop_cache(&mut self) {
        self.cache_loaded = false;
        self.cache_dirty = false;
    }

    /// Make sure the cache holds the cluster containing `position`.
    /// Callers guarantee the chain covers that position.
    fn ensure_cluster(&mut self) -> Result<(), XenonError> {
        if self.cache_loaded {
            return Ok(());
        }
        let target = (self.position / self.cluster_size()) as u32;
        let cluster = self
            .partition
            .walk_chain(self.dirent.first_cluster, target)?;
        self.cache = self.partition.read_cluster(&mut *self.io, cluster)?;
        self.current_cluster = cluster;
        self.clusters_in = target;
        self.cache_loaded = true;
        Ok(())
    }

    /// Flush the cache and step it to the next cluster in the chain.
    fn advance_cluster(&mut self) -> Result<(), XenonError> {
        self.flush_cache()?;
        let next = self.partition.next_cluster(self.current_cluster)?;
        if next == CLUSTER_LAST {
            return Err(XenonError::BadChain(self.current_cluster));
        }
        self.cache = self.partition.read_cluster(&mut *self.io, next)?;
        self.current_cluster = next;
        self.clusters_in += 1;
        Ok(())
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize, XenonError> {
        let length = FatxFileStream::len(self);
        if self.position >= length || buf.is_empty() {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(length - self.position) as usize;
        self.ensure_cluster()?;

        let cluster_size = self.cluster_size() as usize;
        let mut done = 0;
        while done < count {
            let in_cluster = (self.position % cluster_size as u64) as usize;
            let take = (cluster_size - in_cluster).min(count - done);
            buf[done..done + take]
                .copy_from_slice(&self.cache[in_cluster..in_cluster + take]);
            done += take;
            self.position += take as u64;
            if self.position % cluster_size as u64 == 0 && self.position < length {
                self.advance_cluster()?;
            }
        }
        Ok(count)
    }

    fn write_inner(&mut self, buf: &[u8]) -> Result<usize, XenonError> {
        if self.read_only {
            return Err(XenonError::ReadOnly(self.dirent.name()));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.file_modified = true;

        let end = self.position + buf.len() as u64;
        if end > FatxFileStream::len(self) {
            self.set_length(end)?;
        }
        self.ensure_cluster()?;

        let length = FatxFileStream::len(self);
        let cluster_size = self.cluster_size() as usize;
        let mut done = 0;
        while done < buf.len() {
            let in_cluster = (self.position % cluster_size as u64) as usize;
            let take = (cluster_size - in_cluster).min(buf.len() - done);
            self.cache[in_cluster..in_cluster + take]
                .copy_from_slice(&buf[done..done + take]);
            self.cache_dirty = true;
            done += take;
            self.position += take as u64;
            if self.position % cluster_size as u64 == 0 && self.position < length {
                self.advance_cluster()?;
            }
        }
        Ok(buf.len())
    }

    /// Grow or shrink the file. Growing links fresh clusters onto the
    /// chain (failing `NoSpace` up front, leaving the file untouched);
    /// shrinking frees the tail and, at zero, detaches the chain
    /// entirely.
    pub fn set_length(&mut self, new_len: u64) -> Result<(), XenonError> {
        if self.read_only {
            return Err(XenonError::ReadOnly(self.dirent.name()));
        }
        if new_len == FatxFileStream::len(self) {
            return Ok(());
        }
        self.flush_cache()?;
        let shrinking = new_len < FatxFileStream::len(self);

        self.partition
            .resize_dirent_chain(&mut *self.io, &mut self.dirent, new_len)?;
        self.file_modified = true;

        if shrinking {
            self.drop_cache();
            self.current_cluster = self.dirent.first_cluster;
            if self.position > new_len {
                self.position = new_len;
            }
            self.clusters_in = (self.position / self.cluster_size()) as u32;
        }
        Ok(())
    }

    fn seek_to(&mut self, target: u64) -> Result<u64, XenonError> {
        if target > FatxFileStream::len(self) {
            return Err(XenonError::Other(format!(
                "seek to {} past the end of '{}' ({} bytes)",
                target,
                self.dirent.name(),
                FatxFileStream::len(self)
            )));
        }
        let new_clusters_in = (target / self.cluster_size()) as u32;
        if !(self.cache_loaded && new_clusters_in == self.clusters_in) {
            self.flush_cache()?;
            self.drop_cache();
            self.clusters_in = new_clusters_in;
        }
        self.position = target;
        Ok(target)
    }

    /// Flush the cache and, if the file changed, stamp and persist the
    /// dirent. Called by `close` and as a last resort on drop.
    fn finish(&mut self) -> Result<(), XenonError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush_cache()?;
        if self.file_modified {
            self.dirent.modified = timestamps::now();
            self.partition.update_dirent(&mut *self.io, &self.dirent)?;
        }
        Ok(())
    }

    pub fn close(mut self) -> Result<(), XenonError> {
        self.finish()
    }
}

impl Read for FatxFileStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).map_err(io::Error::from)
    }
}

impl Write for FatxFileStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_inner(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_cache().map_err(io::Error::from)?;
        self.io.flush()
    }
}

impl Seek for FatxFileStream<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => FatxFileStream::len(self).checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.seek_to(target).map_err(io::Error::from)
    }
}

impl DeviceIo for FatxFileStream<'_> {
    fn len(&mut self) -> io::Result<u64> {
        Ok(FatxFileStream::len(self))
    }

    fn set_len(&mut self, len: u64) -> Result<(), XenonError> {
        self.set_length(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush_cache().map_err(io::Error::from)?;
        self.io.sync()
    }
}

impl Drop for FatxFileStream<'_> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::super::formatter;
    use super::super::partition::{FatxPartition, PartitionKind};
    use super::*;
    use std::io::Cursor;
    use xenon_core::MemoryIo;

    // 512-byte clusters keep multi-cluster cases cheap.
    fn small_volume() -> (MemoryIo, FatxPartition) {
        let mut io: MemoryIo = Cursor::new(vec![0u8; 0x8_0000]);
        formatter::format_partition(&mut io, 0, 0x8_0000, 1).unwrap();
        let mut partition = FatxPartition::new("Data", 0, 0x8_0000, PartitionKind::Regular);
        partition.read(&mut io).unwrap();
        (io, partition)
    }

    #[test]
    fn open_modes() {
        let (mut io, mut partition) = small_volume();

        assert!(matches!(
            FatxFileStream::open(&mut partition, &mut io, "nope", FileMode::Open),
            Err(XenonError::NotFound(_))
        ));

        let stream =
            FatxFileStream::open(&mut partition, &mut io, "a.bin", FileMode::OpenOrCreate)
                .unwrap();
        assert_eq!(stream.len(), 0);
        stream.close().unwrap();

        assert!(matches!(
            FatxFileStream::open(&mut partition, &mut io, "a.bin", FileMode::CreateNew),
            Err(XenonError::AlreadyExists(_))
        ));

        // Create truncates what OpenOrCreate left behind.
        let mut stream =
            FatxFileStream::open(&mut partition, &mut io, "a.bin", FileMode::Create).unwrap();
        stream.write_all(&[1; 100]).unwrap();
        stream.close().unwrap();
        let stream =
            FatxFileStream::open(&mut partition, &mut io, "a.bin", FileMode::Create).unwrap();
        assert_eq!(stream.len(), 0);
        stream.close().unwrap();
    }

    #[test]
    fn odd_sized_reads_cross_clusters() {
        let (mut io, mut partition) = small_volume();
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();

        let mut stream =
            FatxFileStream::open(&mut partition, &mut io, "pattern", FileMode::Create).unwrap();
        stream.write_all(&payload).unwrap();
        stream.close().unwrap();

        let mut stream =
            FatxFileStream::open(&mut partition, &mut io, "pattern", FileMode::Open).unwrap();
        let mut back = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            back.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(back, payload);
    }

    #[test]
    fn seek_lands_on_the_right_cluster() {
        let (mut io, mut partition) = small_volume();
        let payload: Vec<u8> = (0..2048u32).map(|i| (i / 512) as u8).collect();

        let mut stream =
            FatxFileStream::open(&mut partition, &mut io, "strided", FileMode::Create).unwrap();
        stream.write_all(&payload).unwrap();

        stream.seek(SeekFrom::Start(512 * 3 + 17)).unwrap();
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 3);

        stream.seek(SeekFrom::Current(-530)).unwrap();
        stream.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 2);
        stream.close().unwrap();
    }

    #[test]
    fn dropping_a_dirty_stream_still_persists() {
        let (mut io, mut partition) = small_volume();
        {
            let mut stream =
                FatxFileStream::open(&mut partition, &mut io, "dropped", FileMode::Create)
                    .unwrap();
            stream.write_all(b"persisted by drop").unwrap();
        }
        let mut stream =
            FatxFileStream::open(&mut partition, &mut io, "dropped", FileMode::Open).unwrap();
        let mut back = Vec::new();
        stream.read_to_end(&mut back).unwrap();
        assert_eq!(back, b"persisted by drop");
    }

    #[test]
    fn read_only_streams_reject_mutation() {
        let (mut io, mut partition) = small_volume();
        FatxFileStream::open(&mut partition, &mut io, "locked", FileMode::Create)
            .unwrap()
            .close()
            .unwrap();

        assert!(matches!(
            FatxFileStream::open_with_access(
                &mut partition,
                &mut io,
                "locked",
                FileMode::Create,
                FileAccess::ReadOnly,
            ),
            Err(XenonError::UnsupportedMode(_))
        ));

        let mut stream = FatxFileStream::open_with_access(
            &mut partition,
            &mut io,
            "locked",
            FileMode::Open,
            FileAccess::ReadOnly,
        )
        .unwrap();
        assert!(matches!(
            stream.write_inner(b"x"),
            Err(XenonError::ReadOnly(_))
        ));
        assert!(matches!(
            stream.set_length(10),
            Err(XenonError::ReadOnly(_))
        ));
        stream.close().unwrap();
    }

    #[test]
    fn opening_a_directory_as_a_file_fails() {
        let (mut io, mut partition) = small_volume();
        let root = partition.root_cluster;
        partition.create_dirent(&mut io, root, "folder", true).unwrap();
        assert!(FatxFileStream::open(&mut partition, &mut io, "folder", FileMode::Open).is_err());
    }
}
