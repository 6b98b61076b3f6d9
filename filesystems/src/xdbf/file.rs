// XDBF allocator.
// The file keeps two parallel tables ahead of a data area: allocated
// sections keyed by (namespace, id) and free regions ordered by offset.
// Allocation is best-fit (exact size first, then the lowest-offset
// region that fits); the file grows at its tail when nothing fits, and
// a rebuild compacts everything when fragmentation defeats allocation.

use std::io::SeekFrom;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};

use xenon_core::{DeviceIo, XenonError};

use super::sections::{XdbfEntry, XdbfFreeEntry};

/// "XDBF" read as a big-endian u32.
pub const XDBF_MAGIC: u32 = 0x5844_4246;
pub const XDBF_VERSION: u32 = 0x1_0000;
pub const DEFAULT_ENTRY_MAX: u32 = 0x200;
pub const DEFAULT_FREE_MAX: u32 = 0x200;

const HEADER_SIZE: u64 = 0x18;
const ENTRY_RECORD_SIZE: u64 = 0x12;
const FREE_RECORD_SIZE: u64 = 0x8;

pub struct XdbfFile<D: DeviceIo> {
    io: D,
    pub version: u32,
    entry_max: u32,
    free_max: u32,
    allocated: Vec<XdbfEntry>,
    free: Vec<XdbfFreeEntry>,
}

impl<D: DeviceIo> XdbfFile<D> {
    /// Read an existing XDBF file from the start of `io`.
    pub fn open(mut io: D) -> Result<Self, XenonError> {
        io.seek(SeekFrom::Start(0))?;
        let magic = io.read_u32::<BigEndian>()?;
        if magic != XDBF_MAGIC {
            return Err(XenonError::InvalidXdbf(format!(
                "bad magic {:#010X}",
                magic
            )));
        }
        let version = io.read_u32::<BigEndian>()?;
        let entry_max = io.read_u32::<BigEndian>()?;
        let entry_current = io.read_u32::<BigEndian>()?;
        let free_max = io.read_u32::<BigEndian>()?;
        let free_current = io.read_u32::<BigEndian>()?;

        let mut allocated = Vec::with_capacity(entry_current as usize);
        for _ in 0..entry_current {
            allocated.push(XdbfEntry {
                namespace: io.read_i16::<BigEndian>()?,
                id: io.read_i64::<BigEndian>()?,
                offset: io.read_i32::<BigEndian>()?,
                size: io.read_i32::<BigEndian>()?,
            });
        }

        io.seek(SeekFrom::Start(free_table_offset(entry_max)))?;
        let mut free = Vec::with_capacity(free_current as usize);
        for _ in 0..free_current {
            free.push(XdbfFreeEntry {
                offset: io.read_i32::<BigEndian>()?,
                size: io.read_u32::<BigEndian>()?,
            });
        }

        debug!(
            "opened XDBF: {} allocated, {} free, tables {}x{}",
            allocated.len(),
            free.len(),
            entry_max,
            free_max
        );
        Ok(Self {
            io,
            version,
            entry_max,
            free_max,
            allocated,
            free,
        })
    }

    /// Initialize a fresh, empty XDBF file with the default table
    /// capacities.
    pub fn create(io: D) -> Result<Self, XenonError> {
        Self::create_with_limits(io, DEFAULT_ENTRY_MAX, DEFAULT_FREE_MAX)
    }

    pub fn create_with_limits(io: D, entry_max: u32, free_max: u32) -> Result<Self, XenonError> {
        let mut file = Self {
            io,
            version: XDBF_VERSION,
            entry_max,
            free_max,
            allocated: Vec::new(),
            free: Vec::new(),
        };
        let length = file.section_start();
        file.io.set_len(length)?;
        file.save()?;
        Ok(file)
    }

    /// Start of the data area; section offsets are relative to this.
    pub fn section_start(&self) -> u64 {
        (self.free_max as u64 + 3) * FREE_RECORD_SIZE + self.entry_max as u64 * ENTRY_RECORD_SIZE
    }

    pub fn entries(&self) -> &[XdbfEntry] {
        &self.allocated
    }

    pub fn free_sections(&self) -> &[XdbfFreeEntry] {
        &self.free
    }

    pub fn entry_max(&self) -> u32 {
        self.entry_max
    }

    pub fn free_max(&self) -> u32 {
        self.free_max
    }

    pub fn find(&self, namespace: i16, id: i64) -> Option<XdbfEntry> {
        self.allocated
            .iter()
            .copied()
            .find(|entry| entry.namespace == namespace && entry.id == id)
    }

    pub fn into_inner(self) -> D {
        self.io
    }

    /// Write the header and both tables back at their fixed offsets.
    /// The data area in between is untouched.
    pub fn save(&mut self) -> Result<(), XenonError> {
        self.io.seek(SeekFrom::Start(0))?;
        self.io.write_u32::<BigEndian>(XDBF_MAGIC)?;
        self.io.write_u32::<BigEndian>(self.version)?;
        self.io.write_u32::<BigEndian>(self.entry_max)?;
        self.io.write_u32::<BigEndian>(self.allocated.len() as u32)?;
        self.io.write_u32::<BigEndian>(self.free_max)?;
        self.io.write_u32::<BigEndian>(self.free.len() as u32)?;

        for entry in &self.allocated {
            self.io.write_i16::<BigEndian>(entry.namespace)?;
            self.io.write_i64::<BigEndian>(entry.id)?;
            self.io.write_i32::<BigEndian>(entry.offset)?;
            self.io.write_i32::<BigEndian>(entry.size)?;
        }

        self.io
            .seek(SeekFrom::Start(free_table_offset(self.entry_max)))?;
        for free in &self.free {
            self.io.write_i32::<BigEndian>(free.offset)?;
            self.io.write_u32::<BigEndian>(free.size)?;
        }
        self.io.flush()?;
        Ok(())
    }

    /// Best-fit allocate `size` bytes for (namespace, id). If no free
    /// region fits, the file is expanded once at its tail and the
    /// search retried.
    pub fn allocate_section(
        &mut self,
        size: u32,
        namespace: i16,
        id: i64,
    ) -> Result<XdbfEntry, XenonError> {
        if self.find(namespace, id).is_some() {
            return Err(XenonError::AlreadyExists(format!(
                "section {}/{:#X}",
                namespace, id
            )));
        }
        if let Some(entry) = self.claim(size, namespace, id)? {
            self.save()?;
            return Ok(entry);
        }
        self.expand(size)?;
        match self.claim(size, namespace, id)? {
            Some(entry) => {
                self.save()?;
                Ok(entry)
            }
            None => Err(XenonError::NoSpace(format!(
                "no region of {} bytes even after expansion",
                size
            ))),
        }
    }

    /// One best-fit pass over the free table.
    fn claim(
        &mut self,
        size: u32,
        namespace: i16,
        id: i64,
    ) -> Result<Option<XdbfEntry>, XenonError> {
        // Exact size first; the free list is offset-ordered, so the
        // first hit is also the lowest-offset one.
        let index = match self
            .free
            .iter()
            .position(|region| region.size == size)
            .or_else(|| self.free.iter().position(|region| region.size >= size))
        {
            Some(index) => index,
            None => return Ok(None),
        };

        let region = self.free[index];
        if region.size == size {
            self.free.remove(index);
        } else {
            // Splitting leaves the remainder as a new free region; the
            // entry table must have room for the allocated half.
            if self.allocated.len() as u32 >= self.entry_max {
                return Err(XenonError::NoFreeSlots("entry table is full".into()));
            }
            self.free[index] = XdbfFreeEntry {
                offset: region.offset + size as i32,
                size: region.size - size,
            };
        }

        let entry = XdbfEntry {
            namespace,
            id,
            offset: region.offset,
            size: size as i32,
        };
        self.allocated.push(entry);
        self.sort_tables();
        Ok(Some(entry))
    }

    /// Grow the data area by `amount` bytes at its tail: extend the
    /// highest-offset region when it is free, or append a fresh free
    /// region right after it when it is allocated.
    pub fn expand(&mut self, amount: u32) -> Result<(), XenonError> {
        #[derive(Clone, Copy)]
        enum Tail {
            None,
            Allocated(usize),
            Free(usize),
        }

        let mut highest = -1i64;
        let mut tail = Tail::None;
        for (index, entry) in self.allocated.iter().enumerate() {
            if entry.offset as i64 > highest {
                highest = entry.offset as i64;
                tail = Tail::Allocated(index);
            }
        }
        for (index, region) in self.free.iter().enumerate() {
            if region.offset as i64 > highest {
                highest = region.offset as i64;
                tail = Tail::Free(index);
            }
        }

        match tail {
            Tail::Free(index) => {
                self.free[index].size += amount;
            }
            Tail::Allocated(index) => {
                if self.free.len() as u32 >= self.free_max {
                    return Err(XenonError::NoFreeSlots("free table is full".into()));
                }
                let entry = self.allocated[index];
                self.free.push(XdbfFreeEntry {
                    offset: entry.offset + entry.size,
                    size: amount,
                });
                self.sort_tables();
            }
            Tail::None => {
                self.free.push(XdbfFreeEntry {
                    offset: 0,
                    size: amount,
                });
            }
        }

        let length = self.io.len()?;
        self.io.set_len(length + amount as u64)?;
        debug!("expanded XDBF by {} bytes to {}", amount, length + amount as u64);
        self.save()
    }

    /// Release the section keyed by (namespace, id), wiping its bytes
    /// in the data area.
    pub fn free_section(&mut self, namespace: i16, id: i64) -> Result<(), XenonError> {
        let index = self
            .allocated
            .iter()
            .position(|entry| entry.namespace == namespace && entry.id == id)
            .ok_or_else(|| {
                XenonError::NotFound(format!("section {}/{:#X}", namespace, id))
            })?;
        let entry = self.allocated.remove(index);
        self.wipe(entry.offset, entry.size as u32)?;
        self.free.push(XdbfFreeEntry {
            offset: entry.offset,
            size: entry.size as u32,
        });
        self.sort_tables();
        self.save()
    }

    /// Write `data` as the section (namespace, id), allocating,
    /// reusing or relocating its region as needed. A placement failure
    /// triggers one compacting rebuild before giving up.
    pub fn update_section(
        &mut self,
        namespace: i16,
        id: i64,
        data: &[u8],
    ) -> Result<XdbfEntry, XenonError> {
        let size = data.len() as u32;
        let entry = match self.find(namespace, id) {
            None => self
                .allocate_section(size, namespace, id)
                .map_err(|err| XenonError::UpdateFailed(err.to_string()))?,
            Some(current) if current.size as u32 == size => current,
            Some(_) => {
                self.free_section(namespace, id)?;
                match self.allocate_section(size, namespace, id) {
                    Ok(entry) => entry,
                    Err(_) => {
                        self.rebuild()?;
                        self.allocate_section(size, namespace, id).map_err(|_| {
                            XenonError::NoSpace(format!(
                                "cannot place {} bytes for section {}/{:#X}",
                                size, namespace, id
                            ))
                        })?
                    }
                }
            }
        };

        let offset = self.section_start() + entry.offset as u64;
        self.io.seek(SeekFrom::Start(offset))?;
        self.io.write_all(data)?;
        self.sort_tables();
        self.save()?;
        Ok(entry)
    }

    pub fn read_section(&mut self, namespace: i16, id: i64) -> Result<Vec<u8>, XenonError> {
        let entry = self.find(namespace, id).ok_or_else(|| {
            XenonError::NotFound(format!("section {}/{:#X}", namespace, id))
        })?;
        self.read_at(entry.offset, entry.size as u32)
    }

    /// Compact the file: every allocation moves to a contiguous run at
    /// the start of the data area and all free regions collapse into
    /// one tail region of their summed size.
    pub fn rebuild(&mut self) -> Result<(), XenonError> {
        info!(
            "rebuilding XDBF: {} allocated, {} free sections",
            self.allocated.len(),
            self.free.len()
        );
        self.sort_tables();

        let entries = self.allocated.clone();
        let mut payloads = Vec::with_capacity(entries.len());
        for entry in &entries {
            payloads.push(self.read_at(entry.offset, entry.size as u32)?);
        }

        if self.allocated.len() as u32 >= self.entry_max {
            self.entry_max = self.allocated.len() as u32 + 10;
        }
        if self.free.len() as u32 >= self.free_max {
            self.free_max = self.free.len() as u32 + 10;
        }

        let allocated_total: u64 = entries.iter().map(|entry| entry.size as u64).sum();
        let free_total: u64 = self.free.iter().map(|region| region.size as u64).sum();
        self.io
            .set_len(self.section_start() + allocated_total + free_total)?;

        let section_start = self.section_start();
        let mut cursor = 0u64;
        for (index, payload) in payloads.iter().enumerate() {
            self.io.seek(SeekFrom::Start(section_start + cursor))?;
            self.io.write_all(payload)?;
            self.allocated[index].offset = cursor as i32;
            self.allocated[index].size = payload.len() as i32;
            cursor += payload.len() as u64;
        }

        self.free = vec![XdbfFreeEntry {
            offset: allocated_total as i32,
            size: free_total as u32,
        }];
        self.save()
    }

    /// Check the structural invariants: allocated keys are unique, the
    /// regions of both tables tile the data area without gaps or
    /// overlap, and the stream length matches the accounting. Returns
    /// a description of every violation found.
    pub fn verify(&mut self) -> Result<Vec<String>, XenonError> {
        let mut problems = Vec::new();

        let mut keys: Vec<(i16, i64)> = self
            .allocated
            .iter()
            .map(|entry| (entry.namespace, entry.id))
            .collect();
        keys.sort();
        for pair in keys.windows(2) {
            if pair[0] == pair[1] {
                problems.push(format!(
                    "duplicate section key {}/{:#X}",
                    pair[0].0, pair[0].1
                ));
            }
        }

        let mut regions: Vec<(i64, i64, &'static str)> = self
            .allocated
            .iter()
            .map(|entry| (entry.offset as i64, entry.size as i64, "allocated"))
            .chain(
                self.free
                    .iter()
                    .map(|region| (region.offset as i64, region.size as i64, "free")),
            )
            .collect();
        regions.sort();

        let mut cursor = 0i64;
        for (offset, size, kind) in &regions {
            if *offset != cursor {
                problems.push(format!(
                    "{} region at {:#X} leaves a gap or overlap at {:#X}",
                    kind, offset, cursor
                ));
            }
            cursor = offset + size;
        }

        let expected_len = self.section_start() + cursor.max(0) as u64;
        let actual_len = self.io.len()?;
        if actual_len != expected_len {
            problems.push(format!(
                "stream is {} bytes, accounting says {}",
                actual_len, expected_len
            ));
        }
        Ok(problems)
    }

    /// Zero the bytes of every free region.
    pub fn clear_all_free_data(&mut self) -> Result<(), XenonError> {
        let regions = self.free.clone();
        for region in &regions {
            self.wipe(region.offset, region.size)?;
        }
        Ok(())
    }

    fn read_at(&mut self, offset: i32, size: u32) -> Result<Vec<u8>, XenonError> {
        self.io
            .seek(SeekFrom::Start(self.section_start() + offset as u64))?;
        let mut data = vec![0u8; size as usize];
        self.io.read_exact(&mut data)?;
        Ok(data)
    }

    fn wipe(&mut self, offset: i32, size: u32) -> Result<(), XenonError> {
        self.io
            .seek(SeekFrom::Start(self.section_start() + offset as u64))?;
        let zeros = vec![0u8; (size as usize).min(64 * 1024)];
        let mut remaining = size as usize;
        while remaining > 0 {
            let chunk = remaining.min(zeros.len());
            self.io.write_all(&zeros[..chunk])?;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Allocated sections order by (namespace, id); free regions by
    /// offset.
    fn sort_tables(&mut self) {
        self.allocated
            .sort_by(|a, b| a.namespace.cmp(&b.namespace).then(a.id.cmp(&b.id)));
        self.free.sort_by_key(|region| region.offset);
    }
}

fn free_table_offset(entry_max: u32) -> u64 {
    HEADER_SIZE + entry_max as u64 * ENTRY_RECORD_SIZE
}

#[cfg(test)]
mod tests {
    use super::super::sections::XdbfNamespace;
    use super::*;
    use std::io::Cursor;
    use xenon_core::MemoryIo;

    const NS: i16 = XdbfNamespace::Setting as i16;

    fn fresh() -> XdbfFile<MemoryIo> {
        XdbfFile::create(Cursor::new(Vec::new())).unwrap()
    }

    #[test]
    fn create_produces_an_openable_file() {
        let file = fresh();
        let io = file.into_inner();
        let reopened = XdbfFile::open(io).unwrap();
        assert_eq!(reopened.entries().len(), 0);
        assert_eq!(reopened.free_sections().len(), 0);
        assert_eq!(reopened.entry_max(), DEFAULT_ENTRY_MAX);
    }

    #[test]
    fn open_rejects_wrong_magic() {
        let io: MemoryIo = Cursor::new(vec![0u8; 0x100]);
        assert!(matches!(
            XdbfFile::open(io),
            Err(XenonError::InvalidXdbf(_))
        ));
    }

    #[test]
    fn best_fit_prefers_exact_match() {
        let mut file = fresh();
        file.allocate_section(100, NS, 1).unwrap();
        file.allocate_section(200, NS, 2).unwrap();
        file.allocate_section(50, NS, 3).unwrap();

        // Free the middle and a bigger one at the tail; an exact 50
        // request must take the 50-byte hole, not split the 200.
        file.free_section(NS, 2).unwrap();
        file.free_section(NS, 3).unwrap();
        let entry = file.allocate_section(50, NS, 4).unwrap();
        assert_eq!(entry.offset, 300);
        assert_eq!(file.free_sections(), &[XdbfFreeEntry { offset: 100, size: 200 }]);
    }

    #[test]
    fn split_leaves_the_remainder_free() {
        let mut file = fresh();
        file.allocate_section(100, NS, 1).unwrap();
        file.allocate_section(200, NS, 2).unwrap();
        file.free_section(NS, 1).unwrap();

        let entry = file.allocate_section(60, NS, 3).unwrap();
        assert_eq!(entry.offset, 0);
        assert_eq!(file.free_sections(), &[XdbfFreeEntry { offset: 60, size: 40 }]);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut file = fresh();
        file.allocate_section(10, NS, 1).unwrap();
        assert!(matches!(
            file.allocate_section(10, NS, 1),
            Err(XenonError::AlreadyExists(_))
        ));
    }

    #[test]
    fn freeing_a_missing_section_fails() {
        let mut file = fresh();
        assert!(matches!(
            file.free_section(NS, 99),
            Err(XenonError::NotFound(_))
        ));
    }

    #[test]
    fn free_wipes_the_data_area(){
        let mut file = fresh();
        file.update_section(NS, 1, &[0xAB; 64]).unwrap();
        let start = file.section_start();
        file.free_section(NS, 1).unwrap();

        let mut io = file.into_inner();
        let raw = io.get_ref();
        assert!(raw[start as usize..start as usize + 64]
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn update_grows_and_relocates() {
        let mut file = fresh();
        file.update_section(NS, 1, b"little").unwrap();
        file.update_section(NS, 2, &[0x22; 40]).unwrap();
        file.update_section(NS, 1, &[0x11; 500]).unwrap();

        assert_eq!(file.read_section(NS, 1).unwrap(), vec![0x11; 500]);
        assert_eq!(file.read_section(NS, 2).unwrap(), vec![0x22; 40]);
    }

    #[test]
    fn rebuild_compacts_to_one_tail_region() {
        let mut file = fresh();
        for id in 0..8 {
            file.update_section(NS, id, &[id as u8 + 1; 100]).unwrap();
        }
        for id in [1, 3, 5] {
            file.free_section(NS, id).unwrap();
        }
        file.rebuild().unwrap();

        assert_eq!(file.free_sections().len(), 1);
        assert_eq!(file.free_sections()[0].size, 300);
        // Allocations are contiguous from offset 0.
        let mut expected = 0;
        for entry in file.entries() {
            assert_eq!(entry.offset, expected);
            expected += entry.size;
        }
        assert_eq!(file.free_sections()[0].offset, expected);

        // Payloads survived the move.
        for id in [0i64, 2, 4, 6, 7] {
            assert_eq!(
                file.read_section(NS, id).unwrap(),
                vec![id as u8 + 1; 100]
            );
        }
    }

    #[test]
    fn table_bytes_match_the_disk_format() {
        let mut file =
            XdbfFile::create_with_limits(Cursor::new(Vec::new()), 0x10, 0x08).unwrap();
        file.update_section(NS, 0x1122334455i64, &[0xDD; 5]).unwrap();

        let io = file.into_inner();
        let raw = io.get_ref();
        assert_eq!(&raw[0..4], b"XDBF");
        assert_eq!(&raw[4..8], &XDBF_VERSION.to_be_bytes());
        assert_eq!(&raw[8..12], &0x10u32.to_be_bytes()); // entry max
        assert_eq!(&raw[12..16], &1u32.to_be_bytes()); // entry current
        assert_eq!(&raw[16..20], &0x08u32.to_be_bytes()); // free max
        assert_eq!(&raw[20..24], &0u32.to_be_bytes()); // free current

        // First entry record at 0x18: namespace, id, offset, size.
        assert_eq!(&raw[0x18..0x1A], &NS.to_be_bytes());
        assert_eq!(&raw[0x1A..0x22], &0x1122334455i64.to_be_bytes());
        assert_eq!(&raw[0x22..0x26], &0u32.to_be_bytes());
        assert_eq!(&raw[0x26..0x2A], &5u32.to_be_bytes());

        // Data area: (freeMax + 3) * 8 + entryMax * 0x12.
        let section_start: usize = (0x08 + 3) * 8 + 0x10 * 0x12;
        assert_eq!(&raw[section_start..section_start + 5], &[0xDD; 5]);
    }

    #[test]
    fn verify_passes_after_churn_and_rebuild() {
        let mut file = fresh();
        for id in 0..10 {
            file.update_section(NS, id, &[0x33; 90]).unwrap();
        }
        file.free_section(NS, 4).unwrap();
        file.update_section(NS, 11, &[0x44; 25]).unwrap();
        assert!(file.verify().unwrap().is_empty());

        file.rebuild().unwrap();
        assert!(file.verify().unwrap().is_empty());
    }

    #[test]
    fn data_area_accounting_stays_consistent() {
        let mut file = fresh();
        for id in 0..6 {
            file.update_section(NS, id, &[0x5A; 77]).unwrap();
        }
        file.free_section(NS, 2).unwrap();
        file.update_section(NS, 9, &[0x9A; 30]).unwrap();

        let allocated: u64 = file.entries().iter().map(|e| e.size as u64).sum();
        let free: u64 = file.free_sections().iter().map(|f| f.size as u64).sum();
        let section_start = file.section_start();
        let mut io = file.into_inner();
        assert_eq!(io.len().unwrap(), section_start + allocated + free);
    }
}
