// Directory entries.
// A dirent is a 64-byte record inside the cluster chain of its parent
// directory: name length, attribute bits, 42 bytes of ASCII name, the
// first data cluster, the byte size and three packed timestamps.

use byteorder::{BigEndian, ByteOrder};

use super::constants::*;

/// What a 64-byte directory slot holds, judged by its name-length byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// 0x00 or 0xFF: never used; terminates the directory listing.
    Empty,
    /// 0xE5: soft-deleted, name bytes preserved for recovery.
    Deleted,
    /// 1..=42: a live entry.
    Valid,
    /// Anything else: corrupt; also terminates the listing.
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Dirent {
    pub name_len: u8,
    pub attributes: u8,
    pub name: [u8; DIRENT_NAME_SIZE],
    pub first_cluster: u32,
    pub size: u32,
    pub created: u32,
    pub modified: u32,
    pub accessed: u32,

    // In-memory bookkeeping, never written to disk.
    /// Cluster this entry physically resides in.
    pub parent_cluster: u32,
    /// Slot index inside that cluster.
    pub slot: u32,
}

impl Dirent {
    pub fn decode(raw: &[u8]) -> Self {
        debug_assert!(raw.len() >= DIRENT_SIZE);
        let mut name = [0u8; DIRENT_NAME_SIZE];
        name.copy_from_slice(&raw[2..2 + DIRENT_NAME_SIZE]);
        Self {
            name_len: raw[0],
            attributes: raw[1],
            name,
            first_cluster: BigEndian::read_u32(&raw[44..48]),
            size: BigEndian::read_u32(&raw[48..52]),
            created: BigEndian::read_u32(&raw[52..56]),
            modified: BigEndian::read_u32(&raw[56..60]),
            accessed: BigEndian::read_u32(&raw[60..64]),
            parent_cluster: 0,
            slot: 0,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= DIRENT_SIZE);
        out[0] = self.name_len;
        out[1] = self.attributes;
        out[2..2 + DIRENT_NAME_SIZE].copy_from_slice(&self.name);
        BigEndian::write_u32(&mut out[44..48], self.first_cluster);
        BigEndian::write_u32(&mut out[48..52], self.size);
        BigEndian::write_u32(&mut out[52..56], self.created);
        BigEndian::write_u32(&mut out[56..60], self.modified);
        BigEndian::write_u32(&mut out[60..64], self.accessed);
    }

    pub fn state(&self) -> SlotState {
        slot_state(self.name_len)
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn is_file(&self) -> bool {
        !self.is_directory()
    }

    /// The entry name. For soft-deleted entries the stored length byte
    /// is the 0xE5 marker, so the length is re-derived from the
    /// preserved name bytes.
    pub fn name(&self) -> String {
        let len = match self.state() {
            SlotState::Valid => self.name_len as usize,
            SlotState::Deleted => self.recovered_name_len(),
            SlotState::Empty | SlotState::Invalid => 0,
        };
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    /// Length of the preserved name of a soft-deleted entry: everything
    /// up to the first pad byte.
    pub fn recovered_name_len(&self) -> usize {
        self.name
            .iter()
            .position(|&b| b == NAME_EMPTY || b == NAME_EMPTY_FF)
            .unwrap_or(DIRENT_NAME_SIZE)
    }

    /// Store `name` (validated by the caller) and its length byte.
    pub fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        self.name = [DIRENT_NAME_PAD; DIRENT_NAME_SIZE];
        self.name[..bytes.len()].copy_from_slice(bytes);
        self.name_len = bytes.len() as u8;
    }
}

/// Classify a slot by its first byte without decoding the whole record.
pub fn slot_state(name_len: u8) -> SlotState {
    match name_len {
        NAME_EMPTY | NAME_EMPTY_FF => SlotState::Empty,
        NAME_DELETED => SlotState::Deleted,
        1..=42 => SlotState::Valid,
        _ => SlotState::Invalid,
    }
}
