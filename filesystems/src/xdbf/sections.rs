// XDBF table records and namespaces.

use serde::{Deserialize, Serialize};

/// An allocated section: 18 bytes on disk, keyed by (namespace, id).
/// The offset is relative to the start of the data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdbfEntry {
    pub namespace: i16,
    pub id: i64,
    pub offset: i32,
    pub size: i32,
}

/// A free region: 8 bytes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XdbfFreeEntry {
    pub offset: i32,
    pub size: u32,
}

/// Well-known XDBF namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum XdbfNamespace {
    Achievement = 1,
    Image = 2,
    Setting = 3,
    Title = 4,
    String = 5,
    AvatarAward = 6,
}

impl XdbfNamespace {
    pub fn from_raw(raw: i16) -> Option<Self> {
        match raw {
            1 => Some(Self::Achievement),
            2 => Some(Self::Image),
            3 => Some(Self::Setting),
            4 => Some(Self::Title),
            5 => Some(Self::String),
            6 => Some(Self::AvatarAward),
            _ => None,
        }
    }
}

impl From<XdbfNamespace> for i16 {
    fn from(namespace: XdbfNamespace) -> i16 {
        namespace as i16
    }
}
