// Xbox 360 storage engines: FATX volumes and XDBF container files.

pub mod fatx;
pub mod xdbf;

pub use fatx::device::{DeviceInfo, DeviceKind, EntryInfo, FatxDevice, PartitionInfo};
pub use fatx::dirent::{Dirent, SlotState};
pub use fatx::partition::{FatxPartition, PartitionKind};
pub use fatx::stream::{FatxFileStream, FileAccess, FileMode};
pub use fatx::validator::{CheckStatus, VolumeReport};
pub use xdbf::{XdbfEntry, XdbfFile, XdbfFreeEntry, XdbfNamespace};
