// FATX volume engine
// Layout, allocation and dirent management for Xbox 360 FATX partitions.

pub mod constants;
pub mod device;
pub mod directory;
pub mod dirent;
pub mod formatter;
pub mod names;
pub mod partition;
pub mod paths;
pub mod stream;
pub mod timestamps;
pub mod validator;

pub use device::{DeviceInfo, DeviceKind, EntryInfo, FatxDevice, PartitionInfo};
pub use dirent::{Dirent, SlotState};
pub use partition::{FatxPartition, PartitionKind};
pub use stream::{FatxFileStream, FileAccess, FileMode};
pub use validator::{validate_volume, CheckStatus, Finding, VolumeReport};
