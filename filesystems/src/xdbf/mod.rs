// XDBF container files
// Fixed-file block allocator used by Xbox 360 dashboard data (gamer
// profiles, title settings): an entry table of allocated sections, a
// free-region table, and a data area the sections index into.

pub mod file;
pub mod sections;

pub use file::XdbfFile;
pub use sections::{XdbfEntry, XdbfFreeEntry, XdbfNamespace};
