// FATX volume formatter.
// Lays down a fresh volume in a byte region: header, zeroed chain map
// with the reserved media marker, and an empty root directory at
// cluster 1.

use std::io::SeekFrom;

use byteorder::{BigEndian, WriteBytesExt};
use chrono::Utc;
use log::info;

use xenon_core::{DeviceIo, XenonError};

use super::constants::cluster_values::*;
use super::constants::*;
use super::partition::round_up;

/// Cluster sizes the retail software produces.
const VALID_SECTORS_PER_CLUSTER: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];

const ROOT_CLUSTER: u32 = 1;

/// Format the byte region `[offset, offset + size)` as a FATX volume.
pub fn format_partition(
    io: &mut dyn DeviceIo,
    offset: u64,
    size: u64,
    sectors_per_cluster: u32,
) -> Result<(), XenonError> {
    if !VALID_SECTORS_PER_CLUSTER.contains(&sectors_per_cluster) {
        return Err(XenonError::Other(format!(
            "invalid sectors-per-cluster: {}",
            sectors_per_cluster
        )));
    }
    let cluster_size = (sectors_per_cluster * SECTOR_SIZE) as u64;
    let cluster_count = (size / cluster_size) as u32;
    if cluster_count < 2 {
        return Err(XenonError::NoSpace(format!(
            "{} bytes is too small for {}-byte clusters",
            size, cluster_size
        )));
    }
    let entry_size: u64 = if cluster_count < CHAIN_MAP_16_LIMIT { 2 } else { 4 };
    let chain_map_size = round_up(cluster_count as u64 * entry_size, CHAIN_MAP_ALIGN);

    // Header: magic, id, sectors per cluster, root cluster. The id just
    // needs to be distinctive; the current time works.
    io.seek(SeekFrom::Start(offset))?;
    io.write_u32::<BigEndian>(FATX_MAGIC)?;
    io.write_u32::<BigEndian>(Utc::now().timestamp() as u32)?;
    io.write_u32::<BigEndian>(sectors_per_cluster)?;
    io.write_u32::<BigEndian>(ROOT_CLUSTER)?;

    // Reserved area up to the chain map.
    write_zeros(io, CHAIN_MAP_OFFSET - 0x10)?;

    // Chain map: entry 0 carries the media marker, the root cluster is
    // a one-cluster chain, everything else is free.
    io.seek(SeekFrom::Start(offset + CHAIN_MAP_OFFSET))?;
    write_zeros(io, chain_map_size)?;
    io.seek(SeekFrom::Start(offset + CHAIN_MAP_OFFSET))?;
    if entry_size == 2 {
        io.write_u16::<BigEndian>(MEDIA_MARKER_16 as u16)?;
        io.write_u16::<BigEndian>(CLUSTER_LAST as u16)?;
    } else {
        io.write_u32::<BigEndian>(MEDIA_MARKER_32)?;
        io.write_u32::<BigEndian>(CLUSTER_LAST)?;
    }

    // Empty root directory.
    io.seek(SeekFrom::Start(offset + CHAIN_MAP_OFFSET + chain_map_size))?;
    write_zeros(io, cluster_size)?;

    io.flush()?;
    info!(
        "formatted FATX volume at {:#X}: {} clusters of {:#X} bytes",
        offset, cluster_count, cluster_size
    );
    Ok(())
}

/// Format a whole stream with the memory-card layout: a cache volume at
/// offset 0 and a data volume covering the rest.
pub fn format_memory_card(
    io: &mut dyn DeviceIo,
    sectors_per_cluster: u32,
) -> Result<(), XenonError> {
    const DATA_OFFSET: u64 = 0x7F_F000;
    let total = io.len()?;
    if total <= DATA_OFFSET {
        return Err(XenonError::NoSpace(format!(
            "{} bytes cannot hold the memory-card layout",
            total
        )));
    }
    format_partition(io, 0, DATA_OFFSET, sectors_per_cluster)?;
    format_partition(io, DATA_OFFSET, total - DATA_OFFSET, sectors_per_cluster)
}

fn write_zeros(io: &mut dyn DeviceIo, count: u64) -> Result<(), XenonError> {
    let zeros = vec![0u8; (count as usize).min(1024 * 1024)];
    let mut remaining = count as usize;
    while remaining > 0 {
        let chunk = remaining.min(zeros.len());
        io.write_all(&zeros[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::partition::{FatxPartition, PartitionKind};
    use super::*;
    use std::io::Cursor;
    use xenon_core::MemoryIo;

    #[test]
    fn formatted_volume_mounts() {
        let mut io: MemoryIo = Cursor::new(vec![0u8; 0x8_0000]);
        format_partition(&mut io, 0, 0x8_0000, 2).unwrap();

        let mut partition = FatxPartition::new("Data", 0, 0x8_0000, PartitionKind::Regular);
        partition.read(&mut io).unwrap();
        assert!(partition.is_valid());
        assert_eq!(partition.cluster_size, 0x400);
        assert_eq!(partition.root_cluster, 1);
        // Root is allocated, everything else is free.
        assert_eq!(partition.next_cluster(1).unwrap(), CLUSTER_LAST);
        assert_eq!(
            partition.free_cluster_count(),
            partition.cluster_count - 2
        );
    }

    #[test]
    fn header_bytes_match_the_disk_format() {
        let mut io: MemoryIo = Cursor::new(vec![0u8; 0x8_0000]);
        format_partition(&mut io, 0, 0x8_0000, 2).unwrap();
        let raw = io.get_ref();

        // "XTAF" on disk reads back as the big-endian magic.
        assert_eq!(&raw[0..4], b"XTAF");
        assert_eq!(&raw[8..12], &2u32.to_be_bytes()); // sectors per cluster
        assert_eq!(&raw[12..16], &1u32.to_be_bytes()); // root cluster
        // 16-bit chain map: media marker then the root chain end.
        assert_eq!(&raw[0x1000..0x1002], &[0xFF, 0xF8]);
        assert_eq!(&raw[0x1002..0x1004], &[0xFF, 0xFF]);
        assert_eq!(&raw[0x1004..0x1006], &[0x00, 0x00]);
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut io: MemoryIo = Cursor::new(vec![0u8; 0x1000]);
        assert!(format_partition(&mut io, 0, 0x1000, 3).is_err());
        assert!(format_partition(&mut io, 0, 0x400, 64).is_err());
    }
}
