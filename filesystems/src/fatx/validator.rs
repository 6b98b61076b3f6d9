// FATX volume consistency checks.
// Walks the directory tree and the chain map together and reports
// anything a healthy volume would never show: cross-linked chains,
// orphaned clusters, size/chain mismatches, malformed names.

use std::collections::HashMap;

use log::{debug, warn};

use xenon_core::{DeviceIo, XenonError};

use super::constants::cluster_values::*;
use super::dirent::SlotState;
use super::names::validate_name;
use super::partition::FatxPartition;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warning,
    Fail,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub check: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

/// Result of a full volume walk.
#[derive(Debug, Clone)]
pub struct VolumeReport {
    pub findings: Vec<Finding>,
    pub files: u32,
    pub directories: u32,
    pub deleted_entries: u32,
    pub used_clusters: u32,
    pub free_clusters: u32,
    pub orphaned_clusters: Vec<u32>,
}

impl VolumeReport {
    pub fn is_healthy(&self) -> bool {
        self.findings
            .iter()
            .all(|finding| finding.status != CheckStatus::Fail)
    }

    fn push(&mut self, check: &'static str, status: CheckStatus, detail: String) {
        if status != CheckStatus::Pass {
            warn!("volume check '{}': {}", check, detail);
        }
        self.findings.push(Finding {
            check,
            status,
            detail,
        });
    }
}

/// Walk every reachable dirent and cross-check the chain map.
pub fn validate_volume(
    partition: &mut FatxPartition,
    io: &mut dyn DeviceIo,
) -> Result<VolumeReport, XenonError> {
    let mut report = VolumeReport {
        findings: Vec::new(),
        files: 0,
        directories: 0,
        deleted_entries: 0,
        used_clusters: 0,
        free_clusters: partition.free_cluster_count(),
        orphaned_clusters: Vec::new(),
    };

    check_header(partition, &mut report);

    // Every cluster a chain claims, keyed to the path that claimed it.
    let mut claims: HashMap<u32, String> = HashMap::new();

    // The root directory chain belongs to no dirent; claim it first.
    claim_chain(
        partition,
        partition.root_cluster,
        None,
        "\\",
        &mut claims,
        &mut report,
    );

    // Iterative tree walk: (directory cluster, path prefix).
    let mut pending = vec![(partition.root_cluster, String::new())];
    while let Some((dir_cluster, prefix)) = pending.pop() {
        let entries = match partition.read_directory(io, dir_cluster) {
            Ok(entries) => entries,
            Err(err) => {
                report.push(
                    "directory-walk",
                    CheckStatus::Fail,
                    format!("directory at cluster {} is unreadable: {}", dir_cluster, err),
                );
                continue;
            }
        };

        for entry in entries {
            if entry.state() == SlotState::Deleted {
                report.deleted_entries += 1;
                continue;
            }
            let path = format!("{}\\{}", prefix, entry.name());

            if validate_name(&entry.name()).is_err() {
                report.push(
                    "entry-name",
                    CheckStatus::Fail,
                    format!("'{}' has an invalid stored name", path),
                );
            }

            if entry.is_directory() {
                report.directories += 1;
                if entry.first_cluster == CLUSTER_LAST || entry.first_cluster == 0 {
                    report.push(
                        "directory-chain",
                        CheckStatus::Fail,
                        format!("directory '{}' has no data cluster", path),
                    );
                    continue;
                }
                claim_chain(
                    partition,
                    entry.first_cluster,
                    None,
                    &path,
                    &mut claims,
                    &mut report,
                );
                pending.push((entry.first_cluster, path));
            } else {
                report.files += 1;
                let expected =
                    (entry.size as u64).div_ceil(partition.cluster_size as u64) as u32;
                if entry.first_cluster == CLUSTER_LAST {
                    if entry.size != 0 {
                        report.push(
                            "file-chain",
                            CheckStatus::Fail,
                            format!(
                                "'{}' is {} bytes but has no data chain",
                                path, entry.size
                            ),
                        );
                    }
                } else {
                    claim_chain(
                        partition,
                        entry.first_cluster,
                        Some(expected),
                        &path,
                        &mut claims,
                        &mut report,
                    );
                }
            }
        }
    }

    report.used_clusters = claims.len() as u32;

    // Anything the map marks taken but no chain reached is orphaned.
    for cluster in 1..partition.cluster_count {
        let entry = partition.next_cluster(cluster)?;
        if entry != CLUSTER_FREE && !claims.contains_key(&cluster) {
            report.orphaned_clusters.push(cluster);
        }
    }
    if report.orphaned_clusters.is_empty() {
        report.push(
            "orphans",
            CheckStatus::Pass,
            "every allocated cluster is reachable".into(),
        );
    } else {
        report.push(
            "orphans",
            CheckStatus::Warning,
            format!(
                "{} allocated clusters unreachable from any entry",
                report.orphaned_clusters.len()
            ),
        );
    }

    let accounted = report.used_clusters + report.free_clusters
        + report.orphaned_clusters.len() as u32;
    // Cluster 0 is the media marker and is never accounted.
    if accounted == partition.cluster_count - 1 {
        report.push(
            "accounting",
            CheckStatus::Pass,
            format!(
                "{} used + {} free + {} orphaned covers the volume",
                report.used_clusters,
                report.free_clusters,
                report.orphaned_clusters.len()
            ),
        );
    } else {
        report.push(
            "accounting",
            CheckStatus::Fail,
            format!(
                "{} clusters accounted, volume has {}",
                accounted,
                partition.cluster_count - 1
            ),
        );
    }

    debug!(
        "validated '{}': {} files, {} directories, {} findings",
        partition.name,
        report.files,
        report.directories,
        report.findings.len()
    );
    Ok(report)
}

fn check_header(partition: &FatxPartition, report: &mut VolumeReport) {
    if partition.root_cluster == 0 || partition.root_cluster >= partition.cluster_count {
        report.push(
            "header",
            CheckStatus::Fail,
            format!("root cluster {} is out of range", partition.root_cluster),
        );
    } else {
        report.push(
            "header",
            CheckStatus::Pass,
            format!("root directory at cluster {}", partition.root_cluster),
        );
    }
}

/// Follow one chain, claiming each cluster. Reports cross-links (a
/// cluster two chains claim), walks into free clusters, cycles, and,
/// when `expected_len` is given, length mismatches against the size
/// the dirent declares.
fn claim_chain(
    partition: &FatxPartition,
    start: u32,
    expected_len: Option<u32>,
    owner: &str,
    claims: &mut HashMap<u32, String>,
    report: &mut VolumeReport,
) {
    let mut current = start;
    let mut length = 0u32;
    loop {
        if current == 0 || current >= partition.cluster_count {
            report.push(
                "chain-range",
                CheckStatus::Fail,
                format!("'{}' chains to out-of-range cluster {}", owner, current),
            );
            return;
        }
        if let Some(previous_owner) = claims.get(&current) {
            report.push(
                "cross-link",
                CheckStatus::Fail,
                format!(
                    "cluster {} claimed by both '{}' and '{}'",
                    current, previous_owner, owner
                ),
            );
            return;
        }
        claims.insert(current, owner.to_string());
        length += 1;
        if length > partition.cluster_count {
            report.push(
                "chain-cycle",
                CheckStatus::Fail,
                format!("'{}' has a cyclic chain", owner),
            );
            return;
        }

        let next = match partition.next_cluster(current) {
            Ok(next) => next,
            Err(_) => return,
        };
        if next == CLUSTER_LAST {
            break;
        }
        if next == CLUSTER_FREE {
            report.push(
                "chain-free",
                CheckStatus::Fail,
                format!("'{}' chains into free cluster after {}", owner, current),
            );
            return;
        }
        current = next;
    }

    if let Some(expected) = expected_len {
        if length != expected {
            report.push(
                "size-chain",
                CheckStatus::Fail,
                format!(
                    "'{}' declares {} clusters but its chain has {}",
                    owner, expected, length
                ),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::formatter;
    use super::super::partition::PartitionKind;
    use super::*;
    use std::io::Cursor;
    use xenon_core::MemoryIo;

    fn volume() -> (MemoryIo, FatxPartition) {
        let mut io: MemoryIo = Cursor::new(vec![0u8; 0x8_0000]);
        formatter::format_partition(&mut io, 0, 0x8_0000, 1).unwrap();
        let mut partition = FatxPartition::new("Data", 0, 0x8_0000, PartitionKind::Regular);
        partition.read(&mut io).unwrap();
        (io, partition)
    }

    #[test]
    fn fresh_volume_is_healthy() {
        let (mut io, mut partition) = volume();
        let report = validate_volume(&mut partition, &mut io).unwrap();
        assert!(report.is_healthy(), "{:?}", report.findings);
        assert_eq!(report.files, 0);
        assert_eq!(report.used_clusters, 1); // root directory
        assert!(report.orphaned_clusters.is_empty());
    }

    #[test]
    fn orphaned_clusters_are_reported() {
        let (mut io, mut partition) = volume();
        partition.allocate_cluster(&mut io, true).unwrap();
        let report = validate_volume(&mut partition, &mut io).unwrap();
        assert_eq!(report.orphaned_clusters.len(), 1);
        // An orphan is a warning, not a failure.
        assert!(report.is_healthy());
    }

    #[test]
    fn cross_linked_chains_fail() {
        let (mut io, mut partition) = volume();
        let root = partition.root_cluster;

        let mut a = partition.create_dirent(&mut io, root, "a.bin", false).unwrap();
        let mut b = partition.create_dirent(&mut io, root, "b.bin", false).unwrap();
        partition
            .write_file_data(&mut io, &mut a, &[1u8; 600])
            .unwrap();
        partition
            .write_file_data(&mut io, &mut b, &[2u8; 600])
            .unwrap();

        // Point b's chain into a's second cluster.
        let stolen = partition.next_cluster(a.first_cluster).unwrap();
        partition.set_next_cluster(b.first_cluster, stolen).unwrap();
        partition.write_chain_map(&mut io).unwrap();

        let report = validate_volume(&mut partition, &mut io).unwrap();
        assert!(!report.is_healthy());
        assert!(report
            .findings
            .iter()
            .any(|finding| finding.check == "cross-link"));
    }

    #[test]
    fn size_chain_mismatch_fails() {
        let (mut io, mut partition) = volume();
        let root = partition.root_cluster;
        let mut file = partition.create_dirent(&mut io, root, "short", false).unwrap();
        partition
            .write_file_data(&mut io, &mut file, &[3u8; 1200])
            .unwrap();

        // Lie about the size without touching the chain.
        file.size = 100;
        partition.update_dirent(&mut io, &file).unwrap();

        let report = validate_volume(&mut partition, &mut io).unwrap();
        assert!(report
            .findings
            .iter()
            .any(|finding| finding.check == "size-chain"));
    }

    #[test]
    fn deleted_entries_are_counted_not_walked() {
        let (mut io, mut partition) = volume();
        let root = partition.root_cluster;
        let mut file = partition.create_dirent(&mut io, root, "gone", false).unwrap();
        partition
            .write_file_data(&mut io, &mut file, &[4u8; 100])
            .unwrap();
        partition.delete_dirent(&mut io, &mut file).unwrap();

        let report = validate_volume(&mut partition, &mut io).unwrap();
        assert!(report.is_healthy(), "{:?}", report.findings);
        assert_eq!(report.deleted_entries, 1);
        assert_eq!(report.files, 0);
    }
}
