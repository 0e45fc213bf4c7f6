//! Parsers for the text output of the mapping tools.
//!
//! `kpartx` and `losetup -j` have no machine-readable mode, so their output
//! is parsed here and nowhere else.

use std::path::PathBuf;

/// Directory where device-mapper exposes partition mappings.
pub const DEVICE_MAPPER_DIR: &str = "/dev/mapper";

/// Marker the tools append to stale entries whose backing file is gone.
const DELETED_MARKER: &str = "(deleted)";

/// One partition mapping reported by `kpartx -av`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMapping {
    /// Mapping name, e.g. `loop0p1`
    pub name: String,
    /// Device node, e.g. `/dev/mapper/loop0p1`
    pub device: PathBuf,
}

/// Parse `kpartx -a -v` output into partition mappings.
///
/// Lines look like `add map loop0p1 (253:0): 0 204800 linear 7:0 2048`.
/// Order is preserved and anything marked deleted is skipped, so the first
/// element is the primary partition.
pub fn parse_kpartx_add(output: &str) -> Vec<PartitionMapping> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.contains("deleted"))
        .filter_map(|line| line.strip_prefix("add map "))
        .filter_map(|rest| rest.split_whitespace().next())
        .map(|name| PartitionMapping {
            name: name.to_string(),
            device: PathBuf::from(DEVICE_MAPPER_DIR).join(name),
        })
        .collect()
}

/// A loop device attached to an image, as reported by `losetup -j <image>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopAssociation {
    /// Loop device, e.g. `/dev/loop0`
    pub device: PathBuf,
    /// Backing file path as printed by losetup
    pub backing_file: String,
    /// The backing file was deleted while the loop device stayed attached
    pub deleted: bool,
}

/// Parse `losetup -j <image>` output.
///
/// Lines look like `/dev/loop0: [2049]:1835122 (/img/web2.img)`, with
/// ` (deleted)` inside the parentheses for stale devices.
pub fn parse_losetup_associations(output: &str) -> Vec<LoopAssociation> {
    output
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let (device, rest) = line.split_once(':')?;
            if !device.starts_with("/dev/") {
                return None;
            }
            let open = rest.find('(')?;
            let close = rest.rfind(')')?;
            if close <= open {
                return None;
            }
            let inner = rest[open + 1..close].trim();
            let (backing_file, deleted) = match inner.strip_suffix(DELETED_MARKER) {
                Some(stripped) => (stripped.trim_end().to_string(), true),
                None => (inner.to_string(), false),
            };
            Some(LoopAssociation {
                device: PathBuf::from(device),
                backing_file,
                deleted,
            })
        })
        .collect()
}

/// Loop devices still live for an image, ignoring stale entries.
pub fn live_associations(output: &str) -> Vec<LoopAssociation> {
    parse_losetup_associations(output)
        .into_iter()
        .filter(|a| !a.deleted)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kpartx_preserves_order() {
        let output = "add map loop0p1 (253:0): 0 204800 linear 7:0 2048\n\
                      add map loop0p2 (253:1): 0 1843200 linear 7:0 206848\n";
        let maps = parse_kpartx_add(output);
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].name, "loop0p1");
        assert_eq!(maps[0].device, PathBuf::from("/dev/mapper/loop0p1"));
        assert_eq!(maps[1].name, "loop0p2");
    }

    #[test]
    fn test_kpartx_skips_deleted_entries() {
        let output = "loop deleted : /dev/loop0\n\
                      add map loop7p1 (253:4) deleted\n\
                      add map loop1p1 (253:5): 0 204800 linear 7:1 2048\n\
                      add map loop1p2 (253:6): 0 409600 linear 7:1 206848\n";
        let maps = parse_kpartx_add(output);
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].name, "loop1p1");
    }

    #[test]
    fn test_kpartx_ignores_noise() {
        assert!(parse_kpartx_add("").is_empty());
        assert!(parse_kpartx_add("read error, sector 0\n").is_empty());
    }

    #[test]
    fn test_losetup_associations() {
        let output = "/dev/loop0: [2049]:1835122 (/var/lib/libvirt/images/web2.img)\n\
                      /dev/loop4: [2049]:1835122 (/var/lib/libvirt/images/web2.img (deleted))\n";
        let all = parse_losetup_associations(output);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].device, PathBuf::from("/dev/loop0"));
        assert_eq!(all[0].backing_file, "/var/lib/libvirt/images/web2.img");
        assert!(!all[0].deleted);
        assert!(all[1].deleted);
        assert_eq!(all[1].backing_file, "/var/lib/libvirt/images/web2.img");

        let live = live_associations(output);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].device, PathBuf::from("/dev/loop0"));
    }

    #[test]
    fn test_losetup_empty_output() {
        assert!(live_associations("").is_empty());
        assert!(live_associations("\n").is_empty());
    }
}
