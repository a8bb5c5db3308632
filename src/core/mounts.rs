//! Mount table parsing and MountSet selection.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::hardware::{BlockDevice, MountEntry};

/// Filesystem kinds that are never backed by the captured device.
const PSEUDO_FILESYSTEMS: &[&str] = &[
    "autofs",
    "binfmt_misc",
    "bpf",
    "cgroup",
    "cgroup2",
    "configfs",
    "debugfs",
    "devpts",
    "devtmpfs",
    "efivarfs",
    "fusectl",
    "hugetlbfs",
    "mqueue",
    "nsfs",
    "overlay",
    "proc",
    "pstore",
    "ramfs",
    "securityfs",
    "squashfs",
    "sysfs",
    "tmpfs",
    "tracefs",
];

pub fn is_pseudo_filesystem(fstype: &str) -> bool {
    PSEUDO_FILESYSTEMS.contains(&fstype) || fstype.starts_with("fuse.")
}

/// Parse `/proc/self/mounts` (fstab format). Malformed lines are skipped.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: unescape_octal(source),
                target: PathBuf::from(unescape_octal(target)),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// The kernel escapes space, tab, newline and backslash as `\NNN`.
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mounts backed by `device` or any of its `partitions`, excluding pseudo
/// filesystems and every mount of the filesystem at `/` (bind mounts of the
/// root filesystem included). One entry per backing source; bind mounts of
/// an already listed filesystem are dropped.
pub fn mount_set(
    mounts: &[MountEntry],
    device: &BlockDevice,
    partitions: &[BlockDevice],
) -> Vec<MountEntry> {
    let backing: HashSet<PathBuf> = std::iter::once(device)
        .chain(partitions.iter())
        .map(|d| canonical(&d.path))
        .collect();

    let root_sources: HashSet<PathBuf> = mounts
        .iter()
        .filter(|m| m.target == Path::new("/"))
        .map(|m| canonical(Path::new(&m.source)))
        .collect();

    let mut seen = HashSet::new();
    mounts
        .iter()
        .filter(|m| m.target != Path::new("/"))
        .filter(|m| !is_pseudo_filesystem(&m.fstype))
        .filter(|m| {
            let source = canonical(Path::new(&m.source));
            backing.contains(&source) && !root_sources.contains(&source)
        })
        .filter(|m| seen.insert(canonical(Path::new(&m.source))))
        .cloned()
        .collect()
}

/// The mount holding `path`: the entry with the longest target that is a
/// prefix of it. Later entries shadow earlier ones at the same target.
pub fn mount_containing<'a>(mounts: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    let path = canonical(path);
    mounts
        .iter()
        .filter(|m| path.starts_with(canonical(&m.target)))
        .max_by_key(|m| canonical(&m.target).components().count())
}

/// Split `set` into the mounts of filesystems other than `held`'s and the
/// mounts of `held`'s filesystem.
pub fn exclude_filesystem(
    set: Vec<MountEntry>,
    held: &MountEntry,
) -> (Vec<MountEntry>, Vec<MountEntry>) {
    let held_source = canonical(Path::new(&held.source));
    set.into_iter()
        .partition(|m| canonical(Path::new(&m.source)) != held_source)
}

/// Resolve `/dev/disk/by-*` and `/dev/mapper` symlinks where possible.
fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
