use crate::error::MountError;
use crate::{MountSpec, UnmountFlags};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::path::{Path, PathBuf};

const PROC_MOUNTS: &str = "/proc/mounts";
const PROC_FILESYSTEMS: &str = "/proc/filesystems";

/// Split options into mount(2) flags and the filesystem-specific data string.
fn split_options(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for opt in options {
        match opt.as_str() {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags &= !MsFlags::MS_RDONLY,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "defaults" | "auto" => {}
            other => data.push(other),
        }
    }

    (flags, data.join(","))
}

/// Mount a filesystem based on the mount specification.
///
/// Without an explicit type every block-device filesystem the kernel knows
/// is tried in turn, the way mount(8) does it.
pub fn mount_fs(spec: &MountSpec, target: &Path) -> Result<(), MountError> {
    if spec.source.is_empty() {
        return Err(MountError::InvalidSpec("empty mount source".to_string()));
    }

    let (flags, data) = split_options(&spec.options);

    let candidates = match &spec.vfstype {
        Some(t) => vec![t.clone()],
        None if flags.contains(MsFlags::MS_BIND) => vec![String::new()],
        None => probe_filesystems()?,
    };

    let probing = spec.vfstype.is_none() && !flags.contains(MsFlags::MS_BIND);
    let mut errors = Vec::new();
    for fstype in &candidates {
        tracing::debug!(
            "Mounting {} at {:?} (type {:?}, flags {:?}, data {:?})",
            spec.source,
            target,
            fstype,
            flags,
            data
        );

        let fstype_arg = (!fstype.is_empty()).then_some(fstype.as_str());
        let data_arg = (!data.is_empty()).then_some(data.as_str());

        match mount(Some(spec.source.as_str()), target, fstype_arg, flags, data_arg) {
            Ok(()) => {
                tracing::info!("Mounted {} at {:?} ({})", spec.source, target, fstype);
                return Ok(());
            }
            Err(errno) => {
                tracing::debug!("Mounting {} as {:?} failed: {}", spec.source, fstype, errno);
                errors.push(errno);
            }
        }
    }

    Err(mount_failure(&spec.source, target, &errors, probing))
}

/// EINVAL and ENODEV only mean the superblock was not of the type tried.
fn is_type_mismatch(errno: Errno) -> bool {
    matches!(errno, Errno::EINVAL | Errno::ENODEV)
}

/// The error to report once every candidate type has failed: the first one
/// that is not a type mismatch, else the first one. A probe where every type
/// was a mismatch is an unknown filesystem.
fn mount_failure(source: &str, target: &Path, errors: &[Errno], probing: bool) -> MountError {
    let meaningful = errors.iter().copied().find(|e| !is_type_mismatch(*e));
    let errno = match (meaningful, errors.first()) {
        (Some(errno), _) => errno,
        (None, Some(_)) if probing => return MountError::UnknownFilesystem(source.to_string()),
        (None, Some(errno)) => *errno,
        (None, None) => return MountError::UnknownFilesystem(source.to_string()),
    };
    MountError::MountFailed {
        source_spec: source.to_string(),
        target: target.display().to_string(),
        errno,
    }
}

/// Unmount a filesystem at the given path.
pub fn unmount(target: &Path, flags: UnmountFlags) -> Result<(), MountError> {
    tracing::debug!("Unmounting {:?} ({:?})", target, flags);

    let mut mnt_flags = MntFlags::empty();
    if flags.force {
        mnt_flags |= MntFlags::MNT_FORCE;
    }
    if flags.lazy {
        mnt_flags |= MntFlags::MNT_DETACH;
    }

    umount2(target, mnt_flags).map_err(|errno| MountError::UnmountFailed {
        target: target.display().to_string(),
        errno,
    })?;

    tracing::info!("Unmounted {:?}", target);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
}

/// Undo the octal escaping the kernel applies to spaces and friends.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = i + 3 < bytes.len()
            && bytes[i + 1..i + 4]
                .iter()
                .all(|b| (b'0'..=b'7').contains(b));
        if bytes[i] == b'\\' && octal {
            let v = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
            out.push(v as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse the contents of `/proc/mounts`.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: unescape(fields.next()?),
                target: PathBuf::from(unescape(fields.next()?)),
                fstype: fields.next()?.to_string(),
                options: fields.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

pub fn list_mounts() -> Result<Vec<MountEntry>, MountError> {
    let content = std::fs::read_to_string(PROC_MOUNTS)?;
    Ok(parse_mounts(&content))
}

/// Mounts at or below `root`, deepest first so they can be unmounted in order.
pub fn mounts_under(entries: Vec<MountEntry>, root: &Path) -> Vec<MountEntry> {
    let mut under: Vec<MountEntry> = entries
        .into_iter()
        .filter(|e| e.target.starts_with(root))
        .collect();
    under.sort_by(|a, b| {
        b.target
            .components()
            .count()
            .cmp(&a.target.components().count())
            .then_with(|| b.target.cmp(&a.target))
    });
    under
}

/// Filesystem types usable on block devices, from `/proc/filesystems`.
pub fn probe_filesystems() -> Result<Vec<String>, MountError> {
    let content = std::fs::read_to_string(PROC_FILESYSTEMS)?;
    Ok(content
        .lines()
        .filter(|line| !line.starts_with("nodev"))
        .map(|line| line.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect())
}
