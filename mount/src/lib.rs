mod error;
mod vfs;

pub use error::MountError;
pub use vfs::{
    MountEntry, list_mounts, mount_fs, mounts_under, parse_mounts, probe_filesystems, unmount,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Filesystem type; probed from `/proc/filesystems` when absent.
    pub vfstype: Option<String>,
    pub source: String,
    pub options: Vec<String>,
}

impl MountSpec {
    pub fn new(vfstype: Option<&str>, source: &str, options: Vec<String>) -> Self {
        Self {
            vfstype: vfstype.filter(|t| !t.is_empty()).map(str::to_string),
            source: source.to_string(),
            options,
        }
    }

    /// Build a spec from a `mount -o` style comma separated option string.
    pub fn with_option_string(vfstype: Option<&str>, source: &str, options: &str) -> Self {
        let options = options
            .split(',')
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        Self::new(vfstype, source, options)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnmountFlags {
    pub force: bool,
    pub lazy: bool,
}
