use crate::config::Config;
use crate::error::HandlerError;
use crate::progress::ProgressNotifier;
use crate::sysroot::{NEED_ROOT, Sysroot, device_name_translation, is_device_parameter};
use guestd_proto::{Mountable, Procedure};

/// Which optional arguments the caller actually supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptArgs(u64);

impl OptArgs {
    pub fn new(bitmask: u64) -> Self {
        Self(bitmask)
    }

    pub fn bitmask(&self) -> u64 {
        self.0
    }

    pub fn is_set(&self, bit: u64) -> bool {
        self.0 & bit != 0
    }

    /// `value` if the caller supplied it, whatever it is.
    pub fn get<T>(&self, bit: u64, value: T) -> Option<T> {
        self.is_set(bit).then_some(value)
    }
}

/// Everything a handler may consult about the request it is serving.
pub struct RequestContext<'a> {
    pub procedure: Procedure,
    pub serial: u32,
    pub optargs: OptArgs,
    /// Size hint the controller sent for uploads, zero if unknown.
    pub progress_hint: u64,
    pub sysroot: &'a Sysroot,
    pub config: &'a Config,
    pub progress: &'a ProgressNotifier,
}

impl RequestContext<'_> {
    pub fn name(&self) -> &'static str {
        self.procedure.name()
    }

    pub fn need_root(&self) -> Result<(), HandlerError> {
        if self.sysroot.is_root_mounted() {
            Ok(())
        } else {
            Err(HandlerError::msg(NEED_ROOT))
        }
    }

    /// Checks for a guest path argument: root mounted and absolute.
    pub fn guest_path(&self, path: &str) -> Result<(), HandlerError> {
        self.need_root()?;
        self.sysroot.sysroot_path(path).map(|_| ())
    }

    /// Resolve a device argument, translating `/dev/sdX` names if needed.
    pub fn resolve_device(&self, device: &str) -> Result<String, HandlerError> {
        let not_a_device = || {
            HandlerError::msg(format!("{}: {}: expecting a device name", self.name(), device))
        };
        if !device.starts_with("/dev/") {
            return Err(not_a_device());
        }
        let resolved = device_name_translation(device)
            .map_err(|e| HandlerError::os(format!("{}: {}", self.name(), device), e))?;
        if !is_device_parameter(&resolved) {
            return Err(not_a_device());
        }
        Ok(resolved)
    }

    /// Parse and resolve a mountable argument.
    pub fn resolve_mountable(&self, mountable: &str) -> Result<Mountable, HandlerError> {
        let parsed = Mountable::parse_with(mountable, is_device_node)
            .map_err(|e| HandlerError::msg(format!("{}: {}", self.name(), e)))?;
        match parsed {
            Mountable::Device(device) => Ok(Mountable::Device(self.resolve_device(&device)?)),
            Mountable::Path(path) => {
                self.need_root()?;
                Ok(Mountable::Path(path))
            }
            volume @ Mountable::BtrfsVolume { .. } => Ok(volume),
        }
    }
}

fn is_device_node(path: &str) -> bool {
    std::fs::metadata(path).is_ok_and(|m| !m.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestd_proto::optargs;

    #[test]
    fn test_explicit_default_is_distinguishable() {
        let none = OptArgs::new(0);
        let level = OptArgs::new(optargs::COMPRESS_OUT_LEVEL);

        assert_eq!(none.get(optargs::COMPRESS_OUT_LEVEL, 0), None);
        assert_eq!(level.get(optargs::COMPRESS_OUT_LEVEL, 0), Some(0));
    }

    #[test]
    fn test_every_subset_round_trips() {
        let bits = [
            optargs::MKFS_BLOCKSIZE,
            optargs::MKFS_FEATURES,
            optargs::MKFS_INODE,
            optargs::MKFS_SECTORSIZE,
            optargs::MKFS_LABEL,
        ];
        for subset in 0u64..(1 << bits.len()) {
            let mask = bits
                .iter()
                .enumerate()
                .filter(|(i, _)| subset & (1 << i) != 0)
                .fold(0, |acc, (_, bit)| acc | bit);
            let args = OptArgs::new(mask);
            for (i, bit) in bits.iter().enumerate() {
                assert_eq!(args.is_set(*bit), subset & (1 << i) != 0);
            }
            assert_eq!(args.bitmask() & !Procedure::Mkfs.optargs_mask(), 0);
        }
    }
}
