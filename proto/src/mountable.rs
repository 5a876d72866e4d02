use std::fmt;

use crate::error::ProtoError;

pub const BTRFSVOL_PREFIX: &str = "btrfsvol:";

/// Something that can be mounted or operated on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mountable {
    Device(String),
    /// A path inside the mounted sysroot.
    Path(String),
    BtrfsVolume { device: String, volume: String },
}

impl Mountable {
    /// Parse a mountable string.
    ///
    /// `btrfsvol:` descriptors are ambiguous (`/dev/VG/LV/sub` could split
    /// anywhere), so the device is the shortest `/dev/...` prefix for which
    /// `is_device` holds.
    pub fn parse_with<F>(s: &str, mut is_device: F) -> Result<Self, ProtoError>
    where
        F: FnMut(&str) -> bool,
    {
        if let Some(desc) = s.strip_prefix(BTRFSVOL_PREFIX) {
            if !desc.starts_with("/dev/") {
                return Err(ProtoError::InvalidMountable(s.to_string()));
            }
            let split = desc
                .char_indices()
                .skip("/dev/".len())
                .filter(|&(_, c)| c == '/')
                .map(|(i, _)| i)
                .find(|&i| is_device(&desc[..i]));

            return match split {
                Some(i) if i + 1 < desc.len() => Ok(Mountable::BtrfsVolume {
                    device: desc[..i].to_string(),
                    volume: desc[i + 1..].to_string(),
                }),
                _ => Err(ProtoError::InvalidMountable(s.to_string())),
            };
        }

        if s.starts_with('/') && !s.starts_with("/dev/") {
            Ok(Mountable::Path(s.to_string()))
        } else {
            Ok(Mountable::Device(s.to_string()))
        }
    }

    /// Wire code used by `internal_parse_mountable`.
    pub fn type_code(&self) -> i32 {
        match self {
            Mountable::Device(_) => 0,
            Mountable::BtrfsVolume { .. } => 1,
            Mountable::Path(_) => 2,
        }
    }

    pub fn device(&self) -> &str {
        match self {
            Mountable::Device(d) | Mountable::Path(d) => d,
            Mountable::BtrfsVolume { device, .. } => device,
        }
    }

    pub fn volume(&self) -> Option<&str> {
        match self {
            Mountable::BtrfsVolume { volume, .. } => Some(volume),
            _ => None,
        }
    }
}

impl fmt::Display for Mountable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mountable::Device(d) | Mountable::Path(d) => f.write_str(d),
            Mountable::BtrfsVolume { device, volume } => {
                write!(f, "{BTRFSVOL_PREFIX}{device}/{volume}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_device() {
        let m = Mountable::parse_with("/dev/sda1", |_| true).unwrap();
        assert_eq!(m, Mountable::Device("/dev/sda1".to_string()));
        assert_eq!(m.type_code(), 0);
        assert_eq!(m.to_string(), "/dev/sda1");
    }

    #[test]
    fn test_path() {
        let m = Mountable::parse_with("/images/disk.img", |_| false).unwrap();
        assert_eq!(m, Mountable::Path("/images/disk.img".to_string()));
        assert_eq!(m.type_code(), 2);
    }

    #[test]
    fn test_btrfs_volume_simple() {
        let m = Mountable::parse_with("btrfsvol:/dev/sda3/root", |d| d == "/dev/sda3").unwrap();
        assert_eq!(m.device(), "/dev/sda3");
        assert_eq!(m.volume(), Some("root"));
        assert_eq!(m.to_string(), "btrfsvol:/dev/sda3/root");
    }

    #[test]
    fn test_btrfs_volume_on_lv_with_nested_subvolume() {
        let m = Mountable::parse_with("btrfsvol:/dev/VG/LV/a/b", |d| d == "/dev/VG/LV").unwrap();
        assert_eq!(
            m,
            Mountable::BtrfsVolume {
                device: "/dev/VG/LV".to_string(),
                volume: "a/b".to_string(),
            }
        );
        assert_eq!(m.type_code(), 1);
    }

    #[test]
    fn test_btrfs_volume_rejected() {
        assert!(Mountable::parse_with("btrfsvol:sda3/root", |_| true).is_err());
        assert!(Mountable::parse_with("btrfsvol:/dev/sda3", |_| true).is_err());
        assert!(Mountable::parse_with("btrfsvol:/dev/sda3/", |_| true).is_err());
        assert!(Mountable::parse_with("btrfsvol:/dev/sda3/root", |_| false).is_err());
    }
}
