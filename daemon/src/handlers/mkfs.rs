use crate::command::Command;
use crate::context::RequestContext;
use crate::error::HandlerError;
use guestd_proto::args::MkfsArgs;
use guestd_proto::optargs;

/// Optional arguments the caller supplied.
#[derive(Debug, Default)]
struct MkfsOptions {
    blocksize: Option<i32>,
    features: Option<String>,
    inode: Option<i32>,
    sectorsize: Option<i32>,
    label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Ext,
    Fat,
    Xfs,
    Ntfs,
    Btrfs,
    Other,
}

impl Family {
    fn of(fstype: &str) -> Self {
        match fstype {
            "ext2" | "ext3" | "ext4" => Family::Ext,
            "vfat" | "msdos" | "fat" => Family::Fat,
            "xfs" => Family::Xfs,
            "ntfs" => Family::Ntfs,
            "btrfs" => Family::Btrfs,
            _ => Family::Other,
        }
    }
}

fn unsupported(option: &str, fstype: &str) -> HandlerError {
    HandlerError::msg(format!("{option}: option not supported by {fstype}"))
}

/// Arguments for `mkfs`, minus the program name.
fn mkfs_args(fstype: &str, device: &str, opts: &MkfsOptions) -> Result<Vec<String>, HandlerError> {
    let family = Family::of(fstype);
    let mut argv: Vec<String> = vec!["-t".into(), fstype.into()];

    // Keep every tool quiet and non-interactive.
    match fstype {
        "ntfs" => argv.push("-Q".into()),
        "reiserfs" | "jfs" => argv.push("-f".into()),
        "gfs" | "gfs2" => argv.extend(["-p", "lock_nolock", "-j", "1", "-O"].map(String::from)),
        _ => {}
    }
    match family {
        Family::Ext => argv.push("-F".into()),
        Family::Fat => argv.push("-I".into()),
        Family::Xfs | Family::Btrfs => argv.push("-f".into()),
        Family::Ntfs | Family::Other => {}
    }

    if let Some(blocksize) = opts.blocksize {
        if blocksize <= 0 || !(blocksize as u32).is_power_of_two() {
            return Err(HandlerError::msg(
                "block size must be > 0 and a power of 2",
            ));
        }
        match family {
            Family::Fat => {
                let sectors = blocksize / 512;
                if sectors == 0 {
                    return Err(HandlerError::msg(format!(
                        "{fstype}: block size must be at least 512"
                    )));
                }
                argv.extend(["-s".to_string(), sectors.to_string()]);
            }
            Family::Xfs => argv.extend(["-b".to_string(), format!("size={blocksize}")]),
            Family::Ntfs => argv.extend(["-c".to_string(), blocksize.to_string()]),
            Family::Btrfs => argv.extend(["--sectorsize".to_string(), blocksize.to_string()]),
            Family::Ext | Family::Other => argv.extend(["-b".to_string(), blocksize.to_string()]),
        }
    }

    if let Some(features) = &opts.features {
        match family {
            Family::Ext => argv.extend(["-O".to_string(), features.clone()]),
            _ => return Err(unsupported("features", fstype)),
        }
    }

    if let Some(inode) = opts.inode {
        match family {
            Family::Ext => argv.extend(["-I".to_string(), inode.to_string()]),
            _ => return Err(unsupported("inode", fstype)),
        }
    }

    if let Some(sectorsize) = opts.sectorsize {
        match family {
            Family::Xfs => argv.extend(["-s".to_string(), format!("size={sectorsize}")]),
            Family::Fat => argv.extend(["-S".to_string(), sectorsize.to_string()]),
            _ => return Err(unsupported("sectorsize", fstype)),
        }
    }

    if let Some(label) = &opts.label {
        match family {
            Family::Ext | Family::Xfs | Family::Ntfs | Family::Btrfs => {
                argv.extend(["-L".to_string(), label.clone()]);
            }
            Family::Fat => argv.extend(["-n".to_string(), label.clone()]),
            Family::Other => return Err(unsupported("label", fstype)),
        }
    }

    argv.push(device.to_string());
    Ok(argv)
}

pub fn mkfs(ctx: &RequestContext<'_>, args: MkfsArgs) -> Result<(), HandlerError> {
    let device = ctx.resolve_device(&args.device)?;
    let opts = MkfsOptions {
        blocksize: ctx.optargs.get(optargs::MKFS_BLOCKSIZE, args.blocksize),
        features: ctx.optargs.get(optargs::MKFS_FEATURES, args.features),
        inode: ctx.optargs.get(optargs::MKFS_INODE, args.inode),
        sectorsize: ctx.optargs.get(optargs::MKFS_SECTORSIZE, args.sectorsize),
        label: ctx.optargs.get(optargs::MKFS_LABEL, args.label),
    };
    let argv = mkfs_args(&args.fstype, &device, &opts)?;

    Command::new("mkfs")
        .args(argv)
        .fold_stdout_on_stderr()
        .run_ok()
        .map_err(|e| {
            HandlerError::msg(format!("mkfs: {}: {}: {}", args.fstype, device, e.diagnostic()))
        })?;
    tracing::info!("Created {} filesystem on {}", args.fstype, device);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::Fixture;
    use guestd_proto::Procedure;

    #[test]
    fn test_plain_mkfs() {
        let argv = mkfs_args("ext4", "/dev/sda1", &MkfsOptions::default()).unwrap();
        assert_eq!(argv, vec!["-t", "ext4", "-F", "/dev/sda1"]);

        let argv = mkfs_args("gfs2", "/dev/sda1", &MkfsOptions::default()).unwrap();
        assert_eq!(
            argv,
            vec!["-t", "gfs2", "-p", "lock_nolock", "-j", "1", "-O", "/dev/sda1"]
        );

        let argv = mkfs_args("ntfs", "/dev/sdb", &MkfsOptions::default()).unwrap();
        assert_eq!(argv, vec!["-t", "ntfs", "-Q", "/dev/sdb"]);
    }

    #[test]
    fn test_ext_options() {
        let opts = MkfsOptions {
            blocksize: Some(4096),
            features: Some("^has_journal".to_string()),
            inode: Some(256),
            label: Some("root".to_string()),
            ..Default::default()
        };
        let argv = mkfs_args("ext4", "/dev/sda1", &opts).unwrap();
        assert_eq!(
            argv,
            vec![
                "-t", "ext4", "-F", "-b", "4096", "-O", "^has_journal", "-I", "256", "-L",
                "root", "/dev/sda1"
            ]
        );
    }

    #[test]
    fn test_vfat_translation() {
        let opts = MkfsOptions {
            blocksize: Some(4096),
            label: Some("EFI".to_string()),
            ..Default::default()
        };
        let argv = mkfs_args("vfat", "/dev/sda1", &opts).unwrap();
        assert_eq!(
            argv,
            vec!["-t", "vfat", "-I", "-s", "8", "-n", "EFI", "/dev/sda1"]
        );
    }

    #[test]
    fn test_rejected_combinations() {
        let opts = MkfsOptions {
            features: Some("x".to_string()),
            ..Default::default()
        };
        let err = mkfs_args("xfs", "/dev/sda1", &opts).unwrap_err();
        assert_eq!(err.to_string(), "features: option not supported by xfs");

        let opts = MkfsOptions {
            blocksize: Some(1000),
            ..Default::default()
        };
        assert!(mkfs_args("ext4", "/dev/sda1", &opts).is_err());

        let opts = MkfsOptions {
            blocksize: Some(0),
            ..Default::default()
        };
        assert!(mkfs_args("ext4", "/dev/sda1", &opts).is_err());
    }

    #[test]
    fn test_unset_optargs_are_ignored() {
        let fx = Fixture::new();
        // Only the label bit is set; the bogus blocksize on the wire must
        // not be looked at, so the failure is about the device.
        let ctx = fx.ctx(Procedure::Mkfs, optargs::MKFS_LABEL);
        let err = mkfs(
            &ctx,
            MkfsArgs {
                fstype: "ext4".to_string(),
                device: "/etc/hostname".to_string(),
                blocksize: -1,
                features: String::new(),
                inode: 0,
                sectorsize: 0,
                label: "x".to_string(),
            },
        )
        .unwrap_err();
        assert!(err.to_string().ends_with("expecting a device name"));
    }
}
