use crate::command::Command;
use crate::context::RequestContext;
use crate::error::HandlerError;
use crate::sysroot::{Sysroot, is_device_parameter};
use guestd_mount::{MountSpec, UnmountFlags, list_mounts, mount_fs, mounts_under, unmount};
use guestd_proto::args::{
    InternalMountable, MountArgs, MountOptionsArgs, MountVfsArgs, MountableArgs, UmountArgs,
};
use guestd_proto::{Mountable, optargs};
use std::path::PathBuf;

/// Where `mountpoint` lives on the host. Anything but `/` needs the root
/// filesystem mounted first.
fn mountpoint_path(ctx: &RequestContext<'_>, mountpoint: &str) -> Result<PathBuf, HandlerError> {
    if mountpoint != "/" {
        ctx.need_root()?;
    }
    ctx.sysroot.sysroot_path(mountpoint)
}

pub fn mount_vfs(ctx: &RequestContext<'_>, args: MountVfsArgs) -> Result<(), HandlerError> {
    let target = mountpoint_path(ctx, &args.mountpoint)?;
    let mountable = ctx.resolve_mountable(&args.mountable)?;
    let vfstype = Some(args.vfstype.as_str()).filter(|t| !t.is_empty());
    let context = format!(
        "{} on {} (options: '{}')",
        args.mountable, args.mountpoint, args.options
    );

    match &mountable {
        Mountable::Device(device) => {
            let spec = MountSpec::with_option_string(vfstype, device, &args.options);
            mount_fs(&spec, &target).map_err(|e| HandlerError::mount(context, e))?;
        }
        Mountable::BtrfsVolume { device, volume } => {
            let mut spec =
                MountSpec::with_option_string(vfstype.or(Some("btrfs")), device, &args.options);
            spec.options.push(format!("subvol={volume}"));
            mount_fs(&spec, &target).map_err(|e| HandlerError::mount(context, e))?;
        }
        Mountable::Path(path) => {
            // Image files inside the guest need a loop device, which only
            // mount(8) sets up for us.
            let options = match args.options.as_str() {
                "" => "loop".to_string(),
                options => format!("{options},loop"),
            };
            let image = ctx.sysroot.sysroot_path(path)?;
            let mut cmd = Command::new("mount").arg("-o").arg(options);
            if let Some(vfstype) = vfstype {
                cmd = cmd.arg("-t").arg(vfstype);
            }
            cmd.arg(image.to_string_lossy())
                .arg(target.to_string_lossy())
                .run_ok()
                .map_err(|e| HandlerError::msg(format!("{context}: {e}")))?;
        }
    }

    tracing::info!("Mounted {} on {}", mountable, args.mountpoint);
    if args.mountpoint == "/" {
        ctx.sysroot.set_root_mounted(true);
    }
    Ok(())
}

pub fn mount(ctx: &RequestContext<'_>, args: MountArgs) -> Result<(), HandlerError> {
    mount_vfs(
        ctx,
        MountVfsArgs {
            options: String::new(),
            vfstype: String::new(),
            mountable: args.mountable,
            mountpoint: args.mountpoint,
        },
    )
}

pub fn mount_ro(ctx: &RequestContext<'_>, args: MountArgs) -> Result<(), HandlerError> {
    mount_vfs(
        ctx,
        MountVfsArgs {
            options: "ro".to_string(),
            vfstype: String::new(),
            mountable: args.mountable,
            mountpoint: args.mountpoint,
        },
    )
}

pub fn mount_options(ctx: &RequestContext<'_>, args: MountOptionsArgs) -> Result<(), HandlerError> {
    mount_vfs(
        ctx,
        MountVfsArgs {
            options: args.options,
            vfstype: String::new(),
            mountable: args.mountable,
            mountpoint: args.mountpoint,
        },
    )
}

/// Unmount a guest path, or wherever under the sysroot a device is mounted.
pub fn umount(ctx: &RequestContext<'_>, args: UmountArgs) -> Result<(), HandlerError> {
    let flags = UnmountFlags {
        force: ctx
            .optargs
            .get(optargs::UMOUNT_FORCE, args.force)
            .unwrap_or(false),
        lazy: ctx
            .optargs
            .get(optargs::UMOUNT_LAZYUNMOUNT, args.lazyunmount)
            .unwrap_or(false),
    };

    let target = if is_device_parameter(&args.pathordevice) {
        let device = ctx.resolve_device(&args.pathordevice)?;
        let mounts = list_mounts().map_err(|e| HandlerError::mount("/proc/mounts", e))?;
        mounts_under(mounts, ctx.sysroot.root())
            .into_iter()
            .find(|m| m.source == device)
            .map(|m| m.target)
            .ok_or_else(|| HandlerError::msg(format!("{}: not mounted", args.pathordevice)))?
    } else {
        ctx.sysroot.sysroot_path(&args.pathordevice)?
    };

    unmount(&target, flags).map_err(|e| HandlerError::mount(&args.pathordevice, e))?;
    if target == ctx.sysroot.root() {
        ctx.sysroot.set_root_mounted(false);
    }
    Ok(())
}

/// Unmount everything at or below the sysroot, deepest first.
pub fn unmount_all(sysroot: &Sysroot) -> Result<(), HandlerError> {
    let mounts = list_mounts().map_err(|e| HandlerError::mount("/proc/mounts", e))?;
    for entry in mounts_under(mounts, sysroot.root()) {
        tracing::debug!("umount-all: {} on {}", entry.source, entry.target.display());
        unmount(&entry.target, UnmountFlags::default())
            .map_err(|e| HandlerError::mount(format!("umount: {}", entry.target.display()), e))?;
    }
    sysroot.set_root_mounted(false);
    Ok(())
}

pub fn umount_all(ctx: &RequestContext<'_>, _args: ()) -> Result<(), HandlerError> {
    unmount_all(ctx.sysroot)
}

/// Devices mounted at or below the sysroot, in mount order.
pub fn mounts(ctx: &RequestContext<'_>, _args: ()) -> Result<Vec<String>, HandlerError> {
    let root = ctx.sysroot.root();
    let mounts = list_mounts().map_err(|e| HandlerError::mount("/proc/mounts", e))?;
    Ok(mounts
        .into_iter()
        .filter(|m| m.target.starts_with(root))
        .map(|m| m.source)
        .collect())
}

pub fn internal_parse_mountable(
    ctx: &RequestContext<'_>,
    args: MountableArgs,
) -> Result<InternalMountable, HandlerError> {
    let mountable = ctx.resolve_mountable(&args.mountable)?;
    Ok(InternalMountable {
        im_type: mountable.type_code(),
        im_device: mountable.device().to_string(),
        im_volume: mountable.volume().unwrap_or_default().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::OptArgs;
    use crate::handlers::testing::Fixture;
    use crate::progress::ProgressNotifier;
    use crate::sysroot::{NEED_ROOT, SysrootMode};
    use crate::transport::SharedWriter;
    use guestd_proto::Procedure;

    #[test]
    fn test_mountpoint_needs_root() {
        let sysroot = Sysroot::new("/sysroot", SysrootMode::Chroot);
        let config = Config::default();
        let progress = ProgressNotifier::new(SharedWriter::new(std::io::sink()), 1, 1);
        let ctx = RequestContext {
            procedure: Procedure::Mount,
            serial: 1,
            optargs: OptArgs::new(0),
            progress_hint: 0,
            sysroot: &sysroot,
            config: &config,
            progress: &progress,
        };

        assert_eq!(
            mountpoint_path(&ctx, "/").unwrap(),
            PathBuf::from("/sysroot")
        );
        let err = mountpoint_path(&ctx, "/boot").unwrap_err();
        assert_eq!(err.to_string(), NEED_ROOT);

        let err = mount(
            &ctx,
            MountArgs {
                mountable: "/dev/null".to_string(),
                mountpoint: "/boot".to_string(),
            },
        )
        .unwrap_err();
        assert_eq!(err.to_string(), NEED_ROOT);
        assert!(!sysroot.is_root_mounted());
    }

    #[test]
    fn test_internal_parse_mountable() {
        let fx = Fixture::new();
        let ctx = fx.ctx(Procedure::InternalParseMountable, 0);
        let parse = |s: &str| {
            internal_parse_mountable(
                &ctx,
                MountableArgs {
                    mountable: s.to_string(),
                },
            )
        };

        let device = parse("/dev/null").unwrap();
        assert_eq!((device.im_type, device.im_device.as_str()), (0, "/dev/null"));
        assert_eq!(device.im_volume, "");

        let volume = parse("btrfsvol:/dev/null/root/home").unwrap();
        assert_eq!(volume.im_type, 1);
        assert_eq!(volume.im_device, "/dev/null");
        assert_eq!(volume.im_volume, "root/home");

        let path = parse("/images/disk.img").unwrap();
        assert_eq!(path.im_type, 2);

        let err = parse("btrfsvol:/dev/guestd-missing/x").unwrap_err();
        assert!(err.to_string().ends_with("expecting a btrfs volume"));

        let err = parse("sda1").unwrap_err();
        assert!(err.to_string().contains("expecting a device name"));
    }

    #[test]
    fn test_nothing_mounted_under_fresh_sysroot() {
        let fx = Fixture::new();
        let ctx = fx.ctx(Procedure::Mounts, 0);
        assert!(mounts(&ctx, ()).unwrap().is_empty());
        umount_all(&ctx, ()).unwrap();
    }
}
