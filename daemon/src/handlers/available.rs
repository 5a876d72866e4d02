//! Optional capability groups.

use crate::command::prog_exists;
use crate::config::Config;
use crate::context::RequestContext;
use crate::error::HandlerError;
use guestd_proto::args::GroupsArgs;

enum Probe {
    /// Every listed program must be on `PATH`.
    Programs(&'static [&'static str]),
    /// Follows the network setting.
    Network,
    Always,
}

const GROUPS: &[(&str, Probe)] = &[
    ("btrfs", Probe::Programs(&["btrfs"])),
    ("gdisk", Probe::Programs(&["sgdisk"])),
    ("linuxxattrs", Probe::Always),
    ("lvm2", Probe::Programs(&["lvm"])),
    ("mdadm", Probe::Programs(&["mdadm"])),
    ("network", Probe::Network),
    ("ntfs3g", Probe::Programs(&["ntfs-3g", "ntfsfix"])),
    ("xfs", Probe::Programs(&["mkfs.xfs", "xfs_repair"])),
    ("xz", Probe::Programs(&["xz"])),
    ("zerofree", Probe::Programs(&["zerofree"])),
];

fn group_available(config: &Config, group: &str) -> Result<bool, HandlerError> {
    let (_, probe) = GROUPS
        .iter()
        .find(|(name, _)| *name == group)
        .ok_or_else(|| HandlerError::msg(format!("{group}: unknown group")))?;

    Ok(match probe {
        Probe::Programs(programs) => programs.iter().all(|p| prog_exists(p)),
        Probe::Network => config.network,
        Probe::Always => true,
    })
}

/// Fails unless every group is available.
pub fn available(ctx: &RequestContext<'_>, args: GroupsArgs) -> Result<(), HandlerError> {
    for group in &args.groups {
        if !group_available(ctx.config, group)? {
            return Err(HandlerError::NotSupported(format!(
                "{group}: group not available"
            )));
        }
    }
    Ok(())
}

pub fn feature_available(ctx: &RequestContext<'_>, args: GroupsArgs) -> Result<bool, HandlerError> {
    for group in &args.groups {
        if !group_available(ctx.config, group)? {
            return Ok(false);
        }
    }
    Ok(true)
}
