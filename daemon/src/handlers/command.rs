use crate::command::{Command, split_lines};
use crate::context::RequestContext;
use crate::error::HandlerError;
use crate::sysroot::Sysroot;
use guestd_mount::{MountSpec, UnmountFlags, mount_fs, unmount};
use guestd_proto::args::{CommandArgs, ShArgs};
use std::path::PathBuf;

const BIND_SOURCES: &[&str] = &["/dev", "/dev/pts", "/proc", "/sys"];
const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Host directories bind-mounted into the guest while a command runs.
///
/// Individual binds may fail; only the ones that succeeded are undone, in
/// reverse order, when this is dropped.
struct BindMounts {
    mounted: Vec<PathBuf>,
}

impl BindMounts {
    fn new(sysroot: &Sysroot, network: bool) -> Self {
        let mut mounted = Vec::new();
        if sysroot.is_prefix_mode() {
            return Self { mounted };
        }

        let sources = BIND_SOURCES
            .iter()
            .chain(network.then_some(&RESOLV_CONF))
            .copied();
        for source in sources {
            let target = match sysroot.sysroot_path(source) {
                Ok(target) => target,
                Err(_) => continue,
            };
            let spec = MountSpec::new(None, source, vec!["bind".to_string()]);
            match mount_fs(&spec, &target) {
                Ok(()) => mounted.push(target),
                Err(e) => tracing::debug!("Not binding {} into the guest: {}", source, e),
            }
        }
        Self { mounted }
    }
}

impl Drop for BindMounts {
    fn drop(&mut self) {
        while let Some(target) = self.mounted.pop() {
            if let Err(e) = unmount(&target, UnmountFlags::default()) {
                tracing::warn!("Unmounting bind mount {}: {}", target.display(), e);
            }
        }
    }
}

/// Run `argv` inside the guest and return its stdout.
pub fn command(ctx: &RequestContext<'_>, args: CommandArgs) -> Result<String, HandlerError> {
    ctx.need_root()?;
    let Some((program, rest)) = args.arguments.split_first() else {
        return Err(HandlerError::msg("passed an empty list"));
    };

    let _binds = BindMounts::new(ctx.sysroot, ctx.config.network);
    let out = Command::new(program.as_str())
        .args(rest.iter().map(String::as_str))
        .in_sysroot(ctx.sysroot)
        .run_ok()?;
    Ok(out)
}

pub fn command_lines(ctx: &RequestContext<'_>, args: CommandArgs) -> Result<Vec<String>, HandlerError> {
    command(ctx, args).map(|out| split_lines(&out))
}

fn sh_argv(cmd: String) -> CommandArgs {
    CommandArgs {
        arguments: vec!["/bin/sh".to_string(), "-c".to_string(), cmd],
    }
}

pub fn sh(ctx: &RequestContext<'_>, args: ShArgs) -> Result<String, HandlerError> {
    command(ctx, sh_argv(args.command))
}

pub fn sh_lines(ctx: &RequestContext<'_>, args: ShArgs) -> Result<Vec<String>, HandlerError> {
    command_lines(ctx, sh_argv(args.command))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::Fixture;
    use guestd_proto::Procedure;

    fn argv(words: &[&str]) -> CommandArgs {
        CommandArgs {
            arguments: words.iter().map(|w| w.to_string()).collect(),
        }
    }

    #[test]
    fn test_command_runs_in_sysroot() {
        let fx = Fixture::new();
        fx.write("/marker", b"inside\n");
        let ctx = fx.ctx(Procedure::Command, 0);
        assert_eq!(command(&ctx, argv(&["cat", "marker"])).unwrap(), "inside\n");
    }

    #[test]
    fn test_command_failure() {
        let fx = Fixture::new();
        let ctx = fx.ctx(Procedure::Command, 0);

        let err = command(&ctx, argv(&["false"])).unwrap_err();
        assert!(!err.to_string().is_empty());
        assert!(!err.is_fatal());

        let err = command(&ctx, argv(&[])).unwrap_err();
        assert_eq!(err.to_string(), "passed an empty list");
    }

    #[test]
    fn test_sh_lines() {
        let fx = Fixture::new();
        let ctx = fx.ctx(Procedure::ShLines, 0);
        let sh_args = |cmd: &str| ShArgs {
            command: cmd.to_string(),
        };

        assert_eq!(sh(&ctx, sh_args("echo hi")).unwrap(), "hi\n");
        assert_eq!(
            sh_lines(&ctx, sh_args("printf 'a\\nb\\n\\n'")).unwrap(),
            vec!["a", "b", ""]
        );
        assert!(sh_lines(&ctx, sh_args("true")).unwrap().is_empty());

        let err = sh(&ctx, sh_args("echo oops >&2; exit 2")).unwrap_err();
        assert_eq!(err.to_string(), "/bin/sh: oops");
    }

    #[test]
    fn test_no_binds_in_prefix_mode() {
        let fx = Fixture::new();
        let binds = BindMounts::new(&fx.sysroot, true);
        assert!(binds.mounted.is_empty());
    }
}
