use crate::command::Command;
use crate::context::RequestContext;
use crate::error::{HandlerError, OsContext};
use guestd_proto::args::{ChmodArgs, IsFileArgs, PathArgs, WriteArgs};
use guestd_proto::{MESSAGE_MAX, Opaque, optargs};
use std::fs::{self, File, FileTimes, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::time::SystemTime;

/// Room left for the reply header and length prefixes around `read_file`
/// content.
const READ_FILE_MAX: usize = MESSAGE_MAX - 1024;

pub fn ping_daemon(_ctx: &RequestContext<'_>, _args: ()) -> Result<(), HandlerError> {
    Ok(())
}

pub fn sync(_ctx: &RequestContext<'_>, _args: ()) -> Result<(), HandlerError> {
    nix::unistd::sync();
    Ok(())
}

pub fn touch(ctx: &RequestContext<'_>, args: PathArgs) -> Result<(), HandlerError> {
    let path = &args.path;
    ctx.guest_path(path)?;
    let root = ctx.sysroot.chroot()?;
    let host = root.resolve(path);

    // Only regular files, but a missing one is created.
    match fs::symlink_metadata(&host) {
        Ok(meta) if !meta.file_type().is_file() => {
            return Err(HandlerError::msg(format!(
                "{path}: touch can only be used on a regular files"
            )));
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(HandlerError::os(format!("lstat: {path}"), e)),
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .mode(0o666)
        .open(&host)
        .context(format!("open: {path}"))?;
    drop(root);

    let now = SystemTime::now();
    file.set_times(FileTimes::new().set_accessed(now).set_modified(now))
        .context(format!("futimens: {path}"))
}

pub fn ls(ctx: &RequestContext<'_>, args: PathArgs) -> Result<Vec<String>, HandlerError> {
    ctx.guest_path(&args.path)?;
    let root = ctx.sysroot.chroot()?;
    let entries = fs::read_dir(root.resolve(&args.path)).context(format!("opendir: {}", args.path))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.context(format!("readdir: {}", args.path))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

pub fn mkdir(ctx: &RequestContext<'_>, args: PathArgs) -> Result<(), HandlerError> {
    ctx.guest_path(&args.path)?;
    let root = ctx.sysroot.chroot()?;
    fs::create_dir(root.resolve(&args.path)).context(&args.path)
}

pub fn mkdir_p(ctx: &RequestContext<'_>, args: PathArgs) -> Result<(), HandlerError> {
    ctx.guest_path(&args.path)?;
    let root = ctx.sysroot.chroot()?;
    match fs::create_dir_all(root.resolve(&args.path)) {
        Ok(()) => Ok(()),
        Err(e)
            if e.kind() == io::ErrorKind::AlreadyExists
                || e.raw_os_error() == Some(libc::ENOTDIR) =>
        {
            Err(HandlerError::msg(format!(
                "{}: a path element was not a directory",
                args.path
            )))
        }
        Err(e) => Err(HandlerError::os(&args.path, e)),
    }
}

pub fn rm(ctx: &RequestContext<'_>, args: PathArgs) -> Result<(), HandlerError> {
    ctx.guest_path(&args.path)?;
    let root = ctx.sysroot.chroot()?;
    fs::remove_file(root.resolve(&args.path)).context(&args.path)
}

/// `rm -rf` of a guest path. Anything under the root may go, the root
/// itself may not.
pub fn rm_rf(ctx: &RequestContext<'_>, args: PathArgs) -> Result<(), HandlerError> {
    ctx.guest_path(&args.path)?;
    if args.path == "/" {
        return Err(HandlerError::msg("cannot remove root directory"));
    }
    let host = ctx.sysroot.sysroot_path(&args.path)?;

    Command::new("rm")
        .arg("-rf")
        .arg(host.to_string_lossy())
        .run_ok()
        .map_err(|e| HandlerError::msg(format!("{}: {}", args.path, e)))?;
    Ok(())
}

pub fn chmod(ctx: &RequestContext<'_>, args: ChmodArgs) -> Result<(), HandlerError> {
    ctx.guest_path(&args.path)?;
    if args.mode < 0 {
        return Err(HandlerError::msg(format!("{}: mode is negative", args.path)));
    }
    let root = ctx.sysroot.chroot()?;
    fs::set_permissions(
        root.resolve(&args.path),
        Permissions::from_mode(args.mode as u32),
    )
    .context(format!("{}: 0{:o}", args.path, args.mode))
}

fn file_type(
    ctx: &RequestContext<'_>,
    path: &str,
    follow: bool,
) -> Result<Option<fs::FileType>, HandlerError> {
    ctx.guest_path(path)?;
    let root = ctx.sysroot.chroot()?;
    let host = root.resolve(path);
    let meta = if follow {
        fs::metadata(&host)
    } else {
        fs::symlink_metadata(&host)
    };
    match meta {
        Ok(meta) => Ok(Some(meta.file_type())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(HandlerError::os(path, e)),
    }
}

pub fn is_file(ctx: &RequestContext<'_>, args: IsFileArgs) -> Result<bool, HandlerError> {
    let follow = ctx
        .optargs
        .get(optargs::IS_FILE_FOLLOWSYMLINKS, args.followsymlinks)
        .unwrap_or(false);
    Ok(file_type(ctx, &args.path, follow)?.is_some_and(|t| t.is_file()))
}

pub fn is_dir(ctx: &RequestContext<'_>, args: IsFileArgs) -> Result<bool, HandlerError> {
    let follow = ctx
        .optargs
        .get(optargs::IS_DIR_FOLLOWSYMLINKS, args.followsymlinks)
        .unwrap_or(false);
    Ok(file_type(ctx, &args.path, follow)?.is_some_and(|t| t.is_dir()))
}

pub fn exists(ctx: &RequestContext<'_>, args: PathArgs) -> Result<bool, HandlerError> {
    ctx.guest_path(&args.path)?;
    let root = ctx.sysroot.chroot()?;
    Ok(fs::metadata(root.resolve(&args.path)).is_ok())
}

pub fn filesize(ctx: &RequestContext<'_>, args: PathArgs) -> Result<i64, HandlerError> {
    ctx.guest_path(&args.path)?;
    let root = ctx.sysroot.chroot()?;
    let meta = fs::metadata(root.resolve(&args.path)).context(&args.path)?;
    Ok(meta.len() as i64)
}

pub fn read_file(ctx: &RequestContext<'_>, args: PathArgs) -> Result<Opaque, HandlerError> {
    ctx.guest_path(&args.path)?;
    let root = ctx.sysroot.chroot()?;
    let host = root.resolve(&args.path);
    let file = File::open(&host).context(format!("open: {}", args.path))?;
    drop(root);

    let size = file.metadata().context(format!("fstat: {}", args.path))?.len();
    if size > READ_FILE_MAX as u64 {
        return Err(HandlerError::msg(format!(
            "{}: file is too large for the message buffer",
            args.path
        )));
    }

    let mut content = Vec::with_capacity(size as usize);
    (&file)
        .take(READ_FILE_MAX as u64 + 1)
        .read_to_end(&mut content)
        .context(format!("read: {}", args.path))?;
    if content.len() > READ_FILE_MAX {
        return Err(HandlerError::msg(format!(
            "{}: file is too large for the message buffer",
            args.path
        )));
    }
    Ok(Opaque(content))
}

pub fn write(ctx: &RequestContext<'_>, args: WriteArgs) -> Result<(), HandlerError> {
    ctx.guest_path(&args.path)?;
    let root = ctx.sysroot.chroot()?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(root.resolve(&args.path))
        .context(format!("open: {}", args.path))?;
    drop(root);

    file.write_all(&args.content.0)
        .context(format!("write: {}", args.path))
}

pub fn case_sensitive_path(ctx: &RequestContext<'_>, args: PathArgs) -> Result<String, HandlerError> {
    ctx.need_root()?;
    ctx.sysroot.case_sensitive_path(&args.path)
}
