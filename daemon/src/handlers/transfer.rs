//! Bulk upload and download of guest files and devices.

use crate::context::RequestContext;
use crate::error::{HandlerError, OsContext};
use crate::stream::{FileIn, FileOut, Streamed, read_full};
use guestd_proto::MAX_CHUNK_SIZE;
use guestd_proto::args::{DownloadOffsetArgs, OffsetArgs, PathArgs};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;

/// Open a device directly, or a guest path under the chroot.
fn open_dev_or_path(
    ctx: &RequestContext<'_>,
    path: &str,
    options: &OpenOptions,
) -> Result<File, HandlerError> {
    if path.starts_with("/dev/") {
        let device = ctx.resolve_device(path)?;
        return options.open(&device).context(path);
    }
    ctx.guest_path(path)?;
    let root = ctx.sysroot.chroot()?;
    options.open(root.resolve(path)).context(path)
}

fn check_offset(path: &str, offset: i64) -> Result<u64, HandlerError> {
    u64::try_from(offset)
        .map_err(|_| HandlerError::msg(format!("{path}: offset in file is negative")))
}

fn upload_into(
    ctx: &RequestContext<'_>,
    path: &str,
    mut file: File,
    input: &mut FileIn<'_>,
) -> Result<(), HandlerError> {
    let hint = ctx.progress_hint;
    let mut written = 0u64;

    input
        .receive(|data| -> Result<(), HandlerError> {
            file.write_all(data)
                .context(format!("write error: {path}"))?;
            written += data.len() as u64;
            if hint > 0 {
                ctx.progress.notify_progress(written, hint)?;
            }
            Ok(())
        })?
        .into_result()?;

    file.sync_all().context(format!("close: {path}"))
}

pub fn upload(
    ctx: &RequestContext<'_>,
    args: PathArgs,
    input: &mut FileIn<'_>,
) -> Result<(), HandlerError> {
    let file = open_dev_or_path(
        ctx,
        &args.path,
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o666),
    )?;
    upload_into(ctx, &args.path, file, input)
}

pub fn upload_offset(
    ctx: &RequestContext<'_>,
    args: OffsetArgs,
    input: &mut FileIn<'_>,
) -> Result<(), HandlerError> {
    let offset = check_offset(&args.path, args.offset)?;
    let mut file = open_dev_or_path(
        ctx,
        &args.path,
        OpenOptions::new().write(true).create(true).mode(0o666),
    )?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .context(format!("lseek: {}", args.path))?;
    }
    upload_into(ctx, &args.path, file, input)
}

/// Stream everything `reader` yields, reporting progress against `total`.
fn send_all(
    ctx: &RequestContext<'_>,
    path: &str,
    mut reader: impl Read,
    total: u64,
    output: FileOut<'_>,
) -> Result<Streamed, HandlerError> {
    output.stream(|stream| {
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = read_full(&mut reader, &mut buf).context(path)?;
            if n == 0 {
                return Ok(());
            }
            stream.write(&buf[..n])?;
            sent += n as u64;
            ctx.progress.notify_progress(sent, total)?;
        }
    })
}

pub fn download(
    ctx: &RequestContext<'_>,
    args: PathArgs,
    output: FileOut<'_>,
) -> Result<Streamed, HandlerError> {
    let mut file = open_dev_or_path(ctx, &args.path, OpenOptions::new().read(true))?;

    // Devices report a zero length, so measure by seeking to the end.
    let total = file.seek(SeekFrom::End(0)).context(&args.path)?;
    file.rewind().context(&args.path)?;

    send_all(ctx, &args.path, file, total, output)
}

pub fn download_offset(
    ctx: &RequestContext<'_>,
    args: DownloadOffsetArgs,
    output: FileOut<'_>,
) -> Result<Streamed, HandlerError> {
    let offset = check_offset(&args.path, args.offset)?;
    let size = u64::try_from(args.size)
        .map_err(|_| HandlerError::msg(format!("{}: size is negative", args.path)))?;

    let mut file = open_dev_or_path(ctx, &args.path, OpenOptions::new().read(true))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .context(format!("lseek: {}", args.path))?;
    }

    // A file shorter than offset + size just ends early.
    send_all(ctx, &args.path, file.take(size), size, output)
}
