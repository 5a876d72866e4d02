use crate::command::Command;
use crate::context::RequestContext;
use crate::error::{HandlerError, OsContext};
use guestd_proto::args::ChecksumArgs;
use std::fs::File;

fn program_of_csum(csumtype: &str) -> Result<&'static str, HandlerError> {
    let program = match csumtype.to_ascii_lowercase().as_str() {
        "crc" => "cksum",
        "md5" => "md5sum",
        "sha1" => "sha1sum",
        "sha224" => "sha224sum",
        "sha256" => "sha256sum",
        "sha384" => "sha384sum",
        "sha512" => "sha512sum",
        "gost" => "gostsum",
        "gost12" => "gost12sum",
        _ => {
            return Err(HandlerError::msg(
                "unknown checksum type, expecting crc|md5|sha1|sha224|sha256|sha384|sha512|gost|gost12",
            ));
        }
    };
    Ok(program)
}

/// Feed `file` to the checksum tool and keep the first word it prints.
fn checksum(ctx: &RequestContext<'_>, csumtype: &str, file: File) -> Result<String, HandlerError> {
    let program = program_of_csum(csumtype)?;

    ctx.progress.pulse_start();
    let out = match Command::new(program).stdin_fd(file).run_ok() {
        Ok(out) => out,
        Err(e) => {
            ctx.progress.pulse_cancel();
            return Err(e.into());
        }
    };
    ctx.progress.pulse_end()?;

    let sum = out
        .split([' ', '\t', '\n'])
        .next()
        .unwrap_or_default()
        .to_string();
    Ok(sum)
}

pub fn checksum_file(ctx: &RequestContext<'_>, args: ChecksumArgs) -> Result<String, HandlerError> {
    ctx.guest_path(&args.path)?;
    let file = {
        let root = ctx.sysroot.chroot()?;
        File::open(root.resolve(&args.path)).context(&args.path)?
    };
    checksum(ctx, &args.csumtype, file)
}

pub fn checksum_device(ctx: &RequestContext<'_>, args: ChecksumArgs) -> Result<String, HandlerError> {
    let device = ctx.resolve_device(&args.path)?;
    let file = File::open(&device).context(&device)?;
    checksum(ctx, &args.csumtype, file)
}
