use crate::command::{Command, prog_exists};
use crate::context::RequestContext;
use crate::error::{HandlerError, OsContext};
use crate::stream::{FileOut, Streamed, read_full};
use guestd_proto::args::CompressOutArgs;
use guestd_proto::{MAX_CHUNK_SIZE, optargs};
use std::fs::File;
use std::ops::RangeInclusive;

/// A compression program and the level to pass it, if any.
#[derive(Debug, PartialEq, Eq)]
struct Filter {
    program: &'static str,
    level: Option<i32>,
}

impl Filter {
    fn new(ctype: &str, level: Option<i32>) -> Result<Self, HandlerError> {
        let (program, levels): (_, Option<RangeInclusive<i32>>) = match ctype {
            "compress" => ("compress", None),
            "gzip" => ("gzip", Some(1..=9)),
            "bzip2" => ("bzip2", Some(1..=9)),
            "xz" => ("xz", Some(0..=9)),
            "lzop" => ("lzop", Some(1..=9)),
            _ => return Err(HandlerError::msg("unknown compression type")),
        };

        match (level, levels) {
            (None, _) => {}
            (Some(_), None) => {
                return Err(HandlerError::msg(format!(
                    "{program}: cannot use optional level parameter with this compression type"
                )));
            }
            (Some(level), Some(levels)) if levels.contains(&level) => {}
            (Some(_), Some(_)) => {
                return Err(HandlerError::msg(format!(
                    "{program}: incorrect value for level parameter"
                )));
            }
        }
        Ok(Self { program, level })
    }

    fn check_supported(&self) -> Result<(), HandlerError> {
        if prog_exists(self.program) {
            return Ok(());
        }
        Err(HandlerError::NotSupported(format!(
            "compression type {0} is not supported, because external program '{0}' is not available in the appliance",
            self.program
        )))
    }

    fn args(&self) -> Vec<String> {
        std::iter::once("-c".to_string())
            .chain(self.level.map(|level| format!("-{level}")))
            .collect()
    }
}

/// Stream a guest file through a compression filter.
pub fn compress_out(
    ctx: &RequestContext<'_>,
    args: CompressOutArgs,
    output: FileOut<'_>,
) -> Result<Streamed, HandlerError> {
    let level = ctx.optargs.get(optargs::COMPRESS_OUT_LEVEL, args.level);
    let filter = Filter::new(&args.ctype, level)?;
    filter.check_supported()?;

    ctx.guest_path(&args.file)?;
    let file = {
        let root = ctx.sysroot.chroot()?;
        File::open(root.resolve(&args.file)).context(&args.file)?
    };

    let mut child = Command::new(filter.program)
        .args(filter.args())
        .stdin_fd(file)
        .spawn_reader()?;

    let path = args.file;
    output.stream(move |stream| {
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        loop {
            let n = read_full(child.stdout(), &mut buf).context(format!("fread: {path}"))?;
            if n == 0 {
                break;
            }
            stream.write(&buf[..n])?;
        }
        child.finish()?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(
            Filter::new("gzip", None).unwrap(),
            Filter {
                program: "gzip",
                level: None
            }
        );
        assert_eq!(Filter::new("gzip", Some(9)).unwrap().args(), vec!["-c", "-9"]);
        assert_eq!(Filter::new("xz", Some(0)).unwrap().args(), vec!["-c", "-0"]);
        assert_eq!(Filter::new("lzop", None).unwrap().args(), vec!["-c"]);

        let err = Filter::new("gzip", Some(0)).unwrap_err();
        assert_eq!(err.to_string(), "gzip: incorrect value for level parameter");
        let err = Filter::new("bzip2", Some(10)).unwrap_err();
        assert_eq!(err.to_string(), "bzip2: incorrect value for level parameter");
    }

    #[test]
    fn test_compress_takes_no_level() {
        assert!(Filter::new("compress", None).is_ok());
        let err = Filter::new("compress", Some(1)).unwrap_err();
        assert!(err.to_string().contains("cannot use optional level parameter"));
    }

    #[test]
    fn test_unknown_type() {
        let err = Filter::new("zstd", None).unwrap_err();
        assert_eq!(err.to_string(), "unknown compression type");
    }

    #[test]
    fn test_missing_program_is_not_supported() {
        let filter = Filter {
            program: "guestd-no-such-compressor",
            level: None,
        };
        let err = filter.check_supported().unwrap_err();
        assert!(err.to_string().contains("is not supported"));
        assert_eq!(err.errno(), libc::ENOTSUP);
    }
}
