//! The request loop and the procedure table.
//!
//! One request is read, handled and answered before the next is read. The
//! table at the bottom of [`Session::dispatch`] pairs every procedure with
//! its handler; the argument and return types are inferred from the
//! handler's signature, so a mismatch with the wire records fails to build.

use crate::config::Config;
use crate::context::{OptArgs, RequestContext};
use crate::error::{DaemonError, HandlerError};
use crate::handlers;
use crate::progress::ProgressNotifier;
use crate::stream::{FileIn, FileOut, Streamed};
use crate::sysroot::Sysroot;
use crate::transport::Transport;
use guestd_proto::message::{encode_error, encode_reply};
use guestd_proto::{
    ErrorBody, Frame, LAUNCH_FLAG, MESSAGE_MAX, MessageHeader, PROGRESS_FLAG, Procedure,
    ProtoError, XdrDecode, XdrDecoder, XdrEncode,
};
use std::time::Instant;

const UNKNOWN_OPTARGS: &str = "unknown option in optional arguments bitmask";

pub struct Server {
    transport: Transport,
    sysroot: Sysroot,
    config: Config,
}

impl Server {
    pub fn new(transport: Transport, sysroot: Sysroot, config: Config) -> Self {
        Self {
            transport,
            sysroot,
            config,
        }
    }

    pub fn sysroot(&self) -> &Sysroot {
        &self.sysroot
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Tell the controller the daemon is ready.
    pub fn announce(&self) -> Result<(), DaemonError> {
        self.transport.send_flag(LAUNCH_FLAG)?;
        Ok(())
    }

    /// Serve requests until the controller closes the channel.
    ///
    /// Returns `Ok` only on a clean EOF between requests; every other way
    /// out is a protocol-fatal error.
    pub fn serve(&mut self) -> Result<(), DaemonError> {
        loop {
            match self.transport.read_frame()? {
                None => {
                    tracing::info!("Controller closed the channel");
                    return Ok(());
                }
                Some(Frame::Cancel) => {
                    tracing::debug!("Ignoring cancel outside of a transfer");
                }
                Some(Frame::Launch) => return Err(ProtoError::UnexpectedFlag(LAUNCH_FLAG).into()),
                Some(Frame::Progress(_)) => {
                    return Err(ProtoError::UnexpectedFlag(PROGRESS_FLAG).into());
                }
                Some(Frame::Message(buf)) => self.handle_message(&buf)?,
            }
        }
    }

    fn handle_message(&mut self, buf: &[u8]) -> Result<(), DaemonError> {
        let mut dec = XdrDecoder::new(buf);
        let header = MessageHeader::decode(&mut dec)?;

        if let Err(reason) = header.validate_call() {
            tracing::warn!("Refusing request {}: {}", header.serial, reason);
            let body = ErrorBody::new(0, reason);
            self.transport
                .send_message(&encode_error(header.proc_nr, header.serial, &body))?;
            return Ok(());
        }

        let procedure = Procedure::from_number(header.proc_nr)
            .ok_or(ProtoError::UnknownProcedure(header.proc_nr))?;
        tracing::debug!(
            "proc {} ({}) serial {} optargs {:#x}",
            header.proc_nr,
            procedure.name(),
            header.serial,
            header.optargs_bitmask
        );

        let started = Instant::now();
        let progress =
            ProgressNotifier::new(self.transport.writer(), header.proc_nr, header.serial);
        let mut session = Session {
            transport: &mut self.transport,
            ctx: RequestContext {
                procedure,
                serial: header.serial,
                optargs: OptArgs::new(header.optargs_bitmask),
                progress_hint: header.progress_hint,
                sysroot: &self.sysroot,
                config: &self.config,
                progress: &progress,
            },
            args: &buf[dec.position()..],
        };
        session.dispatch()?;

        if self.config.verbose {
            tracing::info!(
                "proc {} ({}) took {:.2} seconds",
                header.proc_nr,
                procedure.name(),
                started.elapsed().as_secs_f64()
            );
        }
        if !self.sysroot.is_balanced() {
            let (entered, left) = self.sysroot.chroot_counts();
            tracing::warn!(
                "{} left the sysroot unbalanced ({} entered, {} left)",
                procedure.name(),
                entered,
                left
            );
        }
        Ok(())
    }
}

/// One request being handled.
struct Session<'s> {
    transport: &'s mut Transport,
    ctx: RequestContext<'s>,
    args: &'s [u8],
}

impl Session<'_> {
    fn check_optargs(&self) -> Result<(), HandlerError> {
        let unknown = self.ctx.optargs.bitmask() & !self.ctx.procedure.optargs_mask();
        if unknown != 0 {
            return Err(HandlerError::msg(UNKNOWN_OPTARGS));
        }
        Ok(())
    }

    /// A malformed argument list means the two ends disagree on the
    /// protocol, so it ends the session.
    fn decode_args<A: XdrDecode>(&self) -> Result<A, DaemonError> {
        Ok(A::from_xdr(self.args)?)
    }

    fn reply_ok<R: XdrEncode>(&mut self, ret: &R) -> Result<(), DaemonError> {
        let payload = encode_reply(self.ctx.procedure.number(), self.ctx.serial, ret);
        if payload.len() > MESSAGE_MAX {
            tracing::error!(
                "{}: reply of {} bytes is too large",
                self.ctx.name(),
                payload.len()
            );
            return self.reply_error(HandlerError::msg("failed to encode reply body"));
        }
        self.transport.send_message(&payload)?;
        Ok(())
    }

    fn reply_error(&mut self, err: HandlerError) -> Result<(), DaemonError> {
        match err {
            HandlerError::Protocol(e) => Err(e.into()),
            HandlerError::Cancelled => {
                tracing::warn!("{}: cancelled by the controller, not replying", self.ctx.name());
                Ok(())
            }
            err => {
                tracing::error!("{}: {}", self.ctx.name(), err);
                let body = ErrorBody::new(err.errno(), err.to_string());
                let payload = encode_error(self.ctx.procedure.number(), self.ctx.serial, &body);
                self.transport.send_message(&payload)?;
                Ok(())
            }
        }
    }

    fn finish<R: XdrEncode>(&mut self, result: Result<R, HandlerError>) -> Result<(), DaemonError> {
        self.ctx.progress.pulse_cancel();
        match result {
            Ok(ret) => self.reply_ok(&ret),
            Err(e) => self.reply_error(e),
        }
    }

    /// A request answered by a single reply.
    fn call<A, R, F>(&mut self, handler: F) -> Result<(), DaemonError>
    where
        A: XdrDecode,
        R: XdrEncode,
        F: FnOnce(&RequestContext<'_>, A) -> Result<R, HandlerError>,
    {
        if let Err(e) = self.check_optargs() {
            return self.reply_error(e);
        }
        let args = self.decode_args::<A>()?;
        let result = handler(&self.ctx, args);
        self.finish(result)
    }

    /// A request followed by an upload. Whatever the handler did not read is
    /// refused before the reply goes out.
    fn call_file_in<A, R, F>(&mut self, handler: F) -> Result<(), DaemonError>
    where
        A: XdrDecode,
        R: XdrEncode,
        F: FnOnce(&RequestContext<'_>, A, &mut FileIn<'_>) -> Result<R, HandlerError>,
    {
        let checked = self.check_optargs();
        let mut input = FileIn::new(self.transport);
        let result = match checked {
            Ok(()) => {
                let args = A::from_xdr(self.args)?;
                handler(&self.ctx, args, &mut input)
            }
            Err(e) => Err(e),
        };
        if input.is_pending() {
            input.cancel()?;
        }
        self.finish(result)
    }

    /// A request answered by a reply and a download. Once the handler has
    /// started streaming, the outcome travels in the stream itself.
    fn call_file_out<A, F>(&mut self, handler: F) -> Result<(), DaemonError>
    where
        A: XdrDecode,
        F: FnOnce(&RequestContext<'_>, A, FileOut<'_>) -> Result<Streamed, HandlerError>,
    {
        if let Err(e) = self.check_optargs() {
            return self.reply_error(e);
        }
        let args = self.decode_args::<A>()?;
        let output = FileOut::new(self.transport, self.ctx.procedure.number(), self.ctx.serial);
        let result = handler(&self.ctx, args, output);
        self.ctx.progress.pulse_cancel();
        match result {
            Ok(Streamed::Completed) => Ok(()),
            Ok(outcome) => {
                tracing::warn!("{}: download ended early ({:?})", self.ctx.name(), outcome);
                Ok(())
            }
            Err(e) => self.reply_error(e),
        }
    }

    fn dispatch(&mut self) -> Result<(), DaemonError> {
        use handlers::{available, checksum, command, compress, file, mkfs, mount, transfer};

        match self.ctx.procedure {
            Procedure::Mount => self.call(mount::mount),
            Procedure::Sync => self.call(file::sync),
            Procedure::Touch => self.call(file::touch),
            Procedure::Ls => self.call(file::ls),
            Procedure::Mkdir => self.call(file::mkdir),
            Procedure::MkdirP => self.call(file::mkdir_p),
            Procedure::Rm => self.call(file::rm),
            Procedure::RmRf => self.call(file::rm_rf),
            Procedure::Chmod => self.call(file::chmod),
            Procedure::IsFile => self.call(file::is_file),
            Procedure::IsDir => self.call(file::is_dir),
            Procedure::Exists => self.call(file::exists),
            Procedure::Filesize => self.call(file::filesize),
            Procedure::ReadFile => self.call(file::read_file),
            Procedure::Write => self.call(file::write),
            Procedure::Checksum => self.call(checksum::checksum_file),
            Procedure::ChecksumDevice => self.call(checksum::checksum_device),
            Procedure::Command => self.call(command::command),
            Procedure::CommandLines => self.call(command::command_lines),
            Procedure::Sh => self.call(command::sh),
            Procedure::ShLines => self.call(command::sh_lines),
            Procedure::Upload => self.call_file_in(transfer::upload),
            Procedure::UploadOffset => self.call_file_in(transfer::upload_offset),
            Procedure::Download => self.call_file_out(transfer::download),
            Procedure::DownloadOffset => self.call_file_out(transfer::download_offset),
            Procedure::CompressOut => self.call_file_out(compress::compress_out),
            Procedure::Umount => self.call(mount::umount),
            Procedure::UmountAll => self.call(mount::umount_all),
            Procedure::Mounts => self.call(mount::mounts),
            Procedure::MountOptions => self.call(mount::mount_options),
            Procedure::MountRo => self.call(mount::mount_ro),
            Procedure::MountVfs => self.call(mount::mount_vfs),
            Procedure::CaseSensitivePath => self.call(file::case_sensitive_path),
            Procedure::PingDaemon => self.call(file::ping_daemon),
            Procedure::InternalParseMountable => self.call(mount::internal_parse_mountable),
            Procedure::Available => self.call(available::available),
            Procedure::FeatureAvailable => self.call(available::feature_available),
            Procedure::Mkfs => self.call(mkfs::mkfs),
        }
    }
}

/// Unmount everything under the sysroot and flush, on the way out.
pub fn autosync(sysroot: &Sysroot) {
    if !sysroot.is_prefix_mode() {
        if let Err(e) = handlers::mount::unmount_all(sysroot) {
            tracing::warn!("Unmounting on exit: {}", e);
        }
    }
    nix::unistd::sync();
    tracing::info!("Synced filesystems");
}
