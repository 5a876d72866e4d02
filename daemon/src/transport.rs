//! The channel to the controller.
//!
//! One stream descriptor carries everything. Reads happen only on the
//! request loop's thread; writes go through a shared handle because the
//! progress pulse thread writes too.

use crate::error::DaemonError;
use guestd_proto::frame::{self, Frame};
use guestd_proto::{CANCEL_FLAG, Progress, ProtoError};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

pub const DEFAULT_VIRTIO_PORT: &str = "/dev/virtio-ports/org.libguestfs.channel.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    VirtioSerial(PathBuf),
    Vsock(u32),
    Unix(PathBuf),
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::VirtioSerial(PathBuf::from(DEFAULT_VIRTIO_PORT))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::VirtioSerial(path) => write!(f, "virtio:{}", path.display()),
            Endpoint::Vsock(port) => write!(f, "vsock:{port}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// `virtio:PATH`, `vsock:PORT` or `unix:PATH`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("virtio", path)) if !path.is_empty() => Ok(Endpoint::VirtioSerial(path.into())),
            Some(("unix", path)) if !path.is_empty() => Ok(Endpoint::Unix(path.into())),
            Some(("vsock", port)) => port
                .parse()
                .map(Endpoint::Vsock)
                .map_err(|e| format!("invalid vsock port {port:?}: {e}")),
            _ => Err(format!(
                "invalid channel {s:?}, expecting virtio:PATH, vsock:PORT or unix:PATH"
            )),
        }
    }
}

fn connect_vsock(port: u32) -> io::Result<OwnedFd> {
    unsafe {
        let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = OwnedFd::from_raw_fd(fd);

        let mut addr: libc::sockaddr_vm = std::mem::zeroed();
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_port = port;
        addr.svm_cid = libc::VMADDR_CID_HOST;

        if libc::connect(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_vm>() as libc::socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }

        Ok(fd)
    }
}

fn open_endpoint(endpoint: &Endpoint) -> io::Result<OwnedFd> {
    match endpoint {
        Endpoint::VirtioSerial(path) => {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            Ok(OwnedFd::from(file))
        }
        Endpoint::Vsock(port) => connect_vsock(*port),
        Endpoint::Unix(path) => Ok(OwnedFd::from(UnixStream::connect(path)?)),
    }
}

/// Write half of the channel, shareable across threads.
#[derive(Clone)]
pub struct SharedWriter(Arc<Mutex<Box<dyn Write + Send>>>);

impl SharedWriter {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(writer))))
    }

    fn with<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn Write + Send>) -> Result<T, ProtoError>,
    ) -> Result<T, ProtoError> {
        let mut writer = self
            .0
            .lock()
            .map_err(|_| io::Error::other("channel writer lock poisoned"))?;
        f(&mut writer)
    }

    pub fn send_message(&self, payload: &[u8]) -> Result<(), ProtoError> {
        self.with(|w| frame::write_message(w, payload))
    }

    pub fn send_flag(&self, flag: u32) -> Result<(), ProtoError> {
        self.with(|w| frame::write_flag(w, flag))
    }

    pub fn send_progress(&self, progress: &Progress) -> Result<(), ProtoError> {
        self.with(|w| frame::write_progress(w, progress))
    }
}

pub struct Transport {
    reader: File,
    writer: SharedWriter,
}

impl Transport {
    pub fn connect(endpoint: &Endpoint) -> Result<Self, DaemonError> {
        let channel_error = |source| DaemonError::Channel {
            endpoint: endpoint.to_string(),
            source,
        };
        let fd = open_endpoint(endpoint).map_err(channel_error)?;
        let transport = Self::from_fd(fd).map_err(channel_error)?;
        tracing::info!("Connected to controller on {}", endpoint);
        Ok(transport)
    }

    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let write_half = fd.try_clone()?;
        Ok(Self {
            reader: File::from(fd),
            writer: SharedWriter::new(File::from(write_half)),
        })
    }

    pub fn writer(&self) -> SharedWriter {
        self.writer.clone()
    }

    /// Next frame, or `None` on a clean EOF between frames.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, ProtoError> {
        frame::read_frame(&mut self.reader)
    }

    pub fn send_message(&self, payload: &[u8]) -> Result<(), ProtoError> {
        self.writer.send_message(payload)
    }

    pub fn send_flag(&self, flag: u32) -> Result<(), ProtoError> {
        self.writer.send_flag(flag)
    }

    /// Whether the controller has asked to cancel the outgoing transfer.
    /// Never blocks.
    pub fn cancel_pending(&mut self) -> Result<bool, ProtoError> {
        let readable = {
            let mut fds = [PollFd::new(self.reader.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(errno) => return Err(io::Error::from(errno).into()),
            }
        };
        if !readable {
            return Ok(false);
        }

        match frame::read_word(&mut self.reader)? {
            Some(CANCEL_FLAG) => Ok(true),
            Some(word) => Err(ProtoError::UnexpectedFlag(word)),
            None => Err(ProtoError::UnexpectedEof),
        }
    }
}
