use crate::command::CommandError;
use guestd_mount::MountError;
use guestd_proto::ProtoError;
use nix::errno::Errno;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure of one request. Everything except `Protocol` becomes an ERROR
/// reply and the session carries on.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),

    #[error("{context}: {}", os_message(.source))]
    Os { context: String, source: io::Error },

    /// A capability the appliance does not provide.
    #[error("{0}")]
    NotSupported(String),

    /// The controller cancelled an upload; it expects no reply.
    #[error("transfer cancelled by the controller")]
    Cancelled,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{context}: {source}")]
    Mount { context: String, source: MountError },

    #[error(transparent)]
    Protocol(#[from] ProtoError),
}

fn os_message(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(code) => Errno::from_raw(code).desc().to_string(),
        None => err.to_string(),
    }
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Message(message.into())
    }

    pub fn os(context: impl Into<String>, source: io::Error) -> Self {
        HandlerError::Os {
            context: context.into(),
            source,
        }
    }

    pub fn mount(context: impl Into<String>, source: MountError) -> Self {
        HandlerError::Mount {
            context: context.into(),
            source,
        }
    }

    /// Errno carried in the ERROR reply, zero when there is none.
    pub fn errno(&self) -> i32 {
        match self {
            HandlerError::Os { source, .. } => source.raw_os_error().unwrap_or(0),
            HandlerError::NotSupported(_) => Errno::ENOTSUP as i32,
            HandlerError::Command(e) => e.errno().unwrap_or(0),
            HandlerError::Mount { source, .. } => source.errno().unwrap_or(0),
            HandlerError::Message(_) | HandlerError::Cancelled | HandlerError::Protocol(_) => 0,
        }
    }

    /// The session cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Protocol(_))
    }
}

/// Attach a context string to an OS-level failure.
pub trait OsContext<T> {
    fn context(self, context: impl Into<String>) -> Result<T, HandlerError>;
}

impl<T> OsContext<T> for io::Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T, HandlerError> {
        self.map_err(|e| HandlerError::os(context, e))
    }
}

impl<T> OsContext<T> for nix::Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T, HandlerError> {
        self.map_err(|errno| HandlerError::os(context, io::Error::from(errno)))
    }
}

/// Errors that end the session.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("cannot open channel {endpoint}: {source}")]
    Channel { endpoint: String, source: io::Error },

    #[error("invalid config file {path}: {source}")]
    Config {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_error_message_and_errno() {
        let err = HandlerError::os("/etc/hostname", io::Error::from_raw_os_error(libc::ENOENT));
        assert_eq!(err.to_string(), "/etc/hostname: No such file or directory");
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_not_supported_sends_enotsup() {
        let err = HandlerError::NotSupported("xz is not available".to_string());
        assert_eq!(err.errno(), libc::ENOTSUP);
    }

    #[test]
    fn test_protocol_errors_are_fatal() {
        let err = HandlerError::from(ProtoError::UnexpectedEof);
        assert!(err.is_fatal());
        assert_eq!(err.errno(), 0);
    }

    #[test]
    fn test_nix_context() {
        let r: nix::Result<()> = Err(Errno::EACCES);
        let err = r.context("chmod: /root").unwrap_err();
        assert_eq!(err.errno(), libc::EACCES);
        assert!(err.to_string().starts_with("chmod: /root: "));
    }
}
