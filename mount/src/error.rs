use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("{source_spec} on {target}: {errno}")]
    MountFailed {
        source_spec: String,
        target: String,
        errno: nix::errno::Errno,
    },

    #[error("{target}: {errno}")]
    UnmountFailed {
        target: String,
        errno: nix::errno::Errno,
    },

    #[error("{0}: unknown filesystem type")]
    UnknownFilesystem(String),

    #[error("invalid mount specification: {0}")]
    InvalidSpec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MountError {
    /// The errno behind this failure, if there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            MountError::MountFailed { errno, .. } | MountError::UnmountFailed { errno, .. } => {
                Some(*errno as i32)
            }
            MountError::UnknownFilesystem(_) => Some(nix::errno::Errno::ENODEV as i32),
            MountError::InvalidSpec(_) => Some(nix::errno::Errno::EINVAL as i32),
            MountError::Io(e) => e.raw_os_error(),
        }
    }
}

