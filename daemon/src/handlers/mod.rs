//! Procedure implementations.
//!
//! Every handler takes the request context and its decoded argument record
//! and returns its reply value or a [`HandlerError`](crate::error::HandlerError).
//! Transfer handlers additionally get the upload or download stream.

pub mod available;
pub mod checksum;
pub mod command;
pub mod compress;
pub mod file;
pub mod mkfs;
pub mod mount;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing {
    use crate::config::Config;
    use crate::context::{OptArgs, RequestContext};
    use crate::progress::ProgressNotifier;
    use crate::sysroot::{Sysroot, SysrootMode};
    use crate::transport::SharedWriter;
    use guestd_proto::Procedure;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// A prefix-mode sysroot in a temporary directory.
    pub struct Fixture {
        _dir: TempDir,
        pub sysroot: Sysroot,
        pub config: Config,
        pub progress: ProgressNotifier,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let sysroot = Sysroot::new(dir.path(), SysrootMode::Prefix);
            let config = Config {
                test_mode: true,
                sysroot: dir.path().to_path_buf(),
                ..Config::default()
            };
            let progress = ProgressNotifier::new(SharedWriter::new(std::io::sink()), 0, 0);
            Self {
                _dir: dir,
                sysroot,
                config,
                progress,
            }
        }

        pub fn ctx(&self, procedure: Procedure, bitmask: u64) -> RequestContext<'_> {
            RequestContext {
                procedure,
                serial: 1,
                optargs: OptArgs::new(bitmask),
                progress_hint: 0,
                sysroot: &self.sysroot,
                config: &self.config,
                progress: &self.progress,
            }
        }

        pub fn host(&self, guest_path: &str) -> PathBuf {
            self.sysroot.sysroot_path(guest_path).unwrap()
        }

        pub fn mkdir(&self, guest_path: &str) {
            std::fs::create_dir_all(self.host(guest_path)).unwrap();
        }

        pub fn write(&self, guest_path: &str, content: &[u8]) {
            std::fs::write(self.host(guest_path), content).unwrap();
        }
    }
}
