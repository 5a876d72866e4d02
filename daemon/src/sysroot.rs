//! The guest filesystem root and the chroot bracket around it.

use crate::error::{HandlerError, OsContext};
use std::cell::Cell;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub const NEED_ROOT: &str = "you must call 'mount' first to mount the root filesystem";
pub const ABS_PATH: &str = "path must start with a / character";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysrootMode {
    /// Guest paths are reached through chroot(2).
    Chroot,
    /// Guest paths are reached by prefixing the sysroot; used in test mode.
    Prefix,
}

#[derive(Debug)]
pub struct Sysroot {
    root: PathBuf,
    mode: SysrootMode,
    root_mounted: Cell<bool>,
    entered: Cell<u64>,
    left: Cell<u64>,
}

impl Sysroot {
    pub fn new(root: impl Into<PathBuf>, mode: SysrootMode) -> Self {
        Self {
            root: root.into(),
            mode,
            root_mounted: Cell::new(false),
            entered: Cell::new(0),
            left: Cell::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_prefix_mode(&self) -> bool {
        self.mode == SysrootMode::Prefix
    }

    /// In prefix mode the root always counts as mounted.
    pub fn is_root_mounted(&self) -> bool {
        self.is_prefix_mode() || self.root_mounted.get()
    }

    pub fn set_root_mounted(&self, mounted: bool) {
        self.root_mounted.set(mounted);
    }

    /// Host-visible path of a guest path: the sysroot with `guest_path`
    /// appended.
    pub fn sysroot_path(&self, guest_path: &str) -> Result<PathBuf, HandlerError> {
        if !guest_path.starts_with('/') {
            return Err(HandlerError::msg(ABS_PATH));
        }
        Ok(prefixed(&self.root, guest_path))
    }

    /// Enter the guest filesystem until the returned guard is dropped.
    ///
    /// The working directory stays at `/` outside the new root, which is what
    /// lets the guard get back out with `chroot(".")`.
    pub fn chroot(&self) -> Result<ChrootGuard<'_>, HandlerError> {
        if self.mode == SysrootMode::Chroot {
            nix::unistd::chroot(&self.root).context(format!("chroot: {}", self.root.display()))?;
        }
        self.entered.set(self.entered.get() + 1);
        Ok(ChrootGuard { sysroot: self })
    }

    /// Number of chroot entries and exits so far.
    pub fn chroot_counts(&self) -> (u64, u64) {
        (self.entered.get(), self.left.get())
    }

    pub fn is_balanced(&self) -> bool {
        self.entered.get() == self.left.get()
    }

    /// Resolve `guest_path` case-insensitively, one element at a time.
    ///
    /// A missing final element is kept as given so the result can be used to
    /// create a file. Directories are listed from inside the guest, so a
    /// symlink in the guest can never send the walk into the host.
    pub fn case_sensitive_path(&self, guest_path: &str) -> Result<String, HandlerError> {
        if !guest_path.starts_with('/') {
            return Err(HandlerError::msg(ABS_PATH));
        }

        let root = self.chroot()?;
        // Prefix mode has no kernel confinement, so every directory walked
        // must still canonicalize to somewhere under the sysroot.
        let jail = match self.mode {
            SysrootMode::Chroot => None,
            SysrootMode::Prefix => Some(
                std::fs::canonicalize(&self.root)
                    .context(format!("realpath: {}", self.root.display()))?,
            ),
        };

        let elements: Vec<&str> = guest_path.split('/').filter(|e| !e.is_empty()).collect();
        let mut resolved = String::new();

        for (i, name) in elements.iter().enumerate() {
            if *name == "." || *name == ".." {
                return Err(HandlerError::msg("path contained . or .. elements"));
            }
            let last = i + 1 == elements.len();

            let dir = root.resolve(if resolved.is_empty() { "/" } else { resolved.as_str() });
            if let Some(jail) = &jail {
                let canonical =
                    std::fs::canonicalize(&dir).context(format!("realpath: {resolved}/"))?;
                if !canonical.starts_with(jail) {
                    return Err(HandlerError::msg(format!(
                        "{resolved}: symbolic link points outside the guest filesystem"
                    )));
                }
            }

            let found = find_element(&dir, name).context(format!("opendir: {}", name))?;
            let real = match found {
                Some(real) => real,
                None if last => name.to_string(),
                None => {
                    return Err(HandlerError::msg(format!(
                        "{name}: no file or directory found with this name"
                    )));
                }
            };

            resolved.push('/');
            resolved.push_str(&real);

            if !last && !root.resolve(&resolved).is_dir() {
                return Err(HandlerError::msg(format!(
                    "{real}: non-directory element in path"
                )));
            }
        }

        if resolved.is_empty() {
            resolved.push('/');
        }
        Ok(resolved)
    }
}

fn prefixed(root: &Path, guest_path: &str) -> PathBuf {
    let mut s = OsString::from(root.as_os_str());
    if root == Path::new("/") {
        s.clear();
    }
    s.push(guest_path);
    PathBuf::from(s)
}

fn find_element(dir: &Path, name: &str) -> io::Result<Option<String>> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let entry_name = entry.file_name();
        if let Some(entry_name) = entry_name.to_str() {
            if entry_name.eq_ignore_ascii_case(name) {
                return Ok(Some(entry_name.to_string()));
            }
        }
    }
    Ok(None)
}

/// Scoped stay inside the guest filesystem.
pub struct ChrootGuard<'a> {
    sysroot: &'a Sysroot,
}

impl ChrootGuard<'_> {
    /// The path to hand to a syscall while the guard is held.
    pub fn resolve(&self, guest_path: &str) -> PathBuf {
        match self.sysroot.mode {
            SysrootMode::Chroot => PathBuf::from(guest_path),
            SysrootMode::Prefix => prefixed(&self.sysroot.root, guest_path),
        }
    }
}

impl Drop for ChrootGuard<'_> {
    fn drop(&mut self) {
        if self.sysroot.mode == SysrootMode::Chroot {
            if let Err(e) = nix::unistd::chroot(".") {
                tracing::error!("Leaving sysroot with chroot(\".\"): {}", e);
            }
        }
        self.sysroot.left.set(self.sysroot.left.get() + 1);
    }
}

pub fn is_device_parameter(path: &str) -> bool {
    path.starts_with("/dev/") && !Path::new(path).is_dir()
}

fn try_open(device: &str) -> io::Result<File> {
    OpenOptions::new().read(true).open(device)
}

/// Find the node for `device`, trying the IDE and virtio spellings of a
/// `/dev/sdX` name when the SCSI one does not exist.
pub fn device_name_translation(device: &str) -> io::Result<String> {
    let err = match try_open(device) {
        Ok(_) => return Ok(device.to_string()),
        Err(e) => e,
    };

    let missing = matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENXIO));
    let Some(rest) = device.strip_prefix("/dev/sd").filter(|_| missing) else {
        return Err(err);
    };

    for alt in [format!("/dev/hd{rest}"), format!("/dev/vd{rest}")] {
        if try_open(&alt).is_ok() {
            tracing::debug!("Translated {} to {}", device, alt);
            return Ok(alt);
        }
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn prefix_sysroot() -> (TempDir, Sysroot) {
        let dir = TempDir::new().unwrap();
        let sysroot = Sysroot::new(dir.path(), SysrootMode::Prefix);
        (dir, sysroot)
    }

    #[test]
    fn test_sysroot_path() {
        let sysroot = Sysroot::new("/sysroot", SysrootMode::Chroot);
        assert_eq!(
            sysroot.sysroot_path("/etc/hostname").unwrap(),
            PathBuf::from("/sysroot/etc/hostname")
        );
        let err = sysroot.sysroot_path("etc/hostname").unwrap_err();
        assert_eq!(err.to_string(), ABS_PATH);

        let sysroot = Sysroot::new("/", SysrootMode::Chroot);
        assert_eq!(sysroot.sysroot_path("/etc").unwrap(), PathBuf::from("/etc"));
    }

    #[test]
    fn test_root_mounted() {
        let sysroot = Sysroot::new("/sysroot", SysrootMode::Chroot);
        assert!(!sysroot.is_root_mounted());
        sysroot.set_root_mounted(true);
        assert!(sysroot.is_root_mounted());

        let (_dir, prefix) = prefix_sysroot();
        assert!(prefix.is_root_mounted());
    }

    #[test]
    fn test_guard_balance_on_every_path() {
        let (dir, sysroot) = prefix_sysroot();
        std::fs::write(dir.path().join("present"), b"x").unwrap();
        let cwd = std::env::current_dir().unwrap();

        let open = |name: &str| -> Result<File, HandlerError> {
            let root = sysroot.chroot()?;
            let file = File::open(root.resolve(name)).context(name)?;
            Ok(file)
        };

        assert!(open("/present").is_ok());
        assert!(open("/missing").is_err());
        assert_eq!(sysroot.chroot_counts(), (2, 2));
        assert!(sysroot.is_balanced());
        assert_eq!(std::env::current_dir().unwrap(), cwd);
    }

    #[test]
    fn test_case_sensitive_path() {
        let (dir, sysroot) = prefix_sysroot();
        std::fs::create_dir_all(dir.path().join("Windows/System32")).unwrap();
        std::fs::write(dir.path().join("Windows/System32/Config.SYS"), b"").unwrap();

        assert_eq!(
            sysroot.case_sensitive_path("/windows/system32/config.sys").unwrap(),
            "/Windows/System32/Config.SYS"
        );
        assert_eq!(
            sysroot.case_sensitive_path("/WINDOWS/system32/newfile").unwrap(),
            "/Windows/System32/newfile"
        );
        assert_eq!(sysroot.case_sensitive_path("/").unwrap(), "/");

        let err = sysroot.case_sensitive_path("/nope/system32").unwrap_err();
        assert!(err.to_string().contains("no file or directory found"));

        let err = sysroot
            .case_sensitive_path("/windows/system32/config.sys/x")
            .unwrap_err();
        assert!(err.to_string().contains("non-directory element"));

        assert!(sysroot.case_sensitive_path("/windows/../etc").is_err());
        assert!(sysroot.is_balanced());
    }

    #[test]
    fn test_case_sensitive_path_stays_in_guest() {
        let (dir, sysroot) = prefix_sysroot();
        let host = TempDir::new().unwrap();
        std::fs::create_dir(host.path().join("HostOnlyDir")).unwrap();
        std::os::unix::fs::symlink(host.path(), dir.path().join("link")).unwrap();

        std::fs::create_dir(dir.path().join("Data")).unwrap();
        std::os::unix::fs::symlink("Data", dir.path().join("alias")).unwrap();

        let err = sysroot.case_sensitive_path("/link/hostonlydir/x").unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("/link:"), "{msg}");
        assert!(!msg.contains("HostOnlyDir"));
        assert!(!msg.contains(host.path().to_str().unwrap()));

        // Links that stay inside the guest still resolve.
        assert_eq!(
            sysroot.case_sensitive_path("/ALIAS/newfile").unwrap(),
            "/alias/newfile"
        );
        assert_eq!(sysroot.chroot_counts(), (2, 2));
    }

    #[test]
    #[ignore = "needs root and changes the root of the whole process"]
    fn test_chroot_mode_guard() {
        if unsafe { libc::geteuid() } != 0 {
            return;
        }
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Inner")).unwrap();
        std::fs::write(dir.path().join("Inner/guest-only"), b"inside").unwrap();
        std::os::unix::fs::symlink("/Inner", dir.path().join("link")).unwrap();

        let cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir("/").unwrap();
        let sysroot = Sysroot::new(dir.path(), SysrootMode::Chroot);

        let content = {
            let root = sysroot.chroot().unwrap();
            std::fs::read(root.resolve("/Inner/guest-only"))
        };
        let missing = {
            let root = sysroot.chroot().unwrap();
            std::fs::read(root.resolve("/no/such/file"))
        };
        // An absolute link in the guest is followed relative to the guest.
        let resolved = sysroot.case_sensitive_path("/LINK/GUEST-ONLY");
        std::env::set_current_dir(&cwd).unwrap();

        assert_eq!(content.unwrap(), b"inside");
        assert!(missing.is_err());
        assert_eq!(resolved.unwrap(), "/link/guest-only");
        assert_eq!(sysroot.chroot_counts(), (3, 3));
        // Back on the host root.
        assert!(dir.path().join("Inner/guest-only").is_file());
    }

    #[test]
    fn test_device_translation_missing() {
        let err = device_name_translation("/dev/sdzz9").unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert_eq!(device_name_translation("/dev/null").unwrap(), "/dev/null");
    }

    #[test]
    fn test_is_device_parameter() {
        assert!(is_device_parameter("/dev/sda1"));
        assert!(!is_device_parameter("/dev/"));
        assert!(!is_device_parameter("/etc/passwd"));
    }
}
