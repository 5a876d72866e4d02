use crate::error::DaemonError;
use crate::transport::Endpoint;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_SYSROOT: &str = "/sysroot";
const KERNEL_CMDLINE: &str = "/proc/cmdline";

#[derive(Parser, Debug, Default)]
#[command(name = "guestd")]
#[command(about = "Appliance daemon serving disk image requests from a controller")]
pub struct Cli {
    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log every request and spawned command
    #[arg(short, long)]
    pub verbose: bool,

    /// Allow commands run in the guest to use the network
    #[arg(long)]
    pub network: bool,

    /// Do not unmount filesystems and sync when the controller disconnects
    #[arg(short = 'r', long)]
    pub no_autosync: bool,

    /// Test mode: resolve guest paths by prefixing instead of chroot
    #[arg(short, long)]
    pub test: bool,

    /// Where the guest filesystem is mounted
    #[arg(long)]
    pub sysroot: Option<PathBuf>,

    /// Controller channel: virtio:PATH, vsock:PORT or unix:PATH
    #[arg(long)]
    pub channel: Option<Endpoint>,
}

/// Daemon settings. Read-only once the request loop starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub verbose: bool,
    pub network: bool,
    pub autosync: bool,
    pub test_mode: bool,
    pub sysroot: PathBuf,
    pub channel: Endpoint,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            network: false,
            autosync: true,
            test_mode: false,
            sysroot: PathBuf::from(DEFAULT_SYSROOT),
            channel: Endpoint::default(),
        }
    }
}

impl Config {
    /// Defaults, then the config file, then the kernel command line, then
    /// the command line flags.
    ///
    /// Runs before logging is set up, so what was read from where comes back
    /// as notes for the caller to log.
    pub fn load(cli: &Cli) -> Result<(Self, Vec<String>), DaemonError> {
        let mut notes = Vec::new();
        let mut config = match &cli.config {
            Some(path) => {
                notes.push(format!("Read configuration from {}", path.display()));
                Self::from_file(path)?
            }
            None => Self::default(),
        };

        match std::fs::read_to_string(KERNEL_CMDLINE) {
            Ok(cmdline) => {
                config.apply_kernel_cmdline(&cmdline);
                notes.push(format!("Applied {}", KERNEL_CMDLINE));
            }
            Err(e) => notes.push(format!("Not reading {}: {}", KERNEL_CMDLINE, e)),
        }

        config.apply_cli(cli);
        Ok((config, notes))
    }

    pub fn from_file(path: &Path) -> Result<Self, DaemonError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| DaemonError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_kernel_cmdline(&mut self, cmdline: &str) {
        for word in cmdline.split_whitespace() {
            match word {
                "guestfs_verbose=1" => self.verbose = true,
                "guestfs_network=1" => self.network = true,
                "guestfs_noautosync" => self.autosync = false,
                _ => {}
            }
        }
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        self.verbose |= cli.verbose;
        self.network |= cli.network;
        self.test_mode |= cli.test;
        if cli.no_autosync {
            self.autosync = false;
        }
        if let Some(sysroot) = &cli.sysroot {
            self.sysroot = sysroot.clone();
        }
        if let Some(channel) = &cli.channel {
            self.channel = channel.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.autosync);
        assert!(!config.test_mode);
        assert_eq!(config.sysroot, PathBuf::from("/sysroot"));
        assert_eq!(config.channel, Endpoint::default());
    }

    #[test]
    fn test_kernel_cmdline() {
        let mut config = Config::default();
        config.apply_kernel_cmdline("console=ttyS0 guestfs_verbose=1 quiet guestfs_network=1\n");
        assert!(config.verbose);
        assert!(config.network);

        let mut config = Config::default();
        config.apply_kernel_cmdline("guestfs_verbose=0");
        assert!(!config.verbose);
    }

    #[test]
    fn test_layering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guestd.json");
        std::fs::write(
            &path,
            r#"{"sysroot": "/mnt/guest", "channel": {"vsock": 1024}, "network": true}"#,
        )
        .unwrap();

        let mut config = Config::from_file(&path).unwrap();
        assert_eq!(config.sysroot, PathBuf::from("/mnt/guest"));
        assert_eq!(config.channel, Endpoint::Vsock(1024));
        assert!(config.network);
        assert!(config.autosync);

        let cli = Cli::parse_from([
            "guestd",
            "--test",
            "-r",
            "--sysroot",
            "/tmp/root",
            "--channel",
            "unix:/tmp/guestd.sock",
        ]);
        config.apply_cli(&cli);
        assert!(config.test_mode);
        assert!(!config.autosync);
        assert!(config.network);
        assert_eq!(config.sysroot, PathBuf::from("/tmp/root"));
        assert_eq!(config.channel, Endpoint::Unix(PathBuf::from("/tmp/guestd.sock")));
    }

    #[test]
    fn test_load_reports_sources() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guestd.json");
        std::fs::write(&path, r#"{"sysroot": "/mnt/guest"}"#).unwrap();

        let cli = Cli {
            config: Some(path.clone()),
            no_autosync: true,
            ..Cli::default()
        };
        let (config, notes) = Config::load(&cli).unwrap();
        assert_eq!(config.sysroot, PathBuf::from("/mnt/guest"));
        assert!(!config.autosync);
        assert_eq!(notes.len(), 2);
        assert!(notes[0].contains(path.to_str().unwrap()));
        assert!(notes[1].contains(KERNEL_CMDLINE));
    }

    #[test]
    fn test_bad_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(DaemonError::Config { .. })
        ));
    }
}
