//! Procedure numbers and their static properties.

/// Whether a procedure moves a chunk stream besides its request and reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    None,
    /// Chunks flow controller → daemon after the request.
    FileIn,
    /// Chunks flow daemon → controller after the OK reply.
    FileOut,
}

macro_rules! procedures {
    ($($variant:ident = $num:literal, $name:literal, optargs = $optargs:literal, $transfer:ident;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum Procedure {
            $($variant = $num),*
        }

        impl Procedure {
            pub const ALL: &'static [Procedure] = &[$(Procedure::$variant),*];

            pub fn from_number(n: i32) -> Option<Self> {
                match n {
                    $($num => Some(Procedure::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Procedure::$variant => $name),*
                }
            }

            /// Number of optional arguments, i.e. valid bits in the bitmask.
            pub fn optarg_count(self) -> u32 {
                match self {
                    $(Procedure::$variant => $optargs),*
                }
            }

            pub fn transfer(self) -> Transfer {
                match self {
                    $(Procedure::$variant => Transfer::$transfer),*
                }
            }
        }
    };
}

procedures! {
    Mount = 1, "mount", optargs = 0, None;
    Sync = 2, "sync", optargs = 0, None;
    Touch = 3, "touch", optargs = 0, None;
    Ls = 4, "ls", optargs = 0, None;
    Mkdir = 5, "mkdir", optargs = 0, None;
    MkdirP = 6, "mkdir_p", optargs = 0, None;
    Rm = 7, "rm", optargs = 0, None;
    RmRf = 8, "rm_rf", optargs = 0, None;
    Chmod = 9, "chmod", optargs = 0, None;
    IsFile = 10, "is_file", optargs = 1, None;
    IsDir = 11, "is_dir", optargs = 1, None;
    Exists = 12, "exists", optargs = 0, None;
    Filesize = 13, "filesize", optargs = 0, None;
    ReadFile = 14, "read_file", optargs = 0, None;
    Write = 15, "write", optargs = 0, None;
    Checksum = 16, "checksum", optargs = 0, None;
    ChecksumDevice = 17, "checksum_device", optargs = 0, None;
    Command = 18, "command", optargs = 0, None;
    CommandLines = 19, "command_lines", optargs = 0, None;
    Sh = 20, "sh", optargs = 0, None;
    ShLines = 21, "sh_lines", optargs = 0, None;
    Upload = 22, "upload", optargs = 0, FileIn;
    UploadOffset = 23, "upload_offset", optargs = 0, FileIn;
    Download = 24, "download", optargs = 0, FileOut;
    DownloadOffset = 25, "download_offset", optargs = 0, FileOut;
    CompressOut = 26, "compress_out", optargs = 1, FileOut;
    Umount = 27, "umount", optargs = 2, None;
    UmountAll = 28, "umount_all", optargs = 0, None;
    Mounts = 29, "mounts", optargs = 0, None;
    MountOptions = 30, "mount_options", optargs = 0, None;
    MountRo = 31, "mount_ro", optargs = 0, None;
    MountVfs = 32, "mount_vfs", optargs = 0, None;
    CaseSensitivePath = 33, "case_sensitive_path", optargs = 0, None;
    PingDaemon = 34, "ping_daemon", optargs = 0, None;
    InternalParseMountable = 35, "internal_parse_mountable", optargs = 0, None;
    Available = 36, "available", optargs = 0, None;
    FeatureAvailable = 37, "feature_available", optargs = 0, None;
    Mkfs = 38, "mkfs", optargs = 5, None;
}

impl Procedure {
    pub fn number(self) -> i32 {
        self as i32
    }

    /// Mask of the bits a caller may legitimately set for this procedure.
    pub fn optargs_mask(self) -> u64 {
        match self.optarg_count() {
            0 => 0,
            n => u64::MAX >> (64 - n),
        }
    }
}

/// Bit positions of optional arguments, one constant per argument.
pub mod optargs {
    pub const IS_FILE_FOLLOWSYMLINKS: u64 = 1 << 0;
    pub const IS_DIR_FOLLOWSYMLINKS: u64 = 1 << 0;

    pub const COMPRESS_OUT_LEVEL: u64 = 1 << 0;

    pub const UMOUNT_FORCE: u64 = 1 << 0;
    pub const UMOUNT_LAZYUNMOUNT: u64 = 1 << 1;

    pub const MKFS_BLOCKSIZE: u64 = 1 << 0;
    pub const MKFS_FEATURES: u64 = 1 << 1;
    pub const MKFS_INODE: u64 = 1 << 2;
    pub const MKFS_SECTORSIZE: u64 = 1 << 3;
    pub const MKFS_LABEL: u64 = 1 << 4;
}
