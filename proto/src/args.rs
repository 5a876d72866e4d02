//! Argument and return records for each procedure.
//!
//! Optional arguments are always present on the wire; the request's bitmask
//! says which of them the caller actually supplied.

use crate::xdr::Opaque;
use crate::xdr_struct;

xdr_struct! {
    pub struct PathArgs {
        pub path: String,
    }
}

xdr_struct! {
    pub struct DeviceArgs {
        pub device: String,
    }
}

xdr_struct! {
    pub struct MountArgs {
        pub mountable: String,
        pub mountpoint: String,
    }
}

xdr_struct! {
    pub struct MountOptionsArgs {
        pub options: String,
        pub mountable: String,
        pub mountpoint: String,
    }
}

xdr_struct! {
    pub struct MountVfsArgs {
        pub options: String,
        pub vfstype: String,
        pub mountable: String,
        pub mountpoint: String,
    }
}

xdr_struct! {
    pub struct ChmodArgs {
        pub mode: i32,
        pub path: String,
    }
}

xdr_struct! {
    pub struct IsFileArgs {
        pub path: String,
        pub followsymlinks: bool,
    }
}

xdr_struct! {
    pub struct WriteArgs {
        pub path: String,
        pub content: Opaque,
    }
}

xdr_struct! {
    pub struct ChecksumArgs {
        pub csumtype: String,
        pub path: String,
    }
}

xdr_struct! {
    pub struct CommandArgs {
        pub arguments: Vec<String>,
    }
}

xdr_struct! {
    pub struct ShArgs {
        pub command: String,
    }
}

xdr_struct! {
    pub struct OffsetArgs {
        pub path: String,
        pub offset: i64,
    }
}

xdr_struct! {
    pub struct DownloadOffsetArgs {
        pub path: String,
        pub offset: i64,
        pub size: i64,
    }
}

xdr_struct! {
    pub struct CompressOutArgs {
        pub ctype: String,
        pub file: String,
        pub level: i32,
    }
}

xdr_struct! {
    pub struct UmountArgs {
        pub pathordevice: String,
        pub force: bool,
        pub lazyunmount: bool,
    }
}

xdr_struct! {
    pub struct MountableArgs {
        pub mountable: String,
    }
}

xdr_struct! {
    pub struct GroupsArgs {
        pub groups: Vec<String>,
    }
}

xdr_struct! {
    pub struct MkfsArgs {
        pub fstype: String,
        pub device: String,
        pub blocksize: i32,
        pub features: String,
        pub inode: i32,
        pub sectorsize: i32,
        pub label: String,
    }
}

xdr_struct! {
    /// Return value of `internal_parse_mountable`.
    pub struct InternalMountable {
        pub im_type: i32,
        pub im_device: String,
        pub im_volume: String,
    }
}
