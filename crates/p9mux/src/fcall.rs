//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::mem::size_of;

use bitflags::bitflags;
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// The version string that comes with RVersion when the server does not understand
/// the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Tag of `TVersion`/`RVersion`
///
/// Never handed out by the tag pool.
pub const NOTAG: u16 = !0;

/// Special value which `TAttach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that authentication is
/// not required, the afid field in the attach message should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Ample room for `TWrite`/`RRead` header
///
/// size[4] TRead/TWrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// Maximum number of elements in a single `TWalk`
pub const MAXWELEM: usize = 16;

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 16;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 32;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 64;
}

/// Bits in Dir.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Mode bit for read permission
    pub const READ: u32 = 0x4;
    /// Mode bit for write permission
    pub const WRITE: u32 = 0x2;
    /// Mode bit for execute permission
    pub const EXEC: u32 = 0x1;
}

bitflags! {
    /// Bits in QId.typ
    ///
    /// # Protocol
    /// 9P2000
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QIdType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QIdType,
    /// Version number for a file; typically, it is incremented every time the file is modified
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy
    pub path: u64,
}

impl QId {
    /// Encoded size: typ[1] version[4] path[8]
    pub const SIZE: u16 = (size_of::<u8>() + size_of::<u32>() + size_of::<u64>()) as u16;

    pub fn is_dir(&self) -> bool {
        self.typ.contains(QIdType::DIR)
    }
}

/// Plan 9 namespace metadata (somewhat like a unix fstat)
///
/// Carried by `RStat` and `TWStat`. In a `TWStat`, fields set to their
/// "don't touch" value (`!0` for integers, empty for strings) are left unchanged
/// by the server; see [`Dir::unchanged`].
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dir {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: QId,
    /// Permissions
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

impl Dir {
    /// A `Dir` which asks the server to leave every field alone.
    pub fn unchanged() -> Dir {
        Dir {
            typ: !0,
            dev: !0,
            qid: QId {
                typ: QIdType::from_bits_retain(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    /// Value of the leading size[2] field: the encoded length not counting itself.
    ///
    /// `None` if the strings make the record too long for size[2].
    pub fn size(&self) -> Option<u16> {
        let len = size_of::<u16>()
            + size_of::<u32>()
            + QId::SIZE as usize
            + size_of::<u32>() * 3
            + size_of::<u64>()
            + size_of::<u16>() * 4
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len();
        u16::try_from(len).ok()
    }

    pub fn is_dir(&self) -> bool {
        self.mode & dm::DIR != 0
    }
}

/// Data type used in `RRead` and `TWrite`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        // 9P2000.L error reply, accepted from Linux-dialect servers
        TlError         = 6,    // Illegal, never used
        RlError,

        // 9P2000
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        TError          = 106,  // Illegal, never used
        RError,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        // Every R-message directly follows its T-message
        (*self as u8) % 2 == 1
    }

    /// The successful reply type for a T-message
    pub fn response(&self) -> Option<MsgType> {
        match *self {
            MsgType::TlError | MsgType::TError => None,
            t if t.is_t() => MsgType::from_u8(t as u8 + 1),
            _ => None,
        }
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::RlError { .. } => MsgType::RlError,
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::RError { .. } => MsgType::RError,
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TOpen { .. } => MsgType::TOpen,
            FCall::ROpen { .. } => MsgType::ROpen,
            FCall::TCreate { .. } => MsgType::TCreate,
            FCall::RCreate { .. } => MsgType::RCreate,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
            FCall::TStat { .. } => MsgType::TStat,
            FCall::RStat { .. } => MsgType::RStat,
            FCall::TWStat { .. } => MsgType::TWStat,
            FCall::RWStat => MsgType::RWStat,
        }
    }
}

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    RlError {
        ecode: u32,
    },
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach {
        qid: QId,
    },
    RError {
        ename: String,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<QId>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    RCreate {
        qid: QId,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Dir,
    },
    TWStat {
        fid: u32,
        stat: Dir,
    },
    RWStat,
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: FCall,
}

impl Msg {
    /// Type discriminator of the body
    pub fn typ(&self) -> MsgType {
        MsgType::from(&self.body)
    }
}

#[test]
fn response_types_follow_requests() {
    assert_eq!(MsgType::TVersion.response(), Some(MsgType::RVersion));
    assert_eq!(MsgType::TWStat.response(), Some(MsgType::RWStat));
    assert_eq!(MsgType::TFlush.response(), Some(MsgType::RFlush));
    assert_eq!(MsgType::RRead.response(), None);
    assert_eq!(MsgType::TError.response(), None);
    assert!(MsgType::RlError.is_r());
    assert!(MsgType::TClunk.is_t());
}

#[test]
fn dir_size_counts_strings() {
    let dir = Dir {
        name: "file".to_owned(),
        uid: "glenda".to_owned(),
        ..Default::default()
    };
    // fixed part is 47 bytes after the size field itself
    assert_eq!(dir.size(), Some(47 + 4 + 6));

    let huge = Dir {
        name: "n".repeat(40_000),
        uid: "u".repeat(40_000),
        ..Default::default()
    };
    assert_eq!(huge.size(), None);
}
