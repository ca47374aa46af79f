use bitflags::bitflags;
use lazy_static::lazy_static;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvFlags: u32 {
        /// The path given to `open` is the data file itself, not a directory
        const NOSUBDIR = 0x4000;
        /// Don't flush the meta page after commit
        const NOSYNC = 0x10000;
        /// Open the environment read-only
        const RDONLY = 0x20000;
        /// Flush data on commit but not the meta page
        const NOMETASYNC = 0x40000;
        /// Use asynchronous flushes
        const MAPASYNC = 0x100000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DbFlags: u32 {
        /// Create the named database if it doesn't exist
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExist` instead of overwriting an existing key
        const NOOVERWRITE = 0x10;
    }
}

lazy_static! {
    /// Flags that may be toggled on an open environment
    pub(crate) static ref CHANGEABLE: EnvFlags =
        EnvFlags::NOSYNC | EnvFlags::NOMETASYNC | EnvFlags::MAPASYNC;
}

// Page and version constants
pub const PAGE_SIZE: usize = 4096;
/// Magic number stored in both meta pages
pub const MDB_MAGIC: u32 = 0xBEEF_C0DE;
/// On-disk meta format version
pub const DATA_VERSION: u32 = 1;
/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 9;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 70;
/// Number of meta pages at the start of the data file
pub const META_PAGES: usize = 2;

/// Default map size, 1 MiB
pub const DEFAULT_MAPSIZE: usize = 1 << 20;
pub const DEFAULT_MAX_READERS: u32 = 126;
pub const DEFAULT_MAX_DBS: u32 = 0;
/// Largest key the reference engine accepts
pub const MAX_KEY_SIZE: usize = 511;
/// Per-entry bookkeeping charged against the map size
pub const NODE_OVERHEAD: usize = 8;

/// Data file name inside an environment directory
pub const DATA_NAME: &str = "data.mdb";

/// Engine dbi of the unnamed default database
pub const MAIN_DBI: u32 = 1;
/// Database identifiers reserved by the engine; 0 is the free-page database
pub const CORE_DBS: u32 = 2;
