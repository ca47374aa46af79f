/// Engine-side database identifier
pub type Dbi = u32;

/// Database statistics as seen by one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Number of data entries
    pub entries: usize,
}

/// Environment information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    /// Size of the memory map in bytes
    pub map_size: usize,
    /// ID of the last committed write transaction
    pub last_txnid: u64,
    /// Reader slot capacity
    pub max_readers: u32,
    /// Reader slots currently in use
    pub num_readers: u32,
    /// Named database capacity
    pub max_dbs: u32,
    /// Named databases currently registered
    pub num_dbs: u32,
}
