//! Contract between the transaction layer and the page-level tree engine.
//!
//! Every fallible engine call reports failure as an integer result code
//! (see [`crate::error`] for the numbering). The layer validates environment,
//! transaction and handle state before it calls into the engine, and maps the
//! returned codes onto [`crate::Error`].

use std::os::raw::c_int;
use std::result;
use std::sync::Arc;

use crate::constants::{DbFlags, WriteFlags};
use crate::types::Dbi;

/// Result of an engine call; the error is the engine's numeric result code
pub type EngineResult<T> = result::Result<T, c_int>;

/// Limits and recovered state handed to the engine when the environment opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Size of the memory map in bytes
    pub map_size: usize,
    /// Maximum number of named databases
    pub max_dbs: u32,
    /// ID of the last committed write transaction recorded in the meta pages
    pub last_txnid: u64,
}

/// A B+Tree storage engine the transaction layer delegates to.
///
/// A native transaction is a stack of scopes: `begin_txn` creates it with one
/// scope, `begin_nested` pushes a child scope, and `commit_txn`/`abort_txn`
/// always finish the innermost scope. Committing a nested scope merges its
/// mutations into the scope directly below it; committing the last scope
/// publishes them to later transactions.
///
/// Write transactions are serialized by the engine: `begin_txn(false)` blocks
/// while another write transaction is active and wakes once it finishes.
pub trait Engine: Send + Sync {
    /// Engine-native transaction context
    type Txn: Send;

    fn open(&self, config: &EngineConfig) -> EngineResult<()>;

    /// Release engine resources. Waiting writers fail with `EINVAL`.
    fn close(&self);

    fn begin_txn(&self, read_only: bool) -> EngineResult<Self::Txn>;

    fn begin_nested(&self, txn: &mut Self::Txn) -> EngineResult<()>;

    /// Commit the innermost scope. On failure the scope has been discarded.
    fn commit_txn(&self, txn: &mut Self::Txn) -> EngineResult<()>;

    /// Discard the innermost scope
    fn abort_txn(&self, txn: &mut Self::Txn);

    /// ID of the snapshot (readers) or of the transaction being built (writers)
    fn txn_id(&self, txn: &Self::Txn) -> u64;

    fn open_db(&self, txn: &mut Self::Txn, name: Option<&str>, flags: DbFlags) -> EngineResult<Dbi>;

    fn get(&self, txn: &Self::Txn, dbi: Dbi, key: &[u8]) -> EngineResult<Arc<[u8]>>;

    fn put(
        &self,
        txn: &mut Self::Txn,
        dbi: Dbi,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<()>;

    fn delete(&self, txn: &mut Self::Txn, dbi: Dbi, key: &[u8]) -> EngineResult<()>;

    /// Number of entries in `dbi` as seen by `txn`
    fn entries(&self, txn: &Self::Txn, dbi: Dbi) -> EngineResult<usize>;
}
