//! Transaction and database-handle layer of an embedded, memory-mapped
//! key-value store.
//!
//! An [`Environment`] owns a memory-mapped data file and a storage
//! [`Engine`]. Work happens inside a [`Transaction`]: read-only transactions
//! see a fixed snapshot and run concurrently, write transactions are
//! serialized and may be nested. Named databases are opened through a
//! transaction and the resulting [`Database`] handle stays valid for later
//! transactions of the same environment.
//!
//! ```no_run
//! use lumotxn::{DbFlags, EnvFlags, Environment};
//!
//! let mut env = Environment::new();
//! env.set_max_dbs(1)?;
//! env.open("/tmp/store.mdb", 0o664, EnvFlags::NOSUBDIR)?;
//!
//! let mut txn = env.begin_txn()?;
//! let db = txn.open_database(Some("users"), DbFlags::CREATE)?;
//! db.put(&mut txn, b"alice", b"admin")?;
//! txn.commit()?;
//!
//! assert_eq!(db.get_implicit(b"alice")?, b"admin");
//! # Ok::<(), lumotxn::Error>(())
//! ```

mod btree;
mod constants;
mod database;
mod engine;
mod env;
pub mod error;
mod meta;
mod transaction;
mod types;
mod value;

pub use crate::btree::{BTreeEngine, BTreeTxn};
pub use crate::constants::{DbFlags, EnvFlags, WriteFlags, MAX_KEY_SIZE, PAGE_SIZE};
pub use crate::database::Database;
pub use crate::engine::{Engine, EngineConfig, EngineResult};
pub use crate::env::{Environment, MDB_VERSION};
pub use crate::error::{Error, ErrorCategory, Result};
pub use crate::meta::ReaderInfo;
pub use crate::transaction::{Transaction, TxnState};
pub use crate::types::{Dbi, EnvInfo, Stat};
pub use crate::value::Value;
