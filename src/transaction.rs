use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::btree::BTreeEngine;
use crate::constants::DbFlags;
use crate::database::Database;
use crate::engine::{Engine, EngineResult};
use crate::env::Environment;
use crate::error::{Error, Result};

/// Source of transaction tree identifiers
static NEXT_TREE: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// One level of the scope stack
#[derive(Debug)]
struct Frame {
    /// Distinguishes this frame from a later one at the same depth
    id: u64,
    /// Handle table slots registered while this frame was innermost
    opened: Vec<usize>,
}

/// Scope stack shared by a top-level transaction and all of its descendants
struct Scopes<E: Engine> {
    /// `None` once the top-level transaction finished
    native: Option<E::Txn>,
    frames: Vec<Frame>,
    next_id: u64,
    /// Owner tag for handle registrations not yet committed
    tree: u64,
}

/// Database transaction.
///
/// Obtained from [`Environment::begin_txn`], [`Environment::begin_ro_txn`] or
/// [`Transaction::begin_nested`]. A transaction ends with exactly one call to
/// [`Transaction::commit`] or [`Transaction::abort`]; every later call fails
/// with [`Error::AlreadyCommitted`] or [`Error::AlreadyAborted`]. Dropping an
/// active transaction aborts it.
///
/// A transaction may be sent to another thread but must only be used by one
/// thread at a time.
pub struct Transaction<'env, E: Engine = BTreeEngine> {
    /// Reference to environment
    env: &'env Environment<E>,
    scopes: Arc<Mutex<Scopes<E>>>,
    /// Index of this transaction's frame; 0 for top-level
    depth: usize,
    frame_id: u64,
    read_only: bool,
    state: TxnState,
    /// Transaction ID
    id: u64,
    /// Reader slot held by read-only transactions
    reader_slot: Option<usize>,
}

impl<'env, E: Engine> Transaction<'env, E> {
    pub(crate) fn begin(env: &'env Environment<E>, read_only: bool) -> Result<Self> {
        env.check_open()?;
        if !read_only && env.is_read_only() {
            return Err(Error::ReadOnly);
        }

        let reader_slot = if read_only {
            Some(env.acquire_reader()?)
        } else {
            None
        };

        // Blocks here while another write transaction is active
        let native = match env.engine().begin_txn(read_only) {
            Ok(native) => native,
            Err(code) => {
                if let Some(slot) = reader_slot {
                    env.release_reader(slot);
                }
                // a writer that was waiting when the environment closed
                env.check_open()?;
                return Err(Error::from(code));
            }
        };

        let id = env.engine().txn_id(&native);
        if let Some(slot) = reader_slot {
            env.set_reader_txn(slot, id);
        }

        trace!(
            "began {} transaction {}",
            if read_only { "read-only" } else { "write" },
            id
        );

        Ok(Transaction {
            env,
            scopes: Arc::new(Mutex::new(Scopes {
                native: Some(native),
                frames: vec![Frame {
                    id: 0,
                    opened: Vec::new(),
                }],
                next_id: 1,
                tree: NEXT_TREE.fetch_add(1, Ordering::Relaxed),
            })),
            depth: 0,
            frame_id: 0,
            read_only,
            state: TxnState::Active,
            id,
            reader_slot,
        })
    }

    /// Begin a child write transaction.
    ///
    /// The parent cannot be used until the child commits or aborts. Committing
    /// the child merges its changes into the parent; aborting it discards only
    /// the child's changes.
    pub fn begin_nested(&self) -> Result<Transaction<'env, E>> {
        let mut scopes = self.scopes.lock();
        self.check(&scopes)?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let native = scopes.native.as_mut().ok_or(Error::BadTxn)?;
        self.env.engine().begin_nested(native).map_err(Error::from)?;

        let frame_id = scopes.next_id;
        scopes.next_id += 1;
        scopes.frames.push(Frame {
            id: frame_id,
            opened: Vec::new(),
        });

        trace!(
            "began nested transaction {} at depth {}",
            self.id,
            self.depth + 1
        );

        Ok(Transaction {
            env: self.env,
            scopes: Arc::clone(&self.scopes),
            depth: self.depth + 1,
            frame_id,
            read_only: false,
            state: TxnState::Active,
            id: self.id,
            reader_slot: None,
        })
    }

    /// Open a database by name, or the unnamed default database with `None`.
    ///
    /// A name already registered in the environment returns the registered
    /// handle. A new name needs [`DbFlags::CREATE`] and a write transaction
    /// unless the database already exists; otherwise this fails with
    /// [`Error::NotFound`].
    ///
    /// A database created by a write transaction stays private to that
    /// transaction and its children until the top-level commit.
    pub fn open_database(&self, name: Option<&str>, flags: DbFlags) -> Result<Database<'env, E>> {
        let mut scopes = self.scopes.lock();
        self.check(&scopes)?;
        let tree = scopes.tree;

        if let Some((slot, dbi)) = self.env.dbs.read().find(name, tree) {
            return Ok(Database::new(self.env, slot, dbi));
        }

        // Another transaction may have registered the name in between
        let mut table = self.env.dbs.write();
        if let Some((slot, dbi)) = table.find(name, tree) {
            return Ok(Database::new(self.env, slot, dbi));
        }
        // Slots pending for a writer may fill the table; a reader can only
        // find names that are already counted by the engine
        if name.is_some() && !self.read_only && table.is_full() {
            return Err(Error::DbsFull);
        }

        let Scopes { native, frames, .. } = &mut *scopes;
        let native = native.as_mut().ok_or(Error::BadTxn)?;
        let dbi = self
            .env
            .engine()
            .open_db(native, name, flags)
            .map_err(Error::from)?;

        // Committed by its creator but not yet settled
        if let Some(slot) = table.find_dbi(name, dbi) {
            return Ok(Database::new(self.env, slot, dbi));
        }

        // Rolled back with the write scope that created it
        let tracked = name.is_some() && !self.read_only;
        let slot = table.insert(name, dbi, flags, tracked.then_some(tree));
        if tracked {
            if let Some(frame) = frames.get_mut(self.depth) {
                frame.opened.push(slot);
            }
        }

        debug!(
            "registered database {} as dbi {} in slot {}",
            name.unwrap_or("<main>"),
            dbi,
            slot
        );
        Ok(Database::new(self.env, slot, dbi))
    }

    /// Commit the transaction.
    ///
    /// A top-level commit makes all changes visible to transactions that
    /// begin afterwards. A nested commit hands the changes to the parent.
    /// If the engine rejects the commit, the transaction ends aborted and the
    /// engine error is returned.
    pub fn commit(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.scopes);
        let mut scopes = shared.lock();
        self.check(&scopes)?;

        let engine = self.env.engine();
        let Scopes { native, frames, .. } = &mut *scopes;
        let result = match native.as_mut() {
            Some(native) => engine.commit_txn(native),
            None => return Err(Error::BadTxn),
        };

        let frame = frames.pop();
        if self.depth == 0 {
            *native = None;
        }

        if let Err(code) = result {
            let err = Error::from(code);
            warn!("commit of transaction {} failed: {}", self.id, err);
            if let Some(frame) = frame {
                self.forget(frame.opened);
            }
            self.finish(TxnState::Aborted);
            return Err(err);
        }

        if let Some(frame) = frame {
            match frames.last_mut() {
                Some(parent) => parent.opened.extend(frame.opened),
                None => self.settle(frame.opened),
            }
        }
        drop(scopes);

        self.finish(TxnState::Committed);
        trace!("committed transaction {} at depth {}", self.id, self.depth);

        if self.depth == 0 && !self.read_only {
            self.env.record_commit(self.id)?;
        }
        Ok(())
    }

    /// Abort the transaction, discarding its changes and those of any active
    /// child transactions.
    pub fn abort(&mut self) -> Result<()> {
        let mut scopes = self.scopes.lock();
        self.env.check_open()?;
        self.check_state(&scopes)?;

        self.unwind(&mut scopes);
        drop(scopes);

        self.finish(TxnState::Aborted);
        trace!("aborted transaction {} at depth {}", self.id, self.depth);
        Ok(())
    }

    /// Transaction ID; nested transactions share their parent's ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn env(&self) -> &'env Environment<E> {
        self.env
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Nesting depth; 0 for a top-level transaction
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Current state. A child whose parent was aborted reports `Aborted`.
    pub fn state(&self) -> TxnState {
        if self.state == TxnState::Active && !self.scope_alive(&self.scopes.lock()) {
            return TxnState::Aborted;
        }
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// Check that the environment is open and this transaction may be used
    pub(crate) fn validate(&self) -> Result<()> {
        self.check(&self.scopes.lock())
    }

    /// Run an engine call against the native transaction after validation
    pub(crate) fn with_native<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&E, &mut E::Txn) -> EngineResult<T>,
    {
        let mut scopes = self.scopes.lock();
        self.check(&scopes)?;
        let native = scopes.native.as_mut().ok_or(Error::BadTxn)?;
        f(self.env.engine(), native).map_err(Error::from)
    }

    /// Run `f` and finish the transaction: commit on `Ok`, abort on `Err`.
    /// If `f` panics the transaction is aborted when dropped.
    pub(crate) fn run<T, F>(mut txn: Self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        match f(&mut txn) {
            Ok(value) => {
                if txn.state == TxnState::Active {
                    txn.commit()?;
                }
                Ok(value)
            }
            Err(err) => {
                if txn.state == TxnState::Active {
                    if let Err(abort_err) = txn.abort() {
                        warn!("failed to abort transaction {}: {}", txn.id, abort_err);
                    }
                }
                Err(err)
            }
        }
    }

    fn check(&self, scopes: &Scopes<E>) -> Result<()> {
        self.env.check_open()?;
        self.check_state(scopes)?;
        if scopes.frames.len() > self.depth + 1 {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    fn check_state(&self, scopes: &Scopes<E>) -> Result<()> {
        match self.state {
            TxnState::Committed => Err(Error::AlreadyCommitted),
            TxnState::Aborted => Err(Error::AlreadyAborted),
            // An ancestor was aborted and took this scope with it
            TxnState::Active if !self.scope_alive(scopes) => Err(Error::AlreadyAborted),
            TxnState::Active => Ok(()),
        }
    }

    fn scope_alive(&self, scopes: &Scopes<E>) -> bool {
        scopes
            .frames
            .get(self.depth)
            .map_or(false, |frame| frame.id == self.frame_id)
    }

    /// Abort every scope from the innermost down to this transaction's own
    fn unwind(&self, scopes: &mut Scopes<E>) {
        let engine = self.env.engine();
        while scopes.frames.len() > self.depth {
            if let Some(native) = scopes.native.as_mut() {
                engine.abort_txn(native);
            }
            if let Some(frame) = scopes.frames.pop() {
                self.forget(frame.opened);
            }
        }
        if self.depth == 0 {
            scopes.native = None;
        }
    }

    /// Unregister handles created by a discarded scope
    fn forget(&self, slots: Vec<usize>) {
        if slots.is_empty() {
            return;
        }
        let mut table = self.env.dbs.write();
        for slot in slots {
            table.remove(slot);
        }
    }

    /// Publish handles registered by a committed top-level transaction
    fn settle(&self, slots: Vec<usize>) {
        if slots.is_empty() {
            return;
        }
        let mut table = self.env.dbs.write();
        for slot in slots {
            table.settle(slot);
        }
    }

    fn finish(&mut self, state: TxnState) {
        self.state = state;
        if let Some(slot) = self.reader_slot.take() {
            self.env.release_reader(slot);
        }
    }
}

impl<E: Engine> fmt::Debug for Transaction<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("depth", &self.depth)
            .field("read_only", &self.read_only)
            .field("state", &self.state)
            .finish()
    }
}

impl<E: Engine> Drop for Transaction<'_, E> {
    fn drop(&mut self) {
        if self.state != TxnState::Active {
            return;
        }

        {
            let mut scopes = self.scopes.lock();
            if self.scope_alive(&scopes) {
                self.unwind(&mut scopes);
                trace!("aborted transaction {} on drop", self.id);
            }
        }
        self.finish(TxnState::Aborted);
    }
}
