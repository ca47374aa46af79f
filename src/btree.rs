//! Reference engine: ordered in-memory trees with copy-on-write snapshots.
//!
//! Committed state lives in an immutable [`Snapshot`] behind an `Arc`. Readers
//! clone the `Arc` and never block. The single writer records its mutations in
//! a stack of scopes and folds them into a fresh snapshot on commit; trees
//! that no reader still holds are updated in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::trace;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::constants::{
    DbFlags, WriteFlags, CORE_DBS, MAIN_DBI, MAX_KEY_SIZE, META_PAGES, NODE_OVERHEAD, PAGE_SIZE,
};
use crate::engine::{Engine, EngineConfig, EngineResult};
use crate::error::{
    EACCES, EINVAL, MDB_BAD_DBI, MDB_BAD_TXN, MDB_BAD_VALSIZE, MDB_DBS_FULL, MDB_KEYEXIST,
    MDB_MAP_FULL, MDB_NOTFOUND,
};
use crate::types::Dbi;

type Tree = BTreeMap<Vec<u8>, Arc<[u8]>>;

/// Space an entry is charged against the map size
fn entry_size(key_len: usize, value_len: usize) -> usize {
    NODE_OVERHEAD + key_len + value_len
}

/// Committed state visible to transactions that begin after it
#[derive(Debug, Clone)]
struct Snapshot {
    txnid: u64,
    /// Named databases
    catalog: BTreeMap<String, Dbi>,
    trees: HashMap<Dbi, Arc<Tree>>,
    /// Bytes charged against the map size
    used: usize,
}

impl Snapshot {
    fn new(txnid: u64) -> Self {
        let mut trees = HashMap::new();
        trees.insert(MAIN_DBI, Arc::default());
        Snapshot {
            txnid,
            catalog: BTreeMap::new(),
            trees,
            used: 0,
        }
    }
}

/// Pending mutations of one transaction level
#[derive(Debug, Default)]
struct Scope {
    created: BTreeMap<String, Dbi>,
    /// `None` marks a deleted key
    writes: HashMap<Dbi, BTreeMap<Vec<u8>, Option<Arc<[u8]>>>>,
    growth: isize,
}

impl Scope {
    fn merge(&mut self, child: Scope) {
        self.created.extend(child.created);
        for (dbi, writes) in child.writes {
            self.writes.entry(dbi).or_default().extend(writes);
        }
        self.growth += child.growth;
    }
}

/// Native transaction of [`BTreeEngine`]
#[derive(Debug)]
pub struct BTreeTxn {
    read_only: bool,
    txnid: u64,
    /// `None` once the transaction is finished
    base: Option<Arc<Snapshot>>,
    /// Empty for readers; index 0 is the top-level scope
    scopes: Vec<Scope>,
}

impl BTreeTxn {
    fn base(&self) -> EngineResult<&Snapshot> {
        self.base.as_deref().ok_or(MDB_BAD_TXN)
    }

    fn top(&mut self) -> EngineResult<&mut Scope> {
        self.scopes.last_mut().ok_or(MDB_BAD_TXN)
    }

    fn lookup(&self, dbi: Dbi, key: &[u8]) -> EngineResult<Option<&Arc<[u8]>>> {
        let base = self.base()?;
        for scope in self.scopes.iter().rev() {
            if let Some(entry) = scope.writes.get(&dbi).and_then(|writes| writes.get(key)) {
                return Ok(entry.as_ref());
            }
        }
        Ok(base.trees.get(&dbi).and_then(|tree| tree.get(key)))
    }

    fn knows(&self, dbi: Dbi) -> EngineResult<bool> {
        let base = self.base()?;
        Ok(base.trees.contains_key(&dbi)
            || self
                .scopes
                .iter()
                .any(|scope| scope.created.values().any(|created| *created == dbi)))
    }

    fn find_db(&self, name: &str) -> Option<Dbi> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.created.get(name).copied())
            .or_else(|| self.base.as_ref()?.catalog.get(name).copied())
    }

    fn named_dbs(&self) -> usize {
        let committed = self.base.as_ref().map_or(0, |base| base.catalog.len());
        committed + self.scopes.iter().map(|scope| scope.created.len()).sum::<usize>()
    }

    fn growth(&self) -> isize {
        self.scopes.iter().map(|scope| scope.growth).sum()
    }
}

/// In-process [`Engine`] backed by ordered trees
#[derive(Debug)]
pub struct BTreeEngine {
    config: OnceCell<EngineConfig>,
    current: RwLock<Arc<Snapshot>>,
    /// Whether a write transaction is active
    writer: Mutex<bool>,
    writer_released: Condvar,
    next_dbi: AtomicU32,
    closed: AtomicBool,
}

impl BTreeEngine {
    pub fn new() -> Self {
        BTreeEngine {
            config: OnceCell::new(),
            current: RwLock::new(Arc::new(Snapshot::new(0))),
            writer: Mutex::new(false),
            writer_released: Condvar::new(),
            next_dbi: AtomicU32::new(CORE_DBS),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Bytes available for entries once the meta pages are accounted for
    fn capacity(&self) -> usize {
        self.config
            .get()
            .map_or(0, |config| config.map_size.saturating_sub(META_PAGES * PAGE_SIZE))
    }

    fn acquire_writer(&self) -> EngineResult<()> {
        let mut busy = self.writer.lock();
        while *busy {
            if self.is_closed() {
                return Err(EINVAL);
            }
            self.writer_released.wait(&mut busy);
        }
        if self.is_closed() {
            return Err(EINVAL);
        }
        *busy = true;
        Ok(())
    }

    fn release_writer(&self) {
        *self.writer.lock() = false;
        self.writer_released.notify_one();
    }

    fn publish(&self, scope: Scope, txnid: u64) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EINVAL);
        }

        let mut current = self.current.write();
        let snapshot = Arc::make_mut(&mut *current);

        for (name, dbi) in scope.created {
            snapshot.catalog.insert(name, dbi);
            snapshot.trees.entry(dbi).or_default();
        }

        for (dbi, writes) in scope.writes {
            let tree = Arc::make_mut(snapshot.trees.entry(dbi).or_default());
            for (key, value) in writes {
                match value {
                    Some(value) => {
                        tree.insert(key, value);
                    }
                    None => {
                        tree.remove(&key);
                    }
                }
            }
        }

        snapshot.used = (snapshot.used as isize + scope.growth).max(0) as usize;
        snapshot.txnid = txnid;
        trace!("published txn {} ({} bytes used)", txnid, snapshot.used);
        Ok(())
    }
}

impl Default for BTreeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for BTreeEngine {
    type Txn = BTreeTxn;

    fn open(&self, config: &EngineConfig) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EINVAL);
        }
        self.config.set(*config).map_err(|_| EINVAL)?;
        *self.current.write() = Arc::new(Snapshot::new(config.last_txnid));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _busy = self.writer.lock();
        self.writer_released.notify_all();
    }

    fn begin_txn(&self, read_only: bool) -> EngineResult<BTreeTxn> {
        if self.is_closed() || self.config.get().is_none() {
            return Err(EINVAL);
        }

        if read_only {
            let base = Arc::clone(&*self.current.read());
            return Ok(BTreeTxn {
                read_only,
                txnid: base.txnid,
                base: Some(base),
                scopes: Vec::new(),
            });
        }

        self.acquire_writer()?;
        let base = Arc::clone(&*self.current.read());
        Ok(BTreeTxn {
            read_only,
            txnid: base.txnid + 1,
            base: Some(base),
            scopes: vec![Scope::default()],
        })
    }

    fn begin_nested(&self, txn: &mut BTreeTxn) -> EngineResult<()> {
        txn.base()?;
        if txn.read_only {
            return Err(EINVAL);
        }
        txn.scopes.push(Scope::default());
        Ok(())
    }

    fn commit_txn(&self, txn: &mut BTreeTxn) -> EngineResult<()> {
        txn.base()?;
        if txn.read_only {
            txn.base = None;
            return Ok(());
        }

        let scope = txn.scopes.pop().ok_or(MDB_BAD_TXN)?;
        if let Some(parent) = txn.scopes.last_mut() {
            parent.merge(scope);
            return Ok(());
        }

        // Drop our snapshot reference first so unshared trees update in place
        txn.base = None;
        let result = self.publish(scope, txn.txnid);
        self.release_writer();
        result
    }

    fn abort_txn(&self, txn: &mut BTreeTxn) {
        if txn.base.is_none() {
            return;
        }
        if txn.read_only {
            txn.base = None;
            return;
        }

        txn.scopes.pop();
        if txn.scopes.is_empty() {
            txn.base = None;
            self.release_writer();
        }
    }

    fn txn_id(&self, txn: &BTreeTxn) -> u64 {
        txn.txnid
    }

    fn open_db(&self, txn: &mut BTreeTxn, name: Option<&str>, flags: DbFlags) -> EngineResult<Dbi> {
        txn.base()?;
        let name = match name {
            Some(name) => name,
            None => return Ok(MAIN_DBI),
        };

        if let Some(dbi) = txn.find_db(name) {
            return Ok(dbi);
        }
        if txn.read_only || !flags.contains(DbFlags::CREATE) {
            return Err(MDB_NOTFOUND);
        }
        if name.is_empty() || name.len() > MAX_KEY_SIZE {
            return Err(MDB_BAD_VALSIZE);
        }

        let max_dbs = self.config.get().map_or(0, |config| config.max_dbs as usize);
        if txn.named_dbs() >= max_dbs {
            return Err(MDB_DBS_FULL);
        }

        let dbi = self.next_dbi.fetch_add(1, Ordering::SeqCst);
        txn.top()?.created.insert(name.to_owned(), dbi);
        Ok(dbi)
    }

    fn get(&self, txn: &BTreeTxn, dbi: Dbi, key: &[u8]) -> EngineResult<Arc<[u8]>> {
        if !txn.knows(dbi)? {
            return Err(MDB_BAD_DBI);
        }
        txn.lookup(dbi, key)?.cloned().ok_or(MDB_NOTFOUND)
    }

    fn put(
        &self,
        txn: &mut BTreeTxn,
        dbi: Dbi,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> EngineResult<()> {
        if txn.read_only {
            return Err(EACCES);
        }
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Err(MDB_BAD_VALSIZE);
        }
        if !txn.knows(dbi)? {
            return Err(MDB_BAD_DBI);
        }

        let existing = txn.lookup(dbi, key)?.map(|value| value.len());
        if existing.is_some() && flags.contains(WriteFlags::NOOVERWRITE) {
            return Err(MDB_KEYEXIST);
        }

        let added = entry_size(key.len(), value.len()) as isize;
        let removed = existing.map_or(0, |len| entry_size(key.len(), len)) as isize;
        let delta = added - removed;
        let used = txn.base()?.used as isize + txn.growth() + delta;
        if used > self.capacity() as isize {
            return Err(MDB_MAP_FULL);
        }

        let top = txn.top()?;
        top.writes
            .entry(dbi)
            .or_default()
            .insert(key.to_vec(), Some(Arc::from(value)));
        top.growth += delta;
        Ok(())
    }

    fn delete(&self, txn: &mut BTreeTxn, dbi: Dbi, key: &[u8]) -> EngineResult<()> {
        if txn.read_only {
            return Err(EACCES);
        }
        if !txn.knows(dbi)? {
            return Err(MDB_BAD_DBI);
        }

        let existing = txn.lookup(dbi, key)?.map(|value| value.len()).ok_or(MDB_NOTFOUND)?;

        let top = txn.top()?;
        top.writes.entry(dbi).or_default().insert(key.to_vec(), None);
        top.growth -= entry_size(key.len(), existing) as isize;
        Ok(())
    }

    fn entries(&self, txn: &BTreeTxn, dbi: Dbi) -> EngineResult<usize> {
        if !txn.knows(dbi)? {
            return Err(MDB_BAD_DBI);
        }
        let tree = txn.base()?.trees.get(&dbi);

        let mut overlay: BTreeMap<&[u8], bool> = BTreeMap::new();
        for scope in &txn.scopes {
            if let Some(writes) = scope.writes.get(&dbi) {
                for (key, value) in writes {
                    overlay.insert(key.as_slice(), value.is_some());
                }
            }
        }

        let mut count = tree.map_or(0, |tree| tree.len());
        for (key, present) in overlay {
            let committed = tree.map_or(false, |tree| tree.contains_key(key));
            match (committed, present) {
                (false, true) => count += 1,
                (true, false) => count -= 1,
                _ => {}
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(map_size: usize, max_dbs: u32) -> BTreeEngine {
        let engine = BTreeEngine::new();
        engine
            .open(&EngineConfig {
                map_size,
                max_dbs,
                last_txnid: 0,
            })
            .unwrap();
        engine
    }

    #[test]
    fn nested_scopes_merge_one_level() {
        let engine = engine(1 << 20, 0);
        let mut txn = engine.begin_txn(false).unwrap();
        engine.put(&mut txn, MAIN_DBI, b"a", b"1", WriteFlags::empty()).unwrap();

        engine.begin_nested(&mut txn).unwrap();
        engine.put(&mut txn, MAIN_DBI, b"b", b"2", WriteFlags::empty()).unwrap();
        engine.delete(&mut txn, MAIN_DBI, b"a").unwrap();
        assert_eq!(engine.get(&txn, MAIN_DBI, b"a"), Err(MDB_NOTFOUND));
        engine.abort_txn(&mut txn);

        assert_eq!(&*engine.get(&txn, MAIN_DBI, b"a").unwrap(), b"1");
        assert_eq!(engine.get(&txn, MAIN_DBI, b"b"), Err(MDB_NOTFOUND));

        engine.begin_nested(&mut txn).unwrap();
        engine.put(&mut txn, MAIN_DBI, b"c", b"3", WriteFlags::empty()).unwrap();
        engine.commit_txn(&mut txn).unwrap();
        assert_eq!(engine.entries(&txn, MAIN_DBI), Ok(2));

        engine.commit_txn(&mut txn).unwrap();

        let reader = engine.begin_txn(true).unwrap();
        assert_eq!(engine.txn_id(&reader), 1);
        assert_eq!(&*engine.get(&reader, MAIN_DBI, b"c").unwrap(), b"3");
        assert_eq!(engine.entries(&reader, MAIN_DBI), Ok(2));
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let engine = engine(1 << 20, 0);
        let reader = engine.begin_txn(true).unwrap();

        let mut txn = engine.begin_txn(false).unwrap();
        engine.put(&mut txn, MAIN_DBI, b"k", b"v", WriteFlags::empty()).unwrap();
        engine.commit_txn(&mut txn).unwrap();

        assert_eq!(engine.get(&reader, MAIN_DBI, b"k"), Err(MDB_NOTFOUND));
        let later = engine.begin_txn(true).unwrap();
        assert_eq!(&*engine.get(&later, MAIN_DBI, b"k").unwrap(), b"v");
    }

    #[test]
    fn map_size_is_enforced() {
        let engine = engine(META_PAGES * PAGE_SIZE + 64, 0);
        let mut txn = engine.begin_txn(false).unwrap();
        engine.put(&mut txn, MAIN_DBI, b"k", &[0u8; 32], WriteFlags::empty()).unwrap();
        assert_eq!(
            engine.put(&mut txn, MAIN_DBI, b"j", &[0u8; 32], WriteFlags::empty()),
            Err(MDB_MAP_FULL)
        );
        // overwriting with a smaller value frees space
        engine.put(&mut txn, MAIN_DBI, b"k", &[0u8; 4], WriteFlags::empty()).unwrap();
        engine.put(&mut txn, MAIN_DBI, b"j", &[0u8; 4], WriteFlags::empty()).unwrap();
    }

    #[test]
    fn named_databases() {
        let engine = engine(1 << 20, 1);
        let mut txn = engine.begin_txn(false).unwrap();
        assert_eq!(engine.open_db(&mut txn, Some("a"), DbFlags::empty()), Err(MDB_NOTFOUND));

        let dbi = engine.open_db(&mut txn, Some("a"), DbFlags::CREATE).unwrap();
        assert_eq!(engine.open_db(&mut txn, Some("a"), DbFlags::empty()), Ok(dbi));
        assert_eq!(engine.open_db(&mut txn, Some("b"), DbFlags::CREATE), Err(MDB_DBS_FULL));
        engine.abort_txn(&mut txn);

        let mut reader = engine.begin_txn(true).unwrap();
        assert_eq!(engine.open_db(&mut reader, Some("a"), DbFlags::CREATE), Err(MDB_NOTFOUND));
        assert_eq!(engine.get(&reader, dbi, b"k"), Err(MDB_BAD_DBI));
    }

    #[test]
    fn finished_txns_are_rejected() {
        let engine = engine(1 << 20, 0);
        let mut txn = engine.begin_txn(false).unwrap();
        engine.commit_txn(&mut txn).unwrap();
        assert_eq!(engine.get(&txn, MAIN_DBI, b"k"), Err(MDB_BAD_TXN));
        assert_eq!(engine.commit_txn(&mut txn), Err(MDB_BAD_TXN));

        // the writer slot was released by the commit
        let mut next = engine.begin_txn(false).unwrap();
        engine.abort_txn(&mut next);
    }
}
