use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use log::{debug, warn};
use memmap2::{Mmap, MmapMut, MmapOptions};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use crate::btree::BTreeEngine;
use crate::constants::{
    EnvFlags, CHANGEABLE, DATA_NAME, DEFAULT_MAPSIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS,
    META_PAGES, PAGE_SIZE, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use crate::database::DbTable;
use crate::engine::{Engine, EngineConfig};
use crate::error::{Error, Result, EINVAL};
use crate::meta::{MetaHeader, ReaderInfo, ReaderTable};
use crate::transaction::Transaction;
use crate::types::EnvInfo;

/// Database version
pub const MDB_VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;

/// The memory map over the data file
enum MapRegion {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl MapRegion {
    fn len(&self) -> usize {
        match self {
            MapRegion::ReadOnly(map) => map.len(),
            MapRegion::Writable(map) => map.len(),
        }
    }
}

struct MapState {
    /// `None` once the environment is closed
    region: Option<MapRegion>,
    /// Most recently written meta header
    meta: MetaHeader,
}

/// State that exists only between `open` and `close`
struct Opened {
    path: PathBuf,
    data_path: PathBuf,
    map: Mutex<MapState>,
}

/// A memory-mapped storage environment.
///
/// Capacities are configured with the `set_*` methods and frozen by
/// [`Environment::open`]. An environment is opened at most once; after
/// [`Environment::close`] every transaction and database handle derived from
/// it fails with [`Error::NotOpen`].
///
/// The environment is shared between threads by reference. Transactions and
/// database handles borrow it and cannot outlive it.
pub struct Environment<E: Engine = BTreeEngine> {
    /// Configured map size in bytes
    map_size: usize,
    /// Maximum number of named databases
    max_dbs: u32,
    /// Maximum number of concurrent read transactions
    max_readers: u32,
    /// Environment flags
    flags: AtomicU32,
    opened: OnceCell<Opened>,
    closed: AtomicBool,
    /// Reader slots
    readers: Mutex<ReaderTable>,
    /// Database handle table
    pub(crate) dbs: RwLock<DbTable>,
    engine: E,
}

impl Environment {
    /// Create a closed environment backed by the reference [`BTreeEngine`]
    pub fn new() -> Self {
        Self::with_engine(BTreeEngine::new())
    }

    /// Get library version
    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Get library version in String format
    pub fn version_string() -> String {
        format!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Engine> Environment<E> {
    /// Create a closed environment on top of `engine`
    pub fn with_engine(engine: E) -> Self {
        Environment {
            map_size: DEFAULT_MAPSIZE,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
            flags: AtomicU32::new(0),
            opened: OnceCell::new(),
            closed: AtomicBool::new(false),
            readers: Mutex::new(ReaderTable::default()),
            dbs: RwLock::new(DbTable::default()),
            engine,
        }
    }

    /// Open the environment.
    ///
    /// Without [`EnvFlags::NOSUBDIR`], `path` must be an existing directory
    /// and the data lives in `path/data.mdb`. With it, `path` is the data
    /// file. `mode` holds the POSIX permission bits used when the file is
    /// created.
    pub fn open<P: AsRef<Path>>(&mut self, path: P, mode: u32, flags: EnvFlags) -> Result<()> {
        if self.opened.get().is_some() {
            return Err(Error::AlreadyOpen);
        }

        let path = path.as_ref();
        let read_only = flags.contains(EnvFlags::RDONLY);
        let data_path = if flags.contains(EnvFlags::NOSUBDIR) {
            path.to_path_buf()
        } else {
            path.join(DATA_NAME)
        };

        // Open data file
        let mut options = OpenOptions::new();
        options.read(true).write(!read_only).create(!read_only);
        #[cfg(unix)]
        options.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(&data_path)?;
        let file_len = file.metadata()?.len() as usize;

        let existing = if file_len == 0 {
            None
        } else {
            Some(read_meta_pages(&mut file, file_len)?)
        };

        let map_size = if read_only {
            if existing.is_none() {
                return Err(Error::Invalid);
            }
            file_len
        } else {
            let recorded = existing.map_or(0, |meta| meta.map_size as usize);
            round_to_page(
                self.map_size
                    .max(recorded)
                    .max(file_len)
                    .max(META_PAGES * PAGE_SIZE),
            )
            .ok_or_else(|| Error::from(EINVAL))?
        };

        if !read_only && file_len < map_size {
            file.set_len(map_size as u64)?;
        }

        // The map stays valid for as long as the region is held, and the
        // file is only resized through this environment
        let mut region = if read_only {
            MapRegion::ReadOnly(unsafe { MmapOptions::new().len(map_size).map(&file)? })
        } else {
            MapRegion::Writable(unsafe { MmapOptions::new().len(map_size).map_mut(&file)? })
        };

        let meta = match (existing, &mut region) {
            (Some(mut meta), _) => {
                meta.map_size = map_size as u64;
                meta
            }
            (None, MapRegion::Writable(map)) => {
                let meta = MetaHeader::new(map_size);
                meta.write_to(&mut map[..PAGE_SIZE]);
                meta.write_to(&mut map[PAGE_SIZE..META_PAGES * PAGE_SIZE]);
                map.flush_range(0, META_PAGES * PAGE_SIZE)?;
                meta
            }
            (None, MapRegion::ReadOnly(_)) => return Err(Error::Invalid),
        };

        self.engine
            .open(&EngineConfig {
                map_size,
                max_dbs: self.max_dbs,
                last_txnid: meta.last_txnid,
            })
            .map_err(Error::from)?;

        *self.readers.get_mut() = ReaderTable::new(self.max_readers);
        *self.dbs.get_mut() = DbTable::new(self.max_dbs);
        self.flags.store(flags.bits(), Ordering::SeqCst);

        let opened = Opened {
            path: path.to_path_buf(),
            data_path,
            map: Mutex::new(MapState {
                region: Some(region),
                meta,
            }),
        };
        self.opened.set(opened).map_err(|_| Error::AlreadyOpen)?;

        debug!(
            "opened environment at {} (map size {}, max dbs {}, max readers {}, last txn {})",
            path.display(),
            map_size,
            self.max_dbs,
            self.max_readers,
            meta.last_txnid
        );
        Ok(())
    }

    /// Close the environment and release the memory map.
    ///
    /// Closing an environment that is not open fails with `NotOpen`.
    /// Transactions still alive afterwards fail with `NotOpen` on next use.
    pub fn close(&self) -> Result<()> {
        let opened = self.opened()?;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::NotOpen);
        }

        self.engine.close();

        let flushed = {
            let mut state = opened.map.lock();
            let flushed = match &state.region {
                Some(MapRegion::Writable(map)) if !self.flags().contains(EnvFlags::NOSYNC) => {
                    map.flush()
                }
                _ => Ok(()),
            };
            state.region = None;
            flushed
        };

        self.readers.lock().clear();
        self.dbs.write().clear();

        debug!("closed environment at {}", opened.path.display());
        flushed.map_err(Error::from)
    }

    /// Flush the memory map to disk.
    ///
    /// With `force` the flush is synchronous even when the environment was
    /// opened with `NOSYNC` or `MAPASYNC`. Not valid on read-only environments.
    pub fn sync(&self, force: bool) -> Result<()> {
        let opened = self.opened()?;
        let flags = self.flags();
        if flags.contains(EnvFlags::RDONLY) {
            return Err(Error::ReadOnly);
        }

        let state = opened.map.lock();
        let map = match &state.region {
            Some(MapRegion::Writable(map)) => map,
            Some(MapRegion::ReadOnly(_)) => return Err(Error::ReadOnly),
            None => return Err(Error::NotOpen),
        };

        if force {
            map.flush()?;
        } else if flags.contains(EnvFlags::NOSYNC) {
            return Ok(());
        } else if flags.contains(EnvFlags::MAPASYNC) {
            map.flush_async()?;
        } else {
            map.flush()?;
        }
        Ok(())
    }

    /// Set the size of the memory map. Must be called before `open`.
    pub fn set_map_size(&mut self, size: usize) -> Result<()> {
        if self.opened.get().is_some() {
            return Err(Error::AlreadyOpen);
        }
        self.map_size = size;
        Ok(())
    }

    /// Set the maximum number of named databases. Must be called before `open`.
    ///
    /// The unnamed default database is always available and does not count
    /// against this limit.
    pub fn set_max_dbs(&mut self, dbs: u32) -> Result<()> {
        if self.opened.get().is_some() {
            return Err(Error::AlreadyOpen);
        }
        self.max_dbs = dbs;
        Ok(())
    }

    /// Set the maximum number of concurrent read transactions. Must be called
    /// before `open`.
    pub fn set_max_readers(&mut self, readers: u32) -> Result<()> {
        if self.opened.get().is_some() {
            return Err(Error::AlreadyOpen);
        }
        if readers == 0 {
            return Err(Error::from(EINVAL));
        }
        self.max_readers = readers;
        Ok(())
    }

    /// Size of the memory map; the effective size once open
    pub fn map_size(&self) -> usize {
        match self.opened() {
            Ok(opened) => opened.map.lock().meta.map_size as usize,
            Err(_) => self.map_size,
        }
    }

    pub fn max_dbs(&self) -> u32 {
        self.max_dbs
    }

    pub fn max_readers(&self) -> u32 {
        self.max_readers
    }

    /// Set or clear flags on an open environment.
    ///
    /// Only `NOSYNC`, `NOMETASYNC` and `MAPASYNC` can be changed after open.
    pub fn set_flags(&self, flags: EnvFlags, onoff: bool) -> Result<()> {
        self.check_open()?;
        if !CHANGEABLE.contains(flags) {
            return Err(Error::from(EINVAL));
        }

        if onoff {
            self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn flags(&self) -> EnvFlags {
        EnvFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Get the path that was used in `open`
    pub fn path(&self) -> Result<&Path> {
        Ok(&self.opened()?.path)
    }

    /// Path of the data file
    pub fn data_path(&self) -> Result<&Path> {
        Ok(&self.opened()?.data_path)
    }

    pub fn is_open(&self) -> bool {
        self.opened().is_ok()
    }

    pub fn is_read_only(&self) -> bool {
        self.flags().contains(EnvFlags::RDONLY)
    }

    /// Get environment information
    pub fn info(&self) -> Result<EnvInfo> {
        let opened = self.opened()?;
        let (map_size, last_txnid) = {
            let state = opened.map.lock();
            (
                state.region.as_ref().map_or(0, MapRegion::len),
                state.meta.last_txnid,
            )
        };

        Ok(EnvInfo {
            map_size,
            last_txnid,
            max_readers: self.max_readers,
            num_readers: self.readers.lock().active() as u32,
            max_dbs: self.max_dbs,
            num_dbs: self.dbs.read().named_count() as u32,
        })
    }

    /// Active read transactions
    pub fn reader_list(&self) -> Result<Vec<ReaderInfo>> {
        self.check_open()?;
        Ok(self.readers.lock().list())
    }

    /// Begin a new write transaction, blocking while another one is active
    pub fn begin_txn(&self) -> Result<Transaction<'_, E>> {
        Transaction::begin(self, false)
    }

    /// Begin a new read-only transaction
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_, E>> {
        Transaction::begin(self, true)
    }

    /// Run `f` inside a write transaction.
    ///
    /// The transaction is committed if `f` returns `Ok` and aborted if it
    /// returns `Err` or panics; the error from `f` is returned unchanged.
    pub fn write<'env, T, F>(&'env self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'env, E>) -> Result<T>,
    {
        let txn = self.begin_txn()?;
        Transaction::run(txn, f)
    }

    /// Run `f` inside a read-only transaction
    pub fn read<'env, T, F>(&'env self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'env, E>) -> Result<T>,
    {
        let txn = self.begin_ro_txn()?;
        Transaction::run(txn, f)
    }

    pub(crate) fn engine(&self) -> &E {
        &self.engine
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        self.opened().map(|_| ())
    }

    fn opened(&self) -> Result<&Opened> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotOpen);
        }
        self.opened.get().ok_or(Error::NotOpen)
    }

    /// Claim a reader slot
    pub(crate) fn acquire_reader(&self) -> Result<usize> {
        self.check_open()?;
        self.readers.lock().acquire()
    }

    pub(crate) fn set_reader_txn(&self, slot: usize, txn_id: u64) {
        self.readers.lock().set_txn_id(slot, txn_id);
    }

    pub(crate) fn release_reader(&self, slot: usize) {
        self.readers.lock().release(slot);
    }

    /// Record a committed write transaction in the alternate meta page
    pub(crate) fn record_commit(&self, txnid: u64) -> Result<()> {
        let opened = self.opened()?;
        let flags = self.flags();

        let mut state = opened.map.lock();
        // Commits can reach this point out of order once the writer lock is
        // released; never move the recorded txnid backwards
        if txnid <= state.meta.last_txnid {
            return Ok(());
        }

        let mut meta = state.meta;
        meta.last_txnid = txnid;
        let offset = MetaHeader::page_offset(txnid);

        let map = match state.region.as_mut() {
            Some(MapRegion::Writable(map)) => map,
            Some(MapRegion::ReadOnly(_)) => return Err(Error::ReadOnly),
            None => return Err(Error::NotOpen),
        };
        meta.write_to(&mut map[offset..offset + PAGE_SIZE]);

        if !flags.intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC) {
            if flags.contains(EnvFlags::MAPASYNC) {
                map.flush_async_range(offset, PAGE_SIZE)?;
            } else {
                map.flush_range(offset, PAGE_SIZE)?;
            }
        }

        state.meta = meta;
        Ok(())
    }
}

impl<E: Engine> fmt::Debug for Environment<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.opened.get().map(|opened| &opened.path))
            .field("open", &self.is_open())
            .field("flags", &self.flags())
            .field("map_size", &self.map_size)
            .field("max_dbs", &self.max_dbs)
            .field("max_readers", &self.max_readers)
            .finish()
    }
}

impl<E: Engine> Drop for Environment<E> {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                warn!("failed to close environment: {}", err);
            }
        }
    }
}

/// Read and validate the meta pages of an existing data file
fn read_meta_pages(file: &mut File, file_len: usize) -> Result<MetaHeader> {
    if file_len < META_PAGES * PAGE_SIZE {
        return Err(Error::Invalid);
    }

    let mut pages = vec![0u8; META_PAGES * PAGE_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut pages)?;
    MetaHeader::latest(&pages)
}

/// `None` when rounding up overflows
fn round_to_page(size: usize) -> Option<usize> {
    size.checked_add(PAGE_SIZE - 1)
        .map(|size| size & !(PAGE_SIZE - 1))
}
