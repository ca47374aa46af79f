use std::thread::{self, ThreadId};

use crate::constants::{DATA_VERSION, MDB_MAGIC, META_PAGES, PAGE_SIZE};
use crate::error::{Error, Result};

// Byte offsets inside a meta page
const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const PSIZE_OFFSET: usize = 8;
const MAPSIZE_OFFSET: usize = 16;
const TXNID_OFFSET: usize = 24;
const META_LEN: usize = 32;

/// Meta header stored at the start of each of the two meta pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaHeader {
    /// Magic number identifying an environment file
    pub(crate) magic: u32,
    /// Data format version
    pub(crate) version: u32,
    /// Page size the file was created with
    pub(crate) page_size: u32,
    /// Size of mmap region
    pub(crate) map_size: u64,
    /// txnid that committed this page
    pub(crate) last_txnid: u64,
}

impl MetaHeader {
    pub(crate) fn new(map_size: usize) -> Self {
        MetaHeader {
            magic: MDB_MAGIC,
            version: DATA_VERSION,
            page_size: PAGE_SIZE as u32,
            map_size: map_size as u64,
            last_txnid: 0,
        }
    }

    /// Write this header into the start of `page`
    pub(crate) fn write_to(&self, page: &mut [u8]) {
        page[..META_LEN].fill(0);
        page[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&self.magic.to_le_bytes());
        page[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&self.version.to_le_bytes());
        page[PSIZE_OFFSET..PSIZE_OFFSET + 4].copy_from_slice(&self.page_size.to_le_bytes());
        page[MAPSIZE_OFFSET..MAPSIZE_OFFSET + 8].copy_from_slice(&self.map_size.to_le_bytes());
        page[TXNID_OFFSET..TXNID_OFFSET + 8].copy_from_slice(&self.last_txnid.to_le_bytes());
    }

    /// Decode and validate a header from the start of `page`
    pub(crate) fn read_from(page: &[u8]) -> Result<Self> {
        if page.len() < META_LEN {
            return Err(Error::Invalid);
        }

        let meta = MetaHeader {
            magic: read_u32(page, MAGIC_OFFSET),
            version: read_u32(page, VERSION_OFFSET),
            page_size: read_u32(page, PSIZE_OFFSET),
            map_size: read_u64(page, MAPSIZE_OFFSET),
            last_txnid: read_u64(page, TXNID_OFFSET),
        };

        if meta.magic != MDB_MAGIC {
            return Err(Error::Invalid);
        }
        if meta.version != DATA_VERSION {
            return Err(Error::VersionMismatch);
        }
        if meta.page_size as usize != PAGE_SIZE {
            return Err(Error::Invalid);
        }

        Ok(meta)
    }

    /// Pick the most recent valid header out of the two meta pages
    pub(crate) fn latest(pages: &[u8]) -> Result<Self> {
        if pages.len() < META_PAGES * PAGE_SIZE {
            return Err(Error::Invalid);
        }

        let first = MetaHeader::read_from(&pages[..PAGE_SIZE]);
        let second = MetaHeader::read_from(&pages[PAGE_SIZE..2 * PAGE_SIZE]);

        match (first, second) {
            (Ok(a), Ok(b)) => Ok(if b.last_txnid > a.last_txnid { b } else { a }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// Byte offset of the meta page that records `txnid`
    pub(crate) fn page_offset(txnid: u64) -> usize {
        (txnid & 1) as usize * PAGE_SIZE
    }
}

fn read_u32(page: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&page[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(page: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&page[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Reader info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Process ID
    pub pid: u32,
    /// Thread that began the read transaction
    pub thread: ThreadId,
    /// Transaction ID being read
    pub txn_id: u64,
}

/// Fixed-capacity reader slot table
#[derive(Debug, Default)]
pub(crate) struct ReaderTable {
    slots: Vec<Option<ReaderInfo>>,
}

impl ReaderTable {
    pub(crate) fn new(max_readers: u32) -> Self {
        ReaderTable {
            slots: vec![None; max_readers as usize],
        }
    }

    /// Claim a free slot, failing fast when every slot is taken
    pub(crate) fn acquire(&mut self) -> Result<usize> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(Error::ReadersFull)?;

        self.slots[slot] = Some(ReaderInfo {
            pid: std::process::id(),
            thread: thread::current().id(),
            txn_id: 0,
        });
        Ok(slot)
    }

    pub(crate) fn set_txn_id(&mut self, slot: usize, txn_id: u64) {
        if let Some(Some(reader)) = self.slots.get_mut(slot) {
            reader.txn_id = txn_id;
        }
    }

    pub(crate) fn release(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn list(&self) -> Vec<ReaderInfo> {
        self.slots.iter().flatten().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}
