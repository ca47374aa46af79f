use std::fmt;
use std::ptr;

use crate::btree::BTreeEngine;
use crate::constants::{DbFlags, WriteFlags, PAGE_SIZE};
use crate::engine::Engine;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::types::{Dbi, Stat};
use crate::value::Value;

/// Database handle.
///
/// Returned by [`Transaction::open_database`] and usable by any later
/// transaction of the same environment. Every operation validates the
/// environment, the transaction and the handle before it reaches the engine.
pub struct Database<'env, E: Engine = BTreeEngine> {
    env: &'env Environment<E>,
    /// Slot in the environment's handle table
    slot: usize,
    /// Engine database identifier
    dbi: Dbi,
}

impl<'env, E: Engine> Database<'env, E> {
    pub(crate) fn new(env: &'env Environment<E>, slot: usize, dbi: Dbi) -> Self {
        Database { env, slot, dbi }
    }

    /// Get a value by key.
    ///
    /// The value borrows `txn` and cannot be kept past its commit or abort.
    pub fn get<'txn>(&self, txn: &'txn Transaction<'_, E>, key: &[u8]) -> Result<Value<'txn>> {
        let dbi = self.resolve(txn)?;
        txn.with_native(|engine, native| engine.get(native, dbi, key))
            .map(Value::new)
    }

    /// Insert or overwrite a value
    pub fn put(&self, txn: &mut Transaction<'_, E>, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with_flags(txn, key, value, WriteFlags::empty())
    }

    /// Store a value; with [`WriteFlags::NOOVERWRITE`] an existing key fails
    /// with [`Error::KeyExist`]
    pub fn put_with_flags(
        &self,
        txn: &mut Transaction<'_, E>,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        let dbi = self.resolve(txn)?;
        if txn.is_read_only() {
            return Err(Error::ReadOnly);
        }
        txn.with_native(|engine, native| engine.put(native, dbi, key, value, flags))
    }

    /// Delete a key; fails with [`Error::NotFound`] if it is absent
    pub fn delete(&self, txn: &mut Transaction<'_, E>, key: &[u8]) -> Result<()> {
        let dbi = self.resolve(txn)?;
        if txn.is_read_only() {
            return Err(Error::ReadOnly);
        }
        txn.with_native(|engine, native| engine.delete(native, dbi, key))
    }

    /// Get database statistics as seen by `txn`
    pub fn stat(&self, txn: &Transaction<'_, E>) -> Result<Stat> {
        let dbi = self.resolve(txn)?;
        let entries = txn.with_native(|engine, native| engine.entries(native, dbi))?;
        Ok(Stat {
            psize: PAGE_SIZE as u32,
            entries,
        })
    }

    /// Put in a transaction of its own, committed on success
    pub fn put_implicit(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.env.write(|txn| self.put(txn, key, value))
    }

    /// Get in a read-only transaction of its own
    pub fn get_implicit(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.env.read(|txn| self.get(txn, key).map(|value| value.to_vec()))
    }

    /// Delete in a transaction of its own, committed on success
    pub fn delete_implicit(&self, key: &[u8]) -> Result<()> {
        self.env.write(|txn| self.delete(txn, key))
    }

    /// Name the database was opened with; `None` for the default database
    pub fn name(&self) -> Result<Option<String>> {
        self.env.check_open()?;
        let table = self.env.dbs.read();
        let slot = table.get(self.slot, self.dbi).ok_or(Error::BadDbi)?;
        Ok(slot.name.clone())
    }

    /// Flags the database was opened with
    pub fn flags(&self) -> Result<DbFlags> {
        self.env.check_open()?;
        let table = self.env.dbs.read();
        let slot = table.get(self.slot, self.dbi).ok_or(Error::BadDbi)?;
        Ok(slot.flags)
    }

    pub fn dbi(&self) -> Dbi {
        self.dbi
    }

    /// Validate `txn` and this handle, returning the engine identifier
    fn resolve(&self, txn: &Transaction<'_, E>) -> Result<Dbi> {
        txn.validate()?;
        if !ptr::eq(self.env, txn.env()) {
            return Err(Error::BadDbi);
        }
        self.env
            .dbs
            .read()
            .get(self.slot, self.dbi)
            .map(|slot| slot.dbi)
            .ok_or(Error::BadDbi)
    }
}

impl<E: Engine> Clone for Database<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: Engine> Copy for Database<'_, E> {}

impl<E: Engine> PartialEq for Database<'_, E> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.env, other.env) && self.slot == other.slot && self.dbi == other.dbi
    }
}

impl<E: Engine> Eq for Database<'_, E> {}

impl<E: Engine> fmt::Debug for Database<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("slot", &self.slot)
            .field("dbi", &self.dbi)
            .finish()
    }
}

/// Registered database handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DbSlot {
    pub(crate) name: Option<String>,
    pub(crate) dbi: Dbi,
    pub(crate) flags: DbFlags,
    /// Creating transaction tree, until its top-level commit
    pub(crate) pending: Option<u64>,
}

/// Environment-wide table of registered database handles
#[derive(Debug, Default)]
pub(crate) struct DbTable {
    slots: Vec<Option<DbSlot>>,
    /// Capacity for named databases
    max_named: usize,
}

impl DbTable {
    pub(crate) fn new(max_dbs: u32) -> Self {
        DbTable {
            slots: Vec::with_capacity(max_dbs as usize + 1),
            max_named: max_dbs as usize,
        }
    }

    /// Registered handle for `name` visible to transaction tree `tree`.
    /// Pending registrations are only visible to the tree that made them.
    pub(crate) fn find(&self, name: Option<&str>, tree: u64) -> Option<(usize, Dbi)> {
        self.slots.iter().enumerate().find_map(|(index, slot)| match slot {
            Some(slot)
                if slot.name.as_deref() == name
                    && slot.pending.map_or(true, |owner| owner == tree) =>
            {
                Some((index, slot.dbi))
            }
            _ => None,
        })
    }

    /// Slot already holding `name` as `dbi`, pending or not
    pub(crate) fn find_dbi(&self, name: Option<&str>, dbi: Dbi) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .map_or(false, |slot| slot.name.as_deref() == name && slot.dbi == dbi)
        })
    }

    pub(crate) fn named_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.name.is_some())
            .count()
    }

    /// Whether another named database can not be registered
    pub(crate) fn is_full(&self) -> bool {
        self.named_count() >= self.max_named
    }

    pub(crate) fn insert(
        &mut self,
        name: Option<&str>,
        dbi: Dbi,
        flags: DbFlags,
        pending: Option<u64>,
    ) -> usize {
        let entry = DbSlot {
            name: name.map(str::to_owned),
            dbi,
            flags,
            pending,
        };

        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(entry);
                index
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    /// Make a pending registration visible to every transaction
    pub(crate) fn settle(&mut self, slot: usize) {
        if let Some(Some(entry)) = self.slots.get_mut(slot) {
            entry.pending = None;
        }
    }

    pub(crate) fn remove(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
    }

    /// The registration in `slot`, if it still belongs to `dbi`
    pub(crate) fn get(&self, slot: usize, dbi: Dbi) -> Option<&DbSlot> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .filter(|entry| entry.dbi == dbi)
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}
