use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

/// Read-only view of a stored value.
///
/// A `Value` borrows the transaction it was read through, so it cannot be
/// held across a write in the same transaction or past its terminal call.
/// Use [`Value::to_vec`] to keep the bytes longer.
#[derive(Debug, Clone)]
pub struct Value<'txn> {
    data: Arc<[u8]>,
    _txn: PhantomData<&'txn ()>,
}

impl<'txn> Value<'txn> {
    pub(crate) fn new(data: Arc<[u8]>) -> Self {
        Value {
            data,
            _txn: PhantomData,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl Deref for Value<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Value<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl PartialEq<[u8]> for Value<'_> {
    fn eq(&self, other: &[u8]) -> bool {
        *self.data == *other
    }
}

impl<const N: usize> PartialEq<[u8; N]> for Value<'_> {
    fn eq(&self, other: &[u8; N]) -> bool {
        *self.data == other[..]
    }
}
