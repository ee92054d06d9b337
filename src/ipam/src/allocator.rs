use std::sync::Mutex;

use super::{
    bitset::{BitSet, BitSetError},
    error::Error,
};

/// A finite pool of values that can be reserved and released.
///
/// Implementations are internally synchronized, so a single instance can be
/// shared between concurrent requests.
pub trait Allocator: std::fmt::Debug + Send + Sync {
    type Value: Copy + Eq + std::fmt::Debug + std::fmt::Display + Send;

    /// Reserves a specific value.
    fn allocate(&self, value: Self::Value) -> Result<(), Error>;

    /// Reserves the lowest free value.
    fn allocate_next(&self) -> Result<Self::Value, Error>;

    /// Frees a value. Releasing a value that is not allocated is a no-op.
    fn release(&self, value: Self::Value) -> Result<(), Error>;

    fn has(&self, value: Self::Value) -> bool;

    /// Reports whether `allocate(value)` would succeed without reserving it.
    fn verify(&self, value: Self::Value) -> Result<(), Error>;

    /// Returns the value `allocate_next` would pick, treating `exclude` as taken.
    fn peek_next(&self, exclude: &[Self::Value]) -> Result<Self::Value, Error>;

    fn used(&self) -> usize;

    fn free(&self) -> usize;

    fn range(&self) -> String;
}

// Offset based arena shared by the IP and port allocators.
#[derive(Debug)]
pub(crate) struct BitAllocator {
    inner: Mutex<BitSet>,
}

impl BitAllocator {
    pub(crate) fn new(size: usize) -> BitAllocator {
        BitAllocator {
            inner: Mutex::new(BitSet::new(size)),
        }
    }

    // Returns false when the offset was already taken.
    pub(crate) fn allocate(&self, index: usize) -> Result<bool, Error> {
        let mut bits = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        match bits.set_true(index) {
            Ok(()) => Ok(true),
            Err(BitSetError::AlreadySet) => Ok(false),
            Err(e) => Err(Error::BitSet(e)),
        }
    }

    pub(crate) fn allocate_next(&self) -> Result<usize, Error> {
        let mut bits = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        bits.set_next().map_err(|e| match e {
            BitSetError::Full => Error::Full,
            _ => Error::BitSet(e),
        })
    }

    pub(crate) fn release(&self, index: usize) -> Result<bool, Error> {
        let mut bits = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        let was = bits.is_set(index);
        bits.set(index, false).map_err(Error::BitSet)?;
        Ok(was)
    }

    pub(crate) fn is_allocated(&self, index: usize) -> bool {
        self.inner
            .lock()
            .map(|bits| bits.is_set(index))
            .unwrap_or(false)
    }

    pub(crate) fn peek_next(&self, exclude: &[usize]) -> Result<usize, Error> {
        let bits = self.inner.lock().map_err(|_| Error::FailedToGetLock)?;
        bits.get_min_unset_index(exclude).map_err(|e| match e {
            BitSetError::Full => Error::Full,
            _ => Error::BitSet(e),
        })
    }

    pub(crate) fn used(&self) -> usize {
        self.inner.lock().map(|bits| bits.count()).unwrap_or(0)
    }

    pub(crate) fn size(&self) -> usize {
        self.inner.lock().map(|bits| bits.size()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn works_bit_allocator() {
        let alloc = BitAllocator::new(4);
        assert_eq!(alloc.size(), 4);
        assert!(alloc.allocate(2).unwrap());
        assert!(!alloc.allocate(2).unwrap());
        assert_eq!(alloc.allocate_next().unwrap(), 0);
        assert_eq!(alloc.peek_next(&[1]).unwrap(), 3);
        assert_eq!(alloc.used(), 2);
        assert!(alloc.release(2).unwrap());
        assert!(!alloc.release(2).unwrap());
        assert!(!alloc.is_allocated(2));
        assert_eq!(alloc.used(), 1);
    }

    #[test]
    fn fails_bit_allocator_when_full() {
        let alloc = BitAllocator::new(1);
        alloc.allocate_next().unwrap();
        assert_eq!(alloc.allocate_next(), Err(Error::Full));
        assert_eq!(alloc.peek_next(&[]), Err(Error::Full));
    }
}
