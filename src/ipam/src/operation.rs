use std::sync::Arc;

use super::{allocator::Allocator, error::Error};

/// Scoped set of reservations against one allocator.
///
/// Values reserved through an operation are handed back to the allocator when
/// the operation is dropped without being committed. Releases requested with
/// [`Operation::release_deferred`] only happen on commit.
///
/// A dry-run operation never touches the allocator. It answers with the values
/// a real operation would have produced.
#[derive(Debug)]
pub struct Operation<A: Allocator> {
    allocator: Arc<A>,
    dry_run: bool,
    allocated: Vec<A::Value>,
    release_deferred: Vec<A::Value>,
    committed: bool,
}

impl<A: Allocator> Operation<A> {
    pub fn start(allocator: Arc<A>, dry_run: bool) -> Operation<A> {
        Operation {
            allocator,
            dry_run,
            allocated: Vec::new(),
            release_deferred: Vec::new(),
            committed: false,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocate(&mut self, value: A::Value) -> Result<(), Error> {
        if self.dry_run {
            if self.allocated.contains(&value) {
                return Err(Error::AlreadyAllocated(value.to_string()));
            }
            self.allocator.verify(value)?;
        } else {
            self.allocator.allocate(value)?;
        }
        self.allocated.push(value);
        Ok(())
    }

    pub fn allocate_next(&mut self) -> Result<A::Value, Error> {
        let value = if self.dry_run {
            self.allocator.peek_next(&self.allocated)?
        } else {
            self.allocator.allocate_next()?
        };
        self.allocated.push(value);
        Ok(value)
    }

    pub fn release_deferred(&mut self, value: A::Value) {
        self.release_deferred.push(value);
    }

    pub fn allocated(&self) -> &[A::Value] {
        &self.allocated
    }

    pub fn deferred(&self) -> &[A::Value] {
        &self.release_deferred
    }

    /// Keeps every reservation and performs the deferred releases.
    ///
    /// Returns the releases that failed. The reservations stay committed either way.
    pub fn commit(mut self) -> Vec<(A::Value, Error)> {
        self.committed = true;
        if self.dry_run {
            return Vec::new();
        }
        let mut failed = Vec::new();
        for value in self.release_deferred.drain(..) {
            if let Err(e) = self.allocator.release(value) {
                failed.push((value, e));
            }
        }
        if !self.allocated.is_empty() {
            tracing::debug!(range=%self.allocator.range(), allocated=?self.allocated, "committed allocation");
        }
        failed
    }
}

impl<A: Allocator> Drop for Operation<A> {
    fn drop(&mut self) {
        if self.committed || self.dry_run {
            return;
        }
        while let Some(value) = self.allocated.pop() {
            if let Err(e) = self.allocator.release(value) {
                tracing::error!(error=?e, value=%value, range=%self.allocator.range(), "failed to revert allocation");
            }
        }
    }
}
