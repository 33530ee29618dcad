#![forbid(unsafe_code)]

//! Remote artifact storage boundary.
//!
//! Superseded artifacts whose stored name looks like a flat object key are
//! deleted through this trait instead of the local filesystem. Only the no-op
//! implementation ships; a real backend can be plugged in without touching
//! the download driver.

use anyhow::Result;
use tracing::debug;

pub trait ObjectStorage {
    /// Deletes the object with the given key. Deleting a missing object is
    /// not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Storage that remembers nothing. Deletes succeed so the driver's
/// bookkeeping proceeds as if a backend were configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStorage;

impl ObjectStorage for NullStorage {
    fn delete(&self, key: &str) -> Result<()> {
        debug!(key, "no storage backend, delete skipped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_storage_accepts_everything() {
        let storage = NullStorage;
        assert!(storage.delete("file.mp4").is_ok());
    }
}
