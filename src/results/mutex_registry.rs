//! A cache of per-transaction mutexes used to serialize readers and writers
//! of a single transaction's `metadata` file.
//!
//! Only the request processor adds and removes entries; any actor, including
//! a transaction-status query handler, may look one up and lock it. Because
//! the cache stores `Arc`s, a handle returned by [`ResultsMutexRegistry::get`]
//! stays valid even if another task concurrently removes it from the cache.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

/// Errors raised by [`ResultsMutexRegistry`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResultsMutexError {
    /// No mutex is registered for the given transaction id.
    #[error("no results mutex registered for transaction {0}")]
    DoesNotExist(String),
    /// A mutex is already registered for the given transaction id.
    #[error("results mutex already registered for transaction {0}")]
    AlreadyExists(String),
}

/// A registry mapping `transaction_id` to a shared async mutex guarding that
/// transaction's results files.
#[derive(Debug, Default)]
pub struct ResultsMutexRegistry {
    mutexes: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ResultsMutexRegistry {
    /// Build an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Remove every registered mutex. Intended for test setup/teardown.
    pub fn reset(&self) {
        #[expect(clippy::unwrap_used, reason = "lock is never poisoned by a panicking holder in this crate")]
        self.mutexes.lock().unwrap().clear();
    }

    /// Returns `true` if a mutex is registered for `transaction_id`.
    #[must_use]
    pub fn exists(&self, transaction_id: &str) -> bool {
        #[expect(clippy::unwrap_used, reason = "lock is never poisoned by a panicking holder in this crate")]
        self.mutexes.lock().unwrap().contains_key(transaction_id)
    }

    /// Fetch the shared mutex for `transaction_id`.
    ///
    /// # Errors
    /// Returns [`ResultsMutexError::DoesNotExist`] if no mutex is registered.
    pub fn get(&self, transaction_id: &str) -> Result<Arc<AsyncMutex<()>>, ResultsMutexError> {
        #[expect(clippy::unwrap_used, reason = "lock is never poisoned by a panicking holder in this crate")]
        self.mutexes
            .lock()
            .unwrap()
            .get(transaction_id)
            .cloned()
            .ok_or_else(|| ResultsMutexError::DoesNotExist(transaction_id.to_owned()))
    }

    /// Register a new mutex for `transaction_id`.
    ///
    /// # Errors
    /// Returns [`ResultsMutexError::AlreadyExists`] if one is already
    /// registered.
    pub fn add(&self, transaction_id: &str) -> Result<(), ResultsMutexError> {
        tracing::trace!(transaction_id, "adding results mutex");
        #[expect(clippy::unwrap_used, reason = "lock is never poisoned by a panicking holder in this crate")]
        let mut guard = self.mutexes.lock().unwrap();
        if guard.contains_key(transaction_id) {
            return Err(ResultsMutexError::AlreadyExists(transaction_id.to_owned()));
        }
        guard.insert(transaction_id.to_owned(), Arc::new(AsyncMutex::new(())));
        Ok(())
    }

    /// Remove the mutex registered for `transaction_id`.
    ///
    /// # Errors
    /// Returns [`ResultsMutexError::DoesNotExist`] if none is registered.
    pub fn remove(&self, transaction_id: &str) -> Result<(), ResultsMutexError> {
        tracing::trace!(transaction_id, "removing results mutex");
        #[expect(clippy::unwrap_used, reason = "lock is never poisoned by a panicking holder in this crate")]
        let mut guard = self.mutexes.lock().unwrap();
        if guard.remove(transaction_id).is_none() {
            return Err(ResultsMutexError::DoesNotExist(transaction_id.to_owned()));
        }
        Ok(())
    }

    /// The transaction ids of every currently-registered mutex, i.e. every
    /// non-blocking action presently running. Used by the spool purge loop
    /// to avoid reclaiming a directory that is still being written to.
    #[must_use]
    pub fn active_transactions(&self) -> Vec<String> {
        #[expect(clippy::unwrap_used, reason = "lock is never poisoned by a panicking holder in this crate")]
        self.mutexes.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_then_remove() {
        let registry = ResultsMutexRegistry::new();
        assert!(!registry.exists("t1"));
        registry.add("t1").unwrap();
        assert!(registry.exists("t1"));
        assert!(registry.get("t1").is_ok());
        registry.remove("t1").unwrap();
        assert!(!registry.exists("t1"));
    }

    #[test]
    fn add_twice_is_an_error() {
        let registry = ResultsMutexRegistry::new();
        registry.add("t1").unwrap();
        assert_eq!(registry.add("t1").unwrap_err(), ResultsMutexError::AlreadyExists("t1".into()));
    }

    #[test]
    fn get_missing_is_an_error() {
        let registry = ResultsMutexRegistry::new();
        assert_eq!(registry.get("missing").unwrap_err(), ResultsMutexError::DoesNotExist("missing".into()));
    }

    #[test]
    fn remove_missing_is_an_error() {
        let registry = ResultsMutexRegistry::new();
        assert_eq!(registry.remove("missing").unwrap_err(), ResultsMutexError::DoesNotExist("missing".into()));
    }

    #[tokio::test]
    async fn returned_handle_stays_valid_after_removal() {
        let registry = ResultsMutexRegistry::new();
        registry.add("t1").unwrap();
        let handle = registry.get("t1").unwrap();
        registry.remove("t1").unwrap();
        let _guard = handle.lock().await;
    }
}
