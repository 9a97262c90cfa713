use std::sync::Mutex;

use crate::{error::StoreError, types::Credentials};

/// Persistent single-record credential storage. `save` fully replaces any prior record.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Credentials>, StoreError>;
    fn save(&self, credentials: &Credentials) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    record: Mutex<Option<Credentials>>,
    fail_saves: Mutex<bool>,
}

impl MemoryCredentialStore {
    pub fn with_record(credentials: Credentials) -> Self {
        Self {
            record: Mutex::new(Some(credentials)),
            fail_saves: Mutex::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_saves.lock() {
            *flag = fail;
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credentials>, StoreError> {
        self.record
            .lock()
            .map(|record| record.clone())
            .map_err(|_| StoreError::Io("credential record lock poisoned".to_string()))
    }

    fn save(&self, credentials: &Credentials) -> Result<(), StoreError> {
        if self.fail_saves.lock().map(|flag| *flag).unwrap_or(false) {
            return Err(StoreError::Io("simulated nvs write failure".to_string()));
        }

        let mut record = self
            .record
            .lock()
            .map_err(|_| StoreError::Io("credential record lock poisoned".to_string()))?;
        *record = Some(credentials.clone());
        Ok(())
    }
}

/// Write-through cache over a credential store.
///
/// The cache is filled on first read and updated only after the backing store
/// accepted a save. It is never persisted, so every restart rebuilds it from
/// the store.
pub struct CredentialCache<S> {
    store: S,
    cached: Mutex<Option<Option<Credentials>>>,
}

impl<S: CredentialStore> CredentialCache<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn get(&self) -> Result<Option<Credentials>, StoreError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| StoreError::Io("credential cache lock poisoned".to_string()))?;

        if let Some(value) = cached.as_ref() {
            return Ok(value.clone());
        }

        let loaded = self.store.load()?;
        *cached = Some(loaded.clone());
        Ok(loaded)
    }

    /// Holds the cache lock across the store write so concurrent saves are serialized.
    pub fn put(&self, credentials: &Credentials) -> Result<(), StoreError> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| StoreError::Io("credential cache lock poisoned".to_string()))?;

        self.store.save(credentials)?;
        *cached = Some(Some(credentials.clone()));
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        matches!(self.get(), Ok(Some(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_overwrites_previous_record() {
        let cache = CredentialCache::new(MemoryCredentialStore::default());
        cache
            .put(&Credentials::new("office", "long-secret").unwrap())
            .unwrap();
        cache.put(&Credentials::new("home", "").unwrap()).unwrap();

        let stored = cache.store().load().unwrap().unwrap();
        assert_eq!(stored.ssid(), "home");
        assert_eq!(stored.password(), "");
        assert_eq!(cache.get().unwrap(), Some(stored));
    }

    #[test]
    fn failed_save_leaves_cache_untouched() {
        let cache = CredentialCache::new(MemoryCredentialStore::with_record(
            Credentials::new("old", "secret99").unwrap(),
        ));
        assert!(cache.has_credentials());

        cache.store().set_fail_saves(true);
        assert!(cache.put(&Credentials::new("new", "x").unwrap()).is_err());

        assert_eq!(cache.get().unwrap().unwrap().ssid(), "old");
    }
}
