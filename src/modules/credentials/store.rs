//! Credential persistence.
//!
//! The cache talks to storage only through [`CredentialStore`], so persistence
//! stays an explicit dependency handed in at construction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use redb::backends::InMemoryBackend;
use redb::{Builder, Database, ReadableTable, TableDefinition, TableError};
use thiserror::Error;

use super::EgressCredential;

const CREDENTIALS: TableDefinition<&str, &[u8]> = TableDefinition::new("egress_credentials");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential database error: {0}")]
    Database(#[from] redb::Error),
    #[error("credential record is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn db_err<E: Into<redb::Error>>(err: E) -> StoreError {
    StoreError::Database(err.into())
}

/// Repository for egress credentials keyed by egress key.
pub trait CredentialStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<EgressCredential>, StoreError>;
    fn save(&self, credential: &EgressCredential) -> Result<(), StoreError>;
    fn remove(&self, egress_key: &str) -> Result<(), StoreError>;
}

/// Process-local store; the default.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, EgressCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_all(&self) -> Result<Vec<EgressCredential>, StoreError> {
        let guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.values().cloned().collect())
    }

    fn save(&self, credential: &EgressCredential) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(credential.egress_key.clone(), credential.clone());
        Ok(())
    }

    fn remove(&self, egress_key: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(egress_key);
        Ok(())
    }
}

/// redb-backed store so solved sessions survive restarts.
pub struct RedbCredentialStore {
    db: Database,
}

impl RedbCredentialStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(db_err)?;
        log::debug!("opened credential store at {}", path.as_ref().display());
        Ok(Self { db })
    }

    /// Volatile database, mainly for tests.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Builder::new()
            .create_with_backend(InMemoryBackend::new())
            .map_err(db_err)?;
        Ok(Self { db })
    }
}

impl CredentialStore for RedbCredentialStore {
    fn load_all(&self) -> Result<Vec<EgressCredential>, StoreError> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = match txn.open_table(CREDENTIALS) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(db_err(err)),
        };

        let mut credentials = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (key, value) = entry.map_err(db_err)?;
            match serde_json::from_slice::<EgressCredential>(value.value()) {
                Ok(credential) => credentials.push(credential),
                Err(err) => log::warn!("skipping unreadable credential {}: {err}", key.value()),
            }
        }
        Ok(credentials)
    }

    fn save(&self, credential: &EgressCredential) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(credential)?;
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(CREDENTIALS).map_err(db_err)?;
            table
                .insert(credential.egress_key.as_str(), payload.as_slice())
                .map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn remove(&self, egress_key: &str) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(CREDENTIALS).map_err(db_err)?;
            table.remove(egress_key).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::credentials::CredentialSource;
    use crate::modules::proxy::EgressPath;
    use chrono::{Duration, Utc};

    fn credential(egress: EgressPath, cookies: &str) -> EgressCredential {
        let now = Utc::now();
        EgressCredential {
            egress_key: egress.key().to_string(),
            egress,
            cookies: cookies.to_string(),
            created_at: now,
            expires_at: now + Duration::hours(12),
            valid: true,
            source: CredentialSource::Solved,
        }
    }

    #[test]
    fn redb_store_round_trips_and_removes() {
        let store = RedbCredentialStore::in_memory().unwrap();
        assert!(store.load_all().unwrap().is_empty());

        let direct = credential(EgressPath::Direct, "anubis-auth=a");
        let proxied = credential(
            EgressPath::proxy("http://user:pw@10.0.0.1:8080"),
            "anubis-auth=b",
        );
        store.save(&direct).unwrap();
        store.save(&proxied).unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by(|a, b| a.egress_key.cmp(&b.egress_key));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].egress_key, "NO_PROXY");
        assert_eq!(loaded[0].cookies, "anubis-auth=a");
        assert_eq!(loaded[1].egress, proxied.egress);

        store.remove("NO_PROXY").unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn memory_store_overwrites_by_key() {
        let store = MemoryCredentialStore::new();
        store.save(&credential(EgressPath::Direct, "a=1")).unwrap();
        store.save(&credential(EgressPath::Direct, "a=2")).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].cookies, "a=2");
    }
}
