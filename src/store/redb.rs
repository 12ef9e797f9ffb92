use std::path::Path;

use redb::{Database, TableDefinition, backends::InMemoryBackend};
use snafu::ResultExt;
use tracing::{info, trace};

use super::{CreateDirSnafu, Store, StoreError};

const VALUES_TABLE: TableDefinition<(&str, &str), &str> = TableDefinition::new("replicants-1");

/// A [`Store`] backed by a redb database.
#[derive(Debug)]
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database file at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!("loading replicant database from {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu)?;
        }
        let db = Database::builder()
            .create(path)
            .map_err(::redb::Error::from)?;
        Self::open(db)
    }

    /// Create a database living in memory.
    pub fn in_memory() -> Result<Self, StoreError> {
        info!("using in-memory replicant database");
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(::redb::Error::from)?;
        Self::open(db)
    }

    fn open(db: Database) -> Result<Self, StoreError> {
        let write_tx = db.begin_write().map_err(::redb::Error::from)?;
        {
            let _table = write_tx
                .open_table(VALUES_TABLE)
                .map_err(::redb::Error::from)?;
        }
        write_tx.commit().map_err(::redb::Error::from)?;
        Ok(Self { db })
    }

    fn get(&self, namespace: &str, name: &str) -> Result<Option<String>, ::redb::Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(VALUES_TABLE)?;
        let Some(row) = table.get((namespace, name))? else {
            return Ok(None);
        };
        Ok(Some(row.value().to_string()))
    }

    fn upsert(&self, namespace: &str, name: &str, text: &str) -> Result<(), ::redb::Error> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(VALUES_TABLE)?;
            table.insert((namespace, name), text)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl Store for RedbStore {
    fn load(&self, namespace: &str, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(namespace, name)?)
    }

    fn save(&self, namespace: &str, name: &str, text: &str) -> Result<(), StoreError> {
        trace!(%namespace, %name, len = text.len(), "writing value");
        Ok(self.upsert(namespace, name, text)?)
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    #[test]
    fn values_survive_reopen() -> TestResult {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("replicants.db");
        {
            let store = RedbStore::persistent(&path)?;
            store.save("ns", "counter", "3")?;
            store.save("ns", "undefined", "")?;
            store.save("ns", "counter", "4")?;
        }
        let store = RedbStore::persistent(&path)?;
        assert_eq!(store.load("ns", "counter")?.as_deref(), Some("4"));
        assert_eq!(store.load("ns", "undefined")?.as_deref(), Some(""));
        assert_eq!(store.load("ns", "missing")?, None);
        assert_eq!(store.load("other", "counter")?, None);
        Ok(())
    }

    #[test]
    fn in_memory() -> TestResult {
        let store = RedbStore::in_memory()?;
        store.save("a", "b", r#"{"k":[1,2]}"#)?;
        assert_eq!(store.load("a", "b")?.as_deref(), Some(r#"{"k":[1,2]}"#));
        Ok(())
    }
}
