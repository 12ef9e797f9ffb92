//! Durable storage of replicant values.
//!
//! Values are stored as JSON text keyed by `(namespace, name)`. A top-level undefined value
//! is stored as the empty string.

use std::{collections::BTreeMap, fmt::Debug, sync::atomic::{AtomicBool, Ordering}};

use nested_enum_utils::common_fields;
use parking_lot::Mutex;
use serde_json::Value;
use snafu::{Backtrace, Snafu};

pub use self::{
    redb::RedbStore,
    scheduler::{SavePolicy, SaveScheduler},
};

mod redb;
pub mod scheduler;

/// Errors reading or writing the store.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(transparent)]
    Database { source: ::redb::Error },
    #[snafu(display("failed to create database directory"))]
    CreateDir { source: std::io::Error },
    #[snafu(display("store is unavailable"))]
    Unavailable {},
    #[snafu(display("failed to serialize value"))]
    Serialize { source: serde_json::Error },
}

/// Key/value storage for serialized replicant values.
pub trait Store: Debug + Send + Sync + 'static {
    /// Load the serialized value stored for `(namespace, name)`.
    fn load(&self, namespace: &str, name: &str) -> Result<Option<String>, StoreError>;

    /// Store the serialized value for `(namespace, name)`.
    fn save(&self, namespace: &str, name: &str, text: &str) -> Result<(), StoreError>;
}

/// Serialize a value for the store.
pub fn serialize_value(value: Option<&Value>) -> Result<String, StoreError> {
    use snafu::ResultExt;
    match value {
        None => Ok(String::new()),
        Some(value) => serde_json::to_string(value).context(SerializeSnafu),
    }
}

/// Parse a value read from the store.
pub fn parse_value(text: &str) -> Result<Option<Value>, serde_json::Error> {
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text).map(Some)
}

/// A store keeping values in memory only.
///
/// Saves can be made to fail with [`MemoryStore::set_unavailable`], to exercise retries.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<(String, String), String>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following save fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl Store for MemoryStore {
    fn load(&self, namespace: &str, name: &str) -> Result<Option<String>, StoreError> {
        let key = (namespace.to_string(), name.to_string());
        Ok(self.values.lock().get(&key).cloned())
    }

    fn save(&self, namespace: &str, name: &str, text: &str) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return UnavailableSnafu.fail();
        }
        self.values
            .lock()
            .insert((namespace.to_string(), name.to_string()), text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use testresult::TestResult;

    use super::*;

    #[test]
    fn undefined_is_empty_text() -> TestResult {
        assert_eq!(serialize_value(None)?, "");
        assert_eq!(parse_value("")?, None);
        assert_eq!(serialize_value(Some(&Value::Null))?, "null");
        assert_eq!(parse_value("null")?, Some(Value::Null));
        Ok(())
    }

    #[test]
    fn memory_store() -> TestResult {
        let store = MemoryStore::new();
        assert_eq!(store.load("ns", "a")?, None);
        store.save("ns", "a", &serialize_value(Some(&json!({ "x": 1 })))?)?;
        assert_eq!(store.load("ns", "a")?.as_deref(), Some(r#"{"x":1}"#));
        assert_eq!(store.load("other", "a")?, None);

        store.set_unavailable(true);
        assert!(matches!(
            store.save("ns", "a", "1"),
            Err(StoreError::Unavailable { .. })
        ));
        assert_eq!(store.len(), 1);
        Ok(())
    }
}
