use crate::config::RetryPolicy;
use crate::errors::{Result, StorageError};
use crate::record::{KeyLayout, Record};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Outcome of writing a single item, keyed by its store key.
pub type PutOutcome = (String, Result<()>);

/// The remote key-value backend as seen by the engine.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Provisions the backing table keyed by `partition_attribute`. Idempotent.
    async fn ensure_schema(&self, partition_attribute: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Record>>;

    /// Writes `records` in chunks of at most `batch_size`.
    ///
    /// An `Err` means the call as a whole failed; per-item failures are
    /// reported in the returned outcomes.
    async fn batched_put(&self, records: &[Record], batch_size: usize) -> Result<Vec<PutOutcome>>;

    /// Every partition-key value currently stored, mapped to the natural key
    /// its item carries.
    async fn scan_keys(&self) -> Result<HashMap<String, String>>;

    fn describe(&self) -> String;
}

/// Runs `op` again while it fails transiently, up to the policy's attempts.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                log::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt,
                    policy.max_attempts,
                    err,
                    policy.backoff
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Config(format!("invalid {kind} name '{name}'")))
    }
}

fn item_key(record: &Record, layout: &KeyLayout) -> Result<String> {
    if layout.uses_surrogate() && record.surrogate_id.is_none() {
        return Err(StorageError::InvalidRecord(format!(
            "record '{}' has no surrogate id",
            record.natural_key
        )));
    }
    let key = record.store_key().trim();
    if key.is_empty() {
        return Err(StorageError::InvalidRecord(
            "record has an empty partition key".into(),
        ));
    }
    Ok(key.to_string())
}

/// SQLite-backed store: one table per feed, one JSON item per partition key.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
    layout: KeyLayout,
}

impl SqliteStore {
    pub fn open(path: &Path, table: &str, layout: KeyLayout) -> Result<Self> {
        validate_identifier("table", table)?;
        validate_identifier("attribute", &layout.key_attribute)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", path.display())))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            table: table.to_string(),
            layout,
        })
    }

    pub fn in_memory(table: &str, layout: KeyLayout) -> Result<Self> {
        validate_identifier("table", table)?;
        validate_identifier("attribute", &layout.key_attribute)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            table: table.to_string(),
            layout,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("store connection poisoned".into()))
    }

    fn existing_key_column(conn: &Connection, table: &str) -> Result<Option<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let pk: i64 = row.get(5)?;
            if pk > 0 {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", self.table), [], |r| {
            r.get(0)
        })?;
        Ok(n as usize)
    }
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    async fn ensure_schema(&self, partition_attribute: &str) -> Result<()> {
        validate_identifier("attribute", partition_attribute)?;
        let conn = self.lock()?;
        match Self::existing_key_column(&conn, &self.table)? {
            Some(found) if found != partition_attribute => Err(StorageError::SchemaMismatch {
                table: self.table.clone(),
                expected: partition_attribute.to_string(),
                found,
            }),
            Some(_) => Ok(()),
            None => {
                log::info!(
                    "Creating table '{}' keyed by '{}'",
                    self.table,
                    partition_attribute
                );
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS \"{}\" (
                        \"{}\" TEXT PRIMARY KEY,
                        item TEXT NOT NULL
                    );",
                    self.table, partition_attribute
                ))?;
                Ok(())
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Record>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT item FROM \"{}\" WHERE \"{}\" = ?1",
                    self.table, self.layout.key_attribute
                ),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => {
                let item: JsonMap<String, JsonValue> = serde_json::from_str(&text)?;
                Ok(Some(Record::from_item(&item, &self.layout)))
            }
            None => Ok(None),
        }
    }

    async fn batched_put(&self, records: &[Record], batch_size: usize) -> Result<Vec<PutOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());
        let mut conn = self.lock()?;
        let sql = format!(
            "INSERT INTO \"{table}\" (\"{key}\", item) VALUES (?1, ?2)
             ON CONFLICT(\"{key}\") DO UPDATE SET item = excluded.item",
            table = self.table,
            key = self.layout.key_attribute
        );

        for chunk in records.chunks(batch_size.max(1)) {
            let tx = conn.transaction()?;
            let mut chunk_outcomes = Vec::with_capacity(chunk.len());
            for record in chunk {
                let outcome = item_key(record, &self.layout).and_then(|key| {
                    let item = serde_json::to_string(&record.to_item(&self.layout))?;
                    tx.execute(&sql, params![key, item])?;
                    Ok(key)
                });
                match outcome {
                    Ok(key) => chunk_outcomes.push((key, Ok(()))),
                    Err(err) => {
                        chunk_outcomes.push((record.store_key().to_string(), Err(err)));
                    }
                }
            }
            if let Err(err) = tx.commit() {
                let message = err.to_string();
                outcomes.extend(chunk_outcomes.into_iter().map(|(key, outcome)| {
                    let outcome = outcome.and(Err(StorageError::Transient(message.clone())));
                    (key, outcome)
                }));
                continue;
            }
            outcomes.extend(chunk_outcomes);
        }
        Ok(outcomes)
    }

    async fn scan_keys(&self) -> Result<HashMap<String, String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT \"{key}\", COALESCE(json_extract(item, ?1), \"{key}\") FROM \"{table}\"",
            key = self.layout.key_attribute,
            table = self.table
        ))?;
        let natural_path = format!("$.\"{}\"", self.layout.natural_key_attribute);
        let keys = stmt
            .query_map(params![natural_path], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("sqlite table '{}'", self.table)
    }
}

/// In-process store with failure injection, for tests and dry runs.
pub struct MemoryStore {
    layout: KeyLayout,
    items: Mutex<HashMap<String, JsonMap<String, JsonValue>>>,
    schema: Mutex<Option<String>>,
    failing_puts: Mutex<HashSet<String>>,
    failing_gets: Mutex<HashSet<String>>,
    transient_failures: AtomicU32,
    unavailable: Mutex<bool>,
    put_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(layout: KeyLayout) -> Self {
        Self {
            layout,
            items: Mutex::new(HashMap::new()),
            schema: Mutex::new(None),
            failing_puts: Mutex::new(HashSet::new()),
            failing_gets: Mutex::new(HashSet::new()),
            transient_failures: AtomicU32::new(0),
            unavailable: Mutex::new(false),
            put_calls: AtomicUsize::new(0),
        }
    }

    fn guard<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
        mutex
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store poisoned".into()))
    }

    /// Seeds an item directly, bypassing the write path.
    pub fn insert(&self, record: &Record) {
        if let Ok(mut items) = self.items.lock() {
            items.insert(record.store_key().to_string(), record.to_item(&self.layout));
        }
    }

    /// Simulates an out-of-band deletion.
    pub fn remove(&self, key: &str) -> bool {
        self.items
            .lock()
            .map(|mut items| items.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn fail_puts_for(&self, key: &str) {
        if let Ok(mut keys) = self.failing_puts.lock() {
            keys.insert(key.to_string());
        }
    }

    pub fn fail_gets_for(&self, key: &str) {
        if let Ok(mut keys) = self.failing_gets.lock() {
            keys.insert(key.to_string());
        }
    }

    /// The next `n` store calls fail with a transient error.
    pub fn fail_transiently(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut flag) = self.unavailable.lock() {
            *flag = unavailable;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if *Self::guard(&self.unavailable)? {
            return Err(StorageError::Unavailable("memory store offline".into()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Transient("injected throttling".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    async fn ensure_schema(&self, partition_attribute: &str) -> Result<()> {
        self.check_available()?;
        let mut schema = Self::guard(&self.schema)?;
        match schema.as_deref() {
            Some(found) if found != partition_attribute => Err(StorageError::SchemaMismatch {
                table: "memory".into(),
                expected: partition_attribute.to_string(),
                found: found.to_string(),
            }),
            _ => {
                *schema = Some(partition_attribute.to_string());
                Ok(())
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Record>> {
        self.check_available()?;
        if Self::guard(&self.failing_gets)?.contains(key) {
            return Err(StorageError::Unavailable(format!("injected get failure for {key}")));
        }
        Ok(Self::guard(&self.items)?
            .get(key)
            .map(|item| Record::from_item(item, &self.layout)))
    }

    async fn batched_put(&self, records: &[Record], batch_size: usize) -> Result<Vec<PutOutcome>> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let failing = Self::guard(&self.failing_puts)?.clone();
        let mut items = Self::guard(&self.items)?;
        let mut outcomes = Vec::with_capacity(records.len());
        for chunk in records.chunks(batch_size.max(1)) {
            for record in chunk {
                let outcome = item_key(record, &self.layout).and_then(|key| {
                    if failing.contains(&key) {
                        return Err(StorageError::InvalidRecord(format!(
                            "injected put failure for {key}"
                        )));
                    }
                    items.insert(key.clone(), record.to_item(&self.layout));
                    Ok(key)
                });
                match outcome {
                    Ok(key) => outcomes.push((key, Ok(()))),
                    Err(err) => outcomes.push((record.store_key().to_string(), Err(err))),
                }
            }
        }
        Ok(outcomes)
    }

    async fn scan_keys(&self) -> Result<HashMap<String, String>> {
        self.check_available()?;
        let items = Self::guard(&self.items)?;
        Ok(items
            .iter()
            .map(|(key, item)| {
                let natural = Record::from_item(item, &self.layout).natural_key;
                let natural = if natural.is_empty() { key.clone() } else { natural };
                (key.clone(), natural)
            })
            .collect())
    }

    fn describe(&self) -> String {
        "in-memory store".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cisa_layout() -> KeyLayout {
        KeyLayout::natural("cveID")
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.sqlite"), "cisa_data", cisa_layout())
            .unwrap();
        store.ensure_schema("cveID").await.unwrap();
        // Second call is a no-op.
        store.ensure_schema("cveID").await.unwrap();

        let records = vec![
            Record::new("CVE-2024-1").with_field("sev", "high"),
            Record::new("CVE-2024-2").with_field("sev", "low"),
            Record::new("CVE-2024-3").with_field("sev", ""),
        ];
        let outcomes = store.batched_put(&records, 2).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(store.count().unwrap(), 3);

        let fetched = store.get("CVE-2024-1").await.unwrap().unwrap();
        assert_eq!(fetched.natural_key, "CVE-2024-1");
        assert_eq!(fetched.text("sev").as_deref(), Some("high"));
        let blank = store.get("CVE-2024-3").await.unwrap().unwrap();
        assert!(blank.get("sev").is_none());

        let keys = store.scan_keys().await.unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys.get("CVE-2024-1").map(String::as_str), Some("CVE-2024-1"));
        assert!(store.get("CVE-1999-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_schema_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.sqlite");
        let store = SqliteStore::open(&path, "feed", KeyLayout::natural("uuid")).unwrap();
        store.ensure_schema("uuid").await.unwrap();

        let reopened = SqliteStore::open(&path, "feed", KeyLayout::natural("cve")).unwrap();
        let err = reopened.ensure_schema("cve").await.unwrap_err();
        assert!(matches!(err, StorageError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_rejects_unkeyed_items_individually() {
        let store = SqliteStore::in_memory("meta", KeyLayout::surrogate("id", "module_id")).unwrap();
        store.ensure_schema("id").await.unwrap();

        let mut good = Record::new("exploit/a");
        good.surrogate_id = Some("META-2025-000001".into());
        let missing_id = Record::new("exploit/b");

        let outcomes = store.batched_put(&[good, missing_id], 10).await.unwrap();
        assert!(outcomes[0].1.is_ok());
        assert!(matches!(outcomes[1].1, Err(StorageError::InvalidRecord(_))));
        assert_eq!(store.count().unwrap(), 1);

        let keys = store.scan_keys().await.unwrap();
        assert_eq!(
            keys.get("META-2025-000001").map(String::as_str),
            Some("exploit/a")
        );
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        assert!(SqliteStore::in_memory("bad name", cisa_layout()).is_err());
        assert!(SqliteStore::in_memory("t", KeyLayout::natural("x\"y")).is_err());
    }

    #[tokio::test]
    async fn test_with_retry_recovers_from_transient_errors() {
        let store = MemoryStore::new(cisa_layout());
        store.fail_transiently(2);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: std::time::Duration::from_millis(1),
        };
        let keys = with_retry(&policy, "scan", || store.scan_keys()).await;
        assert!(keys.is_ok());
    }

    #[tokio::test]
    async fn test_with_retry_gives_up() {
        let store = MemoryStore::new(cisa_layout());
        store.fail_transiently(5);
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: std::time::Duration::from_millis(1),
        };
        let err = with_retry(&policy, "scan", || store.scan_keys())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new(cisa_layout());
        store.fail_puts_for("CVE-2");
        let outcomes = store
            .batched_put(&[Record::new("CVE-1"), Record::new("CVE-2")], 25)
            .await
            .unwrap();
        assert!(outcomes[0].1.is_ok());
        assert!(outcomes[1].1.is_err());
        assert_eq!(store.len(), 1);
        assert!(store.remove("CVE-1"));
        assert!(store.is_empty());
    }
}
