use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::CacheError;

/// Schema migrations
/// Each version contains a list of SQL statements to execute
const MIGRATIONS: &[&[&str]] = &[
    // v1: namespace index for bulk invalidation
    &["CREATE INDEX IF NOT EXISTS idx_entries_namespace ON entries(namespace)"],
];

/// Identity of a cached request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from the request method, path and relevant parameters
    pub fn for_request(method: &str, path: &str, params: &[(&str, &str)]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(method.to_ascii_uppercase().as_bytes());
        hasher.update(b" ");
        hasher.update(path.as_bytes());
        let mut params = params.to_vec();
        params.sort();
        for (name, value) in params {
            hasher.update(b"\n");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Disk-persisted, TTL-bound cache of remote metadata responses.
///
/// Entries are never authoritative: every read may miss and every write may
/// be lost without affecting correctness, so concurrent processes share the
/// database without coordination beyond SQLite's own locking.
pub struct ContentCache {
    conn: Mutex<Connection>,
}

impl ContentCache {
    pub fn new(db_path: &Path) -> Result<Self, CacheError> {
        info!("Initializing content cache at {:?}", db_path);

        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.create_schema()?;

        debug!("Content cache ready");
        Ok(cache)
    }

    /// In-memory cache, used when the cache directory is unusable and in tests
    pub fn in_memory() -> Result<Self, CacheError> {
        let cache = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        cache.create_schema()?;
        Ok(cache)
    }

    /// Acquire database connection lock with proper error handling
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn.lock().map_err(|_| CacheError::LockPoisoned)
    }

    /// Get current timestamp in milliseconds since UNIX epoch
    fn current_timestamp_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn create_schema(&self) -> Result<(), CacheError> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                payload TEXT NOT NULL,
                valid_until INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        Self::apply_migrations(&conn)?;
        Ok(())
    }

    /// Apply pending migrations based on user_version pragma
    fn apply_migrations(conn: &Connection) -> Result<(), CacheError> {
        let current_version: i32 =
            conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        for (i, statements) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current_version {
                for sql in *statements {
                    conn.execute(sql, [])?;
                }
                debug!("Applied migration v{}", version);
            }
        }

        let target_version = MIGRATIONS.len() as i32;
        if target_version > current_version {
            conn.pragma_update(None, "user_version", target_version)?;
        }

        Ok(())
    }

    /// Cached payload, or None when absent or expired
    pub fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        self.get_at(key, Self::current_timestamp_ms())
    }

    pub fn get_at(&self, key: &CacheKey, now_ms: i64) -> Result<Option<String>, CacheError> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT payload FROM entries WHERE key = ?1 AND valid_until >= ?2",
            (key.as_str(), now_ms),
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(payload) => Ok(Some(payload)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store a payload; last write wins
    pub fn put(
        &self,
        key: &CacheKey,
        namespace: &str,
        payload: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.put_at(key, namespace, payload, ttl, Self::current_timestamp_ms())
    }

    pub fn put_at(
        &self,
        key: &CacheKey,
        namespace: &str,
        payload: &str,
        ttl: Duration,
        now_ms: i64,
    ) -> Result<(), CacheError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let valid_until = now_ms.saturating_add(ttl_ms);
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO entries (key, namespace, payload, valid_until)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                namespace = excluded.namespace,
                payload = excluded.payload,
                valid_until = excluded.valid_until
            "#,
            (key.as_str(), namespace, payload, valid_until),
        )?;
        Ok(())
    }

    /// Drop every entry of one namespace, returns the number of entries removed
    pub fn invalidate(&self, namespace: &str) -> Result<usize, CacheError> {
        let conn = self.lock_conn()?;
        let removed = conn.execute("DELETE FROM entries WHERE namespace = ?1", [namespace])?;
        info!("Invalidated {} cache entries in namespace '{}'", removed, namespace);
        Ok(removed)
    }

    /// Delete expired rows, returns the number of entries removed
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM entries WHERE valid_until < ?1",
            [Self::current_timestamp_ms()],
        )?;
        debug!("Purged {} expired cache entries", removed);
        Ok(removed)
    }
}

/// Parse a TTL such as `5s`, `10m`, `1h` or `1d`
pub fn parse_ttl(ttl: &str) -> Result<Duration, CacheError> {
    let ttl = ttl.trim();
    let invalid = || CacheError::InvalidTtl(ttl.to_string());
    let split = ttl
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (amount, unit) = ttl.split_at(split);
    let amount: u64 = amount.parse().map_err(|_| invalid())?;
    let unit_seconds: u64 = match unit.trim() {
        "s" | "sec" | "second" | "seconds" => 1,
        "m" | "min" | "minute" | "minutes" => 60,
        "h" | "hour" | "hours" => 60 * 60,
        "d" | "day" | "days" => 24 * 60 * 60,
        _ => return Err(invalid()),
    };
    let seconds = amount.checked_mul(unit_seconds).ok_or_else(invalid)?;
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn key(path: &str) -> CacheKey {
        CacheKey::for_request("GET", path, &[])
    }

    #[test]
    fn entry_with_five_second_ttl_hits_after_one_second_and_misses_after_ten() {
        let cache = ContentCache::in_memory().unwrap();
        let now = 1_700_000_000_000;
        let k = key("/v2/boards");

        cache
            .put_at(&k, "http", "[1,2,3]", Duration::from_secs(5), now)
            .unwrap();

        assert_eq!(
            cache.get_at(&k, now + 1_000).unwrap().as_deref(),
            Some("[1,2,3]")
        );
        assert_eq!(cache.get_at(&k, now + 10_000).unwrap(), None);
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let cache = ContentCache::in_memory().unwrap();
        let k = key("/v3/packages/tool/gcc");

        cache.put(&k, "http", "old", Duration::from_secs(60)).unwrap();
        cache.put(&k, "http", "new", Duration::from_secs(60)).unwrap();

        assert_eq!(cache.get(&k).unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn invalidate_drops_only_one_namespace() {
        let cache = ContentCache::in_memory().unwrap();
        let http = key("/a");
        let other = key("/b");
        cache.put(&http, "http", "a", Duration::from_secs(60)).unwrap();
        cache.put(&other, "boards", "b", Duration::from_secs(60)).unwrap();

        let removed = cache.invalidate("http").unwrap();

        assert_eq!(removed, 1);
        assert_eq!(cache.get(&http).unwrap(), None);
        assert_eq!(cache.get(&other).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn purge_expired_removes_only_stale_rows() {
        let cache = ContentCache::in_memory().unwrap();
        let stale = key("/stale");
        let fresh = key("/fresh");
        cache
            .put_at(&stale, "http", "x", Duration::from_secs(1), 0)
            .unwrap();
        cache.put(&fresh, "http", "y", Duration::from_secs(60)).unwrap();

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.get(&fresh).unwrap().as_deref(), Some("y"));
    }

    #[test]
    fn entries_persist_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("content.db");
        let k = key("/persisted");

        {
            let cache = ContentCache::new(&db_path).unwrap();
            cache.put(&k, "http", "kept", Duration::from_secs(60)).unwrap();
        }

        let reopened = ContentCache::new(&db_path).unwrap();
        assert_eq!(reopened.get(&k).unwrap().as_deref(), Some("kept"));
    }

    #[test]
    fn cache_key_ignores_parameter_order_and_method_case() {
        let a = CacheKey::for_request("get", "/v3/packages", &[("a", "1"), ("b", "2")]);
        let b = CacheKey::for_request("GET", "/v3/packages", &[("b", "2"), ("a", "1")]);
        let c = CacheKey::for_request("POST", "/v3/packages", &[("a", "1"), ("b", "2")]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[rstest]
    #[case("5s", 5)]
    #[case("10m", 600)]
    #[case("1h", 3600)]
    #[case("1d", 86400)]
    #[case("2 days", 172800)]
    fn parse_ttl_accepts_units(#[case] input: &str, #[case] seconds: u64) {
        assert_eq!(parse_ttl(input).unwrap(), Duration::from_secs(seconds));
    }

    #[rstest]
    #[case("")]
    #[case("10")]
    #[case("s")]
    #[case("5w")]
    #[case("999999999999999999d")]
    #[case("99999999999999999999s")]
    fn parse_ttl_rejects_malformed(#[case] input: &str) {
        assert!(matches!(parse_ttl(input), Err(CacheError::InvalidTtl(_))));
    }
}
