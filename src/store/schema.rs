//! Table layout and schema migrations.
//!
//! The version lives in `PRAGMA user_version`. Table names are part of the
//! persisted contract; any change goes through a new entry in `MIGRATIONS`.

pub const SCHEMA_VERSION: u32 = 1;

pub const MUTATIONS_TABLE: &str = "offline_mutations";
pub const QUEUE_TABLE: &str = "sync_queue";
pub const CACHE_TABLE: &str = "response_cache";

/// Migration `n` upgrades a store from version `n` to `n + 1`.
pub const MIGRATIONS: &[&str] = &[SCHEMA_V1];

const SCHEMA_V1: &str = r#"
-- Domain mutations captured while offline
CREATE TABLE IF NOT EXISTS offline_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    action TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_mutations_resource_type
    ON offline_mutations(resource_type);
CREATE INDEX IF NOT EXISTS idx_offline_mutations_timestamp
    ON offline_mutations(timestamp);
CREATE INDEX IF NOT EXISTS idx_offline_mutations_synced
    ON offline_mutations(synced);

-- Requests waiting to be replayed, FIFO by id
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT,
    timestamp INTEGER NOT NULL,
    retries INTEGER NOT NULL DEFAULT 0,
    mutation_id INTEGER,
    idempotency_key TEXT NOT NULL DEFAULT '',
    last_error TEXT,
    dead_lettered INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_timestamp ON sync_queue(timestamp);
CREATE INDEX IF NOT EXISTS idx_sync_queue_retries ON sync_queue(retries);

-- Cached responses, one row per (namespace, url)
CREATE TABLE IF NOT EXISTS response_cache (
    namespace TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    ttl INTEGER NOT NULL,
    PRIMARY KEY (namespace, url)
);

CREATE INDEX IF NOT EXISTS idx_response_cache_timestamp ON response_cache(timestamp);
"#;
