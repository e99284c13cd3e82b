/// Schema for the local store. Dates are stored as `YYYY-MM-DD` text so
/// range scans compare lexicographically.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Cached server records, one row per (kind, id)
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY CHECK (id <> ''),
    source_date TEXT NOT NULL,
    status TEXT,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_events_start ON events(source_date);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY CHECK (id <> ''),
    source_date TEXT NOT NULL,
    status TEXT,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(source_date);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

-- Mutations waiting for replay. AUTOINCREMENT keeps local ids monotonic
-- and never reused, which is what replay order relies on.
CREATE TABLE IF NOT EXISTS pending_actions (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_kind TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_enqueued ON pending_actions(enqueued_at);

-- Actions the server refused for good, kept for inspection
CREATE TABLE IF NOT EXISTS rejected_actions (
    local_id INTEGER PRIMARY KEY,
    entity_kind TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    reason TEXT NOT NULL,
    rejected_at TEXT NOT NULL
);
"#;
