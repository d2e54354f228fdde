/// Schema for the profile database.
///
/// `reset_records` is deliberately not one of the clearable surfaces: a reset
/// record has to survive the reset it describes.
pub const SCHEMA: &str = r#"
-- Key-value areas ('local' persists, 'session' is per-tab scratch)
CREATE TABLE IF NOT EXISTS kv_store (
    area TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (area, key)
);

CREATE TABLE IF NOT EXISTS cookies (
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    domain TEXT NOT NULL,
    path TEXT NOT NULL DEFAULT '/',
    http_only INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (name, domain, path)
);

-- Catalog of structured databases the app created
CREATE TABLE IF NOT EXISTS structured_databases (
    name TEXT PRIMARY KEY,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS reset_records (
    reset_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    counts TEXT
);

CREATE INDEX IF NOT EXISTS idx_reset_records_started ON reset_records(started_at);
"#;
