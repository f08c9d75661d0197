/// Schema for all tables.
pub const SCHEMA: &str = r#"
-- Accounts that own sections
CREATE TABLE IF NOT EXISTS owners (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);

-- Last known status per owner and section
CREATE TABLE IF NOT EXISTS section_status (
    owner_id INTEGER NOT NULL,
    section_id TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    content_hash TEXT NOT NULL DEFAULT '',
    error_message TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (owner_id, section_id)
);

-- Latest payload per owner and section (serialized JSON)
CREATE TABLE IF NOT EXISTS section_data (
    owner_id INTEGER NOT NULL,
    section_id TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (owner_id, section_id)
);

-- Raw remote responses with expiry (unix millis)
CREATE TABLE IF NOT EXISTS response_cache (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_response_cache_expires ON response_cache(expires_at);
"#;
