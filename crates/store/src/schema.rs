//! Table definitions. Operator segment SQL runs against `users` and
//! `events`, so those two names are part of the public contract.

pub const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    attributes  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    attributes  TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS segments (
    id          TEXT PRIMARY KEY,
    evaluator   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS segment_event_triggers (
    segment_id  TEXT NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
    event       TEXT NOT NULL,
    PRIMARY KEY (segment_id, event)
);

CREATE TABLE IF NOT EXISTS segment_memberships (
    user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    segment_id  TEXT NOT NULL REFERENCES segments(id) ON DELETE CASCADE,
    PRIMARY KEY (user_id, segment_id)
);

CREATE TABLE IF NOT EXISTS campaigns (
    id          TEXT PRIMARY KEY,
    flow        TEXT NOT NULL,
    behavior    TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS campaign_segments (
    campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    segment_id  TEXT NOT NULL,
    role        TEXT NOT NULL,
    PRIMARY KEY (campaign_id, segment_id, role)
);

CREATE TABLE IF NOT EXISTS campaign_memberships (
    user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (user_id, campaign_id)
);

CREATE TABLE IF NOT EXISTS executions (
    user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    campaign_id TEXT NOT NULL,
    status      TEXT NOT NULL,
    sleep_until TEXT NOT NULL,
    error       TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (user_id, campaign_id)
);

CREATE TABLE IF NOT EXISTS execution_history (
    user_id     TEXT NOT NULL,
    campaign_id TEXT NOT NULL,
    step_index  INTEGER NOT NULL,
    attributes  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (user_id, campaign_id, step_index),
    FOREIGN KEY (user_id, campaign_id)
        REFERENCES executions(user_id, campaign_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS templates (
    id        TEXT PRIMARY KEY,
    subject   TEXT NOT NULL,
    html      TEXT NOT NULL,
    preamble  TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS transactions (
    id        TEXT PRIMARY KEY,
    event     TEXT NOT NULL,
    subject   TEXT NOT NULL,
    html      TEXT NOT NULL,
    preamble  TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS email_provider (
    id           INTEGER PRIMARY KEY CHECK (id = 1),
    config       TEXT NOT NULL,
    from_address TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS configs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    config_json TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
"#;

pub const CREATE_INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_events_user ON events(user_id);
CREATE INDEX IF NOT EXISTS idx_events_name ON events(name);
CREATE INDEX IF NOT EXISTS idx_segment_memberships_segment ON segment_memberships(segment_id);
CREATE INDEX IF NOT EXISTS idx_campaign_segments_segment ON campaign_segments(segment_id);
CREATE INDEX IF NOT EXISTS idx_executions_due ON executions(status, sleep_until);
"#;
