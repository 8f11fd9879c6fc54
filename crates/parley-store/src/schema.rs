/// SQL DDL for the parley database.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 2;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    last_seq INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS direct_conversations (
    conversation_id TEXT PRIMARY KEY REFERENCES conversations(id),
    user_a TEXT NOT NULL,
    user_b TEXT NOT NULL,
    UNIQUE (user_a, user_b),
    CHECK (user_a < user_b)
);

CREATE TABLE IF NOT EXISTS groups (
    conversation_id TEXT PRIMARY KEY REFERENCES conversations(id),
    name TEXT NOT NULL,
    creator_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    conversation_id TEXT NOT NULL REFERENCES groups(conversation_id),
    user_id TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    joined_seq INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (conversation_id, user_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    seq INTEGER NOT NULL,
    sender_id TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    UNIQUE (conversation_id, seq)
);

CREATE TABLE IF NOT EXISTS delivery_cursors (
    user_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    seq INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, conversation_id)
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    token_hash TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_direct_user_a ON direct_conversations(user_a);
CREATE INDEX IF NOT EXISTS idx_direct_user_b ON direct_conversations(user_b);
CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);
CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Upgrades keyed by the version they produce.
pub const MIGRATIONS: &[(u32, &str)] = &[(
    2,
    "ALTER TABLE group_members ADD COLUMN joined_seq INTEGER NOT NULL DEFAULT 0;",
)];

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
