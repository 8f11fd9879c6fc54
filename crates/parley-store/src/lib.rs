//! SQLite persistence for parley: conversations, the per-conversation
//! message log, delivery cursors and bearer tokens.

pub mod conversations;
pub mod cursors;
pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sqlite;
pub mod tokens;

pub use database::Database;
pub use error::StoreError;
pub use sqlite::SqliteChatStore;
