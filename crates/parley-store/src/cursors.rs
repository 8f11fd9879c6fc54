use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use parley_core::ids::{ConversationId, UserId};

use crate::database::Database;
use crate::error::StoreError;

/// Durable per (user, conversation) delivery cursors.
pub struct CursorRepo {
    db: Database,
}

impl CursorRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Highest delivered seq, `0` if never advanced.
    #[instrument(skip(self), fields(user_id = %user, conversation_id = %conversation))]
    pub fn get(&self, user: &UserId, conversation: &ConversationId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let seq: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM delivery_cursors WHERE user_id = ?1 AND conversation_id = ?2",
                    rusqlite::params![user.as_str(), conversation.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seq.unwrap_or(0))
        })
    }

    /// Upsert with `MAX(existing, seq)`; a late or duplicate advance never
    /// moves the cursor backwards.
    #[instrument(skip(self), fields(user_id = %user, conversation_id = %conversation, seq))]
    pub fn advance(
        &self,
        user: &UserId,
        conversation: &ConversationId,
        seq: i64,
    ) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "INSERT INTO delivery_cursors (user_id, conversation_id, seq, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (user_id, conversation_id) DO UPDATE SET
                     seq = MAX(delivery_cursors.seq, excluded.seq),
                     updated_at = excluded.updated_at
                 RETURNING seq",
                rusqlite::params![user.as_str(), conversation.as_str(), seq, Utc::now().to_rfc3339()],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationRepo;
    use parley_core::models::ParticipantPair;

    fn user(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    fn setup() -> (CursorRepo, ConversationId) {
        let db = Database::in_memory().unwrap();
        let pair = ParticipantPair::new(&user("alice"), &user("bob")).unwrap();
        let d = ConversationRepo::new(db.clone()).get_or_create_direct(&pair).unwrap();
        (CursorRepo::new(db), d.id)
    }

    #[test]
    fn unknown_cursor_is_zero() {
        let (repo, conv) = setup();
        assert_eq!(repo.get(&user("bob"), &conv).unwrap(), 0);
    }

    #[test]
    fn advance_is_monotonic() {
        let (repo, conv) = setup();
        assert_eq!(repo.advance(&user("bob"), &conv, 3).unwrap(), 3);
        assert_eq!(repo.advance(&user("bob"), &conv, 2).unwrap(), 3);
        assert_eq!(repo.advance(&user("bob"), &conv, 5).unwrap(), 5);
        assert_eq!(repo.get(&user("bob"), &conv).unwrap(), 5);
    }

    #[test]
    fn cursors_are_per_user() {
        let (repo, conv) = setup();
        repo.advance(&user("bob"), &conv, 4).unwrap();
        assert_eq!(repo.get(&user("alice"), &conv).unwrap(), 0);
    }
}
