use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use parley_core::ids::{ConversationId, MessageId, UserId};
use parley_core::models::Message;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const MESSAGE_COLUMNS: &str = "id, conversation_id, seq, sender_id, body, created_at, deleted";

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message. The conversation's `last_seq` counter is bumped and
    /// the row inserted in the same transaction, so seqs are gap-free and
    /// never reused.
    #[instrument(skip(self, body), fields(conversation_id = %conversation, sender = %sender))]
    pub fn append(
        &self,
        conversation: &ConversationId,
        sender: &UserId,
        body: &str,
    ) -> Result<Message, StoreError> {
        self.db.with_tx(|tx| {
            let seq: i64 = tx
                .query_row(
                    "UPDATE conversations SET last_seq = last_seq + 1 WHERE id = ?1 RETURNING last_seq",
                    [conversation.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation}")))?;

            let id = MessageId::new();
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO messages (id, conversation_id, seq, sender_id, body, created_at, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                rusqlite::params![id.as_str(), conversation.as_str(), seq, sender.as_str(), body, now],
            )?;

            Ok(Message {
                id,
                conversation_id: conversation.clone(),
                seq,
                sender_id: sender.clone(),
                body: body.to_string(),
                created_at: now,
                deleted: false,
            })
        })
    }

    /// Messages with `seq > after_seq`, ascending, at most `limit`.
    #[instrument(skip(self), fields(conversation_id = %conversation, after_seq, limit))]
    pub fn list_after_seq(
        &self,
        conversation: &ConversationId,
        after_seq: i64,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1 AND seq > ?2
                 ORDER BY seq ASC
                 LIMIT ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![conversation.as_str(), after_seq, limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_message(row)?);
            }
            Ok(results)
        })
    }

    /// Newest message of a conversation, deleted or not.
    #[instrument(skip(self), fields(conversation_id = %conversation))]
    pub fn last(&self, conversation: &ConversationId) -> Result<Option<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY seq DESC
                 LIMIT 1"
            ))?;
            let mut rows = stmt.query([conversation.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_message(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Flag a message deleted. Sender-only; repeating the delete returns the
    /// existing tombstone.
    #[instrument(skip(self), fields(message_id = %id, requester = %requester))]
    pub fn soft_delete(&self, id: &MessageId, requester: &UserId) -> Result<Message, StoreError> {
        self.db.with_tx(|tx| {
            let mut message = load_message(tx, id)?;
            if &message.sender_id != requester {
                return Err(StoreError::Forbidden(format!(
                    "only the sender can delete message {id}"
                )));
            }
            if message.deleted {
                return Ok(message);
            }
            tx.execute(
                "UPDATE messages SET deleted = 1, deleted_at = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().to_rfc3339(), id.as_str()],
            )?;
            message.deleted = true;
            Ok(message)
        })
    }
}

fn load_message(conn: &Connection, id: &MessageId) -> Result<Message, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_message(row),
        None => Err(StoreError::NotFound(format!("message {id}"))),
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        conversation_id: ConversationId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "messages",
            "conversation_id",
        )?),
        seq: row_helpers::get(row, 2, "messages", "seq")?,
        sender_id: UserId::from_raw(row_helpers::get::<String>(row, 3, "messages", "sender_id")?),
        body: row_helpers::get(row, 4, "messages", "body")?,
        created_at: row_helpers::get(row, 5, "messages", "created_at")?,
        deleted: row_helpers::get::<i64>(row, 6, "messages", "deleted")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::ConversationRepo;
    use parley_core::models::ParticipantPair;

    fn user(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    fn setup() -> (MessageRepo, ConversationId) {
        let db = Database::in_memory().unwrap();
        let convs = ConversationRepo::new(db.clone());
        let pair = ParticipantPair::new(&user("alice"), &user("bob")).unwrap();
        let d = convs.get_or_create_direct(&pair).unwrap();
        (MessageRepo::new(db), d.id)
    }

    #[test]
    fn first_message_has_seq_one() {
        let (repo, conv) = setup();
        let m = repo.append(&conv, &user("alice"), "hi").unwrap();
        assert_eq!(m.seq, 1);
        assert!(m.id.as_str().starts_with("msg_"));
        assert!(!m.deleted);
    }

    #[test]
    fn seqs_are_gap_free() {
        let (repo, conv) = setup();
        let seqs: Vec<i64> = (0..5)
            .map(|i| repo.append(&conv, &user("alice"), &format!("m{i}")).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn seqs_are_per_conversation() {
        let db = Database::in_memory().unwrap();
        let convs = ConversationRepo::new(db.clone());
        let repo = MessageRepo::new(db);
        let d1 = convs
            .get_or_create_direct(&ParticipantPair::new(&user("a"), &user("b")).unwrap())
            .unwrap();
        let d2 = convs
            .get_or_create_direct(&ParticipantPair::new(&user("a"), &user("c")).unwrap())
            .unwrap();
        repo.append(&d1.id, &user("a"), "x").unwrap();
        repo.append(&d1.id, &user("a"), "y").unwrap();
        assert_eq!(repo.append(&d2.id, &user("a"), "z").unwrap().seq, 1);
    }

    #[test]
    fn append_to_unknown_conversation_is_not_found() {
        let (repo, _) = setup();
        let err = repo
            .append(&ConversationId::from_raw("conv_missing"), &user("alice"), "hi")
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_after_seq_is_exclusive_and_limited() {
        let (repo, conv) = setup();
        for i in 0..6 {
            repo.append(&conv, &user("alice"), &format!("m{i}")).unwrap();
        }
        let page = repo.list_after_seq(&conv, 2, 3).unwrap();
        let seqs: Vec<i64> = page.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let rest = repo.list_after_seq(&conv, 5, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].body, "m5");

        assert!(repo.list_after_seq(&conv, 6, 10).unwrap().is_empty());
    }

    #[test]
    fn soft_delete_is_sender_only() {
        let (repo, conv) = setup();
        let m = repo.append(&conv, &user("alice"), "oops").unwrap();
        let err = repo.soft_delete(&m.id, &user("bob")).unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
        assert!(!repo.list_after_seq(&conv, 0, 10).unwrap()[0].deleted);
    }

    #[test]
    fn soft_delete_keeps_seq_and_is_idempotent() {
        let (repo, conv) = setup();
        let m1 = repo.append(&conv, &user("alice"), "one").unwrap();
        let m2 = repo.append(&conv, &user("alice"), "two").unwrap();

        let t = repo.soft_delete(&m1.id, &user("alice")).unwrap();
        assert!(t.deleted);
        assert_eq!(t.seq, 1);
        let again = repo.soft_delete(&m1.id, &user("alice")).unwrap();
        assert!(again.deleted);

        let all = repo.list_after_seq(&conv, 0, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].deleted);
        assert_eq!(all[1].id, m2.id);

        // Deleting does not renumber what follows.
        assert_eq!(repo.append(&conv, &user("bob"), "three").unwrap().seq, 3);
    }

    #[test]
    fn soft_delete_unknown_message_is_not_found() {
        let (repo, _) = setup();
        let err = repo.soft_delete(&MessageId::from_raw("msg_x"), &user("alice")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn last_message() {
        let (repo, conv) = setup();
        assert!(repo.last(&conv).unwrap().is_none());
        repo.append(&conv, &user("alice"), "one").unwrap();
        repo.append(&conv, &user("bob"), "two").unwrap();
        let last = repo.last(&conv).unwrap().unwrap();
        assert_eq!(last.seq, 2);
        assert_eq!(last.sender_id, user("bob"));
    }

    #[test]
    fn concurrent_appends_get_distinct_seqs() {
        let (repo, conv) = setup();
        let repo = std::sync::Arc::new(repo);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let repo = repo.clone();
                let conv = conv.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .map(|i| repo.append(&conv, &user("alice"), &format!("{t}-{i}")).unwrap().seq)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seqs: Vec<i64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=80).collect::<Vec<_>>());
    }
}
