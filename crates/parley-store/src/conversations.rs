use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use parley_core::ids::{ConversationId, UserId};
use parley_core::models::{Conversation, ConversationKind, DirectConversation, Group, ParticipantPair};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Lookup-or-create the direct conversation for a canonical pair.
    /// Runs in one IMMEDIATE transaction so concurrent callers observe the
    /// same row.
    #[instrument(skip(self), fields(user_a = %pair.low(), user_b = %pair.high()))]
    pub fn get_or_create_direct(&self, pair: &ParticipantPair) -> Result<DirectConversation, StoreError> {
        self.db.with_tx(|tx| {
            if let Some(existing) = find_direct(tx, pair)? {
                return Ok(existing);
            }

            let id = ConversationId::new();
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO conversations (id, kind, last_seq, created_at) VALUES (?1, ?2, 0, ?3)",
                rusqlite::params![id.as_str(), ConversationKind::Direct.to_string(), now],
            )?;
            tx.execute(
                "INSERT INTO direct_conversations (conversation_id, user_a, user_b) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.as_str(), pair.low().as_str(), pair.high().as_str()],
            )?;

            Ok(DirectConversation {
                id,
                user_a: pair.low().clone(),
                user_b: pair.high().clone(),
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn get(&self, id: &ConversationId) -> Result<Conversation, StoreError> {
        self.db.with_conn(|conn| load_conversation(conn, id))
    }

    /// Current member set.
    #[instrument(skip(self), fields(conversation_id = %id))]
    pub fn members(&self, id: &ConversationId) -> Result<BTreeSet<UserId>, StoreError> {
        self.db.with_conn(|conn| Ok(load_conversation(conn, id)?.members()))
    }

    /// Seq of the group's newest message when `user` joined. `0` for direct
    /// conversations, founding members and non-members.
    #[instrument(skip(self), fields(conversation_id = %id, user_id = %user))]
    pub fn joined_seq(&self, id: &ConversationId, user: &UserId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            let seq: Option<i64> = conn
                .query_row(
                    "SELECT joined_seq FROM group_members WHERE conversation_id = ?1 AND user_id = ?2",
                    rusqlite::params![id.as_str(), user.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seq.unwrap_or(0))
        })
    }

    /// Direct conversations and groups containing `user`, oldest first.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn list_for_user(&self, user: &UserId) -> Result<Vec<Conversation>, StoreError> {
        self.db.with_conn(|conn| {
            let mut out: Vec<Conversation> = list_direct(conn, user)?
                .into_iter()
                .map(Conversation::Direct)
                .collect();
            out.extend(list_groups(conn, user)?.into_iter().map(Conversation::Group));
            out.sort_by(|a, b| a.created_at().cmp(b.created_at()).then_with(|| a.id().cmp(b.id())));
            Ok(out)
        })
    }

    #[instrument(skip(self), fields(user_id = %user))]
    pub fn list_direct_for(&self, user: &UserId) -> Result<Vec<DirectConversation>, StoreError> {
        self.db.with_conn(|conn| list_direct(conn, user))
    }

    #[instrument(skip(self), fields(user_id = %user))]
    pub fn list_groups_for(&self, user: &UserId) -> Result<Vec<Group>, StoreError> {
        self.db.with_conn(|conn| list_groups(conn, user))
    }

    /// Create a group. The creator is always a member.
    #[instrument(skip(self, members), fields(creator = %creator, name))]
    pub fn create_group(
        &self,
        name: &str,
        creator: &UserId,
        members: &[UserId],
    ) -> Result<Group, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("group name must not be empty".into()));
        }

        let mut member_set: BTreeSet<UserId> = members.iter().cloned().collect();
        member_set.insert(creator.clone());

        self.db.with_tx(|tx| {
            let id = ConversationId::new();
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT INTO conversations (id, kind, last_seq, created_at) VALUES (?1, ?2, 0, ?3)",
                rusqlite::params![id.as_str(), ConversationKind::Group.to_string(), now],
            )?;
            tx.execute(
                "INSERT INTO groups (conversation_id, name, creator_id) VALUES (?1, ?2, ?3)",
                rusqlite::params![id.as_str(), name, creator.as_str()],
            )?;
            for member in &member_set {
                tx.execute(
                    "INSERT INTO group_members (conversation_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![id.as_str(), member.as_str(), now],
                )?;
            }

            Ok(Group {
                id,
                name: name.to_string(),
                members: member_set,
                creator_id: creator.clone(),
                created_at: now,
            })
        })
    }

    /// Add a member. Creator-only; adding an existing member is a no-op and
    /// keeps their original join point.
    #[instrument(skip(self), fields(group_id = %group, requester = %requester, user_id = %user))]
    pub fn add_member(
        &self,
        group: &ConversationId,
        requester: &UserId,
        user: &UserId,
    ) -> Result<Group, StoreError> {
        self.db.with_tx(|tx| {
            let current = load_group(tx, group)?;
            if &current.creator_id != requester {
                return Err(StoreError::Forbidden(format!(
                    "only the creator of group {group} can add members"
                )));
            }
            // joined_seq pins the history the new member may read.
            tx.execute(
                "INSERT OR IGNORE INTO group_members (conversation_id, user_id, joined_at, joined_seq)
                 SELECT ?1, ?2, ?3, last_seq FROM conversations WHERE id = ?1",
                rusqlite::params![group.as_str(), user.as_str(), Utc::now().to_rfc3339()],
            )?;
            load_group(tx, group)
        })
    }

    /// Remove a member. The creator may remove anyone, members may leave.
    #[instrument(skip(self), fields(group_id = %group, requester = %requester, user_id = %user))]
    pub fn remove_member(
        &self,
        group: &ConversationId,
        requester: &UserId,
        user: &UserId,
    ) -> Result<Group, StoreError> {
        self.db.with_tx(|tx| {
            let current = load_group(tx, group)?;
            if &current.creator_id != requester && requester != user {
                return Err(StoreError::Forbidden(format!(
                    "only the creator of group {group} can remove other members"
                )));
            }
            if !current.members.contains(user) {
                return Err(StoreError::NotFound(format!("member {user} in group {group}")));
            }
            if current.members.len() == 1 {
                return Err(StoreError::Invalid(format!(
                    "cannot remove the last member of group {group}"
                )));
            }
            tx.execute(
                "DELETE FROM group_members WHERE conversation_id = ?1 AND user_id = ?2",
                rusqlite::params![group.as_str(), user.as_str()],
            )?;
            load_group(tx, group)
        })
    }
}

fn find_direct(conn: &Connection, pair: &ParticipantPair) -> Result<Option<DirectConversation>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT d.conversation_id, d.user_a, d.user_b, c.created_at
         FROM direct_conversations d JOIN conversations c ON c.id = d.conversation_id
         WHERE d.user_a = ?1 AND d.user_b = ?2",
    )?;
    let mut rows = stmt.query(rusqlite::params![pair.low().as_str(), pair.high().as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_direct(row)?)),
        None => Ok(None),
    }
}

fn load_conversation(conn: &Connection, id: &ConversationId) -> Result<Conversation, StoreError> {
    let kind: Option<String> = conn
        .query_row("SELECT kind FROM conversations WHERE id = ?1", [id.as_str()], |row| row.get(0))
        .optional()?;
    let kind = kind.ok_or_else(|| StoreError::NotFound(format!("conversation {id}")))?;

    match row_helpers::parse_enum::<ConversationKind>(&kind, "conversations", "kind")? {
        ConversationKind::Direct => {
            let mut stmt = conn.prepare(
                "SELECT d.conversation_id, d.user_a, d.user_b, c.created_at
                 FROM direct_conversations d JOIN conversations c ON c.id = d.conversation_id
                 WHERE d.conversation_id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Conversation::Direct(row_to_direct(row)?)),
                None => Err(StoreError::NotFound(format!("conversation {id}"))),
            }
        }
        ConversationKind::Group => Ok(Conversation::Group(load_group(conn, id)?)),
    }
}

fn load_group(conn: &Connection, id: &ConversationId) -> Result<Group, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT g.conversation_id, g.name, g.creator_id, c.created_at
         FROM groups g JOIN conversations c ON c.id = g.conversation_id
         WHERE g.conversation_id = ?1",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    let row = rows
        .next()?
        .ok_or_else(|| StoreError::NotFound(format!("group {id}")))?;

    let group_id = ConversationId::from_raw(row_helpers::get::<String>(row, 0, "groups", "conversation_id")?);
    let name: String = row_helpers::get(row, 1, "groups", "name")?;
    let creator_id = UserId::from_raw(row_helpers::get::<String>(row, 2, "groups", "creator_id")?);
    let created_at: String = row_helpers::get(row, 3, "conversations", "created_at")?;

    Ok(Group {
        members: load_members(conn, &group_id)?,
        id: group_id,
        name,
        creator_id,
        created_at,
    })
}

fn load_members(conn: &Connection, id: &ConversationId) -> Result<BTreeSet<UserId>, StoreError> {
    let mut stmt = conn.prepare("SELECT user_id FROM group_members WHERE conversation_id = ?1")?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut members = BTreeSet::new();
    while let Some(row) = rows.next()? {
        members.insert(UserId::from_raw(row_helpers::get::<String>(
            row,
            0,
            "group_members",
            "user_id",
        )?));
    }
    Ok(members)
}

fn list_direct(conn: &Connection, user: &UserId) -> Result<Vec<DirectConversation>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT d.conversation_id, d.user_a, d.user_b, c.created_at
         FROM direct_conversations d JOIN conversations c ON c.id = d.conversation_id
         WHERE d.user_a = ?1 OR d.user_b = ?1
         ORDER BY c.created_at ASC, d.conversation_id ASC",
    )?;
    let mut rows = stmt.query([user.as_str()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_direct(row)?);
    }
    Ok(out)
}

fn list_groups(conn: &Connection, user: &UserId) -> Result<Vec<Group>, StoreError> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT m.conversation_id
             FROM group_members m JOIN conversations c ON c.id = m.conversation_id
             WHERE m.user_id = ?1
             ORDER BY c.created_at ASC, m.conversation_id ASC",
        )?;
        let rows = stmt.query_map([user.as_str()], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    ids.into_iter()
        .map(|id| load_group(conn, &ConversationId::from_raw(id)))
        .collect()
}

fn row_to_direct(row: &rusqlite::Row<'_>) -> Result<DirectConversation, StoreError> {
    Ok(DirectConversation {
        id: ConversationId::from_raw(row_helpers::get::<String>(
            row,
            0,
            "direct_conversations",
            "conversation_id",
        )?),
        user_a: UserId::from_raw(row_helpers::get::<String>(row, 1, "direct_conversations", "user_a")?),
        user_b: UserId::from_raw(row_helpers::get::<String>(row, 2, "direct_conversations", "user_b")?),
        created_at: row_helpers::get(row, 3, "conversations", "created_at")?,
    })
}
