use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::ChatError;
use crate::ids::{ConversationId, MessageId, UserId};

/// User as known to the identity system. Only ever referenced by id here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Group => write!(f, "group"),
        }
    }
}

impl std::str::FromStr for ConversationKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown conversation kind: {other}")),
        }
    }
}

/// Ordered user pair `(low, high)` identifying a direct conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    low: UserId,
    high: UserId,
}

impl ParticipantPair {
    /// Canonicalize an unordered pair. Rejects chatting with oneself.
    pub fn new(a: &UserId, b: &UserId) -> Result<Self, ChatError> {
        if a == b {
            return Err(ChatError::InvalidParticipants(format!(
                "cannot open a direct conversation with oneself ({a})"
            )));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self {
            low: low.clone(),
            high: high.clone(),
        })
    }

    pub fn low(&self) -> &UserId {
        &self.low
    }

    pub fn high(&self) -> &UserId {
        &self.high
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectConversation {
    pub id: ConversationId,
    /// Lower of the two participant ids.
    pub user_a: UserId,
    /// Higher of the two participant ids.
    pub user_b: UserId,
    pub created_at: String,
}

impl DirectConversation {
    pub fn has_member(&self, user: &UserId) -> bool {
        &self.user_a == user || &self.user_b == user
    }

    /// The participant that is not `user`.
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        if &self.user_a == user {
            Some(&self.user_b)
        } else if &self.user_b == user {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: ConversationId,
    pub name: String,
    pub members: BTreeSet<UserId>,
    pub creator_id: UserId,
    pub created_at: String,
}

/// The unit of addressing for messages and subscriptions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conversation {
    Direct(DirectConversation),
    Group(Group),
}

impl Conversation {
    pub fn id(&self) -> &ConversationId {
        match self {
            Self::Direct(d) => &d.id,
            Self::Group(g) => &g.id,
        }
    }

    pub fn kind(&self) -> ConversationKind {
        match self {
            Self::Direct(_) => ConversationKind::Direct,
            Self::Group(_) => ConversationKind::Group,
        }
    }

    pub fn has_member(&self, user: &UserId) -> bool {
        match self {
            Self::Direct(d) => d.has_member(user),
            Self::Group(g) => g.members.contains(user),
        }
    }

    pub fn members(&self) -> BTreeSet<UserId> {
        match self {
            Self::Direct(d) => [d.user_a.clone(), d.user_b.clone()].into_iter().collect(),
            Self::Group(g) => g.members.clone(),
        }
    }

    pub fn created_at(&self) -> &str {
        match self {
            Self::Direct(d) => &d.created_at,
            Self::Group(g) => &g.created_at,
        }
    }
}

/// A persisted chat message. `seq` is assigned by the store and is the
/// ordering and catch-up key within the conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub seq: i64,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: String,
    #[serde(default)]
    pub deleted: bool,
}

/// Message as seen on the wire. Tombstones keep their id and seq but carry
/// no text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub seq: i64,
    pub sender: UserId,
    pub text: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl From<&Message> for WireMessage {
    fn from(m: &Message) -> Self {
        Self {
            message_id: m.id.clone(),
            conversation_id: m.conversation_id.clone(),
            seq: m.seq,
            sender: m.sender_id.clone(),
            text: if m.deleted { String::new() } else { m.body.clone() },
            created_at: m.created_at.clone(),
            deleted: m.deleted,
        }
    }
}

/// Conversation plus its newest message, for conversation listings.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub last_message: Option<WireMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(s: &str) -> UserId {
        UserId::from_raw(s)
    }

    #[test]
    fn pair_is_canonical_regardless_of_order() {
        let ab = ParticipantPair::new(&user("alice"), &user("bob")).unwrap();
        let ba = ParticipantPair::new(&user("bob"), &user("alice")).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.low(), &user("alice"));
        assert_eq!(ab.high(), &user("bob"));
    }

    #[test]
    fn pair_rejects_self_chat() {
        let err = ParticipantPair::new(&user("alice"), &user("alice")).unwrap_err();
        assert!(matches!(err, ChatError::InvalidParticipants(_)));
    }

    #[test]
    fn kind_parses_and_displays() {
        assert_eq!("group".parse::<ConversationKind>().unwrap(), ConversationKind::Group);
        assert_eq!(ConversationKind::Direct.to_string(), "direct");
        assert!("channel".parse::<ConversationKind>().is_err());
    }

    #[test]
    fn direct_membership_and_peer() {
        let d = DirectConversation {
            id: ConversationId::new(),
            user_a: user("alice"),
            user_b: user("bob"),
            created_at: "2026-01-01T00:00:00Z".into(),
        };
        assert!(d.has_member(&user("bob")));
        assert!(!d.has_member(&user("carol")));
        assert_eq!(d.peer_of(&user("alice")), Some(&user("bob")));
        assert_eq!(d.peer_of(&user("carol")), None);
    }

    #[test]
    fn tombstone_has_no_text_on_the_wire() {
        let m = Message {
            id: MessageId::from_raw("msg_1"),
            conversation_id: ConversationId::from_raw("conv_1"),
            seq: 4,
            sender_id: user("alice"),
            body: "secret".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            deleted: true,
        };
        let wire = WireMessage::from(&m);
        assert!(wire.text.is_empty());
        assert!(wire.deleted);
        assert_eq!(wire.seq, 4);
    }

    #[test]
    fn conversation_serializes_with_kind_tag() {
        let group = Conversation::Group(Group {
            id: ConversationId::from_raw("conv_g"),
            name: "sales".into(),
            members: [user("alice"), user("bob")].into_iter().collect(),
            creator_id: user("alice"),
            created_at: "2026-01-01T00:00:00Z".into(),
        });
        let v = serde_json::to_value(&group).unwrap();
        assert_eq!(v["kind"], "group");
        assert_eq!(v["creatorId"], "alice");
        assert_eq!(v["members"][1], "bob");
    }

    #[test]
    fn summary_flattens_conversation() {
        let summary = ConversationSummary {
            conversation: Conversation::Direct(DirectConversation {
                id: ConversationId::from_raw("conv_d"),
                user_a: user("alice"),
                user_b: user("bob"),
                created_at: "2026-01-01T00:00:00Z".into(),
            }),
            last_message: None,
        };
        let v = serde_json::to_value(&summary).unwrap();
        assert_eq!(v["id"], "conv_d");
        assert_eq!(v["kind"], "direct");
        assert!(v["lastMessage"].is_null());
    }
}
