use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// User ids normally come from the identity system verbatim via `from_raw`.
branded_id!(UserId, "usr");
branded_id!(ConversationId, "conv");
branded_id!(MessageId, "msg");
branded_id!(ConnectionId, "conn");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_have_prefixes() {
        assert!(UserId::new().as_str().starts_with("usr_"));
        assert!(ConversationId::new().as_str().starts_with("conv_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(ConnectionId::new().as_str().starts_with("conn_"));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(ConversationId::new(), ConversationId::new());
    }

    #[test]
    fn user_ids_order_lexicographically() {
        let a = UserId::from_raw("alice");
        let b = UserId::from_raw("bob");
        assert!(a < b);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = MessageId::from_raw("msg_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"msg_1\"");
        let back: MessageId = serde_json::from_str("\"msg_1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<MessageId> = (0..100).map(|_| MessageId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
