use chrono::{DateTime, Duration, Utc};
use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};
use tracing::instrument;
use uuid::Uuid;

use parley_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;

const TOKEN_PREFIX: &str = "plt_";

/// Bearer tokens. Only SHA-256 hashes are stored.
pub struct TokenRepo {
    db: Database,
}

impl TokenRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Mint a token for `user`. The plaintext is returned once and never
    /// stored.
    #[instrument(skip(self), fields(user_id = %user))]
    pub fn issue(&self, user: &UserId, ttl: Option<Duration>) -> Result<String, StoreError> {
        let token = format!(
            "{TOKEN_PREFIX}{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let now = Utc::now();
        let expires_at = ttl.map(|ttl| (now + ttl).to_rfc3339());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auth_tokens (token_hash, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![hash_token(&token), user.as_str(), now.to_rfc3339(), expires_at],
            )?;
            Ok(())
        })?;
        Ok(token)
    }

    /// Resolve a token to its user. Unknown and expired tokens yield `None`.
    #[instrument(skip_all)]
    pub fn resolve(&self, token: &str) -> Result<Option<UserId>, StoreError> {
        let row: Option<(String, Option<String>)> = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT user_id, expires_at FROM auth_tokens WHERE token_hash = ?1",
                    [hash_token(token)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?)
        })?;

        let Some((user_id, expires_at)) = row else {
            return Ok(None);
        };
        if let Some(raw) = expires_at {
            let expires = DateTime::parse_from_rfc3339(&raw).map_err(|e| StoreError::CorruptRow {
                table: "auth_tokens",
                column: "expires_at",
                detail: e.to_string(),
            })?;
            if expires <= Utc::now() {
                return Ok(None);
            }
        }
        Ok(Some(UserId::from_raw(user_id)))
    }

    /// Returns whether a token was removed.
    #[instrument(skip_all)]
    pub fn revoke(&self, token: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM auth_tokens WHERE token_hash = ?1", [hash_token(token)])?;
            Ok(n > 0)
        })
    }
}

fn hash_token(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
