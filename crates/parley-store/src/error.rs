use parley_core::ChatError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(d) => ChatError::NotFound(d),
            StoreError::Forbidden(d) => ChatError::Forbidden(d),
            StoreError::Invalid(d) | StoreError::Conflict(d) => ChatError::InvalidRequest(d),
            other => ChatError::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_become_transient() {
        let err: ChatError = StoreError::Database("locked".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn not_found_is_preserved() {
        let err: ChatError = StoreError::NotFound("message msg_1".into()).into();
        assert_eq!(err, ChatError::NotFound("message msg_1".into()));
    }

    #[test]
    fn forbidden_is_preserved() {
        let err: ChatError = StoreError::Forbidden("not the sender".into()).into();
        assert_eq!(err.code(), "FORBIDDEN");
    }
}
