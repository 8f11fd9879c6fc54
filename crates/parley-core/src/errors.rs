/// Error taxonomy shared by the REST surface and the socket channel.
///
/// Everything except `Transient` is terminal for the request that triggered
/// it and is reported to the caller verbatim.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid participants: {0}")]
    InvalidParticipants(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable code used in `error` frames and REST error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidParticipants(_) => "INVALID_PARTICIPANTS",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Transient(_) => "TRANSIENT",
        }
    }

    /// The message without the variant prefix.
    pub fn detail(&self) -> &str {
        match self {
            Self::Unauthorized(d)
            | Self::Forbidden(d)
            | Self::NotFound(d)
            | Self::InvalidParticipants(d)
            | Self::InvalidRequest(d)
            | Self::Transient(d) => d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(ChatError::Transient("busy".into()).is_retryable());
        assert!(!ChatError::Unauthorized("x".into()).is_retryable());
        assert!(!ChatError::Forbidden("x".into()).is_retryable());
        assert!(!ChatError::NotFound("x".into()).is_retryable());
        assert!(!ChatError::InvalidParticipants("x".into()).is_retryable());
        assert!(!ChatError::InvalidRequest("x".into()).is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ChatError::Forbidden(String::new()).code(), "FORBIDDEN");
        assert_eq!(
            ChatError::InvalidParticipants(String::new()).code(),
            "INVALID_PARTICIPANTS"
        );
        assert_eq!(ChatError::Transient(String::new()).code(), "TRANSIENT");
    }

    #[test]
    fn detail_strips_prefix() {
        let err = ChatError::NotFound("conversation conv_1".into());
        assert_eq!(err.detail(), "conversation conv_1");
        assert_eq!(err.to_string(), "not found: conversation conv_1");
    }
}
