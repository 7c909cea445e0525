/// Coarse classification of a [`FleetError`], for callers that branch on the
/// failure category rather than on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    PreconditionFailed,
    ManifestAbsent,
    ExternalToolFailure,
    InvariantViolation,
    Io,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("manifest absent: {0} has not been generated yet")]
    ManifestAbsent(String),
    #[error("{action} failed: {detail}")]
    ExternalTool { action: String, detail: String },
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal: {0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = FleetError> = std::result::Result<T, E>;

impl FleetError {
    pub fn external(action: impl Into<String>, detail: impl Into<String>) -> Self {
        FleetError::ExternalTool {
            action: action.into(),
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::NotFound(_) => ErrorKind::NotFound,
            FleetError::Conflict(_) => ErrorKind::Conflict,
            FleetError::InvalidInput(_) => ErrorKind::InvalidInput,
            FleetError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            FleetError::ManifestAbsent(_) => ErrorKind::ManifestAbsent,
            FleetError::ExternalTool { .. } => ErrorKind::ExternalToolFailure,
            FleetError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            FleetError::Io(_) => ErrorKind::Io,
            FleetError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            FleetError::NotFound("instance a1".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            FleetError::external("docker compose up", "boom").kind(),
            ErrorKind::ExternalToolFailure
        );
        assert_eq!(
            FleetError::InvariantViolation("missing archive".into()).kind(),
            ErrorKind::InvariantViolation
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: FleetError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn external_tool_message_carries_diagnostic() {
        let err = FleetError::external("docker compose stop a1", "no such service: a1");
        assert_eq!(
            err.to_string(),
            "docker compose stop a1 failed: no such service: a1"
        );
    }

    #[test]
    fn internal_keeps_context_chain() {
        use anyhow::Context;
        let inner: anyhow::Result<()> = Err(anyhow::anyhow!("disk full"));
        let err: FleetError = inner.context("failed to write manifest").unwrap_err().into();
        let msg = err.to_string();
        assert!(msg.contains("failed to write manifest"), "got: {msg}");
        assert!(msg.contains("disk full"), "got: {msg}");
    }
}
