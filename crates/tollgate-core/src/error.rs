use tollgate_protocol::ReasonCode;

/// Typed outcome of a rejected or failed engine operation.
///
/// Every variant carries a stable [`ReasonCode`]; callers should branch on
/// that rather than on the message text.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{message}")]
    Denied {
        reason_code: ReasonCode,
        message: String,
    },
    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error("{entity} {id} is not leased to {worker_id}")]
    NotClaimed {
        entity: &'static str,
        id: String,
        worker_id: String,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{message}")]
    Validation {
        reason_code: ReasonCode,
        message: String,
    },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            EngineError::Denied { reason_code, .. } => *reason_code,
            EngineError::InvalidTransition { .. } => ReasonCode::InvalidTransition,
            EngineError::NotClaimed { .. } => ReasonCode::NotClaimed,
            EngineError::NotFound { .. } => ReasonCode::NotFound,
            EngineError::Validation { reason_code, .. } => *reason_code,
            EngineError::Internal(_) => ReasonCode::InternalError,
        }
    }

    pub(crate) fn validation(reason_code: ReasonCode, message: impl Into<String>) -> Self {
        EngineError::Validation {
            reason_code,
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        let err = EngineError::InvalidTransition {
            entity: "changeset",
            id: "cs-1".into(),
            from: "applied".into(),
            to: "approved".into(),
        };
        assert_eq!(err.reason_code(), ReasonCode::InvalidTransition);
        assert_eq!(err.to_string(), "changeset cs-1 cannot move from applied to approved");
        let internal = EngineError::from(anyhow::anyhow!("disk full"));
        assert_eq!(internal.reason_code().as_str(), "internal_error");
    }
}
