#[allow(clippy::single_component_path_imports)]
use serde_yaml;

/// Coarse classification used by transports to pick a status code or exit message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// An identifier did not resolve.
    NotFound,
    /// A field-level constraint was violated.
    Validation,
    /// A uniqueness rule was violated.
    Conflict,
    /// The target entity is closed or otherwise terminal.
    InvalidState,
    /// Storage, gateway or configuration failure; not the caller's fault.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum KiaError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid identifier: {0}")]
    Uuid(#[from] kia_uuid::UuidError),
    #[error("invalid text: {0}")]
    Text(#[from] kia_types::TextError),

    #[error("failed to create journal directory: {0}")]
    DirCreation(std::io::Error),
    #[error("failed to write journal file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to read journal file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to remove journal file: {0}")]
    FileRemove(std::io::Error),
    #[error("failed to serialize YAML: {0}")]
    YamlSerialization(serde_yaml::Error),
    #[error("failed to deserialize YAML: {0}")]
    YamlDeserialization(serde_yaml::Error),

    #[error("resident directory failure: {0}")]
    Gateway(String),

    #[error("{error}; rollback also failed: {compensation}")]
    RollbackFailed {
        #[source]
        error: Box<KiaError>,
        compensation: Box<KiaError>,
    },
}

impl KiaError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        KiaError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        KiaError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        KiaError::Conflict(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        KiaError::InvalidState(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KiaError::NotFound { .. } => ErrorKind::NotFound,
            KiaError::Validation(_) | KiaError::Uuid(_) | KiaError::Text(_) => {
                ErrorKind::Validation
            }
            KiaError::Conflict(_) => ErrorKind::Conflict,
            KiaError::InvalidState(_) => ErrorKind::InvalidState,
            KiaError::RollbackFailed { error, .. } => match error.kind() {
                ErrorKind::Internal => ErrorKind::Internal,
                other => other,
            },
            _ => ErrorKind::Internal,
        }
    }
}

pub type KiaResult<T> = std::result::Result<T, KiaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classifies_domain_errors() {
        assert_eq!(
            KiaError::not_found("pregnancy", "abc").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(KiaError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(KiaError::conflict("x").kind(), ErrorKind::Conflict);
        assert_eq!(KiaError::invalid_state("x").kind(), ErrorKind::InvalidState);
        assert_eq!(
            KiaError::from(kia_types::TextError::Empty).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            KiaError::FileWrite(std::io::Error::other("disk full")).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_rollback_failed_reports_both_errors() {
        let err = KiaError::RollbackFailed {
            error: Box::new(KiaError::FileWrite(std::io::Error::other("disk full"))),
            compensation: Box::new(KiaError::Gateway("directory offline".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("disk full"));
        assert!(msg.contains("directory offline"));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
