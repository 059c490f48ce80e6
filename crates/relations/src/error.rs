//! Error types for the relation system
//!
//! Definition-time problems (bad relation types, broken options) surface as
//! `Configuration` errors the moment a relation is declared. Resolution-time
//! problems (connector failures, malformed include specs) propagate to the
//! caller of the find/include operation as a single error.

use thiserror::Error;

/// Result type alias for model and relation operations
pub type ModelResult<T> = Result<T, ModelError>;

/// Error types for relation definition and resolution
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// The storage connector failed to execute an operation
    #[error("Database error: {0}")]
    Database(String),

    /// Record not found in the given model
    #[error("Record not found in model '{0}'")]
    NotFound(String),

    /// Input failed validation (include specs, embedded items, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Primary key is missing or invalid
    #[error("Primary key is missing or invalid")]
    MissingPrimaryKey,

    /// Relationship lookup or binding failed
    #[error("Relationship error: {0}")]
    Relationship(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Relation or model definition error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Serialization(err.to_string())
    }
}

// Connectors built on anyhow report their failures as database errors
impl From<anyhow::Error> for ModelError {
    fn from(err: anyhow::Error) -> Self {
        ModelError::Database(err.to_string())
    }
}

/// Error types raised while declaring relations
#[derive(Debug, Clone, Error)]
pub enum RelationshipError {
    /// Relation declared without a type
    #[error("Relation '{0}' was declared without a type")]
    MissingType(String),

    /// Relation type outside the known set
    #[error("Unknown relation type '{kind}' for relation '{name}'")]
    UnknownType { name: String, kind: String },

    /// Relationship not found on a model
    #[error("Relationship not found: {0}")]
    NotFound(String),

    /// Invalid relationship configuration
    #[error("Invalid relationship configuration: {0}")]
    InvalidConfiguration(String),

    /// Relation still waits for one of its models to be defined
    #[error("Relation '{relation}' on '{model}' is not bound yet: model '{missing}' is undefined")]
    Unbound {
        model: String,
        relation: String,
        missing: String,
    },
}

impl From<RelationshipError> for ModelError {
    fn from(err: RelationshipError) -> Self {
        match err {
            RelationshipError::MissingType(_)
            | RelationshipError::UnknownType { .. }
            | RelationshipError::InvalidConfiguration(_) => {
                ModelError::Configuration(err.to_string())
            }
            RelationshipError::NotFound(_) | RelationshipError::Unbound { .. } => {
                ModelError::Relationship(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_errors_map_to_configuration() {
        let err: ModelError = RelationshipError::UnknownType {
            name: "posts".to_string(),
            kind: "hasSome".to_string(),
        }
        .into();
        assert!(matches!(err, ModelError::Configuration(_)));
        assert!(err.to_string().contains("hasSome"));

        let err: ModelError = RelationshipError::MissingType("posts".to_string()).into();
        assert!(matches!(err, ModelError::Configuration(_)));
    }

    #[test]
    fn test_unbound_maps_to_relationship() {
        let err: ModelError = RelationshipError::Unbound {
            model: "User".to_string(),
            relation: "posts".to_string(),
            missing: "Post".to_string(),
        }
        .into();
        assert!(matches!(err, ModelError::Relationship(_)));
        assert!(err.to_string().contains("'Post' is undefined"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ModelError = parse_err.into();
        assert!(matches!(err, ModelError::Serialization(_)));
    }

    #[test]
    fn test_anyhow_error_conversion() {
        let err: ModelError = anyhow::anyhow!("connection reset").into();
        assert_eq!(err.to_string(), "Database error: connection reset");
    }
}
