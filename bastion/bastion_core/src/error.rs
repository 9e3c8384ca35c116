//! Error types for the Bastion engine.
//!
//! Errors are organized by the failure taxonomy callers need to branch on:
//! policy denials, validation failures, usage errors, schema integrity
//! problems and failures bubbling up from the storage collaborator.
//!
//! The root error type, `Error`, wraps the subsystem errors so that every
//! layer of the client stack can propagate a single type.

use crate::types::PolicyOperation;
use thiserror::Error;

/// Root error type for Bastion.
#[derive(Debug, Error)]
pub enum Error {
    /// Access-policy errors
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Payload validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Invalid arguments or unsupported usage
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Schema metadata integrity errors
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Errors raised by the storage collaborator
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A required entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The query context could not be accepted
    #[error("Invalid query context: {0}")]
    Context(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected failures, with the original error preserved
    #[error("Unknown error: {message}")]
    Unknown {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Errors produced by policy enforcement.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A guard excluded the target entity or was statically false
    #[error("denied by policy: {model} entities failed '{operation}' check{}", detail_suffix(.detail))]
    Denied {
        model: String,
        operation: PolicyOperation,
        detail: Option<String>,
    },

    /// The write succeeded but the result cannot be read back
    #[error("result of '{operation}' on {model} is not readable under the current policy")]
    ResultNotReadable {
        model: String,
        operation: PolicyOperation,
    },

    /// No permission checker is available for a static check
    #[error("no permission checker for {model}.{operation}")]
    MissingChecker {
        model: String,
        operation: PolicyOperation,
    },
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(", {}", d),
        None => String::new(),
    }
}

/// Errors produced by payload validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The payload violated the model's validation schema
    #[error("data for {model} failed validation: {detail}")]
    Failed { model: String, detail: String },

    /// The validation schema itself could not be compiled
    #[error("invalid validation schema for {model}: {detail}")]
    InvalidSchema { model: String, detail: String },
}

/// Usage and argument errors, raised before any I/O.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A required argument was not supplied
    #[error("'{argument}' is required for '{action}'")]
    MissingArgument { action: String, argument: String },

    /// The argument object has the wrong shape
    #[error("invalid arguments for '{action}': {detail}")]
    InvalidArgument { action: String, detail: String },

    /// The model is not part of the schema
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// The field is not part of the model
    #[error("unknown field {model}.{field}")]
    UnknownField { model: String, field: String },

    /// Delegate models cannot be instantiated directly
    #[error("model \"{model}\" is a delegate and cannot be used with '{action}' directly")]
    AbstractModel { model: String, action: String },

    /// Discriminator fields are system managed
    #[error("field \"{field}\" is a discriminator of {model} and cannot be set directly")]
    DiscriminatorWrite { model: String, field: String },

    /// Aggregation over fields stored on a base model
    #[error("aggregation on {model} cannot reference inherited field \"{field}\"")]
    InheritedAggregation { model: String, field: String },

    /// `skipDuplicates` on a hierarchy model
    #[error("'skipDuplicates' is not supported for {model} because it participates in a delegate hierarchy")]
    SkipDuplicates { model: String },

    /// Extra constraints passed to a permission check are invalid
    #[error("invalid permission check constraint: {0}")]
    InvalidCheck(String),
}

/// Schema metadata integrity errors.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A model declares more than one base
    #[error("model {0} declares more than one base type; multiple inheritance is not supported")]
    MultipleInheritance(String),

    /// The base chain loops back on itself
    #[error("model {0} is part of an inheritance cycle")]
    InheritanceCycle(String),

    /// The declared base model does not exist
    #[error("model {model} inherits from unknown model {base}")]
    UnknownBase { model: String, base: String },

    /// A creatable model has no id fields
    #[error("model {0} has no id fields")]
    MissingIdFields(String),

    /// A relation names a back link that does not exist
    #[error("relation {model}.{field} names missing back link {back_link}")]
    InvalidBackLink {
        model: String,
        field: String,
        back_link: String,
    },

    /// A relation targets a model that does not exist
    #[error("relation {model}.{field} targets unknown model {target}")]
    UnknownRelationTarget {
        model: String,
        field: String,
        target: String,
    },
}

/// Errors raised by the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A record required by the operation was not found
    #[error("record not found in {model}: {detail}")]
    RecordNotFound { model: String, detail: String },

    /// A unique constraint was violated
    #[error("unique constraint failed on {model}({})", .fields.join(", "))]
    UniqueConstraint { model: String, fields: Vec<String> },

    /// A foreign-key or relation constraint was violated
    #[error("relation violation on {model}: {detail}")]
    RelationViolation { model: String, detail: String },

    /// The storage engine rejected the query
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The transaction failed or timed out
    #[error("transaction error: {0}")]
    Transaction(String),
}

/// Coarse classification of an error, following the engine's failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A guard rejected the operation
    DeniedByPolicy,
    /// The operation completed but its result is not readable
    ResultNotReadable,
    /// A required entity does not exist
    NotFound,
    /// The payload failed validation
    Validation,
    /// The caller misused the API
    Usage,
    /// The storage collaborator reported a failure
    Storage,
    /// Anything else
    Unknown,
}

impl Error {
    /// Wrap an unexpected error, keeping it as the source.
    pub fn unknown<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Unknown {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }

    /// Build a policy denial error.
    pub fn denied(
        model: impl Into<String>,
        operation: PolicyOperation,
        detail: Option<String>,
    ) -> Self {
        PolicyError::Denied {
            model: model.into(),
            operation,
            detail,
        }
        .into()
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Policy(PolicyError::Denied { .. }) => ErrorKind::DeniedByPolicy,
            Error::Policy(PolicyError::ResultNotReadable { .. }) => ErrorKind::ResultNotReadable,
            Error::Policy(PolicyError::MissingChecker { .. }) => ErrorKind::Usage,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Query(_) | Error::Schema(_) | Error::Context(_) | Error::Config(_) => {
                ErrorKind::Usage
            }
            Error::NotFound(_) | Error::Storage(StorageError::RecordNotFound { .. }) => {
                ErrorKind::NotFound
            }
            Error::Storage(_) => ErrorKind::Storage,
            Error::Serialization(_) | Error::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Whether the error is a policy denial.
    pub fn is_denied(&self) -> bool {
        self.kind() == ErrorKind::DeniedByPolicy
    }
}

/// Result type used throughout Bastion.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::denied("Post", PolicyOperation::Update, None);
        assert_eq!(
            err.to_string(),
            "Policy error: denied by policy: Post entities failed 'update' check"
        );

        let err = Error::denied(
            "Post",
            PolicyOperation::Create,
            Some("entity {\"id\":1} failed policy check".to_string()),
        );
        assert!(err.to_string().ends_with("entity {\"id\":1} failed policy check"));

        let err: Error = StorageError::UniqueConstraint {
            model: "User".to_string(),
            fields: vec!["email".to_string()],
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Storage error: unique constraint failed on User(email)"
        );
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(
            Error::denied("Post", PolicyOperation::Read, None).kind(),
            ErrorKind::DeniedByPolicy
        );
        assert_eq!(
            Error::from(PolicyError::ResultNotReadable {
                model: "Post".to_string(),
                operation: PolicyOperation::Create,
            })
            .kind(),
            ErrorKind::ResultNotReadable
        );
        assert_eq!(
            Error::from(QueryError::SkipDuplicates {
                model: "Video".to_string()
            })
            .kind(),
            ErrorKind::Usage
        );
        assert_eq!(
            Error::NotFound("Post".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::from(ValidationError::Failed {
                model: "Post".to_string(),
                detail: "/title: too short".to_string()
            })
            .kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_unknown_preserves_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = Error::unknown(io);
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "Unknown error: disk on fire");
    }
}
