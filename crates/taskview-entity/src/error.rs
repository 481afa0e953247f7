//! Error types for entity normalization

use crate::field::Field;

/// Normalization failure; every variant means the entity is malformed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// Backend entity carried no id
    #[error("malformed entity: missing id")]
    MissingId,

    /// A required primary field is absent or null
    #[error("malformed entity: missing required field `{0}`")]
    MissingField(Field),

    /// A relation field holds a value of the wrong kind
    #[error("malformed entity: field `{field}` expected {expected}, found {found}")]
    InvalidFieldType {
        /// Offending field
        field: Field,
        /// Expected value kind
        expected: &'static str,
        /// Actual value kind
        found: &'static str,
    },
}
