use thiserror::Error;

use crate::urn::Urn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid URN '{urn}': {reason}")]
    InvalidUrn { urn: String, reason: String },

    #[error("invalid property path '{path}': {reason}")]
    InvalidPropertyPath { path: String, reason: String },

    #[error("duplicate resource in snapshot: {0}")]
    DuplicateResource(Urn),

    #[error("resource {urn} refers to {dependency}, which does not precede it in the snapshot")]
    OutOfOrder { urn: Urn, dependency: Urn },
}
