use atlas_core::{AtomError, AtomId, FormatError, IndexError, NamespaceId, ProjectionError, StoreError};
use thiserror::Error;

use super::relations::RelationId;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Atom(#[from] AtomError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown atom: {0}")]
    UnknownAtom(AtomId),

    #[error("Unknown namespace: {0}")]
    UnknownNamespace(NamespaceId),

    #[error("Namespace {0} already exists")]
    NamespaceExists(NamespaceId),

    #[error("Unknown relation: {0}")]
    UnknownRelation(RelationId),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
