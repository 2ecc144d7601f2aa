use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::IdType;

#[derive(Debug, Error, Diagnostic)]
pub enum ReconcileError {
    #[error("invalid identifier specifier: {0}")]
    InvalidSpecifier(String),

    #[error("unparseable {id_type}: {value}")]
    UnparseableIdentifier { id_type: IdType, value: String },

    #[error("record has no usable identifier after normalization")]
    NoIdentifiers,

    #[error("{id_type} {value} resolves to multiple text refs: {candidates:?}")]
    AmbiguousReference {
        id_type: IdType,
        value: String,
        candidates: Vec<u64>,
    },

    #[error("reference store query failed: {0}")]
    #[diagnostic(help("nothing was written; rerun once the store is reachable"))]
    StoreQuery(String),

    #[error("reference store rejected a write: {0}")]
    #[diagnostic(help("the batch was aborted before any change was persisted"))]
    StoreWrite(String),

    #[error("text ref not found: {0}")]
    NotFound(String),

    #[error("missing input: {0}")]
    MissingInput(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("failed to read metadata at {path}: {message}")]
    MetadataRead { path: PathBuf, message: String },

    #[error("malformed metadata row {line}: {message}")]
    MetadataParse { line: u64, message: String },

    #[error("failed to read document {0}")]
    DocumentRead(String),

    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("filesystem error: {0}")]
    Filesystem(String),
}
