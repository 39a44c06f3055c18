use thiserror::Error;

use crate::types::Version;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("invalid collection: {0}")]
    InvalidCollection(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("migration {version} failed to apply: {source}")]
    Apply {
        version: Version,
        #[source]
        source: Box<Error>,
    },

    #[error("migration {version} failed to revert: {source}")]
    Revert {
        version: Version,
        #[source]
        source: Box<Error>,
    },

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("ledger out of sync with store: {0}")]
    OutOfSync(String),

    #[error("store is locked: {0}")]
    Locked(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a store failure with the version of the unit being applied.
    pub fn apply(version: Version, source: Error) -> Self {
        Error::Apply {
            version,
            source: Box::new(source),
        }
    }

    /// Wrap a store failure with the version of the unit being reverted.
    pub fn revert(version: Version, source: Error) -> Self {
        Error::Revert {
            version,
            source: Box::new(source),
        }
    }

    /// Descriptor authoring errors, caught before any store mutation.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidField(_) | Error::InvalidCollection(_))
    }
}
