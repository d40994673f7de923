use thiserror::Error;

use crate::RepoError;

#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler read an entity its loader never asked for
    #[error("{kind} {id} was read without being loaded first")]
    NotLoaded { kind: String, id: String },
    #[error("could not (de)serialize entity: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{event_name} has no param named {name}")]
    MissingParam { event_name: String, name: String },
    #[error("{event_name}.{name} is not a valid {expected}")]
    InvalidParam {
        event_name: String,
        name: String,
        expected: String,
    },
    #[error("cannot register an address for unknown contract {contract_name}")]
    UnknownContract { contract_name: String },
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("{0}")]
    Custom(String),
}

impl HandlerError {
    pub fn custom(message: impl Into<String>) -> Self {
        HandlerError::Custom(message.into())
    }
}
