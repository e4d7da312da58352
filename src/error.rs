use thiserror::Error;

use crate::config::ConfigError;
use crate::http_client::HttpError;
use crate::security::form::FormError;
use crate::security::gate::GateError;
use crate::security::token::TokenFetchError;
use crate::storage::StorageError;

/// Any failure surfaced by the guard layer
#[derive(Debug, Error)]
pub enum GuardError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Token(#[from] TokenFetchError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Form(#[from] FormError),
}

pub type GuardResult<T> = Result<T, GuardError>;
