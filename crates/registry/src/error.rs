use graph_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("agent '{0}' not found")]
    NotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
