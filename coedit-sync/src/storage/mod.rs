//! Storage service boundary: the authoritative copy of each document.
//!
//! - [`http::HttpStorage`] — REST client (`GET`/`PUT /documents/{id}`,
//!   `POST /documents/{id}/share`) with bearer auth
//! - [`memory::MemoryStorage`] — in-process store with failure injection

pub mod http;
pub mod memory;

use crate::auth::AuthError;
use crate::document::Document;

#[async_trait::async_trait]
pub trait StorageService: Send + Sync {
    /// Load a document.
    async fn fetch(&self, document_id: &str) -> Result<Document, StorageError>;

    /// Replace a document's content.
    async fn update_content(&self, document_id: &str, content: &str) -> Result<(), StorageError>;

    /// Grant `username` access to a document.
    async fn share(&self, document_id: &str, username: &str) -> Result<(), StorageError>;
}

/// Storage failures. Fetch callers branch on the variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("document not found")]
    NotFound,
    #[error("access to the document is forbidden")]
    Forbidden,
    #[error("not authenticated: {0}")]
    Unauthorized(String),
    #[error("storage service returned status {0}")]
    Status(u16),
    #[error("storage service unreachable: {0}")]
    Network(String),
    #[error("unexpected storage response: {0}")]
    Decode(String),
}

impl From<AuthError> for StorageError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Network(message) => StorageError::Network(message),
            other => StorageError::Unauthorized(other.to_string()),
        }
    }
}
