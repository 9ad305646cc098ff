//! REST client for the storage service.
//!
//! ```text
//! GET  /documents/{id}         → {id, title, language, content}
//! PUT  /documents/{id}         ← {content}
//! POST /documents/{id}/share   ← {username}
//! ```
//!
//! Every request carries `Authorization: Bearer <token>` from the
//! [`AuthSession`]. A 401 triggers one token refresh and one retry when the
//! session can refresh.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use super::{StorageError, StorageService};
use crate::auth::AuthSession;
use crate::document::Document;

pub struct HttpStorage {
    client: reqwest::Client,
    api_url: String,
    auth: Arc<AuthSession>,
}

impl HttpStorage {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>, auth: Arc<AuthSession>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    /// Client with a per-request timeout.
    pub fn with_timeout(
        api_url: impl Into<String>,
        auth: Arc<AuthSession>,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::Network(e.to_string()))?;
        Ok(Self::new(client, api_url, auth))
    }

    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    fn document_url(&self, document_id: &str) -> String {
        format!("{}/documents/{}", self.api_url, document_id)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, StorageError> {
        let mut token = self.auth.bearer().await?;
        let mut refreshed = false;
        loop {
            let mut request = self.client.request(method.clone(), url).bearer_auth(&token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request
                .send()
                .await
                .map_err(|e| StorageError::Network(e.to_string()))?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed && self.auth.can_refresh() {
                log::debug!("{method} {url} returned 401, refreshing token");
                token = self.auth.refresh(&token).await?;
                refreshed = true;
                continue;
            }
            return check_status(response).await;
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    log::debug!("Storage request failed: {status} {body}");
    Err(match status {
        StatusCode::NOT_FOUND => StorageError::NotFound,
        StatusCode::FORBIDDEN => StorageError::Forbidden,
        StatusCode::UNAUTHORIZED => StorageError::Unauthorized(body),
        other => StorageError::Status(other.as_u16()),
    })
}

#[async_trait::async_trait]
impl StorageService for HttpStorage {
    async fn fetch(&self, document_id: &str) -> Result<Document, StorageError> {
        let url = self.document_url(document_id);
        let response = self.send(Method::GET, &url, None).await?;
        response
            .json::<Document>()
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))
    }

    async fn update_content(&self, document_id: &str, content: &str) -> Result<(), StorageError> {
        let url = self.document_url(document_id);
        let body = json!({ "content": content });
        self.send(Method::PUT, &url, Some(&body)).await?;
        Ok(())
    }

    async fn share(&self, document_id: &str, username: &str) -> Result<(), StorageError> {
        let url = format!("{}/share", self.document_url(document_id));
        let body = json!({ "username": username });
        self.send(Method::POST, &url, Some(&body)).await?;
        log::info!("Shared document {document_id} with {username}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessToken, UserIdentity};

    fn storage(api_url: &str) -> HttpStorage {
        let auth = AuthSession::new(UserIdentity::new("1", "alice"), AccessToken::new("t", None));
        HttpStorage::new(reqwest::Client::new(), api_url, Arc::new(auth))
    }

    #[test]
    fn test_document_urls() {
        let s = storage("http://localhost:8000/");
        assert_eq!(s.document_url("42"), "http://localhost:8000/documents/42");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_network_error() {
        // Port 9 (discard) on localhost is closed in test environments.
        let s = storage("http://127.0.0.1:9");
        assert!(matches!(s.fetch("1").await, Err(StorageError::Network(_))));
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_is_unauthorized() {
        let s = storage("http://127.0.0.1:9");
        s.auth().invalidate();
        assert!(matches!(
            s.update_content("1", "x").await,
            Err(StorageError::Unauthorized(_))
        ));
    }
}
