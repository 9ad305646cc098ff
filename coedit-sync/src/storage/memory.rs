//! In-process document store.
//!
//! Shares state across clones so a test can hand one clone to a session and
//! inspect another. Failure knobs make the next N saves or every fetch fail;
//! a delay knob holds the next save open so it can overlap later ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{StorageError, StorageService};
use crate::document::Document;

#[derive(Debug, Default)]
struct StoreState {
    documents: HashMap<String, Document>,
    /// Content of every save call, successful or not, in order.
    saves: Vec<(String, String)>,
    fail_saves: usize,
    save_delay: Option<Duration>,
    fetch_error: Option<StorageError>,
    shares: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(self, id: impl Into<String>, content: impl Into<String>) -> Self {
        let id = id.into();
        self.state
            .lock()
            .documents
            .insert(id.clone(), Document::new(id, content));
        self
    }

    pub fn content(&self, id: &str) -> Option<String> {
        self.state.lock().documents.get(id).map(|d| d.content.clone())
    }

    pub fn set_content(&self, id: &str, content: &str) {
        if let Some(doc) = self.state.lock().documents.get_mut(id) {
            doc.content = content.to_string();
        }
    }

    /// Number of save attempts so far.
    pub fn save_calls(&self) -> usize {
        self.state.lock().saves.len()
    }

    /// Content sent by each save attempt, in order.
    pub fn saved_contents(&self) -> Vec<String> {
        self.state.lock().saves.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Fail the next `n` saves with a 503.
    pub fn fail_next_saves(&self, n: usize) {
        self.state.lock().fail_saves = n;
    }

    /// Hold the next save for `delay` before it writes.
    pub fn delay_next_save(&self, delay: Duration) {
        self.state.lock().save_delay = Some(delay);
    }

    /// Fail every fetch with `error` (or stop failing with `None`).
    pub fn fail_fetches(&self, error: Option<StorageError>) {
        self.state.lock().fetch_error = error;
    }

    /// `(document_id, username)` for every share granted.
    pub fn shares(&self) -> Vec<(String, String)> {
        self.state.lock().shares.clone()
    }
}

#[async_trait::async_trait]
impl StorageService for MemoryStorage {
    async fn fetch(&self, document_id: &str) -> Result<Document, StorageError> {
        let state = self.state.lock();
        if let Some(error) = &state.fetch_error {
            return Err(error.clone());
        }
        state
            .documents
            .get(document_id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_content(&self, document_id: &str, content: &str) -> Result<(), StorageError> {
        let delay = {
            let mut state = self.state.lock();
            state.saves.push((document_id.to_string(), content.to_string()));
            state.save_delay.take()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_saves > 0 {
            state.fail_saves -= 1;
            return Err(StorageError::Status(503));
        }
        let doc = state
            .documents
            .get_mut(document_id)
            .ok_or(StorageError::NotFound)?;
        doc.content = content.to_string();
        Ok(())
    }

    async fn share(&self, document_id: &str, username: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if !state.documents.contains_key(document_id) {
            return Err(StorageError::NotFound);
        }
        state
            .shares
            .push((document_id.to_string(), username.to_string()));
        Ok(())
    }
}
