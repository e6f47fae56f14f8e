use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::BackendError;
use crate::model::{
    AccessToken, Credentials, DocumentId, DocumentRecord, QueryAnswer, QueryRequest,
    Registration, SettingsUpdate, UploadFile, UserProfile,
};

/// Receives whole upload percentages.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// The document Q&A REST surface. Every call except `register` and `login`
/// is authenticated with the bearer token it is given.
#[async_trait]
pub trait DocQaBackend: Send + Sync {
    async fn register(&self, registration: &Registration) -> BackendResult<UserProfile>;

    async fn login(&self, credentials: &Credentials) -> BackendResult<AccessToken>;

    async fn fetch_profile(&self, token: &AccessToken) -> BackendResult<UserProfile>;

    async fn update_profile(
        &self,
        token: &AccessToken,
        update: &SettingsUpdate,
    ) -> BackendResult<UserProfile>;

    async fn list_documents(&self, token: &AccessToken) -> BackendResult<Vec<DocumentRecord>>;

    async fn fetch_document(
        &self,
        token: &AccessToken,
        id: DocumentId,
    ) -> BackendResult<DocumentRecord>;

    /// Streams `file` to the ingestion backend, reporting progress through
    /// `progress` as bytes go out.
    async fn upload_document(
        &self,
        token: &AccessToken,
        file: UploadFile,
        progress: ProgressFn,
    ) -> BackendResult<DocumentRecord>;

    async fn delete_document(&self, token: &AccessToken, id: DocumentId) -> BackendResult<()>;

    async fn query(&self, token: &AccessToken, request: &QueryRequest)
    -> BackendResult<QueryAnswer>;
}

/// Durable slot for the one value persisted across restarts.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<AccessToken>>;
    fn save(&self, token: &AccessToken) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<AccessToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: AccessToken) -> Self {
        Self {
            slot: Mutex::new(Some(token)),
        }
    }

    pub fn peek(&self) -> Option<AccessToken> {
        self.slot.lock().clone()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<AccessToken>> {
        Ok(self.slot.lock().clone())
    }

    fn save(&self, token: &AccessToken) -> Result<()> {
        *self.slot.lock() = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.slot.lock().take();
        Ok(())
    }
}
