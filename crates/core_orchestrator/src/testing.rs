//! Scripted in-memory backend for orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use core_types::{
    AccessToken, BackendError, BackendResult, Credentials, DocQaBackend, DocumentId,
    DocumentRecord, DocumentStatus, ProgressFn, QueryAnswer, QueryRequest, Registration,
    SettingsUpdate, UploadFile, UploadProgress, UserProfile,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

const CHUNK: usize = 64 * 1024;

pub(crate) fn profile(username: &str) -> UserProfile {
    UserProfile {
        id: 1,
        username: username.to_string(),
        email: None,
        preferred_provider: Default::default(),
        preferred_model: "gpt-3.5-turbo".to_string(),
        has_openai_key: false,
        has_anthropic_key: false,
        has_custom_endpoint: false,
        created_at: None,
    }
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    users: Mutex<HashMap<String, (UserProfile, String)>>,
    tokens: Mutex<HashMap<String, String>>,
    documents: Mutex<Vec<DocumentRecord>>,
    answers: Mutex<VecDeque<BackendResult<QueryAnswer>>>,
    failures: Mutex<HashMap<&'static str, BackendError>>,
    per_op: Mutex<HashMap<&'static str, usize>>,
    last_query: Mutex<Option<QueryRequest>>,
    last_update: Mutex<Option<Value>>,
    query_gate: Mutex<Option<Arc<Notify>>>,
    upload_gate: Mutex<Option<Arc<Notify>>>,
    calls: AtomicUsize,
    next_id: AtomicI64,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    pub(crate) fn with_user(username: &str, password: &str) -> Self {
        let backend = Self::new();
        backend.add_user(profile(username), password);
        backend
    }

    pub(crate) fn add_user(&self, profile: UserProfile, password: &str) {
        self.users
            .lock()
            .insert(profile.username.clone(), (profile, password.to_string()));
    }

    pub(crate) fn grant_openai_key(&self, username: &str) {
        if let Some((profile, _)) = self.users.lock().get_mut(username) {
            profile.has_openai_key = true;
        }
    }

    pub(crate) fn issue_token(&self, username: &str) -> AccessToken {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = format!("token-{username}-{id}");
        self.tokens.lock().insert(token.clone(), username.to_string());
        AccessToken::new(token)
    }

    pub(crate) fn expire_tokens(&self) {
        self.tokens.lock().clear();
    }

    pub(crate) fn seed_document(&self, filename: &str, size: u64, status: DocumentStatus) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.documents.lock().push(DocumentRecord {
            id,
            filename: filename.to_string(),
            file_size_bytes: size,
            chunk_count: 0,
            status,
            file_type: None,
            upload_date: None,
        });
        id
    }

    pub(crate) fn set_status(&self, id: i64, status: DocumentStatus) {
        if let Some(doc) = self.documents.lock().iter_mut().find(|d| d.id == id) {
            doc.status = status;
        }
    }

    pub(crate) fn queue_answer(&self, answer: BackendResult<QueryAnswer>) {
        self.answers.lock().push_back(answer);
    }

    pub(crate) fn fail_next(&self, op: &'static str, err: BackendError) {
        self.failures.lock().insert(op, err);
    }

    pub(crate) fn fail_next_profile(&self, err: BackendError) {
        self.fail_next("profile", err);
    }

    /// Makes `query` wait until the returned handle is notified.
    pub(crate) fn hold_queries(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.query_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Makes `upload_document` pause after its first chunk until notified.
    pub(crate) fn hold_uploads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.upload_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_to(&self, op: &'static str) -> usize {
        self.per_op.lock().get(op).copied().unwrap_or(0)
    }

    pub(crate) fn last_query(&self) -> Option<QueryRequest> {
        self.last_query.lock().clone()
    }

    pub(crate) fn last_update(&self) -> Option<Value> {
        self.last_update.lock().clone()
    }

    fn enter(&self, op: &'static str) -> BackendResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.per_op.lock().entry(op).or_default() += 1;
        match self.failures.lock().remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn user_for(&self, token: &AccessToken) -> BackendResult<String> {
        self.tokens
            .lock()
            .get(token.as_str())
            .cloned()
            .ok_or(BackendError::Unauthorized {
                detail: Some("Could not validate credentials".to_string()),
            })
    }
}

#[async_trait]
impl DocQaBackend for FakeBackend {
    async fn register(&self, registration: &Registration) -> BackendResult<UserProfile> {
        self.enter("register")?;
        let mut users = self.users.lock();
        if users.contains_key(&registration.username) {
            return Err(BackendError::Status {
                status: 400,
                detail: Some("Username already registered".to_string()),
            });
        }
        let mut created = profile(&registration.username);
        created.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        created.email = registration.email.clone();
        users.insert(
            registration.username.clone(),
            (created.clone(), registration.password.clone()),
        );
        Ok(created)
    }

    async fn login(&self, credentials: &Credentials) -> BackendResult<AccessToken> {
        self.enter("login")?;
        let valid = self
            .users
            .lock()
            .get(&credentials.username)
            .is_some_and(|(_, password)| *password == credentials.password);
        if !valid {
            return Err(BackendError::Unauthorized {
                detail: Some("Incorrect username or password".to_string()),
            });
        }
        Ok(self.issue_token(&credentials.username))
    }

    async fn fetch_profile(&self, token: &AccessToken) -> BackendResult<UserProfile> {
        self.enter("profile")?;
        let username = self.user_for(token)?;
        self.users
            .lock()
            .get(&username)
            .map(|(profile, _)| profile.clone())
            .ok_or(BackendError::Unauthorized { detail: None })
    }

    async fn update_profile(
        &self,
        token: &AccessToken,
        update: &SettingsUpdate,
    ) -> BackendResult<UserProfile> {
        self.enter("update")?;
        let username = self.user_for(token)?;
        *self.last_update.lock() = serde_json::to_value(update).ok();
        let mut users = self.users.lock();
        let (profile, _) = users
            .get_mut(&username)
            .ok_or(BackendError::Unauthorized { detail: None })?;
        if let Some(email) = &update.email {
            profile.email = Some(email.clone());
        }
        if update.openai_api_key.is_some() {
            profile.has_openai_key = true;
        }
        if update.anthropic_api_key.is_some() {
            profile.has_anthropic_key = true;
        }
        if update.custom_llm_endpoint.is_some() {
            profile.has_custom_endpoint = true;
        }
        if let Some(provider) = update.preferred_provider {
            profile.preferred_provider = provider;
        }
        if let Some(model) = &update.preferred_model {
            profile.preferred_model = model.clone();
        }
        Ok(profile.clone())
    }

    async fn list_documents(&self, token: &AccessToken) -> BackendResult<Vec<DocumentRecord>> {
        self.enter("list")?;
        self.user_for(token)?;
        Ok(self.documents.lock().clone())
    }

    async fn fetch_document(
        &self,
        token: &AccessToken,
        id: DocumentId,
    ) -> BackendResult<DocumentRecord> {
        self.enter("get")?;
        self.user_for(token)?;
        self.documents
            .lock()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(BackendError::Status {
                status: 404,
                detail: Some("Document not found".to_string()),
            })
    }

    async fn upload_document(
        &self,
        token: &AccessToken,
        file: UploadFile,
        progress: ProgressFn,
    ) -> BackendResult<DocumentRecord> {
        self.enter("upload")?;
        self.user_for(token)?;
        let gate = self.upload_gate.lock().clone();
        let mut tracker = UploadProgress::new(file.size(), progress);
        for (index, chunk) in file.bytes.chunks(CHUNK).enumerate() {
            tracker.advance(chunk.len() as u64);
            if index == 0
                && let Some(gate) = &gate
            {
                gate.notified().await;
            }
            tokio::task::yield_now().await;
        }
        let record = DocumentRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            filename: file.filename.clone(),
            file_size_bytes: file.size(),
            chunk_count: 0,
            status: DocumentStatus::Processing,
            file_type: file.extension(),
            upload_date: None,
        };
        self.documents.lock().push(record.clone());
        Ok(record)
    }

    async fn delete_document(&self, token: &AccessToken, id: DocumentId) -> BackendResult<()> {
        self.enter("delete")?;
        self.user_for(token)?;
        let mut documents = self.documents.lock();
        let before = documents.len();
        documents.retain(|d| d.id != id);
        if documents.len() == before {
            return Err(BackendError::Status {
                status: 404,
                detail: Some("Document not found".to_string()),
            });
        }
        Ok(())
    }

    async fn query(
        &self,
        token: &AccessToken,
        request: &QueryRequest,
    ) -> BackendResult<QueryAnswer> {
        self.enter("query")?;
        *self.last_query.lock() = Some(request.clone());
        let gate = self.query_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.user_for(token)?;
        let queued = self.answers.lock().pop_front();
        queued.unwrap_or_else(|| {
            Ok(QueryAnswer {
                answer: format!("echo: {}", request.query),
                sources: Vec::new(),
                query: request.query.clone(),
            })
        })
    }
}
