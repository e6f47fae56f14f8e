//! Client-side state for the document Q&A service: one session shared by the
//! document tracker, the query exchange and the settings controller.

mod documents;
mod query;
mod session;
mod settings;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use core_types::{DocQaBackend, TokenStore};

pub use documents::{DocumentTracker, PollHandle, PollOptions, UploadPolicy, UploadReceipt};
pub use query::{DEFAULT_TOP_K, MAX_QUERY_CHARS, QueryController, QueryOptions, QueryOutcome};
pub use session::{RegistrationForm, Session, SessionStore};
pub use settings::SettingsController;

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub upload_policy: UploadPolicy,
    pub query_defaults: QueryOptions,
}

/// Every component of one client, built over a single session.
#[derive(Clone)]
pub struct ClientContext {
    pub session: Arc<SessionStore>,
    pub documents: Arc<DocumentTracker>,
    pub queries: Arc<QueryController>,
    pub settings: Arc<SettingsController>,
}

impl ClientContext {
    pub fn new(
        backend: Arc<dyn DocQaBackend>,
        tokens: Arc<dyn TokenStore>,
        options: ClientOptions,
    ) -> Self {
        let session = Arc::new(SessionStore::new(Arc::clone(&backend), tokens));
        Self {
            documents: Arc::new(DocumentTracker::new(
                Arc::clone(&session),
                Arc::clone(&backend),
                options.upload_policy,
            )),
            queries: Arc::new(QueryController::with_defaults(
                Arc::clone(&session),
                Arc::clone(&backend),
                options.query_defaults,
            )),
            settings: Arc::new(SettingsController::new(Arc::clone(&session), backend)),
            session,
        }
    }

    /// Builds the context and reconciles any persisted token with the backend.
    pub async fn start(
        backend: Arc<dyn DocQaBackend>,
        tokens: Arc<dyn TokenStore>,
        options: ClientOptions,
    ) -> Self {
        let context = Self::new(backend, tokens, options);
        context.session.restore().await;
        context
    }

    pub fn logout(&self) {
        self.session.logout();
    }
}
