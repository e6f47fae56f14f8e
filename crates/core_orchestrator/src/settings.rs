use std::sync::Arc;

use core_types::{ClientError, DocQaBackend, SettingsUpdate, UserProfile};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::session::SessionStore;

/// Sends partial profile updates. Blank fields are treated as absent.
/// Credentials pass through by value and are gone once the call returns,
/// whatever its outcome.
pub struct SettingsController {
    session: Arc<SessionStore>,
    backend: Arc<dyn DocQaBackend>,
    last_error: Mutex<Option<String>>,
}

impl SettingsController {
    pub fn new(session: Arc<SessionStore>, backend: Arc<dyn DocQaBackend>) -> Self {
        Self {
            session,
            backend,
            last_error: Mutex::new(None),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<UserProfile, ClientError> {
        let update = update.without_blanks();
        let result = self.apply(&update).await;
        drop(update);
        match result {
            Ok(user) => {
                self.clear_error();
                Ok(user)
            }
            Err(err) => {
                *self.last_error.lock() = Some(err.to_string());
                Err(err)
            }
        }
    }

    async fn apply(&self, update: &SettingsUpdate) -> Result<UserProfile, ClientError> {
        let token = self.session.authorize()?;
        if update.is_empty() {
            return Err(ClientError::validation("Nothing to update"));
        }

        let updated = self
            .backend
            .update_profile(&token, update)
            .await
            .map_err(|err| self.session.absorb(&token, err, "Failed to update settings"))?;
        info!(
            credentials = update.carries_credentials(),
            "settings updated"
        );

        // Re-read so the has_* flags come from the backend's view.
        match self.session.refresh_profile().await {
            Ok(user) => Ok(user),
            Err(err) if err.ends_session() => Err(err),
            Err(err) => {
                warn!(error = %err, "profile refresh after settings update failed");
                self.session.clear_error();
                self.session.install_profile(&token, updated.clone());
                Ok(updated)
            }
        }
    }
}
