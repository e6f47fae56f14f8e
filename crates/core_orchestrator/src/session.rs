use std::sync::Arc;

use core_types::{
    AccessToken, BackendError, ClientError, Credentials, DocQaBackend, Registration, TokenStore,
    UserProfile,
};
use parking_lot::RwLock;
use tracing::{info, warn};

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 50;
const PASSWORD_MIN: usize = 6;

/// Point-in-time view of the authentication state.
///
/// `authenticated` is derived rather than stored: a session is authenticated
/// exactly when both a token and a profile are present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    token: Option<AccessToken>,
    user: Option<UserProfile>,
    pending: bool,
    last_error: Option<String>,
    generation: u64,
}

impl Session {
    pub fn token(&self) -> Option<&AccessToken> {
        self.token.as_ref()
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some() && self.user.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Bumped on every sign-in and sign-out.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_llm_credential(&self) -> bool {
        self.user
            .as_ref()
            .is_some_and(UserProfile::has_llm_credential)
    }
}

/// Input of the registration form.
#[derive(Clone, Default)]
pub struct RegistrationForm {
    pub username: String,
    pub email: Option<String>,
    pub password: String,
    pub confirm_password: Option<String>,
}

impl RegistrationForm {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_confirmation(mut self, confirm: impl Into<String>) -> Self {
        self.confirm_password = Some(confirm.into());
        self
    }

    pub fn validate(self) -> Result<Registration, ClientError> {
        let username = self.username.trim().to_string();
        let length = username.chars().count();
        if !(USERNAME_MIN..=USERNAME_MAX).contains(&length) {
            return Err(ClientError::validation(format!(
                "Username must be between {USERNAME_MIN} and {USERNAME_MAX} characters"
            )));
        }
        if let Some(confirm) = self.confirm_password.as_deref()
            && confirm != self.password
        {
            return Err(ClientError::validation("Passwords do not match"));
        }
        if self.password.chars().count() < PASSWORD_MIN {
            return Err(ClientError::validation(format!(
                "Password must be at least {PASSWORD_MIN} characters"
            )));
        }
        let email = self
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty());
        if let Some(email) = email.as_deref()
            && !looks_like_email(email)
        {
            return Err(ClientError::validation(format!(
                "`{email}` is not a valid email address"
            )));
        }
        Ok(Registration {
            username,
            email,
            password: self.password,
        })
    }
}

pub(crate) fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !value.chars().any(char::is_whitespace)
}

/// Owns the authentication token and the signed-in profile.
///
/// This is the only component that mutates session state. Every other
/// component borrows the token through [`SessionStore::authorize`] and hands
/// backend failures back through [`SessionStore::absorb`], which is where a
/// 401 turns into a logout.
pub struct SessionStore {
    backend: Arc<dyn DocQaBackend>,
    tokens: Arc<dyn TokenStore>,
    state: RwLock<Session>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn DocQaBackend>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            backend,
            tokens,
            state: RwLock::new(Session::default()),
        }
    }

    /// Hydrates from the persisted token and confirms it with the backend.
    /// Returns whether the session ended up authenticated.
    pub async fn restore(&self) -> bool {
        let token = match self.tokens.load() {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => return false,
            Err(err) => {
                warn!(error = %err, "failed to read persisted token");
                return false;
            }
        };

        {
            let mut state = self.state.write();
            state.token = Some(token);
            state.user = None;
        }

        match self.refresh_profile().await {
            Ok(user) => {
                info!(user = %user.username, "restored persisted session");
                true
            }
            Err(err) => {
                warn!(error = %err, "persisted session could not be confirmed");
                false
            }
        }
    }

    pub fn snapshot(&self) -> Session {
        self.state.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().is_authenticated()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.state.read().user.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    pub fn has_llm_credential(&self) -> bool {
        self.state.read().has_llm_credential()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile, ClientError> {
        if username.trim().is_empty() || password.is_empty() {
            return Err(ClientError::validation(
                "Username and password are required",
            ));
        }

        self.begin();
        let credentials = Credentials::new(username.trim(), password);

        let token = match self.backend.login(&credentials).await {
            Ok(token) if !token.is_empty() => token,
            Ok(_) => {
                return Err(self.fail(ClientError::AuthenticationFailure(
                    "Login failed".to_string(),
                )));
            }
            Err(err) => return Err(self.fail(login_error(&err))),
        };

        // Token alone is not a session; without a profile the login fails.
        let user = match self.backend.fetch_profile(&token).await {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %err, "profile fetch failed after token issuance");
                return Err(self.fail(login_error(&err)));
            }
        };

        if let Err(err) = self.tokens.save(&token) {
            warn!(error = %err, "failed to persist session token");
        }

        {
            let mut state = self.state.write();
            state.token = Some(token);
            state.user = Some(user.clone());
            state.pending = false;
            state.last_error = None;
            state.generation += 1;
        }
        info!(user = %user.username, "signed in");
        Ok(user)
    }

    /// Creates an account. Does not sign the caller in.
    pub async fn register(&self, form: RegistrationForm) -> Result<UserProfile, ClientError> {
        let registration = form.validate()?;

        self.begin();
        match self.backend.register(&registration).await {
            Ok(user) => {
                self.state.write().pending = false;
                info!(user = %user.username, "registered account");
                Ok(user)
            }
            Err(err) => Err(self.fail(ClientError::from_backend(
                &without_session(err),
                "Registration failed",
            ))),
        }
    }

    /// Local teardown; never contacts the backend. Safe to call repeatedly.
    pub fn logout(&self) {
        let ended = {
            let mut state = self.state.write();
            let had_session = state.token.is_some() || state.user.is_some();
            state.token = None;
            state.user = None;
            state.pending = false;
            if had_session {
                state.generation += 1;
            }
            had_session
        };

        if let Err(err) = self.tokens.clear() {
            warn!(error = %err, "failed to discard persisted token");
        }
        if ended {
            info!("signed out");
        }
    }

    /// Re-fetches the profile with the current token. A rejected token logs
    /// the session out before the error is returned.
    pub async fn refresh_profile(&self) -> Result<UserProfile, ClientError> {
        let token = self
            .state
            .read()
            .token
            .clone()
            .ok_or(ClientError::NotAuthenticated)?;

        match self.backend.fetch_profile(&token).await {
            Ok(user) => {
                self.install_profile(&token, user.clone());
                Ok(user)
            }
            Err(err) => {
                let mapped = self.absorb(&token, err, "Failed to load profile");
                self.state.write().last_error = Some(mapped.to_string());
                Err(mapped)
            }
        }
    }

    pub fn clear_error(&self) {
        self.state.write().last_error = None;
    }

    /// Token for a protected call. Rejects locally when signed out.
    pub fn authorize(&self) -> Result<AccessToken, ClientError> {
        let state = self.state.read();
        match (&state.token, &state.user) {
            (Some(token), Some(_)) => Ok(token.clone()),
            _ => Err(ClientError::NotAuthenticated),
        }
    }

    /// Translates a backend failure from a call made with `token`.
    ///
    /// A 401 logs out, but only if `token` is still the current one: a late
    /// rejection of an older session must not end a newer one.
    pub fn absorb(&self, token: &AccessToken, err: BackendError, fallback: &str) -> ClientError {
        if !err.is_unauthorized() {
            return ClientError::from_backend(&err, fallback);
        }

        let current = self.state.read().token.as_ref() == Some(token);
        if current {
            warn!("backend rejected the session token, signing out");
            self.logout();
        }
        ClientError::SessionExpired
    }

    /// Replaces the profile if `token` is still the active one.
    pub(crate) fn install_profile(&self, token: &AccessToken, user: UserProfile) {
        let mut state = self.state.write();
        if state.token.as_ref() != Some(token) {
            return;
        }
        if state.user.is_none() {
            state.generation += 1;
        }
        state.user = Some(user);
    }

    fn begin(&self) {
        let mut state = self.state.write();
        state.pending = true;
        state.last_error = None;
    }

    fn fail(&self, err: ClientError) -> ClientError {
        let mut state = self.state.write();
        state.pending = false;
        state.last_error = Some(err.to_string());
        err
    }
}

fn login_error(err: &BackendError) -> ClientError {
    match err {
        BackendError::Unauthorized { .. } => ClientError::AuthenticationFailure(
            err.detail().unwrap_or("Login failed").to_string(),
        ),
        _ => ClientError::from_backend(err, "Login failed"),
    }
}

/// Registration is unauthenticated; a 401 there says nothing about a session.
fn without_session(err: BackendError) -> BackendError {
    match err {
        BackendError::Unauthorized { detail } => BackendError::Status {
            status: 401,
            detail,
        },
        other => other,
    }
}
