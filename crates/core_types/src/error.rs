use thiserror::Error;

/// Failure reported by a backend implementation, before the orchestrator
/// decides what it means for the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("unauthorized: {}", .detail.as_deref().unwrap_or("no detail"))]
    Unauthorized { detail: Option<String> },
    #[error("backend returned {status}: {}", .detail.as_deref().unwrap_or("no detail"))]
    Status { status: u16, detail: Option<String> },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid backend response: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BackendError::Unauthorized { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Unauthorized { .. } => Some(401),
            BackendError::Status { status, .. } => Some(*status),
            BackendError::Transport(_) | BackendError::Decode(_) => None,
        }
    }

    /// Backend-provided message, if the response carried one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            BackendError::Unauthorized { detail } | BackendError::Status { detail, .. } => {
                detail.as_deref().filter(|d| !d.trim().is_empty())
            }
            BackendError::Transport(_) | BackendError::Decode(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthenticationFailure,
    SessionExpired,
    Validation,
    ConfigurationRequired,
    Backend,
    NotAuthenticated,
    Busy,
}

/// Outcome of a failed client operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("{0}")]
    AuthenticationFailure(String),
    #[error("Session expired, please log in again")]
    SessionExpired,
    #[error("{0}")]
    Validation(String),
    #[error("Please configure your LLM API key in Settings first")]
    ConfigurationRequired,
    #[error("{message}")]
    Backend {
        status: Option<u16>,
        message: String,
    },
    #[error("Not signed in")]
    NotAuthenticated,
    #[error("{0} already in progress")]
    Busy(&'static str),
}

impl ClientError {
    pub fn validation(message: impl Into<String>) -> Self {
        ClientError::Validation(message.into())
    }

    /// Non-401 translation: backend detail when present, else `fallback`.
    /// 401 always maps to `SessionExpired`; callers that must log out do so
    /// before reaching here.
    pub fn from_backend(err: &BackendError, fallback: &str) -> Self {
        if err.is_unauthorized() {
            return ClientError::SessionExpired;
        }
        ClientError::Backend {
            status: err.status(),
            message: err.detail().unwrap_or(fallback).to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            ClientError::SessionExpired => ErrorKind::SessionExpired,
            ClientError::Validation(_) => ErrorKind::Validation,
            ClientError::ConfigurationRequired => ErrorKind::ConfigurationRequired,
            ClientError::Backend { .. } => ErrorKind::Backend,
            ClientError::NotAuthenticated => ErrorKind::NotAuthenticated,
            ClientError::Busy(_) => ErrorKind::Busy,
        }
    }

    /// True for errors that mean the caller has no usable session.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            ClientError::SessionExpired | ClientError::NotAuthenticated
        )
    }
}
