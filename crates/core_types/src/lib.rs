//! Shared vocabulary for the document Q&A client: the data the backend
//! exchanges, the error taxonomy, and the contracts the orchestrator is
//! written against.

mod backend;
mod error;
mod model;
mod progress;

pub use backend::{BackendResult, DocQaBackend, MemoryTokenStore, ProgressFn, TokenStore};
pub use error::{BackendError, ClientError, ErrorKind};
pub use model::{
    AccessToken, ChatMessage, Citation, Credentials, DocumentId, DocumentRecord, DocumentStatus,
    LlmProvider, MessageId, MessageRole, MessageState, QueryAnswer, QueryRequest, Registration,
    SettingsUpdate, UploadFile, UserId, UserProfile, format_file_size, status_label,
};
pub use progress::{UploadProgress, percent_of};
