use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

pub type UserId = i64;
pub type DocumentId = i64;
pub type MessageId = Uuid;

/// Bearer credential issued by the auth backend. Opaque to this layer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Anthropic,
    Custom,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Custom => "custom",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            "custom" => Ok(LlmProvider::Custom),
            other => Err(format!("unknown LLM provider `{other}`")),
        }
    }
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

/// Profile as reported by `GET /auth/me`. Raw provider keys never come back;
/// only the derived `has_*` flags do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "preferred_llm_provider", default)]
    pub preferred_provider: LlmProvider,
    #[serde(default = "default_model")]
    pub preferred_model: String,
    #[serde(default)]
    pub has_openai_key: bool,
    #[serde(default)]
    pub has_anthropic_key: bool,
    #[serde(default)]
    pub has_custom_endpoint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl UserProfile {
    /// True when at least one LLM credential is configured server-side.
    pub fn has_llm_credential(&self) -> bool {
        self.has_openai_key || self.has_anthropic_key || self.has_custom_endpoint
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DocumentStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    /// Maps the backend's integer code. Unknown codes read as `Pending`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => DocumentStatus::Processing,
            2 => DocumentStatus::Completed,
            -1 => DocumentStatus::Failed,
            _ => DocumentStatus::Pending,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            DocumentStatus::Pending => 0,
            DocumentStatus::Processing => 1,
            DocumentStatus::Completed => 2,
            DocumentStatus::Failed => -1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "Pending",
            DocumentStatus::Processing => "Processing",
            DocumentStatus::Completed => "Completed",
            DocumentStatus::Failed => "Failed",
        }
    }

    /// Completed and Failed are terminal; the backend moves nothing out of them.
    pub fn is_settled(self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }

    fn from_json(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Number(n)) => n.as_i64().map(Self::from_code).unwrap_or_default(),
            Some(Value::String(s)) => s.trim().parse().map(Self::from_code).unwrap_or_default(),
            _ => DocumentStatus::Pending,
        }
    }
}

/// Label for a raw status code, including a missing one.
pub fn status_label(code: Option<i64>) -> &'static str {
    code.map(DocumentStatus::from_code)
        .unwrap_or_default()
        .label()
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for DocumentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for DocumentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        Ok(Self::from_json(value.as_ref()))
    }
}

fn null_as_zero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or(0))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub filename: String,
    #[serde(rename = "file_size")]
    pub file_size_bytes: u64,
    #[serde(default, deserialize_with = "null_as_zero")]
    pub chunk_count: u64,
    #[serde(rename = "processed", default)]
    pub status: DocumentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
}

impl DocumentRecord {
    pub fn uploaded_at(&self) -> Option<NaiveDateTime> {
        let raw = self.upload_date.as_deref()?.trim();
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()
    }
}

/// A retrieved passage returned with an answer. Order is the backend's ranking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub source_number: u32,
    pub document_id: DocumentId,
    #[serde(default)]
    pub page_number: Option<u32>,
    pub similarity: f64,
    #[serde(default)]
    pub text_snippet: String,
}

impl Citation {
    pub fn similarity_percent(&self) -> String {
        format!("{:.1}%", self.similarity * 100.0)
    }

    pub fn location_label(&self) -> String {
        match self.page_number {
            Some(page) => format!(
                "[Source {}] Document ID: {}, Page {page}",
                self.source_number, self.document_id
            ),
            None => format!(
                "[Source {}] Document ID: {}",
                self.source_number, self.document_id
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    pub top_k: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ids: Option<Vec<DocumentId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryAnswer {
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<Citation>,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A user turn stays `Provisional` until its answer arrives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Provisional,
    Committed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    #[serde(default)]
    pub sources: Vec<Citation>,
    pub state: MessageState,
}

impl ChatMessage {
    pub fn provisional_user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v4(),
            role: MessageRole::User,
            content: content.into(),
            sources: Vec::new(),
            state: MessageState::Provisional,
        }
    }

    pub fn assistant(content: impl Into<String>, sources: Vec<Citation>) -> Self {
        Self {
            id: MessageId::new_v4(),
            role: MessageRole::Assistant,
            content: content.into(),
            sources,
            state: MessageState::Committed,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.state == MessageState::Provisional
    }

    pub fn commit(&mut self) {
        self.state = MessageState::Committed;
    }
}

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Body of `POST /auth/register`.
#[derive(Clone, Serialize)]
pub struct Registration {
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub password: String,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// Partial update for `PUT /users/me`. An absent field is left unchanged by
/// the backend; see [`SettingsUpdate::without_blanks`] for blank ones.
#[derive(Clone, Default, Serialize, PartialEq, Eq)]
pub struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_llm_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_llm_api_key: Option<String>,
    #[serde(
        rename = "preferred_llm_provider",
        skip_serializing_if = "Option::is_none"
    )]
    pub preferred_provider: Option<LlmProvider>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.openai_api_key.is_none()
            && self.anthropic_api_key.is_none()
            && self.custom_llm_endpoint.is_none()
            && self.custom_llm_api_key.is_none()
            && self.preferred_provider.is_none()
            && self.preferred_model.is_none()
    }

    pub fn carries_credentials(&self) -> bool {
        self.openai_api_key.is_some()
            || self.anthropic_api_key.is_some()
            || self.custom_llm_api_key.is_some()
    }

    /// Drops text fields that are present but blank, so they are left
    /// unchanged like absent ones.
    pub fn without_blanks(self) -> Self {
        let keep = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        Self {
            email: keep(self.email),
            openai_api_key: keep(self.openai_api_key),
            anthropic_api_key: keep(self.anthropic_api_key),
            custom_llm_endpoint: keep(self.custom_llm_endpoint),
            custom_llm_api_key: keep(self.custom_llm_api_key),
            preferred_provider: self.preferred_provider,
            preferred_model: keep(self.preferred_model),
        }
    }
}

impl fmt::Debug for SettingsUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "***");
        f.debug_struct("SettingsUpdate")
            .field("email", &self.email)
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("anthropic_api_key", &redact(&self.anthropic_api_key))
            .field("custom_llm_endpoint", &self.custom_llm_endpoint)
            .field("custom_llm_api_key", &redact(&self.custom_llm_api_key))
            .field("preferred_provider", &self.preferred_provider)
            .field("preferred_model", &self.preferred_model)
            .finish()
    }
}

/// A file handed to the upload endpoint.
#[derive(Clone)]
pub struct UploadFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn extension(&self) -> Option<String> {
        let (stem, ext) = self.filename.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("filename", &self.filename)
            .field("size", &self.bytes.len())
            .finish()
    }
}

/// Human-readable size, matching the dashboard's B / KB / MB display.
pub fn format_file_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < MIB {
        format!("{:.2} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn status_codes_map_to_labels() {
        assert_eq!(status_label(Some(0)), "Pending");
        assert_eq!(status_label(Some(1)), "Processing");
        assert_eq!(status_label(Some(2)), "Completed");
        assert_eq!(status_label(Some(-1)), "Failed");
        assert_eq!(status_label(Some(7)), "Pending");
        assert_eq!(status_label(None), "Pending");
    }

    #[test]
    fn document_record_tolerates_odd_status_and_null_chunks() {
        let doc: DocumentRecord = serde_json::from_value(json!({
            "id": 3,
            "user_id": 1,
            "filename": "policy.pdf",
            "file_type": "pdf",
            "file_size": 2097152,
            "upload_date": "2024-05-01T10:20:30.123456",
            "processed": "-1",
            "chunk_count": null
        }))
        .expect("decode");
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.chunk_count, 0);
        assert_eq!(doc.file_size_bytes, 2_097_152);
        assert!(doc.uploaded_at().is_some());

        let doc: DocumentRecord = serde_json::from_value(json!({
            "id": 4,
            "filename": "notes.txt",
            "file_size": 10,
            "processed": "weird"
        }))
        .expect("decode");
        assert_eq!(doc.status, DocumentStatus::Pending);
    }

    #[test]
    fn profile_reads_backend_field_names() {
        let profile: UserProfile = serde_json::from_value(json!({
            "id": 1,
            "username": "alice",
            "email": null,
            "created_at": "2024-05-01T10:20:30",
            "preferred_llm_provider": "anthropic",
            "preferred_model": "claude-3-sonnet-20240229",
            "has_openai_key": false,
            "has_anthropic_key": true,
            "has_custom_endpoint": false
        }))
        .expect("decode");
        assert_eq!(profile.preferred_provider, LlmProvider::Anthropic);
        assert!(profile.has_llm_credential());
    }

    #[test]
    fn settings_update_omits_absent_fields_and_redacts_keys() {
        let update = SettingsUpdate {
            openai_api_key: Some("sk-live".to_string()),
            preferred_provider: Some(LlmProvider::OpenAi),
            ..SettingsUpdate::default()
        };
        let body = serde_json::to_value(&update).expect("encode");
        assert_eq!(
            body,
            json!({"openai_api_key": "sk-live", "preferred_llm_provider": "openai"})
        );
        assert!(!format!("{update:?}").contains("sk-live"));
    }

    #[test]
    fn blank_settings_fields_are_dropped() {
        let update = SettingsUpdate {
            openai_api_key: Some("sk-live".to_string()),
            anthropic_api_key: Some(String::new()),
            preferred_model: Some("  ".to_string()),
            ..SettingsUpdate::default()
        }
        .without_blanks();
        assert_eq!(
            serde_json::to_value(&update).expect("encode"),
            json!({"openai_api_key": "sk-live"})
        );
        assert!(SettingsUpdate {
            email: Some(" ".to_string()),
            ..SettingsUpdate::default()
        }
        .without_blanks()
        .is_empty());
    }

    #[test]
    fn citation_display_helpers() {
        let citation = Citation {
            source_number: 1,
            document_id: 9,
            page_number: Some(4),
            similarity: 0.9134,
            text_snippet: "Refunds within 30 days".to_string(),
        };
        assert_eq!(citation.similarity_percent(), "91.3%");
        assert_eq!(
            citation.location_label(),
            "[Source 1] Document ID: 9, Page 4"
        );
    }

    #[test]
    fn file_sizes_are_humanized() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.50 KB");
        assert_eq!(format_file_size(2 * 1024 * 1024), "2.00 MB");
    }

    #[test]
    fn upload_file_extension_is_lowercased() {
        assert_eq!(
            UploadFile::new("Report.PDF", Vec::new()).extension().as_deref(),
            Some("pdf")
        );
        assert_eq!(UploadFile::new(".bashrc", Vec::new()).extension(), None);
        assert_eq!(UploadFile::new("README", Vec::new()).extension(), None);
    }
}
