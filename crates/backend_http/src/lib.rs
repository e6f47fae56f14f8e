use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use core_types::{
    AccessToken, BackendError, BackendResult, Credentials, DocQaBackend, DocumentId,
    DocumentRecord, ProgressFn, QueryAnswer, QueryRequest, Registration, SettingsUpdate,
    UploadFile, UploadProgress, UserProfile,
};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder, Response, StatusCode, multipart};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpBackendOptions {
    pub base_url: String,
    pub timeout: Duration,
    pub upload_chunk_size: usize,
}

impl Default for HttpBackendOptions {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout: Duration::from_secs(120),
            upload_chunk_size: 64 * 1024,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
}

/// Talks to the document Q&A REST API.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    upload_chunk_size: usize,
}

impl HttpBackend {
    pub fn new(options: HttpBackendOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            upload_chunk_size: options.upload_chunk_size.max(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`; returns the reported status string.
    pub async fn health(&self) -> BackendResult<String> {
        let response = self.send(self.request(Method::GET, "/health", None)).await?;
        let health: HealthResponse = decode(response).await?;
        Ok(health.status)
    }

    fn request(&self, method: Method, path: &str, token: Option<&AccessToken>) -> RequestBuilder {
        debug!(%method, path, "backend request");
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match token {
            Some(token) => builder.bearer_auth(token.as_str()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> BackendResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        check_status(response).await
    }

    fn upload_body(&self, bytes: Bytes, progress: ProgressFn) -> reqwest::Body {
        let total = bytes.len() as u64;
        let tracker = Arc::new(Mutex::new(UploadProgress::new(total, progress)));
        let chunks: Vec<Bytes> = (0..bytes.len())
            .step_by(self.upload_chunk_size)
            .map(|start| bytes.slice(start..(start + self.upload_chunk_size).min(bytes.len())))
            .collect();
        if chunks.is_empty() {
            tracker.lock().finish();
        }
        let stream = futures::stream::iter(chunks).map(move |chunk| {
            tracker.lock().advance(chunk.len() as u64);
            Ok::<Bytes, std::io::Error>(chunk)
        });
        reqwest::Body::wrap_stream(stream)
    }
}

#[async_trait]
impl DocQaBackend for HttpBackend {
    async fn register(&self, registration: &Registration) -> BackendResult<UserProfile> {
        let builder = self
            .request(Method::POST, "/auth/register", None)
            .json(registration);
        decode(self.send(builder).await?).await
    }

    async fn login(&self, credentials: &Credentials) -> BackendResult<AccessToken> {
        let builder = self
            .request(Method::POST, "/auth/login", None)
            .json(credentials);
        let token: TokenResponse = decode(self.send(builder).await?).await?;
        Ok(AccessToken::new(token.access_token))
    }

    async fn fetch_profile(&self, token: &AccessToken) -> BackendResult<UserProfile> {
        let builder = self.request(Method::GET, "/auth/me", Some(token));
        decode(self.send(builder).await?).await
    }

    async fn update_profile(
        &self,
        token: &AccessToken,
        update: &SettingsUpdate,
    ) -> BackendResult<UserProfile> {
        let builder = self
            .request(Method::PUT, "/users/me", Some(token))
            .json(update);
        decode(self.send(builder).await?).await
    }

    async fn list_documents(&self, token: &AccessToken) -> BackendResult<Vec<DocumentRecord>> {
        let builder = self.request(Method::GET, "/documents/", Some(token));
        decode(self.send(builder).await?).await
    }

    async fn fetch_document(
        &self,
        token: &AccessToken,
        id: DocumentId,
    ) -> BackendResult<DocumentRecord> {
        let builder = self.request(Method::GET, &format!("/documents/{id}"), Some(token));
        decode(self.send(builder).await?).await
    }

    async fn upload_document(
        &self,
        token: &AccessToken,
        file: UploadFile,
        progress: ProgressFn,
    ) -> BackendResult<DocumentRecord> {
        let total = file.size();
        let mime = mime_guess::from_path(&file.filename).first_or_octet_stream();
        let UploadFile { filename, bytes } = file;
        let body = self.upload_body(Bytes::from(bytes), progress);
        let part = multipart::Part::stream_with_length(body, total)
            .file_name(filename)
            .mime_str(mime.essence_str())
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        let form = multipart::Form::new().part("file", part);

        let builder = self
            .request(Method::POST, "/documents/upload", Some(token))
            .multipart(form);
        decode(self.send(builder).await?).await
    }

    async fn delete_document(&self, token: &AccessToken, id: DocumentId) -> BackendResult<()> {
        let builder = self.request(Method::DELETE, &format!("/documents/{id}"), Some(token));
        self.send(builder).await?;
        Ok(())
    }

    async fn query(
        &self,
        token: &AccessToken,
        request: &QueryRequest,
    ) -> BackendResult<QueryAnswer> {
        let builder = self
            .request(Method::POST, "/query/", Some(token))
            .json(request);
        decode(self.send(builder).await?).await
    }
}

async fn check_status(response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let detail = extract_detail(&body);
    debug!(status = status.as_u16(), ?detail, "backend rejected request");
    if status == StatusCode::UNAUTHORIZED {
        return Err(BackendError::Unauthorized { detail });
    }
    Err(BackendError::Status {
        status: status.as_u16(),
        detail,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> BackendResult<T> {
    let body = response
        .bytes()
        .await
        .map_err(|err| BackendError::Transport(err.to_string()))?;
    serde_json::from_slice(&body).map_err(|err| BackendError::Decode(err.to_string()))
}

/// Pulls the human-readable message out of an error body: either
/// `{"detail": "..."}` or a validation list `{"detail": [{"msg": "..."}]}`.
pub fn extract_detail(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let detail = match value.get("detail")? {
        Value::String(message) => message.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("msg").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("; "),
        _ => return None,
    };
    (!detail.is_empty()).then_some(detail)
}
