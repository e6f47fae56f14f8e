use std::sync::Arc;
use std::time::Duration;

use core_types::{
    ClientError, DocQaBackend, DocumentId, DocumentRecord, ProgressFn, UploadFile, UploadProgress,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::session::SessionStore;

const MIB: u64 = 1024 * 1024;

/// What the backend returns when it accepts an upload.
pub type UploadReceipt = DocumentRecord;

/// Client-side limits checked before an upload touches the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    pub max_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * MIB,
            allowed_extensions: ["pdf", "docx", "doc", "txt"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl UploadPolicy {
    pub fn check(&self, file: &UploadFile) -> Result<(), ClientError> {
        if file.filename.trim().is_empty() {
            return Err(ClientError::validation("A file name is required"));
        }
        let extension = file.extension().unwrap_or_default();
        if !self
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
        {
            return Err(ClientError::validation(format!(
                "Unsupported file type: {}",
                if extension.is_empty() { "none" } else { extension.as_str() }
            )));
        }
        if file.size() > self.max_size_bytes {
            return Err(ClientError::validation(format!(
                "File too large. Maximum size is {}MB",
                self.max_size_bytes / MIB
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct DocumentState {
    generation: u64,
    documents: Vec<DocumentRecord>,
    uploading: bool,
    progress: u8,
    last_error: Option<String>,
}

impl DocumentState {
    /// Drops everything that belonged to a previous session.
    fn sync(&mut self, generation: u64) {
        if self.generation != generation {
            self.generation = generation;
            self.documents.clear();
            self.last_error = None;
        }
    }
}

/// Clears the in-flight marker however the upload ends.
struct UploadSlot {
    state: Arc<Mutex<DocumentState>>,
}

impl Drop for UploadSlot {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.uploading = false;
        state.progress = 0;
    }
}

/// Holds the user's documents as last reported by the backend.
pub struct DocumentTracker {
    session: Arc<SessionStore>,
    backend: Arc<dyn DocQaBackend>,
    policy: UploadPolicy,
    state: Arc<Mutex<DocumentState>>,
}

impl DocumentTracker {
    pub fn new(
        session: Arc<SessionStore>,
        backend: Arc<dyn DocQaBackend>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            session,
            backend,
            policy,
            state: Arc::new(Mutex::new(DocumentState::default())),
        }
    }

    pub fn documents(&self) -> Vec<DocumentRecord> {
        let generation = self.session.generation();
        let mut state = self.state.lock();
        state.sync(generation);
        state.documents.clone()
    }

    pub fn is_uploading(&self) -> bool {
        self.state.lock().uploading
    }

    pub fn upload_progress(&self) -> u8 {
        self.state.lock().progress
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.state.lock().last_error = None;
    }

    /// Replaces the local list with the backend's. No merging.
    pub async fn refresh_list(&self) -> Result<Vec<DocumentRecord>, ClientError> {
        let generation = self.session.generation();
        let token = self.session.authorize().inspect_err(|_| {
            self.state.lock().sync(generation);
        })?;

        match self.backend.list_documents(&token).await {
            Ok(documents) => {
                let mut state = self.state.lock();
                state.sync(generation);
                if self.session.generation() == generation {
                    state.documents = documents.clone();
                }
                debug!(count = documents.len(), "document list refreshed");
                Ok(documents)
            }
            Err(err) => {
                let mapped = self
                    .session
                    .absorb(&token, err, "Failed to load documents");
                warn!(error = %mapped, "document list refresh failed");
                Err(mapped)
            }
        }
    }

    /// Uploads one file, reporting whole percentages to `on_progress`, then
    /// refreshes the list. The returned record is the backend's receipt; the
    /// local list only changes through the refresh.
    pub async fn upload<F>(
        &self,
        file: UploadFile,
        on_progress: F,
    ) -> Result<UploadReceipt, ClientError>
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.policy.check(&file)?;
        let token = self.session.authorize()?;

        let generation = self.session.generation();
        {
            let mut state = self.state.lock();
            state.sync(generation);
            if state.uploading {
                return Err(ClientError::Busy("upload"));
            }
            state.uploading = true;
            state.progress = 0;
            state.last_error = None;
        }
        let _slot = UploadSlot {
            state: Arc::clone(&self.state),
        };

        let relay = Arc::new(Mutex::new(UploadProgress::new(
            file.size(),
            self.progress_sink(on_progress),
        )));
        let backend_sink: ProgressFn = {
            let relay = Arc::clone(&relay);
            Arc::new(move |percent| relay.lock().report(percent))
        };

        let filename = file.filename.clone();
        let size = file.size();
        match self
            .backend
            .upload_document(&token, file, backend_sink)
            .await
        {
            Ok(receipt) => {
                relay.lock().finish();
                info!(%filename, size, id = receipt.id, "document accepted");
                if let Err(err) = self.refresh_list().await {
                    warn!(error = %err, "list refresh after upload failed");
                }
                Ok(receipt)
            }
            Err(err) => {
                let mapped = self
                    .session
                    .absorb(&token, err, "Failed to upload document");
                warn!(%filename, error = %mapped, "upload failed");
                self.record_error(&mapped);
                Err(mapped)
            }
        }
    }

    /// Deletes on the backend, then re-reads the list so server-side
    /// cascades are reflected.
    pub async fn delete_document(&self, id: DocumentId) -> Result<(), ClientError> {
        let token = self.session.authorize()?;

        if let Err(err) = self.backend.delete_document(&token, id).await {
            let mapped = self
                .session
                .absorb(&token, err, "Failed to delete document");
            self.record_error(&mapped);
            return Err(mapped);
        }
        info!(id, "document deleted");

        if let Err(err) = self.refresh_list().await {
            warn!(error = %err, "list refresh after delete failed, pruning locally");
            self.state.lock().documents.retain(|doc| doc.id != id);
        }
        Ok(())
    }

    pub async fn fetch_document(&self, id: DocumentId) -> Result<DocumentRecord, ClientError> {
        let token = self.session.authorize()?;
        self.backend
            .fetch_document(&token, id)
            .await
            .map_err(|err| self.session.absorb(&token, err, "Failed to load document"))
    }

    /// Starts a background task that refreshes the list every
    /// `options.interval` until the handle is cancelled or dropped, or the
    /// session ends.
    pub fn spawn_status_poll(self: &Arc<Self>, options: PollOptions) -> PollHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let tracker = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                match tracker.refresh_list().await {
                    Ok(documents) => {
                        if options.stop_when_settled
                            && documents.iter().all(|doc| doc.status.is_settled())
                        {
                            debug!("all documents settled, status poll finished");
                            break;
                        }
                    }
                    Err(err) if err.ends_session() => {
                        debug!(error = %err, "session ended, status poll finished");
                        break;
                    }
                    Err(err) => debug!(error = %err, "status poll tick failed"),
                }
            }
        });
        PollHandle {
            _stop: stop_tx,
            task,
        }
    }

    fn record_error(&self, err: &ClientError) {
        let generation = self.session.generation();
        let mut state = self.state.lock();
        state.sync(generation);
        state.last_error = Some(err.to_string());
    }

    fn progress_sink<F>(&self, on_progress: F) -> ProgressFn
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let state = Arc::clone(&self.state);
        Arc::new(move |percent| {
            state.lock().progress = percent;
            on_progress(percent);
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub stop_when_settled: bool,
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            stop_when_settled: false,
        }
    }

    pub fn until_settled(mut self) -> Self {
        self.stop_when_settled = true;
        self
    }
}

/// Owns a running status poll. Dropping it stops the task.
pub struct PollHandle {
    _stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the poll and waits for the task to exit.
    pub async fn cancel(self) {
        let PollHandle { _stop, task } = self;
        drop(_stop);
        if let Err(err) = task.await {
            warn!(error = %err, "status poll task ended abnormally");
        }
    }

    /// Waits for the poll to end on its own.
    pub async fn finished(self) {
        let PollHandle { _stop, task } = self;
        if let Err(err) = task.await {
            warn!(error = %err, "status poll task ended abnormally");
        }
    }
}
