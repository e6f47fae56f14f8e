use std::sync::Arc;

use core_types::{ChatMessage, ClientError, DocQaBackend, DocumentId, MessageId, QueryRequest};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::session::SessionStore;

pub const MAX_QUERY_CHARS: usize = 1000;
pub const DEFAULT_TOP_K: u32 = 5;
const TOP_K_RANGE: std::ops::RangeInclusive<u32> = 1..=20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    pub top_k: u32,
    /// Restricts retrieval to these documents when set.
    pub document_ids: Option<Vec<DocumentId>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            document_ids: None,
        }
    }
}

impl QueryOptions {
    pub fn top_k(top_k: u32) -> Self {
        Self {
            top_k,
            ..Self::default()
        }
    }

    pub fn within(mut self, ids: Vec<DocumentId>) -> Self {
        self.document_ids = Some(ids);
        self
    }

    fn validate(&self) -> Result<(), ClientError> {
        if !TOP_K_RANGE.contains(&self.top_k) {
            return Err(ClientError::validation(format!(
                "top_k must be between {} and {}",
                TOP_K_RANGE.start(),
                TOP_K_RANGE.end()
            )));
        }
        if self.document_ids.as_ref().is_some_and(Vec::is_empty) {
            return Err(ClientError::validation("Select at least one document"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Blank input; nothing was sent and the transcript is untouched.
    Ignored,
    Answered(ChatMessage),
}

#[derive(Debug, Default)]
struct Exchange {
    generation: u64,
    transcript: Vec<ChatMessage>,
    busy: bool,
    last_error: Option<String>,
}

impl Exchange {
    fn sync(&mut self, generation: u64) {
        if self.generation != generation {
            self.generation = generation;
            self.transcript.clear();
            self.last_error = None;
        }
    }
}

/// Provisional user turn awaiting its answer. Dropping it without
/// `settle` removes that exact message and releases the busy flag.
struct PendingTurn {
    state: Arc<Mutex<Exchange>>,
    id: MessageId,
    settled: bool,
}

impl PendingTurn {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingTurn {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.busy = false;
        if !self.settled {
            state.transcript.retain(|message| message.id != self.id);
        }
    }
}

/// Runs question/answer exchanges and keeps the transcript.
pub struct QueryController {
    session: Arc<SessionStore>,
    backend: Arc<dyn DocQaBackend>,
    defaults: QueryOptions,
    state: Arc<Mutex<Exchange>>,
}

impl QueryController {
    pub fn new(session: Arc<SessionStore>, backend: Arc<dyn DocQaBackend>) -> Self {
        Self::with_defaults(session, backend, QueryOptions::default())
    }

    pub fn with_defaults(
        session: Arc<SessionStore>,
        backend: Arc<dyn DocQaBackend>,
        defaults: QueryOptions,
    ) -> Self {
        Self {
            session,
            backend,
            defaults,
            state: Arc::new(Mutex::new(Exchange::default())),
        }
    }

    pub fn transcript(&self) -> Vec<ChatMessage> {
        let generation = self.session.generation();
        let mut state = self.state.lock();
        state.sync(generation);
        state.transcript.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.lock().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.state.lock().last_error = None;
    }

    pub fn clear_transcript(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.busy {
            return Err(ClientError::Busy("query"));
        }
        state.transcript.clear();
        Ok(())
    }

    pub async fn submit_query(&self, text: &str) -> Result<QueryOutcome, ClientError> {
        self.submit_query_with(text, self.defaults.clone()).await
    }

    /// Appends the question provisionally, asks the backend, then either
    /// commits the question with its answer or removes the question again.
    pub async fn submit_query_with(
        &self,
        text: &str,
        options: QueryOptions,
    ) -> Result<QueryOutcome, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(QueryOutcome::Ignored);
        }

        let token = self.session.authorize().map_err(|err| self.fail(err))?;
        if !self.session.has_llm_credential() {
            return Err(self.fail(ClientError::ConfigurationRequired));
        }
        if text.chars().count() > MAX_QUERY_CHARS {
            return Err(self.fail(ClientError::validation(format!(
                "Query must be at most {MAX_QUERY_CHARS} characters"
            ))));
        }
        options.validate().map_err(|err| self.fail(err))?;

        let generation = self.session.generation();
        let turn = {
            let mut state = self.state.lock();
            state.sync(generation);
            if state.busy {
                return Err(ClientError::Busy("query"));
            }
            let question = ChatMessage::provisional_user(text);
            let id = question.id;
            state.transcript.push(question);
            state.busy = true;
            state.last_error = None;
            PendingTurn {
                state: Arc::clone(&self.state),
                id,
                settled: false,
            }
        };

        let request = QueryRequest {
            query: text.to_string(),
            top_k: options.top_k,
            document_ids: options.document_ids,
        };
        debug!(top_k = request.top_k, "submitting query");

        let answer = match self.backend.query(&token, &request).await {
            Ok(answer) => answer,
            Err(err) => {
                let mapped = self
                    .session
                    .absorb(&token, err, "Failed to process query");
                drop(turn);
                warn!(error = %mapped, "query failed, question withdrawn");
                return Err(self.fail(mapped));
            }
        };

        let reply = {
            let mut state = self.state.lock();
            let index = state
                .transcript
                .iter()
                .position(|message| message.id == turn.id);
            index.map(|index| {
                state.transcript[index].commit();
                let reply = ChatMessage::assistant(answer.answer, answer.sources);
                state.transcript.push(reply.clone());
                reply
            })
        };
        // The session changed underneath and took the transcript with it.
        let Some(reply) = reply else {
            return Err(ClientError::NotAuthenticated);
        };
        turn.settle();

        info!(sources = reply.sources.len(), "query answered");
        Ok(QueryOutcome::Answered(reply))
    }

    fn fail(&self, err: ClientError) -> ClientError {
        let generation = self.session.generation();
        let mut state = self.state.lock();
        state.sync(generation);
        state.last_error = Some(err.to_string());
        err
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use core_types::{
        BackendError, Citation, MemoryTokenStore, MessageRole, QueryAnswer, TokenStore,
    };

    use super::*;
    use crate::testing::FakeBackend;

    struct Fixture {
        backend: Arc<FakeBackend>,
        tokens: Arc<MemoryTokenStore>,
        session: Arc<SessionStore>,
        controller: Arc<QueryController>,
    }

    async fn fixture(with_key: bool) -> Fixture {
        let backend = Arc::new(FakeBackend::with_user("alice", "secret1"));
        if with_key {
            backend.grant_openai_key("alice");
        }
        let tokens = Arc::new(MemoryTokenStore::new());
        let session = Arc::new(SessionStore::new(backend.clone(), tokens.clone()));
        session.login("alice", "secret1").await.expect("login");
        let controller = Arc::new(QueryController::new(session.clone(), backend.clone()));
        Fixture {
            backend,
            tokens,
            session,
            controller,
        }
    }

    fn citation(source_number: u32, similarity: f64) -> Citation {
        Citation {
            source_number,
            document_id: 7,
            page_number: Some(source_number),
            similarity,
            text_snippet: format!("passage {source_number}"),
        }
    }

    #[tokio::test]
    async fn answered_query_appends_question_then_answer() {
        let fx = fixture(true).await;
        fx.backend.queue_answer(Ok(QueryAnswer {
            answer: "Refunds are accepted within 30 days.".to_string(),
            sources: vec![citation(1, 0.91), citation(2, 0.77)],
            query: "What is the refund policy?".to_string(),
        }));

        let outcome = fx
            .controller
            .submit_query("What is the refund policy?")
            .await
            .expect("answered");
        assert!(matches!(outcome, QueryOutcome::Answered(_)));

        let transcript = fx.controller.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, MessageRole::User);
        assert!(!transcript[0].is_provisional());
        assert_eq!(transcript[1].role, MessageRole::Assistant);
        let similarities: Vec<f64> = transcript[1].sources.iter().map(|s| s.similarity).collect();
        assert_eq!(similarities, vec![0.91, 0.77]);

        let sent = fx.backend.last_query().expect("query sent");
        assert_eq!(sent.top_k, DEFAULT_TOP_K);
        assert_eq!(sent.document_ids, None);
        assert!(!fx.controller.is_busy());
    }

    #[tokio::test]
    async fn missing_credentials_short_circuit() {
        let fx = fixture(false).await;
        let calls = fx.backend.calls();

        let err = fx
            .controller
            .submit_query("What is the refund policy?")
            .await
            .expect_err("gated");
        assert_eq!(err, ClientError::ConfigurationRequired);
        assert!(fx.controller.transcript().is_empty());
        assert_eq!(fx.backend.calls(), calls);
        assert_eq!(
            fx.controller.last_error().as_deref(),
            Some("Please configure your LLM API key in Settings first")
        );
    }

    #[tokio::test]
    async fn error_survives_transcript_reads() {
        let fx = fixture(true).await;
        fx.backend.queue_answer(Err(BackendError::Status {
            status: 500,
            detail: Some("Error processing query: provider unavailable".to_string()),
        }));
        fx.controller.submit_query("hello").await.expect_err("fails");

        assert!(fx.controller.transcript().is_empty());
        assert!(fx.controller.transcript().is_empty());
        assert_eq!(
            fx.controller.last_error().as_deref(),
            Some("Error processing query: provider unavailable")
        );

        fx.controller.submit_query("again").await.expect("answered");
        assert_eq!(fx.controller.last_error(), None);
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let fx = fixture(true).await;
        let outcome = fx.controller.submit_query("   \n").await.expect("ignored");
        assert_eq!(outcome, QueryOutcome::Ignored);
        assert!(fx.controller.transcript().is_empty());
        assert_eq!(fx.backend.calls_to("query"), 0);
        assert_eq!(fx.controller.last_error(), None);
    }

    #[tokio::test]
    async fn failure_restores_the_exact_transcript() {
        let fx = fixture(true).await;
        fx.controller.submit_query("first").await.expect("first");
        fx.controller.submit_query("first").await.expect("duplicate text");
        let before = fx.controller.transcript();

        fx.backend.queue_answer(Err(BackendError::Status {
            status: 500,
            detail: Some("Error processing query: provider unavailable".to_string()),
        }));
        let err = fx
            .controller
            .submit_query("first")
            .await
            .expect_err("fails");
        assert_eq!(err.to_string(), "Error processing query: provider unavailable");
        assert_eq!(fx.controller.transcript(), before);
        assert!(!fx.controller.is_busy());
    }

    #[tokio::test]
    async fn transport_failure_uses_fallback_message() {
        let fx = fixture(true).await;
        fx.backend
            .queue_answer(Err(BackendError::Transport("timed out".to_string())));
        let err = fx.controller.submit_query("hello").await.expect_err("fails");
        assert_eq!(err.to_string(), "Failed to process query");
        assert!(fx.controller.transcript().is_empty());
    }

    #[tokio::test]
    async fn second_submission_while_outstanding_is_rejected() {
        let fx = fixture(true).await;
        let gate = fx.backend.hold_queries();

        let first = {
            let controller = fx.controller.clone();
            tokio::spawn(async move { controller.submit_query("first").await })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while fx.backend.calls_to("query") == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first query reaches backend");

        assert!(fx.controller.is_busy());
        let pending = fx.controller.transcript();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_provisional());

        let err = fx.controller.submit_query("second").await.expect_err("busy");
        assert_eq!(err, ClientError::Busy("query"));
        assert_eq!(
            fx.controller.clear_transcript(),
            Err(ClientError::Busy("query"))
        );

        gate.notify_one();
        first.await.expect("join").expect("first answered");
        assert_eq!(fx.controller.transcript().len(), 2);
        assert_eq!(fx.backend.calls_to("query"), 1);
    }

    #[tokio::test]
    async fn expired_session_logs_out_and_later_calls_stay_local() {
        let fx = fixture(true).await;
        fx.controller.submit_query("hello").await.expect("answered");

        fx.backend.expire_tokens();
        let err = fx.controller.submit_query("again").await.expect_err("expired");
        assert_eq!(err, ClientError::SessionExpired);
        assert!(!fx.session.is_authenticated());
        assert!(fx.tokens.load().expect("load").is_none());
        assert!(fx.controller.transcript().is_empty());

        let calls = fx.backend.calls();
        let err = fx.controller.submit_query("third").await.expect_err("local");
        assert_eq!(err, ClientError::NotAuthenticated);
        assert_eq!(fx.backend.calls(), calls);
    }

    #[tokio::test]
    async fn options_are_validated_and_forwarded() {
        let fx = fixture(true).await;
        let err = fx
            .controller
            .submit_query_with("hello", QueryOptions::top_k(0))
            .await
            .expect_err("invalid");
        assert!(matches!(err, ClientError::Validation(_)));

        let long = "x".repeat(MAX_QUERY_CHARS + 1);
        assert!(matches!(
            fx.controller.submit_query(&long).await,
            Err(ClientError::Validation(_))
        ));
        assert_eq!(fx.backend.calls_to("query"), 0);

        fx.controller
            .submit_query_with("hello", QueryOptions::top_k(8).within(vec![3, 4]))
            .await
            .expect("answered");
        let sent = fx.backend.last_query().expect("sent");
        assert_eq!(sent.top_k, 8);
        assert_eq!(sent.document_ids, Some(vec![3, 4]));
    }

    #[tokio::test]
    async fn clear_transcript_empties_history() {
        let fx = fixture(true).await;
        fx.controller.submit_query("hello").await.expect("answered");
        fx.controller.clear_transcript().expect("cleared");
        assert!(fx.controller.transcript().is_empty());
    }
}
