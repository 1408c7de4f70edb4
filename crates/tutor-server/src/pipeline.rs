/// Request orchestration: validate, resolve the retriever, build the prompt, stream.
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use tutor_common::llm::{clean_answer, LlmClient, TokenStream};

use crate::answer::parse_numbered_answer;
use crate::context::{compose_practice_prompt, compose_prompt, retrieve_context};
use crate::conversation::validate_history;
use crate::error::AppError;
use crate::index::IndexStore;
use crate::model::StructuredItem;
use crate::retriever::{CacheEntry, RetrieverCache};

pub const DEFAULT_PRACTICE_COUNT: usize = 10;
pub const MAX_PRACTICE_COUNT: usize = 30;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    /// Raw history entries; malformed ones are dropped before use.
    #[serde(default)]
    pub history: Option<Vec<Value>>,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub subject: String,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if [&self.message, &self.level, &self.subject]
            .iter()
            .any(|field| field.trim().is_empty())
        {
            return Err(AppError::InvalidRequest(
                "missing required fields: 'message', 'level', or 'subject'".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PracticeRequest {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub subject: String,
    /// Narrows retrieval and the questions to one topic; the whole subject when absent.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default = "default_practice_count")]
    pub count: usize,
}

fn default_practice_count() -> usize {
    DEFAULT_PRACTICE_COUNT
}

impl PracticeRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.level.trim().is_empty() || self.subject.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "missing required fields: 'level' or 'subject'".to_string(),
            ));
        }
        if !(1..=MAX_PRACTICE_COUNT).contains(&self.count) {
            return Err(AppError::InvalidRequest(format!(
                "'count' must be between 1 and {MAX_PRACTICE_COUNT}"
            )));
        }
        Ok(())
    }
}

pub struct TutorPipeline<S: IndexStore> {
    cache: Arc<RetrieverCache<S>>,
    llm: LlmClient,
    top_k: usize,
}

impl<S: IndexStore> TutorPipeline<S> {
    pub fn new(cache: Arc<RetrieverCache<S>>, llm: LlmClient, top_k: usize) -> Self {
        Self { cache, llm, top_k }
    }

    pub fn cache(&self) -> &RetrieverCache<S> {
        &self.cache
    }

    /// Answer a question as a token stream.
    ///
    /// Steps run strictly in order: request validation, retriever lookup, retrieval,
    /// prompt composition, then a single streaming call. The question and answer are
    /// recorded in the subject's memory together once the stream completes.
    pub async fn ask(&self, request: ChatRequest) -> Result<AnswerStream<S::Index>, AppError> {
        request.validate()?;
        let history = validate_history(request.history.as_deref().unwrap_or_default());

        let entry = self.cache.get(&request.level, &request.subject).await?;
        let context = retrieve_context(&entry.index, &request.message, self.top_k).await?;
        let prompt = compose_prompt(&context, &request.message);
        info!(
            level = entry.key.level,
            subject = entry.key.subject,
            history = history.len(),
            remembered = entry.memory.len(),
            "answering question"
        );

        let tokens = self.llm.stream_chat(&prompt, &history).await?;
        Ok(AnswerStream::new(tokens, request.message, entry))
    }

    /// Answer a question and return the whole reply with per-line whitespace trimmed.
    pub async fn ask_complete(&self, request: ChatRequest) -> Result<String, AppError> {
        let mut stream = self.ask(request).await?;
        let mut raw = String::new();
        while let Some(token) = stream.next().await {
            raw.push_str(&token?);
        }
        Ok(clean_answer(&raw))
    }

    /// Generate numbered practice questions grounded in the subject's sources.
    ///
    /// Extraction is best effort: a reply that does not follow the numbering yields an
    /// empty list.
    pub async fn practice_questions(
        &self,
        request: PracticeRequest,
    ) -> Result<Vec<StructuredItem>, AppError> {
        request.validate()?;
        let entry = self.cache.get(&request.level, &request.subject).await?;

        let topic = request
            .topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| entry.key.folder.replace('_', " "));
        let context = retrieve_context(&entry.index, &topic, self.top_k).await?;
        let prompt = compose_practice_prompt(&context, &topic, request.count);

        let answer = self.llm.get_clean_answer(&prompt, &[]).await?;
        let items = parse_numbered_answer(&answer);
        if items.is_empty() {
            warn!(topic = %topic, "no numbered questions found in reply");
        } else if items.len() != request.count {
            debug!(requested = request.count, got = items.len(), "question count differs");
        }
        Ok(items)
    }
}

/// Reply tokens for one question.
///
/// Yields tokens as they arrive and keeps a copy of the answer; when the backend finishes
/// the exchange is recorded in the subject's memory. An answer cut short by an error, by
/// [`AnswerStream::close`] or by dropping the stream is not recorded.
pub struct AnswerStream<I> {
    tokens: TokenStream,
    question: String,
    answer: String,
    entry: Option<Arc<CacheEntry<I>>>,
}

impl<I> AnswerStream<I> {
    fn new(tokens: TokenStream, question: String, entry: Arc<CacheEntry<I>>) -> Self {
        Self {
            tokens,
            question,
            answer: String::new(),
            entry: Some(entry),
        }
    }

    /// Stop early and close the backend connection.
    pub fn close(self) {
        if self.entry.is_some() {
            debug!(chars = self.answer.len(), "answer abandoned");
        }
        self.tokens.close();
    }

    fn finish(&mut self) {
        if let Some(entry) = self.entry.take() {
            debug!(chars = self.answer.len(), "answer complete");
            entry.memory.record_exchange(
                std::mem::take(&mut self.question),
                std::mem::take(&mut self.answer),
            );
        }
    }
}

impl<I> Stream for AnswerStream<I> {
    type Item = Result<String, AppError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.tokens.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(token))) => {
                this.answer.push_str(&token);
                Poll::Ready(Some(Ok(token)))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!(error = %e, "answer stream failed");
                this.entry = None;
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use tutor_common::llm::{LlmBackend, LlmClientConfig, Message};

    use crate::chunker::Chunker;
    use crate::retriever::tests::{layout, write_sources, MockStore};

    fn ndjson(tokens: &[String]) -> String {
        let mut body = String::new();
        for t in tokens {
            body.push_str(&json!({"message": {"content": t}, "done": false}).to_string());
            body.push('\n');
        }
        body.push_str(&json!({"message": {"content": ""}, "done": true}).to_string());
        body.push('\n');
        body
    }

    /// Fake Ollama backend streaming `reply` one word per NDJSON line. An empty `reply`
    /// echoes the prompt back as a single token.
    pub(crate) async fn spawn_backend(reply: &'static str) -> String {
        let router = Router::new().route(
            "/api/chat",
            post(move |Json(body): Json<Value>| async move {
                let tokens: Vec<String> = if reply.is_empty() {
                    let prompt = body["messages"]
                        .as_array()
                        .and_then(|m| m.last())
                        .and_then(|m| m["content"].as_str())
                        .unwrap_or_default();
                    vec![prompt.to_string()]
                } else {
                    reply.split_inclusive(' ').map(str::to_string).collect()
                };
                ndjson(&tokens)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub(crate) fn pipeline(root: &std::path::Path, base_url: &str) -> TutorPipeline<MockStore> {
        let cache = RetrieverCache::new(MockStore::default(), layout(root), Chunker::default(), 10);
        let llm = LlmClient::new(LlmClientConfig::new(LlmBackend::Ollama, base_url)).unwrap();
        TutorPipeline::new(Arc::new(cache), llm, 4)
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            history: None,
            level: "PSLE".to_string(),
            subject: "Science".to_string(),
        }
    }

    pub(crate) fn science_sources(root: &std::path::Path) {
        write_sources(
            root,
            "Science",
            "Plants make food by photosynthesis.",
            &[("plants.mmd", "Leaves contain chlorophyll.")],
        );
    }

    #[tokio::test]
    async fn test_ask_streams_tokens_and_records_turns() {
        let root = tempfile::tempdir().unwrap();
        science_sources(root.path());
        let base = spawn_backend("Chlorophyll absorbs light. ").await;
        let pipeline = pipeline(root.path(), &base);

        let stream = pipeline.ask(request("What does chlorophyll do?")).await.unwrap();
        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["Chlorophyll ", "absorbs ", "light. "]);

        let entry = pipeline.cache().get("psle", "science").await.unwrap();
        assert_eq!(
            entry.memory.turns(),
            vec![
                Message::user("What does chlorophyll do?"),
                Message::assistant("Chlorophyll absorbs light. "),
            ]
        );
    }

    #[tokio::test]
    async fn test_unfinished_answer_is_not_remembered() {
        let root = tempfile::tempdir().unwrap();
        science_sources(root.path());
        let base = spawn_backend("Chlorophyll absorbs light. ").await;
        let pipeline = pipeline(root.path(), &base);

        let mut stream = pipeline.ask(request("What does chlorophyll do?")).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "Chlorophyll ");
        stream.close();

        let stream = pipeline.ask(request("And roots?")).await.unwrap();
        drop(stream);

        let entry = pipeline.cache().get("psle", "science").await.unwrap();
        assert!(entry.memory.turns().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_orders_syllabus_before_notes() {
        let root = tempfile::tempdir().unwrap();
        science_sources(root.path());
        let base = spawn_backend("").await;
        let pipeline = pipeline(root.path(), &base);

        let prompt = pipeline.ask_complete(request("Why are leaves green?")).await.unwrap();
        assert!(prompt.starts_with("You are an expert tutor."));
        assert!(prompt.contains(
            "Context:\nPlants make food by photosynthesis.\n\nLeaves contain chlorophyll.\n\nQuestion:\nWhy are leaves green?"
        ));
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_io() {
        let root = tempfile::tempdir().unwrap();
        // Nothing listens here; reaching the backend would fail differently.
        let pipeline = pipeline(root.path(), "http://127.0.0.1:9");

        let err = pipeline.ask(request("   ")).await.err().unwrap();
        assert!(matches!(err, AppError::InvalidRequest(_)));

        let mut bad_key = request("What is a cell?");
        bad_key.subject = "h2_biology".to_string();
        let err = pipeline.ask(bad_key).await.err().unwrap();
        assert!(matches!(err, AppError::InvalidKey { .. }));
        assert_eq!(pipeline.cache().len().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_history_does_not_fail_request() {
        let root = tempfile::tempdir().unwrap();
        science_sources(root.path());
        let base = spawn_backend("ok").await;
        let pipeline = pipeline(root.path(), &base);

        let mut req = request("Next question");
        req.history = Some(vec![
            json!({"role": "user", "content": "earlier"}),
            json!({"role": "user"}),
            json!(42),
        ]);
        assert_eq!(pipeline.ask_complete(req).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_practice_questions_are_structured() {
        let root = tempfile::tempdir().unwrap();
        science_sources(root.path());
        let base = spawn_backend(
            "Here you go:\n1. What makes leaves green?\nA. Chlorophyll\nAnswer: A\n2. Where does photosynthesis happen?\nAnswer: B",
        )
        .await;
        let pipeline = pipeline(root.path(), &base);

        let items = pipeline
            .practice_questions(PracticeRequest {
                level: "psle".to_string(),
                subject: "science".to_string(),
                topic: Some("photosynthesis".to_string()),
                count: 2,
            })
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].question_number, "1");
        assert_eq!(items[0].content, "What makes leaves green?\nA. Chlorophyll\nAnswer: A");
        assert_eq!(items[1].question_number, "2");
    }

    #[test]
    fn test_practice_count_bounds() {
        let mut req = PracticeRequest {
            level: "psle".to_string(),
            subject: "science".to_string(),
            topic: None,
            count: 0,
        };
        assert!(req.validate().is_err());
        req.count = MAX_PRACTICE_COUNT + 1;
        assert!(req.validate().is_err());
        req.count = DEFAULT_PRACTICE_COUNT;
        assert!(req.validate().is_ok());
    }
}
