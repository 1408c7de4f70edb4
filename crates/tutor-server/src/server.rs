/// HTTP surface over [`TutorPipeline`].
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{stream, StreamExt};
use serde_json::json;
use tracing::{debug, error};

use crate::error::AppError;
use crate::index::IndexStore;
use crate::pipeline::{ChatRequest, PracticeRequest, TutorPipeline};
use crate::taxonomy::taxonomy;

type Shared<S> = State<Arc<TutorPipeline<S>>>;

pub fn router<S: IndexStore>(pipeline: Arc<TutorPipeline<S>>) -> Router {
    Router::new()
        .route("/chat", post(chat::<S>))
        .route("/chat/complete", post(chat_complete::<S>))
        .route("/practice", post(practice::<S>))
        .route("/subjects", get(subjects))
        .route("/health", get(health::<S>))
        .with_state(pipeline)
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidKey { .. } => StatusCode::BAD_REQUEST,
            Self::Common(_) | Self::Llm(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::SourceNotFound(_) | Self::EmptySources(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Stream the answer as plain text. A backend failure mid-answer closes the backend
/// connection and ends the body early; tokens already sent stay valid.
async fn chat<S: IndexStore>(
    State(pipeline): Shared<S>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|e| AppError::InvalidRequest(e.body_text()))?;
    let answer = pipeline.ask(request).await?;

    let body = stream::unfold(answer, |mut answer| async move {
        match answer.next().await {
            Some(Ok(token)) => Some((Ok::<_, Infallible>(token), answer)),
            Some(Err(e)) => {
                debug!(error = %e, "ending answer body early");
                answer.close();
                None
            }
            None => None,
        }
    });
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}

async fn chat_complete<S: IndexStore>(
    State(pipeline): Shared<S>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(request) = payload.map_err(|e| AppError::InvalidRequest(e.body_text()))?;
    let response = pipeline.ask_complete(request).await?;
    Ok(Json(json!({ "response": response })))
}

async fn practice<S: IndexStore>(
    State(pipeline): Shared<S>,
    payload: Result<Json<PracticeRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(request) = payload.map_err(|e| AppError::InvalidRequest(e.body_text()))?;
    let questions = pipeline.practice_questions(request).await?;
    Ok(Json(json!({ "questions": questions })))
}

async fn subjects() -> Json<serde_json::Value> {
    Json(json!({ "levels": taxonomy() }))
}

async fn health<S: IndexStore>(State(pipeline): Shared<S>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "ready_subjects": pipeline.cache().len().await,
    }))
}
