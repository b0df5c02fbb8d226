//! Email queueing and log routes.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use postbox_common::error::AppError;
use postbox_common::types::{EmailLogPage, EmailMessage, EmailResponse, Page};
use postbox_engine::producer::{SendBulkEmailRequest, SendEmailRequest};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/email/send", post(send_email))
        .route("/api/email/send-bulk", post(send_bulk))
        .route("/api/email/logs", get(list_logs))
        .route("/api/email/logs/{id}", get(get_log))
}

/// POST /api/email/send: queue one email.
async fn send_email(
    State(state): State<AppState>,
    Json(request): Json<SendEmailRequest>,
) -> Result<Json<EmailResponse>, AppError> {
    let response = state.emails.queue_email(&request).await?;
    Ok(Json(response))
}

/// POST /api/email/send-bulk: queue each email independently, one result per item.
async fn send_bulk(
    State(state): State<AppState>,
    Json(request): Json<SendBulkEmailRequest>,
) -> Json<Vec<EmailResponse>> {
    Json(state.emails.queue_bulk_emails(&request).await)
}

async fn list_logs(
    State(state): State<AppState>,
    Query(page): Query<Page>,
) -> Result<Json<EmailLogPage>, AppError> {
    Ok(Json(state.emails.get_email_logs(page).await?))
}

async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EmailMessage>, AppError> {
    Ok(Json(state.emails.get_email(id).await?))
}
