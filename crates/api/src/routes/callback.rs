//! Provider delivery-status callback.
//!
//! The provider gets `200 OK` for every well-formed report, whatever happens
//! internally; redelivering a report would not change its outcome.

use axum::extract::rejection::FormRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Form, Router};
use serde::Deserialize;

use herald_common::error::AppError;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/callback", post(status_callback))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub notification_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "MessageSid")]
    pub message_sid: String,
    #[serde(rename = "MessageStatus")]
    pub message_status: String,
}

async fn status_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    form: Result<Form<StatusReport>, FormRejection>,
) -> Result<StatusCode, AppError> {
    let Form(report) = form.map_err(|e| AppError::Validation(format!("Malformed status callback: {}", e)))?;
    if report.message_sid.trim().is_empty() || report.message_status.trim().is_empty() {
        return Err(AppError::Validation(
            "MessageSid and MessageStatus are required".to_string(),
        ));
    }

    match state
        .callbacks
        .process(&query.notification_id, &report.message_status)
        .await
    {
        Ok(outcome) => tracing::debug!(
            notification_id = %query.notification_id,
            message_sid = %report.message_sid,
            ?outcome,
            "Status callback applied"
        ),
        Err(AppError::TerminalStatus { id, status }) => tracing::debug!(
            notification_id = %id,
            %status,
            reported = %report.message_status,
            "Status callback for final notification ignored"
        ),
        Err(AppError::NotFound(msg)) => tracing::error!(
            notification_id = %query.notification_id,
            message_sid = %report.message_sid,
            error = %msg,
            "Status callback for unknown notification"
        ),
        Err(e) => tracing::error!(
            notification_id = %query.notification_id,
            message_sid = %report.message_sid,
            error = %e,
            "Failed to apply status callback"
        ),
    }

    Ok(StatusCode::OK)
}
