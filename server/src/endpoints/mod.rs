// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! REST endpoints, webhook intake and the live WebSocket channel.

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use courierbackend::{
    files::{FileService, FileServiceError},
    identity_service::{IdentityStore, IdentityStoreError},
    ingress::{Ingress, IngressError, WebhookError, WebhookIntake},
    live::SharedLiveHub,
    message_store::{MessageStore, MessageStoreError},
};
use couriercommon::messages::ChatMessage;
use serde::Serialize;
use serde_json::json;

mod conversations;
mod files;
mod messages;
mod users;
mod webhooks;
mod ws;

/// Shared state of all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub identity: Arc<dyn IdentityStore>,
    pub store: Arc<dyn MessageStore>,
    pub ingress: Arc<Ingress>,
    pub webhooks: Arc<WebhookIntake>,
    pub files: FileService,
    pub live: SharedLiveHub,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/messages", post(messages::send_message))
        .route("/messages/{id}", get(messages::get_message))
        .route("/messages/{id}/status", get(messages::get_status))
        .route("/conversations", post(conversations::create_conversation))
        .route(
            "/conversations/{id}/messages",
            get(conversations::list_messages),
        )
        .route(
            "/conversations/{id}/participants",
            post(conversations::add_participants),
        )
        .route(
            "/conversations/{id}/participants/{user_id}",
            delete(conversations::remove_participant),
        )
        .route("/webhooks/{platform}", post(webhooks::receive))
        .route("/ws/chat", get(ws::ws_chat))
        .route("/users", post(users::create_user).get(users::list_users))
        .route("/users/{id}", get(users::get_user))
        .route("/users/{id}/identities", post(users::link_identity))
        .route(
            "/users/{id}/identities/{platform}/{platform_user_id}",
            delete(users::unlink_identity),
        )
        .route("/users/{id}/matches", get(users::suggest_matches))
        .route("/identities/resolve", get(users::resolve))
        .route("/files/initiate", post(files::initiate))
        .route("/files/{id}", get(files::get_file))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Uniform error body: `{"error": "...", "message": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "bad_request",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            error: "duplicate",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.error,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

impl From<IngressError> for ApiError {
    fn from(e: IngressError) -> Self {
        match &e {
            IngressError::Validation(_) => ApiError::bad_request(e.to_string()),
            IngressError::NotFound(_) => ApiError::not_found(e.to_string()),
            IngressError::Publish(_) => Self {
                status: StatusCode::BAD_GATEWAY,
                error: "publish_failed",
                message: e.to_string(),
            },
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<MessageStoreError> for ApiError {
    fn from(e: MessageStoreError) -> Self {
        match &e {
            MessageStoreError::Duplicate => ApiError::conflict(e.to_string()),
            MessageStoreError::NotFound => ApiError::not_found(e.to_string()),
            MessageStoreError::InvalidTransition { .. } => ApiError::conflict(e.to_string()),
            MessageStoreError::InvalidParticipants(_) | MessageStoreError::InvalidState(_) => {
                ApiError::bad_request(e.to_string())
            }
            MessageStoreError::Storage(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<IdentityStoreError> for ApiError {
    fn from(e: IdentityStoreError) -> Self {
        match &e {
            IdentityStoreError::Duplicate => ApiError::conflict(e.to_string()),
            IdentityStoreError::UserNotFound => ApiError::not_found(e.to_string()),
            IdentityStoreError::Storage(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<FileServiceError> for ApiError {
    fn from(e: FileServiceError) -> Self {
        match &e {
            FileServiceError::TooLarge => ApiError::bad_request(e.to_string()),
            FileServiceError::NotFound => ApiError::not_found(e.to_string()),
            FileServiceError::AttachmentsDisabled => Self {
                status: StatusCode::SERVICE_UNAVAILABLE,
                error: "attachments_disabled",
                message: e.to_string(),
            },
            FileServiceError::ObjectStorage(_) => Self {
                status: StatusCode::BAD_GATEWAY,
                error: "object_storage",
                message: e.to_string(),
            },
            FileServiceError::Storage(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        match &e {
            WebhookError::UnknownPlatform(_) => ApiError::not_found(e.to_string()),
            WebhookError::InvalidSignature => Self {
                status: StatusCode::UNAUTHORIZED,
                error: "invalid_signature",
                message: e.to_string(),
            },
            WebhookError::Malformed(_) => ApiError::bad_request(e.to_string()),
            WebhookError::Internal(_) => Self {
                status: StatusCode::BAD_GATEWAY,
                error: "webhook_failed",
                message: e.to_string(),
            },
        }
    }
}

/// Wire shape of a message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: Option<String>,
    pub file_ids: Vec<String>,
    pub channel: String,
    pub kind: couriercommon::messages::MessageKind,
    pub status: couriercommon::messages::MessageStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<couriercommon::messages::ErrorKind>,
    pub recipients: Vec<String>,
    pub outcomes: Vec<OutcomeView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeView {
    pub recipient: String,
    pub status: couriercommon::messages::MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<couriercommon::messages::ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempts: u32,
}

impl From<ChatMessage> for MessageView {
    fn from(message: ChatMessage) -> Self {
        Self {
            message_id: message.message_id.to_string(),
            conversation_id: message.conversation_id.to_string(),
            sender_id: message.sender_id.to_string(),
            text: message.content.text,
            file_ids: message
                .content
                .attachments
                .iter()
                .map(ToString::to_string)
                .collect(),
            channel: message.channel.as_str().to_owned(),
            kind: message.kind,
            status: message.status,
            created_at: message.created_at,
            updated_at: message.updated_at,
            platform_message_id: message.platform_message_id,
            error_kind: message.error_kind,
            recipients: message
                .recipients
                .iter()
                .map(ToString::to_string)
                .collect(),
            outcomes: message
                .outcomes
                .into_iter()
                .map(|o| OutcomeView {
                    recipient: o.recipient,
                    status: o.status,
                    platform_message_id: o.platform_message_id,
                    error_kind: o.error_kind,
                    reason: o.reason,
                    attempts: o.attempts,
                })
                .collect(),
        }
    }
}
