// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use couriercommon::{
    identifiers::{Channel, ConversationId, MessageId, RecipientRef, UserId},
    messages::{MessageContent, MessageStatus, SendRequest, StatusTransition},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, AppState, MessageView};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SendMessageBody {
    conversation_id: String,
    sender_id: Uuid,
    #[serde(default)]
    content: Option<String>,
    channel: String,
    #[serde(default)]
    recipient_ids: Vec<String>,
    #[serde(default)]
    file_ids: Vec<Uuid>,
    #[serde(default)]
    message_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SendMessageResponse {
    message_id: String,
    status: MessageStatus,
    status_url: String,
}

pub(super) async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageBody>,
) -> Result<(StatusCode, Json<SendMessageResponse>), ApiError> {
    let channel: Channel = body
        .channel
        .parse()
        .map_err(|_| ApiError::bad_request(format!("unknown channel: {}", body.channel)))?;
    let recipients = body
        .recipient_ids
        .iter()
        .map(|raw| RecipientRef::parse(raw, channel))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let request = SendRequest {
        conversation_id: ConversationId::new(body.conversation_id),
        sender_id: UserId::from(body.sender_id),
        content: MessageContent {
            text: body.content,
            attachments: body.file_ids.into_iter().map(Into::into).collect(),
        },
        channel,
        message_id: body.message_id.map(Into::into),
        recipients,
    };
    let receipt = state.ingress.accept(request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SendMessageResponse {
            message_id: receipt.message_id.to_string(),
            status: receipt.status,
            status_url: format!("/messages/{}/status", receipt.message_id),
        }),
    ))
}

pub(super) async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageView>, ApiError> {
    let message = state
        .store
        .get_message(&MessageId::from(id))
        .await?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    Ok(Json(message.into()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StatusView {
    message_id: String,
    status: MessageStatus,
    history: Vec<TransitionView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TransitionView {
    status: MessageStatus,
    timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl From<StatusTransition> for TransitionView {
    fn from(transition: StatusTransition) -> Self {
        Self {
            status: transition.status,
            timestamp: transition.timestamp,
            reason: transition.reason,
        }
    }
}

pub(super) async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusView>, ApiError> {
    let message_id = MessageId::from(id);
    let message = state
        .store
        .get_message(&message_id)
        .await?
        .ok_or_else(|| ApiError::not_found("message not found"))?;
    let history = state.store.get_status_history(&message_id).await?;
    Ok(Json(StatusView {
        message_id: message_id.to_string(),
        status: message.status,
        history: history.into_iter().map(Into::into).collect(),
    }))
}
