// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use courierbackend::message_store::Cursor;
use couriercommon::{
    identifiers::{ConversationId, UserId},
    messages::{Conversation, ConversationType},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, AppState, MessageView};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateConversationBody {
    #[serde(rename = "type")]
    conversation_type: String,
    participants: Vec<Uuid>,
    /// Accepted for compatibility; routing derives the channel per message.
    #[serde(default)]
    primary_channel: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ConversationView {
    conversation_id: String,
    #[serde(rename = "type")]
    conversation_type: ConversationType,
    participants: Vec<ParticipantView>,
    created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ParticipantView {
    user_id: String,
    joined_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    left_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Conversation> for ConversationView {
    fn from(conversation: Conversation) -> Self {
        Self {
            conversation_id: conversation.conversation_id.to_string(),
            conversation_type: conversation.conversation_type,
            participants: conversation
                .participants
                .into_iter()
                .map(|p| ParticipantView {
                    user_id: p.user_id.to_string(),
                    joined_at: p.joined_at,
                    left_at: p.left_at,
                })
                .collect(),
            created_at: conversation.created_at,
        }
    }
}

pub(super) async fn create_conversation(
    State(state): State<AppState>,
    Json(body): Json<CreateConversationBody>,
) -> Result<(StatusCode, Json<ConversationView>), ApiError> {
    let conversation_type: ConversationType = body
        .conversation_type
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;
    let conversation = Conversation::new(
        ConversationId::random(),
        conversation_type,
        body.participants.into_iter().map(UserId::from),
    );
    state.store.create_conversation(&conversation).await?;
    Ok((StatusCode::OK, Json(conversation.into())))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ListMessagesParams {
    user_id: Uuid,
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MessagePageView {
    messages: Vec<MessageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

pub(super) async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ListMessagesParams>,
) -> Result<Json<MessagePageView>, ApiError> {
    let cursor = params
        .before
        .as_deref()
        .map(Cursor::decode)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let page = state
        .store
        .list_messages(
            &ConversationId::new(id),
            &UserId::from(params.user_id),
            cursor,
            limit,
        )
        .await?;
    Ok(Json(MessagePageView {
        messages: page.messages.into_iter().map(Into::into).collect(),
        next_cursor: page.next_cursor.map(|cursor| cursor.encode()),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AddParticipantsBody {
    user_ids: Vec<Uuid>,
}

pub(super) async fn add_participants(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddParticipantsBody>,
) -> Result<Json<ConversationView>, ApiError> {
    let conversation_id = ConversationId::new(id);
    let add: Vec<UserId> = body.user_ids.into_iter().map(UserId::from).collect();
    state
        .store
        .modify_participants(&conversation_id, &add, &[])
        .await?;
    let conversation = state
        .store
        .get_conversation(&conversation_id)
        .await?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    Ok(Json(conversation.into()))
}

pub(super) async fn remove_participant(
    State(state): State<AppState>,
    Path((id, user_id)): Path<(String, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .modify_participants(&ConversationId::new(id), &[], &[UserId::from(user_id)])
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
