// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable record of messages, conversations, status history and participant
//! join windows.
//!
//! The store owns all message mutations: only ingress creates rows, only the
//! router and the status propagator append status history. Status appends
//! are monotone under the message state machine; everything else is rejected
//! with [`MessageStoreError::InvalidTransition`].

use async_trait::async_trait;
use couriercommon::{
    identifiers::{AttachmentId, ConversationId, MessageId, Platform, UserId},
    messages::{
        ChatMessage, Conversation, ErrorKind, RecipientOutcome, StatusTransition,
    },
};
use sqlx::PgPool;
use thiserror::Error;

use crate::{
    backend_service::BackendService,
    errors::{ServiceCreationError, StorageError},
};

mod cursor;
pub mod memory;
mod persistence;

pub use cursor::{Cursor, CursorError};

#[derive(Debug, Error)]
pub enum MessageStoreError {
    /// A message with this id already exists.
    #[error("Message already exists")]
    Duplicate,
    /// The referenced message or conversation does not exist.
    #[error("Not found")]
    NotFound,
    /// The requested status transition is not monotone.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: couriercommon::messages::MessageStatus,
        to: couriercommon::messages::MessageStatus,
    },
    /// A participant change violates the conversation's bounds.
    #[error("Invalid participant change: {0}")]
    InvalidParticipants(String),
    /// The operation is not allowed in the message's current state.
    #[error("Invalid message state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for MessageStoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.into())
    }
}

impl From<couriercommon::codec::Error> for MessageStoreError {
    fn from(e: couriercommon::codec::Error) -> Self {
        Self::Storage(e.into())
    }
}

/// One page of conversation history, newest first.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    pub next_cursor: Option<Cursor>,
}

#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug + 'static {
    /// Inserts a message and atomically initialises its status history with
    /// the message's current status. Fails with
    /// [`MessageStoreError::Duplicate`] if the id is taken.
    async fn put_message(&self, message: &ChatMessage) -> Result<(), MessageStoreError>;

    async fn get_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ChatMessage>, MessageStoreError>;

    /// Appends a status transition. Monotone; rejected transitions leave the
    /// history untouched.
    async fn append_status(
        &self,
        message_id: &MessageId,
        transition: StatusTransition,
    ) -> Result<(), MessageStoreError>;

    async fn get_status_history(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<StatusTransition>, MessageStoreError>;

    /// Records per-recipient dispatch metadata, the platform message id of
    /// the first successful dispatch, and a terminal error kind if any.
    async fn record_outcomes(
        &self,
        message_id: &MessageId,
        outcomes: &[RecipientOutcome],
        error_kind: Option<ErrorKind>,
    ) -> Result<(), MessageStoreError>;

    /// Reverse lookup from a platform-assigned message id, for webhook
    /// status updates.
    async fn find_by_platform_message_id(
        &self,
        platform: Platform,
        platform_message_id: &str,
    ) -> Result<Option<ChatMessage>, MessageStoreError>;

    /// Pages through a conversation's history, newest first, tie-broken by
    /// message id. Only messages inside one of the requesting user's join
    /// windows are returned.
    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<MessagePage, MessageStoreError>;

    /// Attaches a file reference. Only callable while the message has not
    /// left its initial status.
    async fn put_attachment_ref(
        &self,
        message_id: &MessageId,
        file_id: AttachmentId,
    ) -> Result<(), MessageStoreError>;

    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), MessageStoreError>;

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, MessageStoreError>;

    /// Adds and removes participants, appending join windows and emitting
    /// one synthetic system message per change. Returns the system messages
    /// written.
    async fn modify_participants(
        &self,
        conversation_id: &ConversationId,
        add: &[UserId],
        remove: &[UserId],
    ) -> Result<Vec<ChatMessage>, MessageStoreError>;
}

/// Postgres-backed message store. Messages are stored as codec blobs beside
/// the columns the queries need, sharded logically by conversation id.
#[derive(Debug, Clone)]
pub struct MessageService {
    db_pool: PgPool,
}

#[async_trait]
impl BackendService for MessageService {
    async fn initialize(db_pool: PgPool) -> Result<Self, ServiceCreationError> {
        Ok(Self { db_pool })
    }
}

/// Validates participant counts for a conversation type.
pub(crate) fn check_participant_bounds(
    conversation_type: couriercommon::messages::ConversationType,
    count: usize,
) -> Result<(), MessageStoreError> {
    use couriercommon::messages::ConversationType;
    use couriercommon::{MAX_PARTICIPANTS, MIN_PARTICIPANTS};
    match conversation_type {
        ConversationType::OneToOne if count != 2 => Err(MessageStoreError::InvalidParticipants(
            format!("a one-to-one conversation has exactly 2 participants, got {count}"),
        )),
        ConversationType::Group if !(MIN_PARTICIPANTS..=MAX_PARTICIPANTS).contains(&count) => {
            Err(MessageStoreError::InvalidParticipants(format!(
                "a group conversation has {MIN_PARTICIPANTS} to {MAX_PARTICIPANTS} participants, got {count}"
            )))
        }
        _ => Ok(()),
    }
}

/// Picks the platform message id recorded on the message row: the first
/// successful dispatch that reported one.
pub(crate) fn first_successful_platform_id(outcomes: &[RecipientOutcome]) -> Option<String> {
    outcomes
        .iter()
        .filter(|o| {
            matches!(
                o.status,
                couriercommon::messages::MessageStatus::Sent
                    | couriercommon::messages::MessageStatus::Delivered
            )
        })
        .find_map(|o| o.platform_message_id.clone())
}

#[cfg(test)]
mod tests {
    use couriercommon::messages::{ConversationType, MessageStatus};

    use super::*;

    #[test]
    fn participant_bounds() {
        assert!(check_participant_bounds(ConversationType::OneToOne, 2).is_ok());
        assert!(check_participant_bounds(ConversationType::OneToOne, 3).is_err());
        assert!(check_participant_bounds(ConversationType::Group, 2).is_ok());
        assert!(check_participant_bounds(ConversationType::Group, 100).is_ok());
        assert!(check_participant_bounds(ConversationType::Group, 101).is_err());
        assert!(check_participant_bounds(ConversationType::Group, 1).is_err());
    }

    #[test]
    fn platform_id_comes_from_a_successful_outcome() {
        let outcomes = vec![
            RecipientOutcome {
                recipient: "whatsapp:+1".into(),
                status: MessageStatus::Failed,
                platform_message_id: Some("failed-id".into()),
                error_kind: Some(ErrorKind::PermanentDelivery),
                reason: None,
                attempts: 1,
            },
            RecipientOutcome {
                recipient: "whatsapp:+2".into(),
                status: MessageStatus::Sent,
                platform_message_id: Some("wamid.1".into()),
                error_kind: None,
                reason: None,
                attempts: 1,
            },
        ];
        assert_eq!(
            first_successful_platform_id(&outcomes),
            Some("wamid.1".to_owned())
        );
    }
}
