// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use async_trait::async_trait;
use chrono::Utc;
use couriercommon::{
    codec::{BlobDecoded, BlobEncoded},
    identifiers::{AttachmentId, ConversationId, MessageId, Platform, UserId},
    messages::{
        ChatMessage, Conversation, ConversationType, ErrorKind, MessageStatus, Participant,
        RecipientOutcome, StatusTransition,
    },
};
use sqlx::{PgConnection, Row, postgres::PgRow};

use crate::errors::is_unique_violation;

use super::{
    Cursor, MessagePage, MessageService, MessageStore, MessageStoreError,
    check_participant_bounds, first_successful_platform_id,
};

impl MessageService {
    /// Inserts the message row and its initial status history entry inside
    /// the given transaction.
    async fn insert_message(
        connection: &mut PgConnection,
        message: &ChatMessage,
    ) -> Result<(), MessageStoreError> {
        let result = sqlx::query(
            "INSERT INTO messages
                (message_id, conversation_id, status, created_at, message_data)
                VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(message.message_id)
        .bind(&message.conversation_id)
        .bind(message.status.as_str())
        .bind(message.created_at)
        .bind(BlobEncoded(message))
        .execute(&mut *connection)
        .await;
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(MessageStoreError::Duplicate),
            Err(e) => return Err(e.into()),
        }
        sqlx::query(
            "INSERT INTO status_history (message_id, status, reason, recorded_at)
                VALUES ($1, $2, $3, $4)",
        )
        .bind(message.message_id)
        .bind(message.status.as_str())
        .bind(None::<String>)
        .bind(message.created_at)
        .execute(connection)
        .await?;
        Ok(())
    }

    /// Loads a message row for update and decodes it.
    async fn load_for_update(
        connection: &mut PgConnection,
        message_id: &MessageId,
    ) -> Result<ChatMessage, MessageStoreError> {
        let row = sqlx::query("SELECT message_data FROM messages WHERE message_id = $1 FOR UPDATE")
            .bind(message_id)
            .fetch_optional(connection)
            .await?
            .ok_or(MessageStoreError::NotFound)?;
        let message: BlobDecoded<ChatMessage> = row.try_get("message_data")?;
        Ok(message.into_inner())
    }

    async fn update_message(
        connection: &mut PgConnection,
        message: &ChatMessage,
    ) -> Result<(), MessageStoreError> {
        sqlx::query("UPDATE messages SET status = $1, message_data = $2 WHERE message_id = $3")
            .bind(message.status.as_str())
            .bind(BlobEncoded(message))
            .bind(message.message_id)
            .execute(connection)
            .await?;
        Ok(())
    }

    fn decode_message_row(row: PgRow) -> Result<ChatMessage, MessageStoreError> {
        let message: BlobDecoded<ChatMessage> = row.try_get("message_data")?;
        Ok(message.into_inner())
    }

    async fn load_conversation(
        connection: &mut PgConnection,
        conversation_id: &ConversationId,
        for_update: bool,
    ) -> Result<Option<Conversation>, MessageStoreError> {
        let query = if for_update {
            "SELECT conversation_type, created_at FROM conversations
                WHERE conversation_id = $1 FOR UPDATE"
        } else {
            "SELECT conversation_type, created_at FROM conversations
                WHERE conversation_id = $1"
        };
        let Some(row) = sqlx::query(query)
            .bind(conversation_id)
            .fetch_optional(&mut *connection)
            .await?
        else {
            return Ok(None);
        };
        let conversation_type: String = row.try_get("conversation_type")?;
        let conversation_type = conversation_type
            .parse::<ConversationType>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let created_at = row.try_get("created_at")?;

        let windows = sqlx::query(
            "SELECT user_id, joined_at, left_at FROM conversation_participants
                WHERE conversation_id = $1 ORDER BY window_id",
        )
        .bind(conversation_id)
        .fetch_all(connection)
        .await?;
        let participants = windows
            .into_iter()
            .map(|row| {
                Ok(Participant {
                    user_id: row.try_get("user_id")?,
                    joined_at: row.try_get("joined_at")?,
                    left_at: row.try_get("left_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(Some(Conversation {
            conversation_id: conversation_id.clone(),
            conversation_type,
            participants,
            created_at,
        }))
    }
}

#[async_trait]
impl MessageStore for MessageService {
    async fn put_message(&self, message: &ChatMessage) -> Result<(), MessageStoreError> {
        let mut transaction = self.db_pool.begin().await?;
        Self::insert_message(&mut transaction, message).await?;
        transaction.commit().await?;
        Ok(())
    }

    async fn get_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ChatMessage>, MessageStoreError> {
        let row = sqlx::query("SELECT message_data FROM messages WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(&self.db_pool)
            .await?;
        row.map(Self::decode_message_row).transpose()
    }

    async fn append_status(
        &self,
        message_id: &MessageId,
        transition: StatusTransition,
    ) -> Result<(), MessageStoreError> {
        let mut transaction = self.db_pool.begin().await?;
        let mut message = Self::load_for_update(&mut transaction, message_id).await?;
        if !message.status.can_transition_to(transition.status) {
            return Err(MessageStoreError::InvalidTransition {
                from: message.status,
                to: transition.status,
            });
        }
        message.status = transition.status;
        message.updated_at = transition.timestamp;
        Self::update_message(&mut transaction, &message).await?;
        sqlx::query(
            "INSERT INTO status_history (message_id, status, reason, recorded_at)
                VALUES ($1, $2, $3, $4)",
        )
        .bind(message_id)
        .bind(transition.status.as_str())
        .bind(&transition.reason)
        .bind(transition.timestamp)
        .execute(&mut *transaction)
        .await?;
        transaction.commit().await?;
        Ok(())
    }

    async fn get_status_history(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<StatusTransition>, MessageStoreError> {
        let rows = sqlx::query(
            "SELECT status, reason, recorded_at FROM status_history
                WHERE message_id = $1 ORDER BY sequence_number",
        )
        .bind(message_id)
        .fetch_all(&self.db_pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                let status = status
                    .parse::<MessageStatus>()
                    .map_err(|e| sqlx::Error::Decode(e.into()))?;
                Ok(StatusTransition {
                    status,
                    timestamp: row.try_get("recorded_at")?,
                    reason: row.try_get("reason")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }

    async fn record_outcomes(
        &self,
        message_id: &MessageId,
        outcomes: &[RecipientOutcome],
        error_kind: Option<ErrorKind>,
    ) -> Result<(), MessageStoreError> {
        let mut transaction = self.db_pool.begin().await?;
        let mut message = Self::load_for_update(&mut transaction, message_id).await?;
        message.outcomes = outcomes.to_vec();
        message.error_kind = error_kind;
        if message.platform_message_id.is_none() {
            message.platform_message_id = first_successful_platform_id(outcomes);
        }
        message.updated_at = Utc::now();
        Self::update_message(&mut transaction, &message).await?;
        for outcome in outcomes {
            let Some(platform_message_id) = &outcome.platform_message_id else {
                continue;
            };
            let Some((platform, _)) = outcome.recipient.split_once(':') else {
                continue;
            };
            let Ok(platform) = platform.parse::<Platform>() else {
                continue;
            };
            sqlx::query(
                "INSERT INTO message_platform_ids (platform, platform_message_id, message_id)
                    VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(platform)
            .bind(platform_message_id)
            .bind(message_id)
            .execute(&mut *transaction)
            .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn find_by_platform_message_id(
        &self,
        platform: Platform,
        platform_message_id: &str,
    ) -> Result<Option<ChatMessage>, MessageStoreError> {
        let row = sqlx::query(
            "SELECT m.message_data FROM messages m
                JOIN message_platform_ids p ON p.message_id = m.message_id
                WHERE p.platform = $1 AND p.platform_message_id = $2",
        )
        .bind(platform)
        .bind(platform_message_id)
        .fetch_optional(&self.db_pool)
        .await?;
        row.map(Self::decode_message_row).transpose()
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<MessagePage, MessageStoreError> {
        let cursor_created_at = cursor.map(|c| c.created_at);
        let cursor_message_id = cursor.map(|c| c.message_id);
        let rows = sqlx::query(
            r#"
            SELECT m.message_data FROM messages m
            WHERE m.conversation_id = $1
              AND EXISTS (
                SELECT 1 FROM conversation_participants p
                WHERE p.conversation_id = m.conversation_id
                  AND p.user_id = $2
                  AND p.joined_at <= m.created_at
                  AND (p.left_at IS NULL OR m.created_at < p.left_at)
              )
              AND ($3::timestamptz IS NULL OR (m.created_at, m.message_id) < ($3, $4))
            ORDER BY m.created_at DESC, m.message_id DESC
            LIMIT $5
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(cursor_created_at)
        .bind(cursor_message_id)
        .bind(limit as i64)
        .fetch_all(&self.db_pool)
        .await?;
        let messages = rows
            .into_iter()
            .map(Self::decode_message_row)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = (messages.len() == limit)
            .then(|| messages.last())
            .flatten()
            .map(|last| Cursor {
                created_at: last.created_at,
                message_id: last.message_id,
            });
        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    async fn put_attachment_ref(
        &self,
        message_id: &MessageId,
        file_id: AttachmentId,
    ) -> Result<(), MessageStoreError> {
        let mut transaction = self.db_pool.begin().await?;
        let mut message = Self::load_for_update(&mut transaction, message_id).await?;
        if message.status != MessageStatus::Pending {
            return Err(MessageStoreError::InvalidState(format!(
                "attachments cannot be added in status {}",
                message.status
            )));
        }
        if !message.content.attachments.contains(&file_id) {
            message.content.attachments.push(file_id);
            message.updated_at = Utc::now();
            Self::update_message(&mut transaction, &message).await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), MessageStoreError> {
        let active = conversation.active_participants_at(Utc::now());
        check_participant_bounds(conversation.conversation_type, active.len())?;
        let mut transaction = self.db_pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO conversations (conversation_id, conversation_type, created_at)
                VALUES ($1, $2, $3)",
        )
        .bind(&conversation.conversation_id)
        .bind(conversation.conversation_type.as_str())
        .bind(conversation.created_at)
        .execute(&mut *transaction)
        .await;
        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Err(MessageStoreError::Duplicate),
            Err(e) => return Err(e.into()),
        }
        for participant in &conversation.participants {
            sqlx::query(
                "INSERT INTO conversation_participants
                    (conversation_id, user_id, joined_at, left_at)
                    VALUES ($1, $2, $3, $4)",
            )
            .bind(&conversation.conversation_id)
            .bind(participant.user_id)
            .bind(participant.joined_at)
            .bind(participant.left_at)
            .execute(&mut *transaction)
            .await?;
        }
        transaction.commit().await?;
        Ok(())
    }

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, MessageStoreError> {
        let mut connection = self.db_pool.acquire().await?;
        Self::load_conversation(&mut connection, conversation_id, false).await
    }

    async fn modify_participants(
        &self,
        conversation_id: &ConversationId,
        add: &[UserId],
        remove: &[UserId],
    ) -> Result<Vec<ChatMessage>, MessageStoreError> {
        let mut transaction = self.db_pool.begin().await?;
        let conversation = Self::load_conversation(&mut transaction, conversation_id, true)
            .await?
            .ok_or(MessageStoreError::NotFound)?;
        let changes = participant_changes(&conversation, add, remove)?;

        let now = Utc::now();
        for user_id in &changes.added {
            sqlx::query(
                "INSERT INTO conversation_participants
                    (conversation_id, user_id, joined_at)
                    VALUES ($1, $2, $3)",
            )
            .bind(conversation_id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *transaction)
            .await?;
        }
        for user_id in &changes.removed {
            sqlx::query(
                "UPDATE conversation_participants SET left_at = $1
                    WHERE conversation_id = $2 AND user_id = $3 AND left_at IS NULL",
            )
            .bind(now)
            .bind(conversation_id)
            .bind(user_id)
            .execute(&mut *transaction)
            .await?;
        }
        let system_messages = changes.system_messages(conversation_id);
        for message in &system_messages {
            Self::insert_message(&mut transaction, message).await?;
        }
        transaction.commit().await?;
        Ok(system_messages)
    }
}

/// The validated outcome of a participant change request.
pub(super) struct ParticipantChanges {
    pub(super) added: Vec<UserId>,
    pub(super) removed: Vec<UserId>,
}

impl ParticipantChanges {
    pub(super) fn system_messages(&self, conversation_id: &ConversationId) -> Vec<ChatMessage> {
        self.added
            .iter()
            .map(|user_id| {
                ChatMessage::system(conversation_id.clone(), *user_id, "joined the conversation")
            })
            .chain(self.removed.iter().map(|user_id| {
                ChatMessage::system(conversation_id.clone(), *user_id, "left the conversation")
            }))
            .collect()
    }
}

/// Validates a participant change against the conversation's type, current
/// membership and size bounds.
pub(super) fn participant_changes(
    conversation: &Conversation,
    add: &[UserId],
    remove: &[UserId],
) -> Result<ParticipantChanges, MessageStoreError> {
    if conversation.conversation_type != ConversationType::Group {
        return Err(MessageStoreError::InvalidParticipants(
            "participants of a one-to-one conversation are fixed".into(),
        ));
    }
    let mut add = add.to_vec();
    add.sort();
    add.dedup();
    let mut remove = remove.to_vec();
    remove.sort();
    remove.dedup();
    let now = Utc::now();
    let active = conversation.active_participants_at(now);
    for user_id in &add {
        if active.contains(user_id) {
            return Err(MessageStoreError::InvalidParticipants(format!(
                "user {user_id} is already a participant"
            )));
        }
    }
    for user_id in &remove {
        if !active.contains(user_id) {
            return Err(MessageStoreError::InvalidParticipants(format!(
                "user {user_id} is not a participant"
            )));
        }
    }
    let resulting = active.len() + add.len() - remove.len();
    check_participant_bounds(conversation.conversation_type, resulting)?;
    Ok(ParticipantChanges {
        added: add,
        removed: remove,
    })
}
