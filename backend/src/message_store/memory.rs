// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory message store for tests and single-process deployments. Same
//! semantics as the Postgres store.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use couriercommon::{
    identifiers::{AttachmentId, ConversationId, MessageId, Platform, UserId},
    messages::{
        ChatMessage, Conversation, ErrorKind, MessageStatus, Participant, RecipientOutcome,
        StatusTransition,
    },
};

use super::{
    Cursor, MessagePage, MessageStore, MessageStoreError, check_participant_bounds,
    first_successful_platform_id, persistence::participant_changes,
};

#[derive(Debug, Default)]
struct Inner {
    messages: HashMap<MessageId, ChatMessage>,
    history: HashMap<MessageId, Vec<StatusTransition>>,
    conversations: HashMap<ConversationId, Conversation>,
    platform_ids: HashMap<(Platform, String), MessageId>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryMessageStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn put_message(&self, message: &ChatMessage) -> Result<(), MessageStoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.messages.contains_key(&message.message_id) {
            return Err(MessageStoreError::Duplicate);
        }
        inner.messages.insert(message.message_id, message.clone());
        inner.history.insert(
            message.message_id,
            vec![StatusTransition {
                status: message.status,
                timestamp: message.created_at,
                reason: None,
            }],
        );
        Ok(())
    }

    async fn get_message(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ChatMessage>, MessageStoreError> {
        Ok(self.inner.lock().unwrap().messages.get(message_id).cloned())
    }

    async fn append_status(
        &self,
        message_id: &MessageId,
        transition: StatusTransition,
    ) -> Result<(), MessageStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or(MessageStoreError::NotFound)?;
        if !message.status.can_transition_to(transition.status) {
            return Err(MessageStoreError::InvalidTransition {
                from: message.status,
                to: transition.status,
            });
        }
        message.status = transition.status;
        message.updated_at = transition.timestamp;
        inner
            .history
            .entry(*message_id)
            .or_default()
            .push(transition);
        Ok(())
    }

    async fn get_status_history(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<StatusTransition>, MessageStoreError> {
        self.inner
            .lock()
            .unwrap()
            .history
            .get(message_id)
            .cloned()
            .ok_or(MessageStoreError::NotFound)
    }

    async fn record_outcomes(
        &self,
        message_id: &MessageId,
        outcomes: &[RecipientOutcome],
        error_kind: Option<ErrorKind>,
    ) -> Result<(), MessageStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or(MessageStoreError::NotFound)?;
        message.outcomes = outcomes.to_vec();
        message.error_kind = error_kind;
        if message.platform_message_id.is_none() {
            message.platform_message_id = first_successful_platform_id(outcomes);
        }
        message.updated_at = Utc::now();
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
            inner
                .platform_ids
                .entry((platform, platform_message_id.clone()))
                .or_insert(*message_id);
        }
        Ok(())
    }

    async fn find_by_platform_message_id(
        &self,
        platform: Platform,
        platform_message_id: &str,
    ) -> Result<Option<ChatMessage>, MessageStoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .platform_ids
            .get(&(platform, platform_message_id.to_owned()))
            .and_then(|message_id| inner.messages.get(message_id))
            .cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<MessagePage, MessageStoreError> {
        let inner = self.inner.lock().unwrap();
        let conversation = inner
            .conversations
            .get(conversation_id)
            .ok_or(MessageStoreError::NotFound)?;
        let mut messages: Vec<ChatMessage> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == *conversation_id)
            .filter(|m| conversation.message_visible_to(user_id, m.created_at))
            .filter(|m| match cursor {
                Some(cursor) => {
                    (m.created_at, m.message_id) < (cursor.created_at, cursor.message_id)
                }
                None => true,
            })
            .cloned()
            .collect();
        messages.sort_by(|a, b| {
            (b.created_at, b.message_id).cmp(&(a.created_at, a.message_id))
        });
        messages.truncate(limit);
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
        let mut inner = self.inner.lock().unwrap();
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or(MessageStoreError::NotFound)?;
        if message.status != MessageStatus::Pending {
            return Err(MessageStoreError::InvalidState(format!(
                "attachments cannot be added in status {}",
                message.status
            )));
        }
        if !message.content.attachments.contains(&file_id) {
            message.content.attachments.push(file_id);
            message.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<(), MessageStoreError> {
        let active = conversation.active_participants_at(Utc::now());
        check_participant_bounds(conversation.conversation_type, active.len())?;
        let mut inner = self.inner.lock().unwrap();
        if inner
            .conversations
            .contains_key(&conversation.conversation_id)
        {
            return Err(MessageStoreError::Duplicate);
        }
        inner
            .conversations
            .insert(conversation.conversation_id.clone(), conversation.clone());
        Ok(())
    }

    async fn get_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>, MessageStoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .conversations
            .get(conversation_id)
            .cloned())
    }

    async fn modify_participants(
        &self,
        conversation_id: &ConversationId,
        add: &[UserId],
        remove: &[UserId],
    ) -> Result<Vec<ChatMessage>, MessageStoreError> {
        let mut inner = self.inner.lock().unwrap();
        let conversation = inner
            .conversations
            .get(conversation_id)
            .ok_or(MessageStoreError::NotFound)?;
        let changes = participant_changes(conversation, add, remove)?;

        let now = Utc::now();
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or(MessageStoreError::NotFound)?;
        for user_id in &changes.added {
            conversation.participants.push(Participant {
                user_id: *user_id,
                joined_at: now,
                left_at: None,
            });
        }
        for user_id in &changes.removed {
            for participant in conversation
                .participants
                .iter_mut()
                .filter(|p| p.user_id == *user_id && p.left_at.is_none())
            {
                participant.left_at = Some(now);
            }
        }
        let system_messages = changes.system_messages(conversation_id);
        for message in &system_messages {
            inner
                .messages
                .insert(message.message_id, message.clone());
            inner.history.insert(
                message.message_id,
                vec![StatusTransition {
                    status: message.status,
                    timestamp: message.created_at,
                    reason: None,
                }],
            );
        }
        Ok(system_messages)
    }
}

#[cfg(test)]
mod tests {
    use couriercommon::{
        identifiers::Channel,
        messages::{ConversationType, MessageContent},
    };

    use super::*;

    fn conversation_with(users: &[UserId]) -> Conversation {
        Conversation::new(
            ConversationId::random(),
            if users.len() == 2 {
                ConversationType::OneToOne
            } else {
                ConversationType::Group
            },
            users.iter().copied(),
        )
    }

    fn outbound(conversation: &Conversation, sender: UserId, text: &str) -> ChatMessage {
        ChatMessage::new_outbound(
            MessageId::random(),
            conversation.conversation_id.clone(),
            sender,
            Vec::new(),
            MessageContent::text(text),
            Channel::Internal,
        )
    }

    #[tokio::test]
    async fn put_message_is_unique() -> anyhow::Result<()> {
        let store = MemoryMessageStore::new();
        let users = [UserId::random(), UserId::random()];
        let conversation = conversation_with(&users);
        store.create_conversation(&conversation).await?;
        let message = outbound(&conversation, users[0], "hello");
        store.put_message(&message).await?;
        let result = store.put_message(&message).await;
        assert!(matches!(result, Err(MessageStoreError::Duplicate)));
        // History was initialised exactly once.
        let history = store.get_status_history(&message.message_id).await?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MessageStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn status_appends_are_monotone() -> anyhow::Result<()> {
        let store = MemoryMessageStore::new();
        let users = [UserId::random(), UserId::random()];
        let conversation = conversation_with(&users);
        store.create_conversation(&conversation).await?;
        let message = outbound(&conversation, users[0], "hello");
        store.put_message(&message).await?;

        store
            .append_status(&message.message_id, StatusTransition::now(MessageStatus::Sent))
            .await?;
        store
            .append_status(
                &message.message_id,
                StatusTransition::now(MessageStatus::Delivered),
            )
            .await?;
        // Replayed SENT is rejected and leaves no trace.
        let result = store
            .append_status(&message.message_id, StatusTransition::now(MessageStatus::Sent))
            .await;
        assert!(matches!(
            result,
            Err(MessageStoreError::InvalidTransition { .. })
        ));
        let history = store.get_status_history(&message.message_id).await?;
        let statuses: Vec<_> = history.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                MessageStatus::Pending,
                MessageStatus::Sent,
                MessageStatus::Delivered
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn history_is_filtered_by_join_windows() -> anyhow::Result<()> {
        let store = MemoryMessageStore::new();
        let admin = UserId::random();
        let u1 = UserId::random();
        let u2 = UserId::random();
        let conversation = Conversation::new(
            ConversationId::random(),
            ConversationType::Group,
            [admin, u1],
        );
        store.create_conversation(&conversation).await?;

        let pre = outbound(&conversation, admin, "before u2");
        store.put_message(&pre).await?;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .modify_participants(&conversation.conversation_id, &[u2], &[])
            .await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let post = outbound(&conversation, admin, "after u2");
        store.put_message(&post).await?;

        let admin_page = store
            .list_messages(&conversation.conversation_id, &admin, None, 10)
            .await?;
        let admin_ids: Vec<_> = admin_page.messages.iter().map(|m| m.message_id).collect();
        assert!(admin_ids.contains(&pre.message_id));
        assert!(admin_ids.contains(&post.message_id));

        let u2_page = store
            .list_messages(&conversation.conversation_id, &u2, None, 10)
            .await?;
        let u2_ids: Vec<_> = u2_page.messages.iter().map(|m| m.message_id).collect();
        assert!(!u2_ids.contains(&pre.message_id));
        assert!(u2_ids.contains(&post.message_id));
        // The join event's system message is visible to the newcomer.
        assert!(
            u2_page
                .messages
                .iter()
                .any(|m| m.kind == couriercommon::messages::MessageKind::System)
        );
        Ok(())
    }

    #[tokio::test]
    async fn pagination_cursor_round_trips() -> anyhow::Result<()> {
        let store = MemoryMessageStore::new();
        let users = [UserId::random(), UserId::random()];
        let conversation = conversation_with(&users);
        store.create_conversation(&conversation).await?;
        for i in 0..5 {
            let message = outbound(&conversation, users[0], &format!("m{i}"));
            store.put_message(&message).await?;
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        let first = store
            .list_messages(&conversation.conversation_id, &users[1], None, 2)
            .await?;
        assert_eq!(first.messages.len(), 2);
        let cursor = first.next_cursor.expect("expected a cursor");
        // The cursor survives its opaque string form.
        let cursor = Cursor::decode(&cursor.encode())?;
        let second = store
            .list_messages(&conversation.conversation_id, &users[1], Some(cursor), 10)
            .await?;
        assert_eq!(second.messages.len(), 3);
        // Newest first, no overlap between pages.
        for m in &second.messages {
            assert!(first.messages.iter().all(|f| f.message_id != m.message_id));
        }
        Ok(())
    }

    #[tokio::test]
    async fn attachment_refs_only_attach_to_pending_messages() -> anyhow::Result<()> {
        let store = MemoryMessageStore::new();
        let users = [UserId::random(), UserId::random()];
        let conversation = conversation_with(&users);
        store.create_conversation(&conversation).await?;
        let message = outbound(&conversation, users[0], "with file");
        store.put_message(&message).await?;
        store
            .put_attachment_ref(&message.message_id, AttachmentId::random())
            .await?;
        store
            .append_status(&message.message_id, StatusTransition::now(MessageStatus::Sent))
            .await?;
        let result = store
            .put_attachment_ref(&message.message_id, AttachmentId::random())
            .await;
        assert!(matches!(result, Err(MessageStoreError::InvalidState(_))));
        Ok(())
    }

    #[tokio::test]
    async fn removing_below_group_floor_is_rejected() -> anyhow::Result<()> {
        let store = MemoryMessageStore::new();
        let users = [UserId::random(), UserId::random()];
        let conversation = Conversation::new(
            ConversationId::random(),
            ConversationType::Group,
            users.iter().copied(),
        );
        store.create_conversation(&conversation).await?;
        let result = store
            .modify_participants(&conversation.conversation_id, &[], &[users[0]])
            .await;
        assert!(matches!(
            result,
            Err(MessageStoreError::InvalidParticipants(_))
        ));
        Ok(())
    }
}
