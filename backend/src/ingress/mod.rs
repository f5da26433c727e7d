// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Ingress: validates and accepts new messages, writes them to the store
//! and hands them to the event log.
//!
//! Acceptance is idempotent: the store's unique message id is the authority,
//! the idempotency cache only short-circuits the common replay. A publish
//! failure after a successful store write is retried with backoff; the
//! message stays PENDING and is never silently lost.

use std::sync::Arc;

use couriercommon::{
    codec::CourierCodec,
    identifiers::{ConversationId, MessageId, RecipientRef, UserId},
    messages::{
        ChatMessage, Conversation, ConversationType, ErrorKind, InboundMessage, MessageContent,
        SendReceipt, SendRequest, events::ChatEvent,
    },
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    event_log::{CHAT_EVENTS, EventLog, EventLogError},
    files::{FileService, FileServiceError},
    idempotency::IdempotencyStore,
    identity_service::IdentityStoreError,
    message_store::{MessageStore, MessageStoreError},
    settings::IngressSettings,
};

mod webhook;

pub use webhook::{WebhookError, WebhookIntake, WebhookReceipt};

#[derive(Debug, Error)]
pub enum IngressError {
    /// Bad input; surfaced synchronously, never produces a message.
    #[error("Validation failed: {0}")]
    Validation(String),
    /// The referenced conversation or resource is absent.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Event-log publication failed after the retry budget; the message is
    /// stored PENDING and the request may be replayed.
    #[error("Event log publication failed: {0}")]
    Publish(#[source] EventLogError),
    #[error(transparent)]
    Store(MessageStoreError),
    #[error(transparent)]
    Identity(#[from] IdentityStoreError),
    #[error(transparent)]
    Files(#[from] FileServiceError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IngressError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngressError::Validation(_) => ErrorKind::Validation,
            IngressError::NotFound(_) => ErrorKind::NotFound,
            IngressError::Publish(_) => ErrorKind::Transient,
            IngressError::Store(_) | IngressError::Identity(_) | IngressError::Files(_) => {
                ErrorKind::Transient
            }
            IngressError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<MessageStoreError> for IngressError {
    fn from(e: MessageStoreError) -> Self {
        match e {
            MessageStoreError::NotFound => IngressError::NotFound("conversation".into()),
            other => IngressError::Store(other),
        }
    }
}

#[derive(Clone)]
pub struct Ingress {
    store: Arc<dyn MessageStore>,
    log: Arc<dyn EventLog>,
    idempotency: Arc<dyn IdempotencyStore>,
    files: FileService,
    settings: IngressSettings,
}

impl Ingress {
    pub fn new(
        store: Arc<dyn MessageStore>,
        log: Arc<dyn EventLog>,
        idempotency: Arc<dyn IdempotencyStore>,
        files: FileService,
        settings: IngressSettings,
    ) -> Self {
        Self {
            store,
            log,
            idempotency,
            files,
            settings,
        }
    }

    /// Accepts a new outbound message. Returns the receipt of the stored
    /// message; replays return the existing state.
    pub async fn accept(&self, request: SendRequest) -> Result<SendReceipt, IngressError> {
        self.validate(&request).await?;

        let conversation = self
            .store
            .get_conversation(&request.conversation_id)
            .await?
            .ok_or_else(|| IngressError::NotFound("conversation".into()))?;
        if conversation.conversation_type == ConversationType::Group
            && !conversation.is_active_participant(&request.sender_id, chrono::Utc::now())
        {
            return Err(IngressError::Validation(
                "sender is not a current participant of the conversation".into(),
            ));
        }

        let message_id = request.message_id.unwrap_or_else(MessageId::random);

        // Advisory fast path for replays; the store stays authoritative.
        if self.cache_seen(&message_id).await
            && let Some(existing) = self.store.get_message(&message_id).await?
        {
            debug!(%message_id, "idempotent replay served from cache");
            return Ok(SendReceipt {
                message_id,
                status: existing.status,
            });
        }

        let recipients = if request.recipients.is_empty() {
            derive_recipients(&conversation, &request.sender_id)
        } else {
            request.recipients.clone()
        };

        let message = ChatMessage::new_outbound(
            message_id,
            request.conversation_id.clone(),
            request.sender_id,
            recipients,
            request.content.clone(),
            request.channel,
        );

        self.store_and_publish(message).await
    }

    /// Accepts a message handed in by a platform webhook. The sender is
    /// already resolved; outbound-only validation does not apply. Unmapped
    /// conversations are opened against the configured inbound inbox.
    pub async fn accept_inbound(
        &self,
        inbound: InboundMessage,
        sender_id: UserId,
    ) -> Result<SendReceipt, IngressError> {
        let conversation_id = ConversationId::new(format!(
            "{}:{}",
            inbound.origin.platform, inbound.platform_chat_id
        ));
        let conversation = match self.store.get_conversation(&conversation_id).await? {
            Some(conversation) => conversation,
            None => {
                let Some(inbox) = self.settings.inbound_inbox else {
                    return Err(IngressError::NotFound(format!(
                        "no conversation mapped for {conversation_id} and no inbound inbox configured"
                    )));
                };
                let conversation = Conversation::new(
                    conversation_id.clone(),
                    ConversationType::OneToOne,
                    [sender_id, inbox],
                );
                match self.store.create_conversation(&conversation).await {
                    Ok(()) => {
                        info!(%conversation_id, "opened conversation for first inbound contact");
                        conversation
                    }
                    // A concurrent webhook already opened it.
                    Err(MessageStoreError::Duplicate) => self
                        .store
                        .get_conversation(&conversation_id)
                        .await?
                        .ok_or_else(|| {
                            IngressError::Internal("conversation vanished after create".into())
                        })?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let message_id =
            MessageId::from_platform(inbound.origin.platform, &inbound.platform_message_id);
        if self.cache_seen(&message_id).await
            && let Some(existing) = self.store.get_message(&message_id).await?
        {
            debug!(%message_id, "duplicate webhook delivery dropped");
            return Ok(SendReceipt {
                message_id,
                status: existing.status,
            });
        }

        let recipients = derive_recipients(&conversation, &sender_id);
        let content = clamp_content(inbound.content, self.settings.max_text_len);
        let message = ChatMessage::new_inbound(
            message_id,
            conversation_id,
            sender_id,
            recipients,
            content,
            inbound.origin,
            inbound.platform_message_id,
        );

        self.store_and_publish(message).await
    }

    async fn validate(&self, request: &SendRequest) -> Result<(), IngressError> {
        if request.content.is_empty() {
            return Err(IngressError::Validation(
                "a message needs text or attachments".into(),
            ));
        }
        if let Some(text) = &request.content.text {
            let units = text.chars().count();
            if units > self.settings.max_text_len {
                return Err(IngressError::Validation(format!(
                    "text exceeds {} units ({units})",
                    self.settings.max_text_len
                )));
            }
        }
        if request.content.attachments.len() > self.settings.max_file_refs {
            return Err(IngressError::Validation(format!(
                "at most {} file references are allowed",
                self.settings.max_file_refs
            )));
        }
        for file_id in &request.content.attachments {
            match self.files.get(file_id).await? {
                None => {
                    return Err(IngressError::Validation(format!(
                        "file {file_id} does not exist"
                    )));
                }
                Some(record) if !record.is_referenceable(chrono::Utc::now()) => {
                    return Err(IngressError::Validation(format!(
                        "file {file_id} is not available (verdict {})",
                        record.verdict.as_str()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn store_and_publish(
        &self,
        message: ChatMessage,
    ) -> Result<SendReceipt, IngressError> {
        let message_id = message.message_id;
        match self.store.put_message(&message).await {
            Ok(()) => {}
            Err(MessageStoreError::Duplicate) => {
                let existing = self
                    .store
                    .get_message(&message_id)
                    .await?
                    .ok_or_else(|| IngressError::Internal("message vanished".into()))?;
                debug!(%message_id, "idempotent replay detected by the store");
                return Ok(SendReceipt {
                    message_id,
                    status: existing.status,
                });
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(error) = self.idempotency.observe(&message_id).await {
            debug!(%error, %message_id, "idempotency marker write failed; continuing");
        }

        self.publish_with_retry(&message).await?;

        info!(
            %message_id,
            conversation_id = %message.conversation_id,
            channel = %message.channel,
            "message accepted"
        );
        Ok(SendReceipt {
            message_id,
            status: message.status,
        })
    }

    /// Publishes the accepted message to chat-events. The key is the
    /// conversation id, so the write is partition-stable; replays after a
    /// mid-flight failure are deduplicated by consumers.
    async fn publish_with_retry(&self, message: &ChatMessage) -> Result<(), IngressError> {
        let payload = CourierCodec::to_vec(&ChatEvent {
            message: message.clone(),
        })
        .map_err(|e| IngressError::Internal(format!("event encoding failed: {e}")))?;
        let key = message.conversation_id.to_string();

        let mut delay = std::time::Duration::from_millis(self.settings.publish_backoff_ms);
        let mut last_error = None;
        for attempt in 1..=self.settings.publish_max_attempts {
            match self.log.publish(CHAT_EVENTS, &key, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(%error, attempt, "chat-events publish failed; retrying");
                    last_error = Some(error);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(IngressError::Publish(last_error.unwrap_or(
            EventLogError::UnknownStream(CHAT_EVENTS.to_owned()),
        )))
    }

    async fn cache_seen(&self, message_id: &MessageId) -> bool {
        match self.idempotency.seen(message_id).await {
            Ok(seen) => seen,
            Err(error) => {
                debug!(%error, %message_id, "idempotency read failed; continuing");
                false
            }
        }
    }
}

/// Recipient set at send time: everyone with an open join window, minus the
/// sender.
fn derive_recipients(conversation: &Conversation, sender_id: &UserId) -> Vec<RecipientRef> {
    conversation
        .active_participants_at(chrono::Utc::now())
        .into_iter()
        .filter(|user_id| user_id != sender_id)
        .map(RecipientRef::User)
        .collect()
}

/// Inbound text was already accepted by the platform; clamp instead of
/// rejecting.
fn clamp_content(mut content: MessageContent, max_text_len: usize) -> MessageContent {
    if let Some(text) = &content.text
        && text.chars().count() > max_text_len
    {
        content.text = Some(text.chars().take(max_text_len).collect());
    }
    content
}

#[cfg(test)]
mod tests {
    use couriercommon::identifiers::{Channel, Platform};

    use crate::{
        event_log::memory::MemoryEventLog, files::MemoryFileStore,
        idempotency::MemoryIdempotencyStore, message_store::memory::MemoryMessageStore,
    };

    use super::*;

    struct Fixture {
        ingress: Ingress,
        store: Arc<MemoryMessageStore>,
        log: Arc<MemoryEventLog>,
        files: MemoryFileStore,
        conversation: Conversation,
        sender: UserId,
        peer: UserId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryMessageStore::new());
        let log = Arc::new(MemoryEventLog::new(4));
        let files = MemoryFileStore::new();
        let sender = UserId::random();
        let peer = UserId::random();
        let conversation = Conversation::new(
            ConversationId::random(),
            ConversationType::OneToOne,
            [sender, peer],
        );
        store.create_conversation(&conversation).await.unwrap();
        let ingress = Ingress::new(
            store.clone(),
            log.clone(),
            Arc::new(MemoryIdempotencyStore::default()),
            FileService::new(Arc::new(files.clone()), None),
            IngressSettings::default(),
        );
        Fixture {
            ingress,
            store,
            log,
            files,
            conversation,
            sender,
            peer,
        }
    }

    fn request(fixture: &Fixture, text: &str) -> SendRequest {
        SendRequest {
            conversation_id: fixture.conversation.conversation_id.clone(),
            sender_id: fixture.sender,
            content: MessageContent::text(text),
            channel: Channel::Internal,
            message_id: None,
            recipients: Vec::new(),
        }
    }

    #[tokio::test]
    async fn accept_stores_and_publishes() -> anyhow::Result<()> {
        let fixture = fixture().await;
        let receipt = fixture.ingress.accept(request(&fixture, "hello")).await?;
        assert_eq!(
            receipt.status,
            couriercommon::messages::MessageStatus::Pending
        );
        let stored = fixture
            .store
            .get_message(&receipt.message_id)
            .await?
            .expect("message stored");
        assert_eq!(stored.recipients, vec![RecipientRef::User(fixture.peer)]);
        assert_eq!(fixture.log.stream_len(CHAT_EVENTS), 1);
        Ok(())
    }

    #[tokio::test]
    async fn replay_returns_the_same_receipt_without_a_second_record() -> anyhow::Result<()> {
        let fixture = fixture().await;
        let mut request = request(&fixture, "hello");
        request.message_id = Some(MessageId::random());
        let first = fixture.ingress.accept(request.clone()).await?;
        let second = fixture.ingress.accept(request).await?;
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(fixture.log.stream_len(CHAT_EVENTS), 1);
        Ok(())
    }

    #[tokio::test]
    async fn text_boundary_is_exact() -> anyhow::Result<()> {
        let fixture = fixture().await;
        let at_cap = "x".repeat(10_000);
        assert!(fixture.ingress.accept(request(&fixture, &at_cap)).await.is_ok());
        let over_cap = "x".repeat(10_001);
        let result = fixture.ingress.accept(request(&fixture, &over_cap)).await;
        assert!(matches!(result, Err(IngressError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn validation_failures_produce_no_message() -> anyhow::Result<()> {
        let fixture = fixture().await;
        let mut bad = request(&fixture, "");
        bad.message_id = Some(MessageId::random());
        let result = fixture.ingress.accept(bad.clone()).await;
        assert!(matches!(result, Err(IngressError::Validation(_))));
        assert!(
            fixture
                .store
                .get_message(&bad.message_id.unwrap())
                .await?
                .is_none()
        );
        assert_eq!(fixture.log.stream_len(CHAT_EVENTS), 0);
        Ok(())
    }

    #[tokio::test]
    async fn files_must_be_clean_to_reference() -> anyhow::Result<()> {
        let fixture = fixture().await;
        let clean = fixture.files.insert_clean("a.pdf", 10, "application/pdf");
        let mut ok = request(&fixture, "with file");
        ok.content.attachments.push(clean);
        assert!(fixture.ingress.accept(ok).await.is_ok());

        let mut missing = request(&fixture, "with file");
        missing.content.attachments.push(
            couriercommon::identifiers::AttachmentId::random(),
        );
        assert!(matches!(
            fixture.ingress.accept(missing).await,
            Err(IngressError::Validation(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() -> anyhow::Result<()> {
        let fixture = fixture().await;
        let mut request = request(&fixture, "hello");
        request.conversation_id = ConversationId::new("missing");
        assert!(matches!(
            fixture.ingress.accept(request).await,
            Err(IngressError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn inbound_opens_a_conversation_against_the_inbox() -> anyhow::Result<()> {
        let store = Arc::new(MemoryMessageStore::new());
        let log = Arc::new(MemoryEventLog::new(4));
        let inbox = UserId::random();
        let customer = UserId::random();
        let ingress = Ingress::new(
            store.clone(),
            log.clone(),
            Arc::new(MemoryIdempotencyStore::default()),
            FileService::new(Arc::new(MemoryFileStore::new()), None),
            IngressSettings {
                inbound_inbox: Some(inbox),
                ..Default::default()
            },
        );
        let inbound = InboundMessage {
            origin: couriercommon::identifiers::PlatformAddress::new(
                Platform::WhatsApp,
                "+5562999999999",
            ),
            platform_chat_id: "+5562999999999".into(),
            platform_message_id: "wamid.1".into(),
            content: MessageContent::text("Oi"),
            timestamp: chrono::Utc::now(),
        };
        let receipt = ingress.accept_inbound(inbound.clone(), customer).await?;
        let message = store.get_message(&receipt.message_id).await?.unwrap();
        assert_eq!(message.channel, Channel::Internal);
        assert_eq!(message.recipients, vec![RecipientRef::User(inbox)]);
        assert!(message.origin.is_some());

        // Webhook redelivery maps to the same message id and is dropped.
        let replay = ingress.accept_inbound(inbound, customer).await?;
        assert_eq!(replay.message_id, receipt.message_id);
        assert_eq!(log.stream_len(CHAT_EVENTS), 1);
        Ok(())
    }
}
