// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Status propagator: consumes status-updates, applies transitions to the
//! store and forwards them to live subscribers.
//!
//! Appends are monotone; a transition the router already recorded is a
//! no-op here, but it is still forwarded so subscribers see every
//! transition in partition order.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use couriercommon::{
    codec::CourierCodec,
    messages::{LiveEvent, events::StatusEvent},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    event_log::{
        EventLog, HandlerOutcome, LogRecord, RecordHandler, STATUS_UPDATES,
        spawn_partition_workers,
    },
    live::SharedLiveHub,
    message_store::{MessageStore, MessageStoreError},
};

pub const STATUS_PROPAGATOR_GROUP: &str = "status-propagator";

pub struct StatusPropagator {
    store: Arc<dyn MessageStore>,
    log: Arc<dyn EventLog>,
    live: SharedLiveHub,
}

impl StatusPropagator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        log: Arc<dyn EventLog>,
        live: SharedLiveHub,
    ) -> Self {
        Self { store, log, live }
    }

    pub fn spawn(
        self: Arc<Self>,
        fetch_wait: Duration,
        lease: Duration,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        spawn_partition_workers(
            self.log.clone(),
            STATUS_UPDATES,
            STATUS_PROPAGATOR_GROUP,
            self,
            fetch_wait,
            lease,
            shutdown,
        )
    }

    async fn apply(&self, event: StatusEvent) -> Result<(), MessageStoreError> {
        match self
            .store
            .append_status(&event.message_id, event.transition.clone())
            .await
        {
            Ok(()) => {}
            // The router records its own terminal transition before
            // publishing; replays and duplicates are no-ops.
            Err(MessageStoreError::InvalidTransition { from, to }) => {
                debug!(%from, %to, message_id = %event.message_id, "duplicate transition; no-op");
            }
            Err(MessageStoreError::NotFound) => {
                warn!(message_id = %event.message_id, "status update for unknown message");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        // Every transition reaches currently subscribed participants, in the
        // same per-conversation order as the log.
        let Some(conversation) = self.store.get_conversation(&event.conversation_id).await?
        else {
            return Ok(());
        };
        let live_event = LiveEvent::Status {
            message_id: event.message_id,
            conversation_id: event.conversation_id.clone(),
            transition: event.transition,
        };
        for user_id in conversation.active_participants_at(chrono::Utc::now()) {
            self.live.notify(&user_id, live_event.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RecordHandler for StatusPropagator {
    async fn handle(&self, record: &LogRecord) -> HandlerOutcome {
        let event: StatusEvent = match CourierCodec::from_slice(&record.payload) {
            Ok(event) => event,
            Err(error) => {
                error!(%error, offset = record.offset, "undecodable status event; skipping");
                return HandlerOutcome::Commit;
            }
        };
        match self.apply(event).await {
            Ok(()) => HandlerOutcome::Commit,
            Err(error) => {
                error!(%error, offset = record.offset, "status apply failed; will refetch");
                HandlerOutcome::Retry
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use couriercommon::{
        identifiers::{Channel, ConversationId, MessageId, UserId},
        messages::{
            ChatMessage, Conversation, ConversationType, MessageContent, MessageStatus,
            StatusTransition,
        },
    };

    use crate::{event_log::memory::MemoryEventLog, live::LiveHub, message_store::memory::MemoryMessageStore};

    use super::*;

    async fn fixture() -> (StatusPropagator, Arc<MemoryMessageStore>, SharedLiveHub, ChatMessage, UserId) {
        let store = Arc::new(MemoryMessageStore::new());
        let live: SharedLiveHub = Arc::new(LiveHub::new());
        let sender = UserId::random();
        let peer = UserId::random();
        let conversation = Conversation::new(
            ConversationId::new("c"),
            ConversationType::OneToOne,
            [sender, peer],
        );
        store.create_conversation(&conversation).await.unwrap();
        let message = ChatMessage::new_outbound(
            MessageId::random(),
            conversation.conversation_id.clone(),
            sender,
            Vec::new(),
            MessageContent::text("hi"),
            Channel::Internal,
        );
        store.put_message(&message).await.unwrap();
        let propagator = StatusPropagator::new(
            store.clone(),
            Arc::new(MemoryEventLog::new(1)),
            live.clone(),
        );
        (propagator, store, live, message, peer)
    }

    fn event(message: &ChatMessage, status: MessageStatus) -> StatusEvent {
        StatusEvent {
            message_id: message.message_id,
            conversation_id: message.conversation_id.clone(),
            transition: StatusTransition::now(status),
        }
    }

    #[tokio::test]
    async fn transitions_are_applied_and_forwarded() -> anyhow::Result<()> {
        let (propagator, store, live, message, peer) = fixture().await;
        let mut rx = live.subscribe(peer);
        propagator.apply(event(&message, MessageStatus::Sent)).await?;
        let stored = store.get_message(&message.message_id).await?.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(matches!(
            rx.try_recv(),
            Ok(LiveEvent::Status {
                transition: StatusTransition {
                    status: MessageStatus::Sent,
                    ..
                },
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_transitions_are_noops_but_still_forwarded() -> anyhow::Result<()> {
        let (propagator, store, live, message, peer) = fixture().await;
        store
            .append_status(&message.message_id, StatusTransition::now(MessageStatus::Sent))
            .await?;
        let mut rx = live.subscribe(peer);
        propagator.apply(event(&message, MessageStatus::Sent)).await?;
        // No second SENT entry in the history.
        let history = store.get_status_history(&message.message_id).await?;
        assert_eq!(
            history.iter().filter(|t| t.status == MessageStatus::Sent).count(),
            1
        );
        // The subscriber still saw the transition.
        assert!(rx.try_recv().is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_messages_are_skipped() -> anyhow::Result<()> {
        let (propagator, _store, _live, message, _peer) = fixture().await;
        let mut unknown = event(&message, MessageStatus::Sent);
        unknown.message_id = MessageId::random();
        // Not an error; the record is committed and forgotten.
        propagator.apply(unknown).await?;
        Ok(())
    }
}
