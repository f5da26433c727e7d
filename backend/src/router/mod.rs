// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The router: consumes chat-events, resolves recipients, fans out to the
//! platform connectors and records the terminal outcome.
//!
//! One worker task owns one partition at a time, which keeps processing
//! strictly sequential per conversation. Within a message, per-recipient
//! dispatches run concurrently; the offset is committed only after the
//! terminal outcome is durable, so crashes replay and deduplicate.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use couriercommon::{
    codec::CourierCodec,
    identifiers::{Channel, PlatformAddress, RecipientRef, UserId},
    messages::{
        ChatMessage, ErrorKind, LiveEvent, MessageKind, MessageStatus, RecipientOutcome,
        StatusTransition,
        events::{ChatEvent, DeadLetter, StatusEvent},
    },
};
use futures_util::future::join_all;
use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    connector::ConnectorRegistry,
    event_log::{
        CHAT_EVENTS, CHAT_EVENTS_DLQ, EventLog, EventLogError, HandlerOutcome, LogRecord,
        RecordHandler, STATUS_UPDATES, spawn_partition_workers,
    },
    identity_service::{IdentityStore, IdentityStoreError},
    live::SharedLiveHub,
    message_store::{MessageStore, MessageStoreError},
    settings::RouterSettings,
};

pub const ROUTER_GROUP: &str = "router";

#[derive(Debug, Error)]
enum ProcessError {
    #[error(transparent)]
    Store(#[from] MessageStoreError),
    #[error(transparent)]
    Identity(#[from] IdentityStoreError),
    #[error(transparent)]
    Log(#[from] EventLogError),
}

pub struct Router {
    store: Arc<dyn MessageStore>,
    identity: Arc<dyn IdentityStore>,
    log: Arc<dyn EventLog>,
    registry: Arc<ConnectorRegistry>,
    live: SharedLiveHub,
    settings: RouterSettings,
}

impl Router {
    pub fn new(
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityStore>,
        log: Arc<dyn EventLog>,
        registry: Arc<ConnectorRegistry>,
        live: SharedLiveHub,
        settings: RouterSettings,
    ) -> Self {
        Self {
            store,
            identity,
            log,
            registry,
            live,
            settings,
        }
    }

    /// Spawns the chat-events partition workers.
    pub fn spawn(
        self: Arc<Self>,
        fetch_wait: Duration,
        lease: Duration,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        spawn_partition_workers(
            self.log.clone(),
            CHAT_EVENTS,
            ROUTER_GROUP,
            self,
            fetch_wait,
            lease,
            shutdown,
        )
    }

    #[instrument(skip_all, fields(message_id = %message.message_id, conversation_id = %message.conversation_id))]
    async fn process(&self, message: ChatMessage) -> Result<(), ProcessError> {
        // The store is the dedup authority: replays of anything past PENDING
        // are skipped without side effects.
        let Some(stored) = self.store.get_message(&message.message_id).await? else {
            warn!("chat event for unknown message; skipping");
            return Ok(());
        };
        if stored.kind == MessageKind::System {
            return Ok(());
        }
        if stored.status != MessageStatus::Pending {
            debug!(status = %stored.status, "replay of a settled message; skipping");
            return Ok(());
        }

        let resolution = self.resolve(&stored).await?;
        let mut outcomes = resolution.unresolvable;

        // Live push for every resolved internal user, regardless of their
        // external bindings. Senders do not receive their own messages.
        for target in &resolution.internal {
            let delivered = if target.user_id == stored.sender_id {
                false
            } else {
                self.live.notify(
                    &target.user_id,
                    LiveEvent::Message {
                        message: stored.clone(),
                    },
                )
            };
            // Internal delivery is an outcome of its own only when the store
            // is the recipient's sole channel.
            if stored.channel == Channel::Internal && !target.has_external_bindings {
                outcomes.push(RecipientOutcome {
                    recipient: target.user_id.to_string(),
                    status: if delivered {
                        MessageStatus::Delivered
                    } else {
                        MessageStatus::Sent
                    },
                    platform_message_id: None,
                    error_kind: None,
                    reason: None,
                    attempts: 1,
                });
            }
        }

        let dispatches = resolution
            .targets
            .iter()
            .map(|recipient| self.dispatch_with_retry(&stored, recipient));
        outcomes.extend(join_all(dispatches).await);

        let terminal = aggregate(&outcomes);
        let (error_kind, reason) = failure_summary(terminal, &outcomes);

        if terminal == MessageStatus::Failed {
            self.publish_dead_letter(&stored, error_kind, reason.as_deref())
                .await?;
        }

        self.store
            .record_outcomes(&stored.message_id, &outcomes, error_kind)
            .await?;

        // A connector may acknowledge delivery synchronously; the state
        // machine still walks through SENT.
        let transitions = match terminal {
            MessageStatus::Delivered => vec![MessageStatus::Sent, MessageStatus::Delivered],
            other => vec![other],
        };
        for status in transitions {
            let transition = StatusTransition {
                status,
                timestamp: chrono::Utc::now(),
                reason: reason.clone(),
            };
            match self
                .store
                .append_status(&stored.message_id, transition.clone())
                .await
            {
                Ok(()) => {}
                Err(MessageStoreError::InvalidTransition { from, to }) => {
                    debug!(%from, %to, "transition already applied; no-op");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            self.publish_status_event(&stored, transition).await;
        }

        info!(status = %terminal, recipients = outcomes.len(), "message routed");
        Ok(())
    }

    /// Expands the recipient set into dispatch targets.
    async fn resolve(&self, message: &ChatMessage) -> Result<Resolution, ProcessError> {
        let mut resolution = Resolution::default();
        let restriction = message.channel.platform();
        for recipient in &message.recipients {
            match recipient {
                RecipientRef::User(user_id) => {
                    let exists = self.identity.get_user(user_id).await?.is_some();
                    let bindings = self.identity.get_identities(user_id).await?;
                    let addresses: Vec<PlatformAddress> = bindings
                        .into_iter()
                        .map(|identity| identity.address)
                        .filter(|address| {
                            restriction.is_none_or(|platform| address.platform == platform)
                        })
                        .collect();
                    if !exists {
                        resolution.unresolvable.push(RecipientOutcome {
                            recipient: user_id.to_string(),
                            status: MessageStatus::Failed,
                            platform_message_id: None,
                            error_kind: Some(ErrorKind::NotFound),
                            reason: Some("unknown user".into()),
                            attempts: 0,
                        });
                        continue;
                    }
                    if addresses.is_empty() && message.channel != Channel::Internal {
                        resolution.unresolvable.push(RecipientOutcome {
                            recipient: user_id.to_string(),
                            status: MessageStatus::Failed,
                            platform_message_id: None,
                            error_kind: Some(ErrorKind::NotFound),
                            reason: Some(format!(
                                "no {} identity for this user",
                                message.channel
                            )),
                            attempts: 0,
                        });
                    }
                    resolution.internal.push(InternalTarget {
                        user_id: *user_id,
                        has_external_bindings: !addresses.is_empty(),
                    });
                    resolution.targets.extend(addresses);
                }
                // Literal platform handles pass through unchanged.
                RecipientRef::Address(address) => {
                    resolution.targets.push(address.clone());
                }
            }
        }
        Ok(resolution)
    }

    /// One recipient's dispatch with the retry budget: exponential backoff,
    /// jittered, capped; retries stay inside this partition's processing.
    async fn dispatch_with_retry(
        &self,
        message: &ChatMessage,
        recipient: &PlatformAddress,
    ) -> RecipientOutcome {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut delay = Duration::from_millis(self.settings.backoff_base_ms);
        let cap = Duration::from_millis(self.settings.backoff_cap_ms);
        let dispatch_timeout = Duration::from_millis(self.settings.dispatch_timeout_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                dispatch_timeout,
                self.registry.dispatch(message, recipient),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(crate::connector::DeliveryError::transient(
                    "dispatch deadline exceeded",
                )),
            };
            match result {
                Ok(outcome) => {
                    return RecipientOutcome {
                        recipient: recipient.to_string(),
                        status: outcome.status.into(),
                        platform_message_id: outcome.platform_message_id,
                        error_kind: None,
                        reason: None,
                        attempts: attempt,
                    };
                }
                Err(error) if error.is_retriable() && attempt < max_attempts => {
                    let pause = jittered(delay, self.settings.jitter);
                    debug!(
                        %error,
                        recipient = %recipient,
                        attempt,
                        pause_ms = pause.as_millis() as u64,
                        "transient dispatch failure; backing off"
                    );
                    tokio::time::sleep(pause).await;
                    delay = (delay * 2).min(cap);
                }
                Err(error) => {
                    return RecipientOutcome {
                        recipient: recipient.to_string(),
                        status: MessageStatus::Failed,
                        platform_message_id: None,
                        error_kind: Some(error.kind),
                        reason: Some(error.reason),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    async fn publish_dead_letter(
        &self,
        message: &ChatMessage,
        error_kind: Option<ErrorKind>,
        reason: Option<&str>,
    ) -> Result<(), ProcessError> {
        let dead_letter = DeadLetter {
            message: message.clone(),
            error_kind: error_kind.unwrap_or(ErrorKind::Internal),
            reason: reason.unwrap_or("all recipients failed").to_owned(),
        };
        let payload = CourierCodec::to_vec(&dead_letter)
            .map_err(|e| MessageStoreError::Storage(e.into()))?;
        self.log
            .publish(
                CHAT_EVENTS_DLQ,
                message.conversation_id.as_str(),
                payload,
            )
            .await?;
        warn!("message dead-lettered");
        Ok(())
    }

    /// Status events feed the propagator and live subscribers; the store
    /// already holds the authoritative history, so a lost event degrades
    /// only liveness.
    async fn publish_status_event(&self, message: &ChatMessage, transition: StatusTransition) {
        let event = StatusEvent {
            message_id: message.message_id,
            conversation_id: message.conversation_id.clone(),
            transition,
        };
        let payload = match CourierCodec::to_vec(&event) {
            Ok(payload) => payload,
            Err(error) => {
                error!(%error, "status event encoding failed");
                return;
            }
        };
        if let Err(error) = self
            .log
            .publish(STATUS_UPDATES, message.conversation_id.as_str(), payload)
            .await
        {
            warn!(%error, "status event publish failed");
        }
    }
}

#[async_trait]
impl RecordHandler for Router {
    async fn handle(&self, record: &LogRecord) -> HandlerOutcome {
        let event: ChatEvent = match CourierCodec::from_slice(&record.payload) {
            Ok(event) => event,
            Err(error) => {
                error!(%error, offset = record.offset, "undecodable chat event; skipping");
                return HandlerOutcome::Commit;
            }
        };
        match self.process(event.message).await {
            Ok(()) => HandlerOutcome::Commit,
            Err(error) => {
                error!(%error, offset = record.offset, "processing failed; will refetch");
                HandlerOutcome::Retry
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InternalTarget {
    user_id: UserId,
    has_external_bindings: bool,
}

#[derive(Debug, Default)]
struct Resolution {
    targets: Vec<PlatformAddress>,
    internal: Vec<InternalTarget>,
    unresolvable: Vec<RecipientOutcome>,
}

/// The message is DELIVERED the moment any recipient got it; FAILED only if
/// every recipient terminally failed.
fn aggregate(outcomes: &[RecipientOutcome]) -> MessageStatus {
    if outcomes
        .iter()
        .any(|o| o.status == MessageStatus::Delivered)
    {
        MessageStatus::Delivered
    } else if outcomes.iter().any(|o| o.status == MessageStatus::Sent) {
        MessageStatus::Sent
    } else {
        MessageStatus::Failed
    }
}

fn failure_summary(
    terminal: MessageStatus,
    outcomes: &[RecipientOutcome],
) -> (Option<ErrorKind>, Option<String>) {
    if terminal != MessageStatus::Failed {
        return (None, None);
    }
    match outcomes.iter().find(|o| o.error_kind.is_some()) {
        Some(outcome) => (outcome.error_kind, outcome.reason.clone()),
        None => (
            Some(ErrorKind::NotFound),
            Some("no deliverable recipients".into()),
        ),
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use couriercommon::{
        identifiers::{ConversationId, MessageId, Platform},
        messages::{Conversation, ConversationType, MessageContent},
    };

    use crate::{
        connector::{
            CircuitBreakerConfig, DeliveryError, DeliveryStatus, DispatchOutcome,
            RateLimitConfig, test_support::ScriptedConnector,
        },
        event_log::memory::MemoryEventLog,
        identity_service::{IdentityStore, memory::MemoryIdentityStore},
        live::LiveHub,
        message_store::memory::MemoryMessageStore,
    };

    use super::*;

    struct Fixture {
        router: Router,
        store: Arc<MemoryMessageStore>,
        identity: Arc<MemoryIdentityStore>,
        log: Arc<MemoryEventLog>,
        live: SharedLiveHub,
        conversation: Conversation,
        sender: UserId,
        customer: UserId,
    }

    async fn fixture(connectors: Vec<Arc<ScriptedConnector>>) -> Fixture {
        let store = Arc::new(MemoryMessageStore::new());
        let identity = Arc::new(MemoryIdentityStore::new());
        let log = Arc::new(MemoryEventLog::new(4));
        let live: SharedLiveHub = Arc::new(LiveHub::new());
        let mut registry = ConnectorRegistry::new();
        for connector in connectors {
            registry.register(
                connector,
                CircuitBreakerConfig::default(),
                RateLimitConfig::default(),
            );
        }
        let sender = identity
            .create_user("Agent", couriercommon::messages::UserRole::Agent)
            .await
            .unwrap()
            .user_id;
        let customer = identity
            .create_user("Customer", couriercommon::messages::UserRole::Customer)
            .await
            .unwrap()
            .user_id;
        let conversation = Conversation::new(
            ConversationId::new("c1"),
            ConversationType::OneToOne,
            [sender, customer],
        );
        store.create_conversation(&conversation).await.unwrap();
        let settings = RouterSettings {
            backoff_base_ms: 1,
            backoff_cap_ms: 4,
            ..Default::default()
        };
        let router = Router::new(
            store.clone(),
            identity.clone(),
            log.clone(),
            Arc::new(registry),
            live.clone(),
            settings,
        );
        Fixture {
            router,
            store,
            identity,
            log,
            live,
            conversation,
            sender,
            customer,
        }
    }

    async fn put_pending(fixture: &Fixture, channel: Channel) -> ChatMessage {
        let message = ChatMessage::new_outbound(
            MessageId::random(),
            fixture.conversation.conversation_id.clone(),
            fixture.sender,
            vec![RecipientRef::User(fixture.customer)],
            MessageContent::text("hello"),
            channel,
        );
        fixture.store.put_message(&message).await.unwrap();
        message
    }

    fn wa_address() -> couriercommon::identifiers::PlatformAddress {
        couriercommon::identifiers::PlatformAddress::new(Platform::WhatsApp, "+5562999999999")
    }

    #[tokio::test]
    async fn happy_path_reaches_sent() -> anyhow::Result<()> {
        let connector = Arc::new(ScriptedConnector::new(Platform::WhatsApp, Vec::new()));
        let fixture = fixture(vec![connector.clone()]).await;
        fixture
            .identity
            .link_identity(&fixture.customer, &wa_address())
            .await?;
        let message = put_pending(&fixture, Channel::Platform(Platform::WhatsApp)).await;

        fixture.router.process(message.clone()).await?;

        assert_eq!(connector.calls.lock().unwrap().len(), 1);
        let stored = fixture.store.get_message(&message.message_id).await?.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.platform_message_id.as_deref(), Some("scripted"));
        assert_eq!(fixture.log.stream_len(STATUS_UPDATES), 1);
        assert_eq!(fixture.log.stream_len(CHAT_EVENTS_DLQ), 0);
        Ok(())
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() -> anyhow::Result<()> {
        let connector = Arc::new(ScriptedConnector::new(
            Platform::WhatsApp,
            vec![
                Err(DeliveryError::transient("try again")),
                Ok(DispatchOutcome {
                    platform_message_id: Some("wamid.2".into()),
                    status: DeliveryStatus::Sent,
                }),
            ],
        ));
        let fixture = fixture(vec![connector.clone()]).await;
        fixture
            .identity
            .link_identity(&fixture.customer, &wa_address())
            .await?;
        let message = put_pending(&fixture, Channel::Platform(Platform::WhatsApp)).await;

        fixture.router.process(message.clone()).await?;

        assert_eq!(connector.calls.lock().unwrap().len(), 2);
        let stored = fixture.store.get_message(&message.message_id).await?.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.outcomes[0].attempts, 2);
        Ok(())
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_retry() -> anyhow::Result<()> {
        let connector = Arc::new(ScriptedConnector::new(
            Platform::WhatsApp,
            vec![Err(DeliveryError::permanent("recipient blocked"))],
        ));
        let fixture = fixture(vec![connector.clone()]).await;
        fixture
            .identity
            .link_identity(&fixture.customer, &wa_address())
            .await?;
        let message = put_pending(&fixture, Channel::Platform(Platform::WhatsApp)).await;

        fixture.router.process(message.clone()).await?;

        assert_eq!(connector.calls.lock().unwrap().len(), 1);
        let stored = fixture.store.get_message(&message.message_id).await?.unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.error_kind, Some(ErrorKind::PermanentDelivery));
        assert_eq!(fixture.log.stream_len(CHAT_EVENTS_DLQ), 1);
        Ok(())
    }

    #[tokio::test]
    async fn fan_out_is_delivered_when_any_platform_succeeds() -> anyhow::Result<()> {
        let whatsapp = Arc::new(ScriptedConnector::new(
            Platform::WhatsApp,
            vec![Err(DeliveryError::permanent("blocked"))],
        ));
        let telegram = Arc::new(ScriptedConnector::new(Platform::Telegram, Vec::new()));
        let fixture = fixture(vec![whatsapp.clone(), telegram.clone()]).await;
        fixture
            .identity
            .link_identity(&fixture.customer, &wa_address())
            .await?;
        fixture
            .identity
            .link_identity(
                &fixture.customer,
                &couriercommon::identifiers::PlatformAddress::new(Platform::Telegram, "42"),
            )
            .await?;
        let message = put_pending(&fixture, Channel::Internal).await;

        fixture.router.process(message.clone()).await?;

        assert_eq!(whatsapp.calls.lock().unwrap().len(), 1);
        assert_eq!(telegram.calls.lock().unwrap().len(), 1);
        let stored = fixture.store.get_message(&message.message_id).await?.unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        // Both outcomes are recorded.
        assert_eq!(stored.outcomes.len(), 2);
        assert!(
            stored
                .outcomes
                .iter()
                .any(|o| o.status == MessageStatus::Failed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn replay_of_a_settled_message_dispatches_nothing() -> anyhow::Result<()> {
        let connector = Arc::new(ScriptedConnector::new(Platform::WhatsApp, Vec::new()));
        let fixture = fixture(vec![connector.clone()]).await;
        fixture
            .identity
            .link_identity(&fixture.customer, &wa_address())
            .await?;
        let message = put_pending(&fixture, Channel::Platform(Platform::WhatsApp)).await;

        fixture.router.process(message.clone()).await?;
        fixture.router.process(message.clone()).await?;

        assert_eq!(connector.calls.lock().unwrap().len(), 1);
        let history = fixture.store.get_status_history(&message.message_id).await?;
        assert_eq!(history.len(), 2); // PENDING, SENT
        Ok(())
    }

    #[tokio::test]
    async fn internal_channel_delivers_through_the_hub() -> anyhow::Result<()> {
        let fixture = fixture(Vec::new()).await;
        let mut live_rx = fixture.live.subscribe(fixture.customer);
        let message = put_pending(&fixture, Channel::Internal).await;

        fixture.router.process(message.clone()).await?;

        let stored = fixture.store.get_message(&message.message_id).await?.unwrap();
        assert_eq!(stored.status, MessageStatus::Delivered);
        let event = live_rx.try_recv().expect("live event");
        assert!(matches!(event, LiveEvent::Message { message: m } if m.message_id == message.message_id));
        Ok(())
    }

    #[tokio::test]
    async fn recipient_without_channel_identity_fails() -> anyhow::Result<()> {
        let connector = Arc::new(ScriptedConnector::new(Platform::WhatsApp, Vec::new()));
        let fixture = fixture(vec![connector.clone()]).await;
        // No WhatsApp identity linked for the customer.
        let message = put_pending(&fixture, Channel::Platform(Platform::WhatsApp)).await;

        fixture.router.process(message.clone()).await?;

        assert_eq!(connector.calls.lock().unwrap().len(), 0);
        let stored = fixture.store.get_message(&message.message_id).await?.unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.error_kind, Some(ErrorKind::NotFound));
        Ok(())
    }
}
