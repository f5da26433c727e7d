// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Webhook intake: the strictly inbound path from platform callbacks into
//! the pipeline.
//!
//! Inbound messages re-enter through [`Ingress::accept_inbound`] with an
//! already-resolved sender; status callbacks are mapped to their message by
//! platform message id and published as status-update events.

use std::sync::Arc;

use couriercommon::{
    codec::CourierCodec,
    identifiers::{Platform, PlatformAddress},
    messages::{InboundEvent, StatusTransition, UserRole, events::StatusEvent},
};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    connector::{ConnectorRegistry, WebhookHeaders},
    event_log::{EventLog, STATUS_UPDATES},
    identity_service::{AuditEntry, IdentityStore},
    message_store::MessageStore,
};

use super::{Ingress, IngressError};

#[derive(Debug, Error)]
pub enum WebhookError {
    /// No connector serves this platform.
    #[error("No connector registered for platform {0}")]
    UnknownPlatform(Platform),
    /// Signature verification failed; the platform must retry.
    #[error("Webhook signature verification failed")]
    InvalidSignature,
    /// The payload could not be parsed.
    #[error("Malformed webhook payload: {0}")]
    Malformed(String),
    /// A dependency failed; the platform should redeliver.
    #[error("Webhook processing failed: {0}")]
    Internal(String),
}

/// What one webhook delivery produced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WebhookReceipt {
    pub accepted_messages: usize,
    pub status_updates: usize,
}

pub struct WebhookIntake {
    registry: Arc<ConnectorRegistry>,
    ingress: Arc<Ingress>,
    identity: Arc<dyn IdentityStore>,
    store: Arc<dyn MessageStore>,
    log: Arc<dyn EventLog>,
}

impl WebhookIntake {
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        ingress: Arc<Ingress>,
        identity: Arc<dyn IdentityStore>,
        store: Arc<dyn MessageStore>,
        log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            registry,
            ingress,
            identity,
            store,
            log,
        }
    }

    /// Verifies, parses and applies one webhook delivery. Redeliveries are
    /// safe: inbound messages deduplicate on their platform message id and
    /// status updates are monotone no-ops on replay.
    pub async fn ingest(
        &self,
        platform: Platform,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<WebhookReceipt, WebhookError> {
        let connector = self
            .registry
            .connector(platform)
            .ok_or(WebhookError::UnknownPlatform(platform))?;
        if !connector.verify_webhook(headers, body) {
            warn!(%platform, "rejected webhook with invalid signature");
            return Err(WebhookError::InvalidSignature);
        }
        let events = connector
            .parse_webhook(body)
            .await
            .map_err(|e| WebhookError::Malformed(e.to_string()))?;

        let mut receipt = WebhookReceipt::default();
        for event in events {
            match event {
                InboundEvent::Message(inbound) => {
                    let sender_id = self.resolve_or_provision(&inbound.origin).await?;
                    match self.ingress.accept_inbound(inbound, sender_id).await {
                        Ok(_) => receipt.accepted_messages += 1,
                        Err(IngressError::NotFound(reason)) => {
                            warn!(%platform, reason, "dropping unmappable inbound message");
                        }
                        Err(error) => {
                            return Err(WebhookError::Internal(error.to_string()));
                        }
                    }
                }
                InboundEvent::Status {
                    platform_message_id,
                    status,
                    reason,
                } => {
                    let applied = self
                        .publish_status(platform, &platform_message_id, status, reason)
                        .await?;
                    if applied {
                        receipt.status_updates += 1;
                    }
                }
            }
        }
        Ok(receipt)
    }

    /// Resolves the platform handle, provisioning a customer identity on
    /// first contact.
    async fn resolve_or_provision(
        &self,
        origin: &PlatformAddress,
    ) -> Result<couriercommon::identifiers::UserId, WebhookError> {
        if let Some(user_id) = self
            .identity
            .resolve(origin)
            .await
            .map_err(|e| WebhookError::Internal(e.to_string()))?
        {
            return Ok(user_id);
        }
        let profile = self
            .identity
            .create_user(&origin.platform_user_id, UserRole::Customer)
            .await
            .map_err(|e| WebhookError::Internal(e.to_string()))?;
        match self.identity.link_identity(&profile.user_id, origin).await {
            Ok(_) => {
                self.identity
                    .audit(AuditEntry::new(
                        "webhook-intake",
                        "auto_provision",
                        origin.to_string(),
                        None,
                        Some(profile.user_id.to_string()),
                    ))
                    .await
                    .map_err(|e| WebhookError::Internal(e.to_string()))?;
                info!(origin = %origin, user_id = %profile.user_id, "provisioned identity on first contact");
                Ok(profile.user_id)
            }
            // A concurrent webhook linked the handle first; use its user.
            Err(crate::identity_service::IdentityStoreError::Duplicate) => self
                .identity
                .resolve(origin)
                .await
                .map_err(|e| WebhookError::Internal(e.to_string()))?
                .ok_or_else(|| WebhookError::Internal("identity vanished after link".into())),
            Err(e) => Err(WebhookError::Internal(e.to_string())),
        }
    }

    /// Maps a platform status callback to its message and publishes a
    /// status-update event on the message's conversation partition.
    async fn publish_status(
        &self,
        platform: Platform,
        platform_message_id: &str,
        status: couriercommon::messages::MessageStatus,
        reason: Option<String>,
    ) -> Result<bool, WebhookError> {
        let Some(message) = self
            .store
            .find_by_platform_message_id(platform, platform_message_id)
            .await
            .map_err(|e| WebhookError::Internal(e.to_string()))?
        else {
            warn!(%platform, platform_message_id, "status update for unknown message");
            return Ok(false);
        };
        let event = StatusEvent {
            message_id: message.message_id,
            conversation_id: message.conversation_id.clone(),
            transition: StatusTransition {
                status,
                timestamp: chrono::Utc::now(),
                reason,
            },
        };
        let payload = CourierCodec::to_vec(&event)
            .map_err(|e| WebhookError::Internal(e.to_string()))?;
        self.log
            .publish(STATUS_UPDATES, message.conversation_id.as_str(), payload)
            .await
            .map_err(|e| WebhookError::Internal(e.to_string()))?;
        Ok(true)
    }
}
