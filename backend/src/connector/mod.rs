// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-platform adapters and the registry the router dispatches through.
//!
//! Connectors register at process start; dispatch is keyed by platform.
//! Each registered connector is guarded by its own circuit breaker and
//! per-recipient rate limiter, so one failing platform cannot poison the
//! others.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use couriercommon::{
    identifiers::{Platform, PlatformAddress},
    messages::{ChatMessage, ErrorKind, InboundEvent, MessageStatus},
};
use thiserror::Error;
use tracing::warn;

mod circuit_breaker;
mod instagram;
mod rate_limit;
mod signature;
mod telegram;
mod whatsapp;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use instagram::InstagramConnector;
pub use rate_limit::{RateLimitConfig, RecipientRateLimiter};
pub use telegram::TelegramConnector;
pub use whatsapp::WhatsAppConnector;

/// Delivery state a connector reports for a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
}

impl From<DeliveryStatus> for MessageStatus {
    fn from(value: DeliveryStatus) -> Self {
        match value {
            DeliveryStatus::Sent => MessageStatus::Sent,
            DeliveryStatus::Delivered => MessageStatus::Delivered,
        }
    }
}

/// Successful dispatch result.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub platform_message_id: Option<String>,
    pub status: DeliveryStatus,
}

/// A classified dispatch failure.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {reason}")]
pub struct DeliveryError {
    pub kind: ErrorKind,
    pub reason: String,
}

impl DeliveryError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PermanentDelivery,
            reason: reason.into(),
        }
    }

    pub fn circuit_open(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::CircuitOpen,
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            reason: reason.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// The webhook headers a connector needs for signature verification,
/// detached from any HTTP framework type.
#[derive(Debug, Default, Clone)]
pub struct WebhookHeaders {
    headers: HashMap<String, String>,
}

impl WebhookHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

impl FromIterator<(String, String)> for WebhookHeaders {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(&name, value);
        }
        headers
    }
}

/// One platform's capability set: outbound sends, webhook intake, and a
/// credential probe.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug + 'static {
    fn platform(&self) -> Platform;

    /// Delivers a message to one recipient. Failures are classified; the
    /// router owns retries.
    async fn send(
        &self,
        message: &ChatMessage,
        recipient: &PlatformAddress,
    ) -> Result<DispatchOutcome, DeliveryError>;

    /// Verifies the platform's webhook signature. Unverified payloads must
    /// be rejected so the platform retries per its policy.
    fn verify_webhook(&self, headers: &WebhookHeaders, body: &[u8]) -> bool;

    /// Translates a raw webhook payload into inbound events.
    async fn parse_webhook(&self, body: &[u8]) -> Result<Vec<InboundEvent>, DeliveryError>;

    async fn validate_credentials(&self) -> Result<(), DeliveryError>;
}

/// Renders the outbound wire text: the message body plus one download link
/// per attachment. Link resolution is best-effort; an attachment without a
/// presignable URL is skipped.
pub(super) async fn render_outbound_text(
    message: &ChatMessage,
    files: &crate::files::FileService,
) -> String {
    let mut text = message.content.text.clone().unwrap_or_default();
    for file_id in &message.content.attachments {
        match files.download_url(file_id).await {
            Ok(Some(url)) => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&url);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::debug!(%error, %file_id, "skipping attachment without download url");
            }
        }
    }
    text
}

struct ConnectorEntry {
    connector: Arc<dyn Connector>,
    breaker: CircuitBreaker,
    limiter: RecipientRateLimiter,
}

impl std::fmt::Debug for ConnectorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorEntry")
            .field("platform", &self.connector.platform())
            .finish_non_exhaustive()
    }
}

/// Process-wide connector registry. Populated once at startup.
#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    entries: HashMap<Platform, ConnectorEntry>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        connector: Arc<dyn Connector>,
        breaker_config: CircuitBreakerConfig,
        rate_config: RateLimitConfig,
    ) {
        let platform = connector.platform();
        self.entries.insert(
            platform,
            ConnectorEntry {
                connector,
                breaker: CircuitBreaker::new(breaker_config),
                limiter: RecipientRateLimiter::new(rate_config),
            },
        );
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.entries.keys().copied().collect()
    }

    pub fn connector(&self, platform: Platform) -> Option<Arc<dyn Connector>> {
        self.entries
            .get(&platform)
            .map(|entry| entry.connector.clone())
    }

    /// Dispatches one message to one recipient through the platform's
    /// guarded connector.
    pub async fn dispatch(
        &self,
        message: &ChatMessage,
        recipient: &PlatformAddress,
    ) -> Result<DispatchOutcome, DeliveryError> {
        let entry = self.entries.get(&recipient.platform).ok_or_else(|| {
            DeliveryError::permanent(format!(
                "no connector registered for {}",
                recipient.platform
            ))
        })?;
        if !entry.breaker.check() {
            return Err(DeliveryError::circuit_open(format!(
                "{} circuit is open",
                recipient.platform
            )));
        }
        if !entry.limiter.allowed(&recipient.platform_user_id) {
            return Err(DeliveryError::transient(format!(
                "recipient rate limit exceeded for {recipient}"
            )));
        }
        match entry.connector.send(message, recipient).await {
            Ok(outcome) => {
                entry.breaker.record_success();
                Ok(outcome)
            }
            Err(error) => {
                // Platform rejections of a specific message do not trip the
                // breaker; transport-level trouble does.
                match error.kind {
                    ErrorKind::Transient | ErrorKind::Internal => entry.breaker.record_failure(),
                    _ => entry.breaker.record_success(),
                }
                Err(error)
            }
        }
    }

    /// Probes every registered connector's credentials at startup.
    pub async fn validate_all(&self) -> Vec<(Platform, Result<(), DeliveryError>)> {
        let mut results = Vec::with_capacity(self.entries.len());
        for (platform, entry) in &self.entries {
            let result = entry.connector.validate_credentials().await;
            if let Err(error) = &result {
                warn!(%platform, %error, "connector credential validation failed");
            }
            results.push((*platform, result));
        }
        results
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// Scripted connector for tests: pops one outcome per send call.
    #[derive(Debug)]
    pub(crate) struct ScriptedConnector {
        platform: Platform,
        script: Mutex<Vec<Result<DispatchOutcome, DeliveryError>>>,
        pub(crate) calls: Mutex<Vec<PlatformAddress>>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(
            platform: Platform,
            script: Vec<Result<DispatchOutcome, DeliveryError>>,
        ) -> Self {
            Self {
                platform,
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn send(
            &self,
            _message: &ChatMessage,
            recipient: &PlatformAddress,
        ) -> Result<DispatchOutcome, DeliveryError> {
            self.calls.lock().unwrap().push(recipient.clone());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(DispatchOutcome {
                    platform_message_id: Some("scripted".into()),
                    status: DeliveryStatus::Sent,
                })
            } else {
                script.remove(0)
            }
        }

        fn verify_webhook(&self, _headers: &WebhookHeaders, _body: &[u8]) -> bool {
            true
        }

        async fn parse_webhook(&self, _body: &[u8]) -> Result<Vec<InboundEvent>, DeliveryError> {
            Ok(Vec::new())
        }

        async fn validate_credentials(&self) -> Result<(), DeliveryError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use couriercommon::{
        identifiers::{Channel, ConversationId, MessageId, UserId},
        messages::MessageContent,
    };

    use super::{test_support::ScriptedConnector, *};

    fn message() -> ChatMessage {
        ChatMessage::new_outbound(
            MessageId::random(),
            ConversationId::new("c"),
            UserId::random(),
            Vec::new(),
            MessageContent::text("hi"),
            Channel::Internal,
        )
    }

    #[tokio::test]
    async fn dispatch_without_connector_is_permanent() {
        let registry = ConnectorRegistry::new();
        let recipient = PlatformAddress::new(Platform::WhatsApp, "+1");
        let error = registry.dispatch(&message(), &recipient).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::PermanentDelivery);
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_transport_failures() {
        let mut registry = ConnectorRegistry::new();
        let failures = (0..10)
            .map(|_| Err(DeliveryError::transient("boom")))
            .collect();
        registry.register(
            Arc::new(ScriptedConnector::new(Platform::WhatsApp, failures)),
            CircuitBreakerConfig {
                min_samples: 5,
                ..Default::default()
            },
            RateLimitConfig::default(),
        );
        let recipient = PlatformAddress::new(Platform::WhatsApp, "+1");
        let mut saw_open = false;
        for _ in 0..10 {
            let error = registry.dispatch(&message(), &recipient).await.unwrap_err();
            if error.kind == ErrorKind::CircuitOpen {
                saw_open = true;
                break;
            }
        }
        assert!(saw_open, "breaker never opened");
    }

    #[tokio::test]
    async fn rate_limit_reports_transient() {
        let mut registry = ConnectorRegistry::new();
        registry.register(
            Arc::new(ScriptedConnector::new(Platform::Telegram, Vec::new())),
            CircuitBreakerConfig::default(),
            RateLimitConfig {
                max_requests: 1,
                time_window: chrono::TimeDelta::minutes(1),
            },
        );
        let recipient = PlatformAddress::new(Platform::Telegram, "42");
        assert!(registry.dispatch(&message(), &recipient).await.is_ok());
        let error = registry.dispatch(&message(), &recipient).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::Transient);
    }
}
