// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telegram-class connector: bot-API sends, shared-secret webhook header.
//! The platform emits no per-message delivery receipts, so inbound events
//! are messages only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use couriercommon::{
    identifiers::{Platform, PlatformAddress},
    messages::{ChatMessage, InboundEvent, InboundMessage, MessageContent},
};
use serde_json::{Value, json};
use tracing::debug;

use crate::{files::FileService, settings::TelegramSettings};

use super::{
    Connector, DeliveryError, DeliveryStatus, DispatchOutcome, WebhookHeaders,
    render_outbound_text, signature::verify_shared_token,
};

#[derive(Debug, Clone)]
pub struct TelegramConnector {
    settings: TelegramSettings,
    http: reqwest::Client,
    files: FileService,
}

impl TelegramConnector {
    pub fn new(settings: TelegramSettings, http: reqwest::Client, files: FileService) -> Self {
        Self {
            settings,
            http,
            files,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.bot_token
        )
    }

    fn parse_update(value: &Value) -> Option<InboundEvent> {
        let message = value.get("message")?;
        let from = message.get("from")?.get("id")?.as_i64()?.to_string();
        let chat_id = message.get("chat")?.get("id")?.as_i64()?.to_string();
        let platform_message_id = message.get("message_id")?.as_i64()?.to_string();
        let text = message.get("text").and_then(Value::as_str)?;
        let timestamp = message
            .get("date")
            .and_then(Value::as_i64)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        Some(InboundEvent::Message(InboundMessage {
            origin: PlatformAddress::new(Platform::Telegram, from),
            platform_chat_id: chat_id,
            platform_message_id,
            content: MessageContent::text(text),
            timestamp,
        }))
    }
}

#[async_trait]
impl Connector for TelegramConnector {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    async fn send(
        &self,
        message: &ChatMessage,
        recipient: &PlatformAddress,
    ) -> Result<DispatchOutcome, DeliveryError> {
        let text = render_outbound_text(message, &self.files).await;
        let body = json!({
            "chat_id": recipient.platform_user_id,
            "text": text,
        });
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::transient(format!("telegram transport error: {e}")))?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(DeliveryError::transient(format!(
                "telegram api returned {status}"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| DeliveryError::transient(format!("telegram response decode: {e}")))?;
        if !body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(DeliveryError::permanent(format!(
                "telegram api rejected the message: {description}"
            )));
        }
        let platform_message_id = body
            .get("result")
            .and_then(|result| result.get("message_id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string());
        Ok(DispatchOutcome {
            platform_message_id,
            status: DeliveryStatus::Sent,
        })
    }

    fn verify_webhook(&self, headers: &WebhookHeaders, _body: &[u8]) -> bool {
        headers
            .get("x-telegram-bot-api-secret-token")
            .is_some_and(|token| verify_shared_token(&self.settings.webhook_secret, token))
    }

    async fn parse_webhook(&self, body: &[u8]) -> Result<Vec<InboundEvent>, DeliveryError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| DeliveryError::permanent(format!("malformed telegram payload: {e}")))?;
        match Self::parse_update(&payload) {
            Some(event) => Ok(vec![event]),
            None => {
                debug!("ignoring telegram update without a text message");
                Ok(Vec::new())
            }
        }
    }

    async fn validate_credentials(&self) -> Result<(), DeliveryError> {
        let response = self
            .http
            .get(self.method_url("getMe"))
            .send()
            .await
            .map_err(|e| DeliveryError::transient(format!("telegram transport error: {e}")))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| DeliveryError::transient(format!("telegram response decode: {e}")))?;
        if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(())
        } else {
            Err(DeliveryError::permanent("telegram credentials rejected"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use couriercommon::messages::MessageStatus;

    use crate::files::MemoryFileStore;

    use super::*;

    fn connector() -> TelegramConnector {
        TelegramConnector::new(
            TelegramSettings {
                api_base: "https://api.telegram.example".into(),
                bot_token: "123:abc".into(),
                webhook_secret: "hook-secret".into(),
            },
            reqwest::Client::new(),
            FileService::new(Arc::new(MemoryFileStore::new()), None),
        )
    }

    #[test]
    fn webhook_token_is_enforced() {
        let connector = connector();
        let mut headers = WebhookHeaders::new();
        headers.insert("X-Telegram-Bot-Api-Secret-Token", "hook-secret");
        assert!(connector.verify_webhook(&headers, b"{}"));

        let mut wrong = WebhookHeaders::new();
        wrong.insert("X-Telegram-Bot-Api-Secret-Token", "other");
        assert!(!connector.verify_webhook(&wrong, b"{}"));
        assert!(!connector.verify_webhook(&WebhookHeaders::new(), b"{}"));
    }

    #[tokio::test]
    async fn update_is_parsed_into_an_inbound_message() -> anyhow::Result<()> {
        let connector = connector();
        let body = serde_json::to_vec(&json!({
            "update_id": 10,
            "message": {
                "message_id": 77,
                "date": 1722470400,
                "from": { "id": 42 },
                "chat": { "id": 42 },
                "text": "privet"
            }
        }))?;
        let events = connector.parse_webhook(&body).await?;
        assert_eq!(events.len(), 1);
        let InboundEvent::Message(message) = &events[0] else {
            panic!("expected a message event");
        };
        assert_eq!(message.origin.platform_user_id, "42");
        assert_eq!(message.platform_chat_id, "42");
        assert_eq!(message.platform_message_id, "77");
        assert_eq!(message.content.text.as_deref(), Some("privet"));
        // No delivery receipts on this platform.
        assert!(!events.iter().any(|e| matches!(
            e,
            InboundEvent::Status {
                status: MessageStatus::Delivered,
                ..
            }
        )));
        Ok(())
    }
}
