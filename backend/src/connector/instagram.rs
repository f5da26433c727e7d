// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Instagram-class connector: graph-style direct messages, Meta webhook
//! signatures, read receipts via `messaging` echoes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use couriercommon::{
    identifiers::{Platform, PlatformAddress},
    messages::{ChatMessage, InboundEvent, InboundMessage, MessageContent, MessageStatus},
};
use serde_json::{Value, json};

use crate::{files::FileService, settings::InstagramSettings};

use super::{
    Connector, DeliveryError, DeliveryStatus, DispatchOutcome, WebhookHeaders,
    render_outbound_text, signature::verify_sha256_prefix_signature,
};

#[derive(Debug, Clone)]
pub struct InstagramConnector {
    settings: InstagramSettings,
    http: reqwest::Client,
    files: FileService,
}

impl InstagramConnector {
    pub fn new(settings: InstagramSettings, http: reqwest::Client, files: FileService) -> Self {
        Self {
            settings,
            http,
            files,
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/messages",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.account_id
        )
    }

    fn parse_messaging(value: &Value) -> Option<InboundEvent> {
        let timestamp = value
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        if let Some(read) = value.get("read") {
            let platform_message_id = read.get("mid")?.as_str()?.to_owned();
            return Some(InboundEvent::Status {
                platform_message_id,
                status: MessageStatus::Read,
                reason: None,
            });
        }
        let sender = value.get("sender")?.get("id")?.as_str()?.to_owned();
        let message = value.get("message")?;
        let platform_message_id = message.get("mid")?.as_str()?.to_owned();
        let text = message.get("text").and_then(Value::as_str)?;
        Some(InboundEvent::Message(InboundMessage {
            origin: PlatformAddress::new(Platform::Instagram, sender.clone()),
            platform_chat_id: sender,
            platform_message_id,
            content: MessageContent::text(text),
            timestamp,
        }))
    }
}

#[async_trait]
impl Connector for InstagramConnector {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    async fn send(
        &self,
        message: &ChatMessage,
        recipient: &PlatformAddress,
    ) -> Result<DispatchOutcome, DeliveryError> {
        let text = render_outbound_text(message, &self.files).await;
        let body = json!({
            "recipient": { "id": recipient.platform_user_id },
            "message": { "text": text },
        });
        let response = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.settings.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::transient(format!("instagram transport error: {e}")))?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(DeliveryError::transient(format!(
                "instagram api returned {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::permanent(format!(
                "instagram api returned {status}: {body}"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| DeliveryError::transient(format!("instagram response decode: {e}")))?;
        let platform_message_id = body
            .get("message_id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(DispatchOutcome {
            platform_message_id,
            status: DeliveryStatus::Sent,
        })
    }

    fn verify_webhook(&self, headers: &WebhookHeaders, body: &[u8]) -> bool {
        headers
            .get("x-hub-signature-256")
            .is_some_and(|signature| {
                verify_sha256_prefix_signature(&self.settings.app_secret, body, signature)
            })
    }

    async fn parse_webhook(&self, body: &[u8]) -> Result<Vec<InboundEvent>, DeliveryError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| DeliveryError::permanent(format!("malformed instagram payload: {e}")))?;
        let mut events = Vec::new();
        for entry in payload
            .get("entry")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            for messaging in entry
                .get("messaging")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                if let Some(event) = Self::parse_messaging(messaging) {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }

    async fn validate_credentials(&self) -> Result<(), DeliveryError> {
        let url = format!(
            "{}/{}",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.account_id
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.settings.access_token)
            .send()
            .await
            .map_err(|e| DeliveryError::transient(format!("instagram transport error: {e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(DeliveryError::permanent("instagram credentials rejected"))
        } else {
            Err(DeliveryError::transient(format!(
                "instagram credential probe returned {status}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::files::MemoryFileStore;

    use super::*;

    fn connector() -> InstagramConnector {
        InstagramConnector::new(
            InstagramSettings {
                api_base: "https://graph.example.com/v19.0".into(),
                account_id: "ig-1".into(),
                access_token: "token".into(),
                app_secret: "s3cret".into(),
            },
            reqwest::Client::new(),
            FileService::new(Arc::new(MemoryFileStore::new()), None),
        )
    }

    #[tokio::test]
    async fn message_and_read_receipt_are_parsed() -> anyhow::Result<()> {
        let connector = connector();
        let body = serde_json::to_vec(&json!({
            "entry": [{
                "messaging": [
                    {
                        "timestamp": 1722470400000i64,
                        "sender": { "id": "ig-user-9" },
                        "message": { "mid": "mid.1", "text": "hey" }
                    },
                    {
                        "timestamp": 1722470460000i64,
                        "read": { "mid": "mid.0" }
                    }
                ]
            }]
        }))?;
        let events = connector.parse_webhook(&body).await?;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], InboundEvent::Message(m)
            if m.origin.platform_user_id == "ig-user-9" && m.platform_message_id == "mid.1"));
        assert_eq!(
            events[1],
            InboundEvent::Status {
                platform_message_id: "mid.0".into(),
                status: MessageStatus::Read,
                reason: None,
            }
        );
        Ok(())
    }
}
