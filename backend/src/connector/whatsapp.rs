// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! WhatsApp-class connector: Cloud-API style JSON messages, Meta webhook
//! signatures, delivery receipts via `statuses` entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use couriercommon::{
    identifiers::{Platform, PlatformAddress},
    messages::{
        ChatMessage, InboundEvent, InboundMessage, MessageContent, MessageStatus,
    },
};
use serde_json::{Value, json};
use tracing::debug;

use crate::{files::FileService, settings::WhatsAppSettings};

use super::{
    Connector, DeliveryError, DeliveryStatus, DispatchOutcome, WebhookHeaders,
    render_outbound_text, signature::verify_sha256_prefix_signature,
};

#[derive(Debug, Clone)]
pub struct WhatsAppConnector {
    settings: WhatsAppSettings,
    http: reqwest::Client,
    files: FileService,
}

impl WhatsAppConnector {
    pub fn new(settings: WhatsAppSettings, http: reqwest::Client, files: FileService) -> Self {
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
            self.settings.phone_number_id
        )
    }

    fn classify_response(status: reqwest::StatusCode, body: &str) -> DeliveryError {
        if status.as_u16() == 429 || status.is_server_error() {
            DeliveryError::transient(format!("whatsapp api returned {status}"))
        } else {
            DeliveryError::permanent(format!("whatsapp api returned {status}: {body}"))
        }
    }

    async fn fetch_media(&self, link: &str, mime_type: &str) -> Option<MessageContent> {
        let response = self.http.get(link).send().await.ok()?;
        let bytes = response.bytes().await.ok()?.to_vec();
        match self
            .files
            .store_inbound("whatsapp-media", mime_type, bytes)
            .await
        {
            Ok(file_id) => Some(MessageContent {
                text: None,
                attachments: vec![file_id],
            }),
            Err(error) => {
                debug!(%error, "failed to store inbound media");
                None
            }
        }
    }

    fn parse_status(value: &Value) -> Option<InboundEvent> {
        let platform_message_id = value.get("id")?.as_str()?.to_owned();
        let status = match value.get("status")?.as_str()? {
            "sent" => MessageStatus::Sent,
            "delivered" => MessageStatus::Delivered,
            "read" => MessageStatus::Read,
            "failed" => MessageStatus::Failed,
            other => {
                debug!(status = other, "ignoring unknown whatsapp status");
                return None;
            }
        };
        let reason = value
            .get("errors")
            .and_then(|errors| errors.as_array())
            .and_then(|errors| errors.first())
            .and_then(|error| error.get("title"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        Some(InboundEvent::Status {
            platform_message_id,
            status,
            reason,
        })
    }

    async fn parse_message(&self, value: &Value) -> Option<InboundEvent> {
        let from = value.get("from")?.as_str()?.to_owned();
        let platform_message_id = value.get("id")?.as_str()?.to_owned();
        let timestamp = value
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        let content = if let Some(text) = value
            .get("text")
            .and_then(|text| text.get("body"))
            .and_then(Value::as_str)
        {
            MessageContent::text(text)
        } else if let Some(link) = media_link(value) {
            let mime_type = media_mime_type(value).unwrap_or("application/octet-stream");
            self.fetch_media(link, mime_type).await?
        } else {
            debug!("ignoring whatsapp message without text or media");
            return None;
        };
        Some(InboundEvent::Message(InboundMessage {
            origin: PlatformAddress::new(Platform::WhatsApp, from.clone()),
            platform_chat_id: from,
            platform_message_id,
            content,
            timestamp,
        }))
    }
}

fn media_value(value: &Value) -> Option<&Value> {
    ["image", "document", "video", "audio"]
        .iter()
        .find_map(|kind| value.get(kind))
}

fn media_link(value: &Value) -> Option<&str> {
    media_value(value)?.get("link")?.as_str()
}

fn media_mime_type(value: &Value) -> Option<&str> {
    media_value(value)?.get("mime_type")?.as_str()
}

#[async_trait]
impl Connector for WhatsAppConnector {
    fn platform(&self) -> Platform {
        Platform::WhatsApp
    }

    async fn send(
        &self,
        message: &ChatMessage,
        recipient: &PlatformAddress,
    ) -> Result<DispatchOutcome, DeliveryError> {
        let text = render_outbound_text(message, &self.files).await;
        let body = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient.platform_user_id,
            "type": "text",
            "text": { "preview_url": false, "body": text },
        });
        let response = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.settings.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::transient(format!("whatsapp transport error: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_response(status, &body));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| DeliveryError::transient(format!("whatsapp response decode: {e}")))?;
        let platform_message_id = body
            .get("messages")
            .and_then(|messages| messages.as_array())
            .and_then(|messages| messages.first())
            .and_then(|message| message.get("id"))
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
            .map_err(|e| DeliveryError::permanent(format!("malformed whatsapp payload: {e}")))?;
        let mut events = Vec::new();
        let entries = payload
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &entries {
            let changes = entry
                .get("changes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for change in &changes {
                let Some(value) = change.get("value") else {
                    continue;
                };
                for message in value
                    .get("messages")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    if let Some(event) = self.parse_message(message).await {
                        events.push(event);
                    }
                }
                for status in value
                    .get("statuses")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    if let Some(event) = Self::parse_status(status) {
                        events.push(event);
                    }
                }
            }
        }
        Ok(events)
    }

    async fn validate_credentials(&self) -> Result<(), DeliveryError> {
        let url = format!(
            "{}/{}",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.phone_number_id
        );
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.settings.access_token)
            .send()
            .await
            .map_err(|e| DeliveryError::transient(format!("whatsapp transport error: {e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(DeliveryError::permanent("whatsapp credentials rejected"))
        } else {
            Err(DeliveryError::transient(format!(
                "whatsapp credential probe returned {status}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::files::MemoryFileStore;

    use super::*;

    fn connector() -> WhatsAppConnector {
        WhatsAppConnector::new(
            WhatsAppSettings {
                api_base: "https://graph.example.com/v19.0".into(),
                phone_number_id: "1234".into(),
                access_token: "token".into(),
                app_secret: "s3cret".into(),
            },
            reqwest::Client::new(),
            FileService::new(Arc::new(MemoryFileStore::new()), None),
        )
    }

    fn signed_headers(secret: &str, body: &[u8]) -> WebhookHeaders {
        use hmac::Mac;
        let mut mac =
            hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let mut headers = WebhookHeaders::new();
        headers.insert(
            "X-Hub-Signature-256",
            format!("sha256={}", hex::encode(mac.finalize().into_bytes())),
        );
        headers
    }

    #[test]
    fn webhook_signature_is_enforced() {
        let connector = connector();
        let body = br#"{"entry":[]}"#;
        assert!(connector.verify_webhook(&signed_headers("s3cret", body), body));
        assert!(!connector.verify_webhook(&signed_headers("wrong", body), body));
        assert!(!connector.verify_webhook(&WebhookHeaders::new(), body));
    }

    #[tokio::test]
    async fn inbound_text_message_is_extracted() -> anyhow::Result<()> {
        let connector = connector();
        let body = serde_json::to_vec(&json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{
                            "from": "5562999999999",
                            "id": "wamid.abc",
                            "timestamp": "1722470400",
                            "text": { "body": "Oi" }
                        }]
                    }
                }]
            }]
        }))?;
        let events = connector.parse_webhook(&body).await?;
        assert_eq!(events.len(), 1);
        let InboundEvent::Message(message) = &events[0] else {
            panic!("expected a message event");
        };
        assert_eq!(message.origin.platform_user_id, "5562999999999");
        assert_eq!(message.platform_message_id, "wamid.abc");
        assert_eq!(message.content.text.as_deref(), Some("Oi"));
        Ok(())
    }

    #[tokio::test]
    async fn delivery_receipts_become_status_events() -> anyhow::Result<()> {
        let connector = connector();
        let body = serde_json::to_vec(&json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "statuses": [
                            { "id": "wamid.abc", "status": "delivered" },
                            { "id": "wamid.def", "status": "failed",
                              "errors": [{ "title": "recipient blocked" }] }
                        ]
                    }
                }]
            }]
        }))?;
        let events = connector.parse_webhook(&body).await?;
        assert_eq!(
            events[0],
            InboundEvent::Status {
                platform_message_id: "wamid.abc".into(),
                status: MessageStatus::Delivered,
                reason: None,
            }
        );
        assert_eq!(
            events[1],
            InboundEvent::Status {
                platform_message_id: "wamid.def".into(),
                status: MessageStatus::Failed,
                reason: Some("recipient blocked".into()),
            }
        );
        Ok(())
    }
}
