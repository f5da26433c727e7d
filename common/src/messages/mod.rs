// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message, conversation and status types shared by the pipeline and the
//! server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifiers::{
    AttachmentId, Channel, ConversationId, MessageId, PlatformAddress, RecipientRef, UserId,
};

pub mod events;

/// Delivery status of a message.
///
/// Transitions are monotone: PENDING → {SENT, FAILED}; SENT → {DELIVERED,
/// FAILED}; DELIVERED → {READ, FAILED}; READ and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
            MessageStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Failed)
                | (Sent, Delivered)
                | (Sent, Failed)
                | (Delivered, Read)
                | (Delivered, Failed)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(MessageStatus::Pending),
            "SENT" => Ok(MessageStatus::Sent),
            "DELIVERED" => Ok(MessageStatus::Delivered),
            "READ" => Ok(MessageStatus::Read),
            "FAILED" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// Classified failure cause, persisted with terminal statuses and surfaced on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Duplicate,
    NotFound,
    Transient,
    CircuitOpen,
    PermanentDelivery,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Duplicate => "duplicate",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::PermanentDelivery => "permanent_delivery",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a dispatch failure of this kind may be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::CircuitOpen)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role tag of an internal user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Agent,
    Customer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Agent => "AGENT",
            UserRole::Customer => "CUSTOMER",
        }
    }
}

impl std::str::FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AGENT" => Ok(UserRole::Agent),
            "CUSTOMER" => Ok(UserRole::Customer),
            other => Err(format!("unknown user role: {other}")),
        }
    }
}

/// Malware-scan verdict of a file attachment. Attachments are
/// unreferenceable from messages unless CLEAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanVerdict {
    Pending,
    Clean,
    Rejected,
}

impl ScanVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanVerdict::Pending => "PENDING",
            ScanVerdict::Clean => "CLEAN",
            ScanVerdict::Rejected => "REJECTED",
        }
    }
}

impl std::str::FromStr for ScanVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ScanVerdict::Pending),
            "CLEAN" => Ok(ScanVerdict::Clean),
            "REJECTED" => Ok(ScanVerdict::Rejected),
            other => Err(format!("unknown scan verdict: {other}")),
        }
    }
}

/// Distinguishes user chat messages from synthetic system messages emitted on
/// participant changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    System,
}

/// Message body: text and/or file attachments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentId>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(str::is_empty) && self.attachments.is_empty()
    }
}

/// One entry of a message's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

impl StatusTransition {
    pub fn now(status: MessageStatus) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            reason: None,
        }
    }

    pub fn with_reason(status: MessageStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            reason: Some(reason.into()),
        }
    }
}

/// Per-recipient dispatch metadata recorded on the message after fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientOutcome {
    /// Canonical display form of the recipient (`<platform>:<id>` or an
    /// internal user id).
    pub recipient: String,
    pub status: MessageStatus,
    pub platform_message_id: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub reason: Option<String>,
    pub attempts: u32,
}

/// The central message record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// Recipient set computed at send time (everyone but the sender, or the
    /// caller-supplied explicit set).
    pub recipients: Vec<RecipientRef>,
    pub content: MessageContent,
    pub channel: Channel,
    pub kind: MessageKind,
    /// For inbound messages, the platform handle the message came from.
    pub origin: Option<PlatformAddress>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Platform-assigned id of the first successful dispatch.
    pub platform_message_id: Option<String>,
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub outcomes: Vec<RecipientOutcome>,
}

impl ChatMessage {
    /// A new outbound message in its initial state.
    pub fn new_outbound(
        message_id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        recipients: Vec<RecipientRef>,
        content: MessageContent,
        channel: Channel,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            conversation_id,
            sender_id,
            recipients,
            content,
            channel,
            kind: MessageKind::Chat,
            origin: None,
            status: MessageStatus::Pending,
            created_at: now,
            updated_at: now,
            platform_message_id: None,
            error_kind: None,
            outcomes: Vec::new(),
        }
    }

    /// A new inbound message handed over by a platform webhook. Routed
    /// internally, so the channel is INTERNAL; the origin keeps the platform
    /// handle it came from.
    pub fn new_inbound(
        message_id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        recipients: Vec<RecipientRef>,
        content: MessageContent,
        origin: PlatformAddress,
        platform_message_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            conversation_id,
            sender_id,
            recipients,
            content,
            channel: Channel::Internal,
            kind: MessageKind::Chat,
            origin: Some(origin),
            status: MessageStatus::Pending,
            created_at: now,
            updated_at: now,
            platform_message_id: Some(platform_message_id),
            error_kind: None,
            outcomes: Vec::new(),
        }
    }

    /// A synthetic system message recording a participant change. Not
    /// dispatched; delivered by construction.
    pub fn system(
        conversation_id: ConversationId,
        subject_id: UserId,
        text: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: MessageId::random(),
            conversation_id,
            sender_id: subject_id,
            recipients: Vec::new(),
            content: MessageContent::text(text),
            channel: Channel::Internal,
            kind: MessageKind::System,
            origin: None,
            status: MessageStatus::Delivered,
            created_at: now,
            updated_at: now,
            platform_message_id: None,
            error_kind: None,
            outcomes: Vec::new(),
        }
    }
}

/// A validated send request as accepted by ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub channel: Channel,
    pub message_id: Option<MessageId>,
    /// Explicit recipient set; when empty, recipients are derived from the
    /// conversation's current participants.
    #[serde(default)]
    pub recipients: Vec<RecipientRef>,
}

/// The synchronous result of accepting a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub status: MessageStatus,
}

/// One join window of a user in a conversation. A user that left and
/// rejoined has several entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn joined_now(user_id: UserId) -> Self {
        Self {
            user_id,
            joined_at: Utc::now(),
            left_at: None,
        }
    }

    pub fn is_active_at(&self, time: DateTime<Utc>) -> bool {
        self.joined_at <= time && self.left_at.is_none_or(|left| time < left)
    }

    /// Whether a message created at the given time falls into this window.
    pub fn covers(&self, created_at: DateTime<Utc>) -> bool {
        self.joined_at <= created_at && self.left_at.is_none_or(|left| created_at < left)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationType {
    OneToOne,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::OneToOne => "ONE_TO_ONE",
            ConversationType::Group => "GROUP",
        }
    }
}

impl std::str::FromStr for ConversationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONE_TO_ONE" => Ok(ConversationType::OneToOne),
            "GROUP" => Ok(ConversationType::Group),
            other => Err(format!("unknown conversation type: {other}")),
        }
    }
}

/// A conversation with its full participant event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: ConversationId,
    pub conversation_type: ConversationType,
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(
        conversation_id: ConversationId,
        conversation_type: ConversationType,
        user_ids: impl IntoIterator<Item = UserId>,
    ) -> Self {
        Self {
            conversation_id,
            conversation_type,
            participants: user_ids.into_iter().map(Participant::joined_now).collect(),
            created_at: Utc::now(),
        }
    }

    /// User ids with an open join window at the given time, deduplicated.
    pub fn active_participants_at(&self, time: DateTime<Utc>) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self
            .participants
            .iter()
            .filter(|p| p.is_active_at(time))
            .map(|p| p.user_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_active_participant(&self, user_id: &UserId, time: DateTime<Utc>) -> bool {
        self.participants
            .iter()
            .any(|p| p.user_id == *user_id && p.is_active_at(time))
    }

    /// Whether a message created at the given time is visible to the user
    /// under the join-window history filter.
    pub fn message_visible_to(&self, user_id: &UserId, created_at: DateTime<Utc>) -> bool {
        self.participants
            .iter()
            .any(|p| p.user_id == *user_id && p.covers(created_at))
    }
}

/// An inbound message normalized out of a platform webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub origin: PlatformAddress,
    /// Platform-side conversation/chat identifier; used to derive the
    /// internal conversation id when none is mapped yet.
    pub platform_chat_id: String,
    pub platform_message_id: String,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

/// What a connector extracts from one webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InboundEvent {
    Message(InboundMessage),
    Status {
        platform_message_id: String,
        status: MessageStatus,
        reason: Option<String>,
    },
}

/// An event pushed to a live subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LiveEvent {
    #[serde(rename_all = "camelCase")]
    Message { message: ChatMessage },
    #[serde(rename_all = "camelCase")]
    Status {
        message_id: MessageId,
        conversation_id: ConversationId,
        transition: StatusTransition,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_machine_is_monotone() {
        use MessageStatus::*;
        let allowed = [
            (Pending, Sent),
            (Pending, Failed),
            (Sent, Delivered),
            (Sent, Failed),
            (Delivered, Read),
            (Delivered, Failed),
        ];
        for from in [Pending, Sent, Delivered, Read, Failed] {
            for to in [Pending, Sent, Delivered, Read, Failed] {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {expected}"
                );
            }
        }
        assert!(Read.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Pending.is_terminal());
    }

    #[test]
    fn participant_windows_filter_history() {
        let user = UserId::random();
        let joined = Utc::now();
        let left = joined + chrono::Duration::minutes(10);
        let window = Participant {
            user_id: user,
            joined_at: joined,
            left_at: Some(left),
        };
        assert!(!window.covers(joined - chrono::Duration::seconds(1)));
        assert!(window.covers(joined));
        assert!(window.covers(left - chrono::Duration::seconds(1)));
        assert!(!window.covers(left));
    }

    #[test]
    fn rejoin_restores_visibility_for_new_messages_only() {
        let user = UserId::random();
        let t0 = Utc::now();
        let conversation = Conversation {
            conversation_id: ConversationId::new("c1"),
            conversation_type: ConversationType::Group,
            participants: vec![
                Participant {
                    user_id: user,
                    joined_at: t0,
                    left_at: Some(t0 + chrono::Duration::minutes(1)),
                },
                Participant {
                    user_id: user,
                    joined_at: t0 + chrono::Duration::minutes(5),
                    left_at: None,
                },
            ],
            created_at: t0,
        };
        // During the gap the user sees nothing.
        assert!(!conversation.message_visible_to(&user, t0 + chrono::Duration::minutes(2)));
        // Inside either window the message is visible.
        assert!(conversation.message_visible_to(&user, t0 + chrono::Duration::seconds(30)));
        assert!(conversation.message_visible_to(&user, t0 + chrono::Duration::minutes(6)));
    }

    #[test]
    fn message_status_string_round_trip() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            MessageStatus::Read,
            MessageStatus::Failed,
        ] {
            let parsed: MessageStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
