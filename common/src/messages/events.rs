// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Envelopes carried on the event log.

use serde::{Deserialize, Serialize};

use crate::{
    identifiers::{ConversationId, MessageId},
    messages::{ChatMessage, ErrorKind, StatusTransition},
};

/// A newly accepted message, published to `chat-events` keyed by its
/// conversation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub message: ChatMessage,
}

/// A status transition, published to `status-updates` keyed by the
/// conversation id so it interleaves in order with its message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub transition: StatusTransition,
}

/// A terminally failed message, published to `chat-events-dlq` with its
/// original payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: ChatMessage,
    pub error_kind: ErrorKind,
    pub reason: String,
}
