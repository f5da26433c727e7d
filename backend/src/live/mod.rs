// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Live delivery hub: fans events out to connected subscribers, keyed by
//! user id.
//!
//! Subscriptions are long-lived; a user may hold several (one per device).
//! Events for one conversation are forwarded in the order they are handed
//! in, which follows the event-log partition order. Offline users receive
//! nothing here; they catch up through history listing.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use couriercommon::{identifiers::UserId, messages::LiveEvent};
use tokio::sync::mpsc;
use tracing::debug;

/// Dispatch for all live subscriptions.
///
/// It keeps the senders of all connected sessions and drops a session when
/// its channel closes.
#[derive(Debug, Default)]
pub struct LiveHub {
    sessions: Mutex<HashMap<UserId, Vec<mpsc::UnboundedSender<LiveEvent>>>>,
}

impl LiveHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a subscription for a user. The returned receiver yields every
    /// event addressed to them while it is alive.
    pub fn subscribe(&self, user_id: UserId) -> mpsc::UnboundedReceiver<LiveEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .lock()
            .unwrap()
            .entry(user_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Whether the user currently holds at least one live subscription.
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.sessions
            .lock()
            .unwrap()
            .get(user_id)
            .is_some_and(|sessions| sessions.iter().any(|tx| !tx.is_closed()))
    }

    /// Pushes an event to all of the user's live sessions. Returns whether
    /// at least one session received it. Closed sessions are pruned.
    pub fn notify(&self, user_id: &UserId, event: LiveEvent) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(senders) = sessions.get_mut(user_id) else {
            return false;
        };
        let mut delivered = false;
        senders.retain(|tx| match tx.send(event.clone()) {
            Ok(()) => {
                delivered = true;
                true
            }
            Err(_) => {
                debug!(%user_id, "dropping closed live session");
                false
            }
        });
        if senders.is_empty() {
            sessions.remove(user_id);
        }
        delivered
    }
}

/// Shared handle used across the pipeline.
pub type SharedLiveHub = Arc<LiveHub>;

#[cfg(test)]
mod tests {
    use couriercommon::{
        identifiers::{Channel, ConversationId, MessageId},
        messages::{ChatMessage, MessageContent},
    };

    use super::*;

    fn event() -> LiveEvent {
        LiveEvent::Message {
            message: ChatMessage::new_outbound(
                MessageId::random(),
                ConversationId::new("c"),
                UserId::random(),
                Vec::new(),
                MessageContent::text("hi"),
                Channel::Internal,
            ),
        }
    }

    #[tokio::test]
    async fn events_reach_all_sessions_of_a_user() {
        let hub = LiveHub::new();
        let user = UserId::random();
        let mut first = hub.subscribe(user);
        let mut second = hub.subscribe(user);
        assert!(hub.is_online(&user));
        assert!(hub.notify(&user, event()));
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_ok());
    }

    #[tokio::test]
    async fn offline_users_receive_nothing() {
        let hub = LiveHub::new();
        let user = UserId::random();
        assert!(!hub.is_online(&user));
        assert!(!hub.notify(&user, event()));
    }

    #[tokio::test]
    async fn dropped_sessions_are_pruned() {
        let hub = LiveHub::new();
        let user = UserId::random();
        let rx = hub.subscribe(user);
        drop(rx);
        assert!(!hub.notify(&user, event()));
        assert!(!hub.is_online(&user));
    }
}
