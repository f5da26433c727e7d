// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The live delivery channel: one WebSocket per subscription, text-framed
//! JSON events in per-conversation order.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use couriercommon::identifiers::UserId;
use serde::Deserialize;
use tracing::{debug, info};

use super::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WsParams {
    user_id: UserId,
}

pub(super) async fn ws_chat(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user_id: UserId) {
    info!(%user_id, "live subscription opened");
    let mut events = state.live.subscribe(user_id);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(error) => {
                        debug!(%error, "dropping unserializable live event");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Clients only listen on this channel; pings are handled
                    // by the protocol layer, anything else is ignored.
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(%error, %user_id, "live socket error");
                        break;
                    }
                }
            }
        }
    }
    info!(%user_id, "live subscription closed");
}
