// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use courierbackend::connector::WebhookHeaders;
use couriercommon::identifiers::Platform;
use serde::Serialize;

use super::{ApiError, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WebhookResponse {
    accepted_messages: usize,
    status_updates: usize,
}

/// Raw platform callback. The connector verifies the signature; unverified
/// payloads are rejected with 401 so the platform retries.
pub(super) async fn receive(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let platform: Platform = platform
        .parse()
        .map_err(|_| ApiError::not_found(format!("unknown platform: {platform}")))?;
    let webhook_headers: WebhookHeaders = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_owned(), value.to_owned()))
        })
        .collect();
    let receipt = state
        .webhooks
        .ingest(platform, &webhook_headers, &body)
        .await?;
    Ok(Json(WebhookResponse {
        accepted_messages: receipt.accepted_messages,
        status_updates: receipt.status_updates,
    }))
}
