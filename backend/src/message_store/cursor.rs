// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use couriercommon::{codec::CourierCodec, identifiers::MessageId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque pagination cursor. Encodes the sort position of the last returned
/// message and round-trips through its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub message_id: MessageId,
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("Malformed cursor")]
    Malformed,
}

impl Cursor {
    pub fn encode(&self) -> String {
        // Encoding a plain (timestamp, id) pair cannot fail.
        let bytes = CourierCodec::to_vec(self).expect("cursor encoding failed");
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn decode(s: &str) -> Result<Self, CursorError> {
        let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|_| CursorError::Malformed)?;
        CourierCodec::from_slice(&bytes).map_err(|_| CursorError::Malformed)
    }
}
