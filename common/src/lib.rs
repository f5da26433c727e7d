// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Common data model used by the gateway pipeline and the server.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;
pub mod identifiers;
pub mod messages;
pub mod time;

pub const DEFAULT_PORT_HTTP: u16 = 9420;

/// Maximum length of a text body in Unicode scalar values.
pub const MAX_TEXT_LEN: usize = 10_000;

/// Maximum size of a single file attachment in bytes (2 GiB).
pub const MAX_ATTACHMENT_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Participant bounds for group conversations.
pub const MIN_PARTICIPANTS: usize = 2;
pub const MAX_PARTICIPANTS: usize = 100;

/// Unrecoverable error in this implementation.
#[derive(Debug, Error, Serialize, Deserialize)]
pub struct LibraryError;

impl Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
