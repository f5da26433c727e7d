// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The blob is empty and carries no codec version byte.
    #[error("Missing codec version")]
    NoCodecVersion,
    /// The version byte does not correspond to a known codec version.
    #[error("Unknown codec version")]
    UnknownCodecVersion,
    #[error("Error serializing value: {0}")]
    SerializationError(Box<dyn std::error::Error + Send + Sync + 'static>),
    #[error("Error deserializing value: {0}")]
    DeserializationError(Box<dyn std::error::Error + Send + Sync + 'static>),
}
