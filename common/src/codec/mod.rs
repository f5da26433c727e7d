// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Versioned codec for persisted blobs and event-log payloads.

use serde::{Serialize, de::DeserializeOwned};

mod error;
mod persistence;

pub use error::Error;
pub use persistence::{BlobDecoded, BlobEncoded};

/// Codec used for all persisted blobs.
///
/// The first byte of every encoded blob is the codec version, so the format
/// can be migrated without a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[non_exhaustive]
pub enum CourierCodec {
    #[default]
    V1 = 1,
}

impl TryFrom<u8> for CourierCodec {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CourierCodec::V1),
            _ => Err(Error::UnknownCodecVersion),
        }
    }
}

impl CourierCodec {
    fn serialize_to_writer<T: Serialize>(
        &self,
        value: &T,
        writer: &mut impl std::io::Write,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        // The first byte is always the codec version
        writer.write_all(&[*self as u8])?;
        match self {
            CourierCodec::V1 => ciborium::ser::into_writer(value, writer)?,
        }
        Ok(())
    }

    pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        CourierCodec::default()
            .serialize_to_writer(value, &mut buf)
            .map_err(Error::SerializationError)?;
        Ok(buf)
    }

    pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
        let (version, payload) = bytes.split_first().ok_or(Error::NoCodecVersion)?;
        let codec = CourierCodec::try_from(*version)?;
        match codec {
            CourierCodec::V1 => ciborium::de::from_reader(payload)
                .map_err(|e| Error::DeserializationError(Box::new(e))),
        }
    }
}

/// Codec used by the sqlx [`BlobEncoded`]/[`BlobDecoded`] adapters.
pub(crate) type PersistenceCodec = CourierCodec;

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        count: u64,
    }

    #[test]
    fn round_trip() {
        let value = Probe {
            name: "probe".to_owned(),
            count: 17,
        };
        let bytes = CourierCodec::to_vec(&value).unwrap();
        assert_eq!(bytes[0], CourierCodec::V1 as u8);
        let decoded: Probe = CourierCodec::from_slice(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let bytes = [42u8, 0, 0];
        let result: Result<Probe, _> = CourierCodec::from_slice(&bytes);
        assert!(matches!(result, Err(Error::UnknownCodecVersion)));
    }

    #[test]
    fn empty_blob_is_rejected() {
        let result: Result<Probe, _> = CourierCodec::from_slice(&[]);
        assert!(matches!(result, Err(Error::NoCodecVersion)));
    }
}
