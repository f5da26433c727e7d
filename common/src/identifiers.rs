// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifiers used across the pipeline.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::{Database, Decode, Encode, Type, encode::IsNull, error::BoxDynError};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

/// Internal user identity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[sqlx(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Message identity. Client-suppliable; collision-resistant when assigned by
/// the gateway.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[sqlx(transparent)]
pub struct MessageId(Uuid);

/// Namespace for deriving message ids from platform-native message ids, so
/// webhook retries map to the same internal message.
const INBOUND_MESSAGE_NAMESPACE: Uuid = Uuid::from_bytes([
    0x7b, 0x1e, 0x42, 0x09, 0x9c, 0x5d, 0x4a, 0x11, 0x8f, 0x6e, 0x2d, 0x0a, 0x55, 0x93, 0xc4, 0x71,
]);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives a stable message id from a platform message id.
    pub fn from_platform(platform: Platform, platform_message_id: &str) -> Self {
        let name = format!("{platform}:{platform_message_id}");
        Self(Uuid::new_v5(&INBOUND_MESSAGE_NAMESPACE, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// File attachment identity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[sqlx(transparent)]
pub struct AttachmentId(Uuid);

impl AttachmentId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for AttachmentId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AttachmentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Conversation identity; opaque string, also the partition key of the event
/// log.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
)]
#[sqlx(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// External messaging platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    WhatsApp,
    Telegram,
    Instagram,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::WhatsApp, Platform::Telegram, Platform::Instagram];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WhatsApp => "whatsapp",
            Platform::Telegram => "telegram",
            Platform::Instagram => "instagram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("Unknown platform: {0}")]
pub struct PlatformParseError(String);

impl FromStr for Platform {
    type Err = PlatformParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Platform::WhatsApp),
            "telegram" => Ok(Platform::Telegram),
            "instagram" => Ok(Platform::Instagram),
            other => Err(PlatformParseError(other.to_owned())),
        }
    }
}

impl<DB: Database> Type<DB> for Platform
where
    String: Type<DB>,
{
    fn type_info() -> DB::TypeInfo {
        <String as Type<DB>>::type_info()
    }
}

impl<'r, DB: Database> Encode<'r, DB> for Platform
where
    String: Encode<'r, DB>,
{
    fn encode_by_ref(
        &self,
        buf: &mut <DB as Database>::ArgumentBuffer<'r>,
    ) -> Result<IsNull, BoxDynError> {
        Encode::<DB>::encode(self.to_string(), buf)
    }
}

impl<'r, DB: Database> Decode<'r, DB> for Platform
where
    &'r str: Decode<'r, DB>,
{
    fn decode(value: <DB as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let s: &str = Decode::<DB>::decode(value)?;
        let platform = s.parse().map_err(|error: PlatformParseError| {
            error!(%error, "Error parsing platform from DB");
            sqlx::Error::Decode(Box::new(error))
        })?;
        Ok(platform)
    }
}

/// The channel a sender targets: a specific platform, or INTERNAL for no
/// external hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    Internal,
    Platform(Platform),
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Internal => "internal",
            Channel::Platform(platform) => platform.as_str(),
        }
    }

    /// The platform restriction this channel imposes on recipient
    /// resolution, if any.
    pub fn platform(&self) -> Option<Platform> {
        match self {
            Channel::Internal => None,
            Channel::Platform(platform) => Some(*platform),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Channel {
    type Err = PlatformParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "internal" {
            Ok(Channel::Internal)
        } else {
            Ok(Channel::Platform(s.parse()?))
        }
    }
}

impl TryFrom<String> for Channel {
    type Error = PlatformParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(value: Channel) -> Self {
        value.as_str().to_owned()
    }
}

impl<DB: Database> Type<DB> for Channel
where
    String: Type<DB>,
{
    fn type_info() -> DB::TypeInfo {
        <String as Type<DB>>::type_info()
    }
}

impl<'r, DB: Database> Encode<'r, DB> for Channel
where
    String: Encode<'r, DB>,
{
    fn encode_by_ref(
        &self,
        buf: &mut <DB as Database>::ArgumentBuffer<'r>,
    ) -> Result<IsNull, BoxDynError> {
        Encode::<DB>::encode(self.to_string(), buf)
    }
}

impl<'r, DB: Database> Decode<'r, DB> for Channel
where
    &'r str: Decode<'r, DB>,
{
    fn decode(value: <DB as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let s: &str = Decode::<DB>::decode(value)?;
        let channel = s.parse().map_err(|error: PlatformParseError| {
            error!(%error, "Error parsing channel from DB");
            sqlx::Error::Decode(Box::new(error))
        })?;
        Ok(channel)
    }
}

/// A platform-qualified handle. Canonical text form is `<platform>:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformAddress {
    pub platform: Platform,
    pub platform_user_id: String,
}

impl PlatformAddress {
    pub fn new(platform: Platform, platform_user_id: impl Into<String>) -> Self {
        Self {
            platform,
            platform_user_id: platform_user_id.into(),
        }
    }
}

impl fmt::Display for PlatformAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.platform_user_id)
    }
}

/// A message recipient as given to the gateway: either an internal user id or
/// a platform-native handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecipientRef {
    User(UserId),
    Address(PlatformAddress),
}

#[derive(Debug, Clone, Error)]
pub enum RecipientParseError {
    /// Not a user id, not `<platform>:<id>`, and the channel gives no
    /// platform to type a raw handle with.
    #[error("Unresolvable recipient reference: {0}")]
    Unresolvable(String),
    #[error("Empty recipient reference")]
    Empty,
}

impl RecipientRef {
    /// Parses a recipient reference.
    ///
    /// A UUID is an internal user id. `<platform>:<id>` is a qualified
    /// handle. A bare string is accepted as a platform handle when the send
    /// channel names a platform.
    pub fn parse(s: &str, channel: Channel) -> Result<Self, RecipientParseError> {
        if s.is_empty() {
            return Err(RecipientParseError::Empty);
        }
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(RecipientRef::User(uuid.into()));
        }
        if let Some((platform, id)) = s.split_once(':')
            && let Ok(platform) = platform.parse::<Platform>()
            && !id.is_empty()
        {
            return Ok(RecipientRef::Address(PlatformAddress::new(platform, id)));
        }
        match channel.platform() {
            Some(platform) => Ok(RecipientRef::Address(PlatformAddress::new(platform, s))),
            None => Err(RecipientParseError::Unresolvable(s.to_owned())),
        }
    }
}

impl fmt::Display for RecipientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipientRef::User(user_id) => write!(f, "{user_id}"),
            RecipientRef::Address(address) => write!(f, "{address}"),
        }
    }
}

impl From<UserId> for RecipientRef {
    fn from(value: UserId) -> Self {
        RecipientRef::User(value)
    }
}

impl From<PlatformAddress> for RecipientRef {
    fn from(value: PlatformAddress) -> Self {
        RecipientRef::Address(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trip() {
        for platform in Platform::ALL {
            let parsed: Platform = platform.as_str().parse().unwrap();
            assert_eq!(parsed, platform);
        }
        assert!("smoke-signals".parse::<Platform>().is_err());
    }

    #[test]
    fn channel_round_trip() {
        for s in ["internal", "whatsapp", "telegram", "instagram"] {
            let channel: Channel = s.parse().unwrap();
            assert_eq!(channel.as_str(), s);
        }
    }

    #[test]
    fn recipient_user_id() {
        let user_id = UserId::random();
        let parsed = RecipientRef::parse(&user_id.to_string(), Channel::Internal).unwrap();
        assert_eq!(parsed, RecipientRef::User(user_id));
    }

    #[test]
    fn recipient_qualified_handle() {
        let parsed = RecipientRef::parse("whatsapp:+5562999999999", Channel::Internal).unwrap();
        assert_eq!(
            parsed,
            RecipientRef::Address(PlatformAddress::new(Platform::WhatsApp, "+5562999999999"))
        );
    }

    #[test]
    fn recipient_raw_handle_needs_platform_channel() {
        let raw = "+5562999999999";
        let parsed =
            RecipientRef::parse(raw, Channel::Platform(Platform::WhatsApp)).unwrap();
        assert_eq!(
            parsed,
            RecipientRef::Address(PlatformAddress::new(Platform::WhatsApp, raw))
        );
        assert!(matches!(
            RecipientRef::parse(raw, Channel::Internal),
            Err(RecipientParseError::Unresolvable(_))
        ));
    }

    #[test]
    fn inbound_message_id_is_stable() {
        let a = MessageId::from_platform(Platform::Telegram, "msg-1");
        let b = MessageId::from_platform(Platform::Telegram, "msg-1");
        let c = MessageId::from_platform(Platform::WhatsApp, "msg-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
