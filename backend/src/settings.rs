// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::Duration;
use couriercommon::{DEFAULT_PORT_HTTP, MAX_TEXT_LEN, identifiers::UserId};
use serde::Deserialize;

/// Configuration for the gateway.
#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    pub application: ApplicationSettings,
    /// If this isn't present, the gateway runs on in-memory stores (dev and
    /// test mode).
    pub database: Option<DatabaseSettings>,
    #[serde(default)]
    pub event_log: EventLogSettings,
    #[serde(default)]
    pub ingress: IngressSettings,
    #[serde(default)]
    pub router: RouterSettings,
    #[serde(default)]
    pub connectors: ConnectorsSettings,
    /// If this isn't present, the support for attachments is disabled.
    pub storage: Option<StorageSettings>,
}

/// Configuration for the application.
#[derive(Deserialize, Clone, Debug)]
pub struct ApplicationSettings {
    #[serde(default = "default_http_port")]
    pub port: u16,
    pub host: String,
}

fn default_http_port() -> u16 {
    DEFAULT_PORT_HTTP
}

/// Configuration for the database.
#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub host: String,
    pub name: String,
    pub cacertpath: Option<String>,
}

impl DatabaseSettings {
    /// Add the TLS mode to the connection string if the CA certificate path
    /// is set.
    fn add_tls_mode(&self, mut connection_string: String) -> String {
        if let Some(ref ca_cert_path) = self.cacertpath {
            connection_string.push_str(&format!("?sslmode=verify-ca&sslrootcert={ca_cert_path}"));
        } else {
            tracing::warn!(
                "No CA certificate path set for database connection. TLS will not be enabled."
            );
        }
        connection_string
    }

    fn base_connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}",
            self.username, self.password, self.host, self.port
        )
    }

    /// Get the connection string for the database.
    pub fn connection_string(&self) -> String {
        let mut connection_string = self.base_connection_string();
        connection_string.push('/');
        connection_string.push_str(&self.name);
        self.add_tls_mode(connection_string)
    }

    /// Get the connection string without the database name.
    pub fn connection_string_without_database(&self) -> String {
        self.add_tls_mode(self.base_connection_string())
    }
}

/// Configuration for the partitioned event log.
#[derive(Deserialize, Clone, Debug)]
pub struct EventLogSettings {
    /// Number of partitions per stream. Must stay stable across deployments,
    /// since the partitioner is a pure function of key and partition count.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// How long a fetch waits for new records before returning empty.
    #[serde(default = "default_fetch_wait_ms")]
    pub fetch_wait_ms: u64,
    /// Partition lease duration; a worker renews its lease on every fetch
    /// cycle.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Marker TTL of the idempotency cache. Must outlive the worst-case
    /// retry window.
    #[serde(default = "default_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: u64,
}

fn default_partitions() -> u32 {
    10
}

fn default_fetch_wait_ms() -> u64 {
    500
}

fn default_lease_secs() -> u64 {
    30
}

fn default_idempotency_ttl_hours() -> u64 {
    24
}

impl Default for EventLogSettings {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            fetch_wait_ms: default_fetch_wait_ms(),
            lease_secs: default_lease_secs(),
            idempotency_ttl_hours: default_idempotency_ttl_hours(),
        }
    }
}

/// Configuration for message acceptance.
#[derive(Deserialize, Clone, Debug)]
pub struct IngressSettings {
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
    #[serde(default = "default_max_file_refs")]
    pub max_file_refs: usize,
    /// Publish retries after a successful store write. The message stays
    /// PENDING and re-submittable if the budget is exhausted.
    #[serde(default = "default_publish_max_attempts")]
    pub publish_max_attempts: u32,
    #[serde(default = "default_publish_backoff_ms")]
    pub publish_backoff_ms: u64,
    /// If set, inbound messages from unmapped conversations open a
    /// one-to-one conversation with this user.
    pub inbound_inbox: Option<UserId>,
}

fn default_max_text_len() -> usize {
    MAX_TEXT_LEN
}

fn default_max_file_refs() -> usize {
    10
}

fn default_publish_max_attempts() -> u32 {
    10
}

fn default_publish_backoff_ms() -> u64 {
    100
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            max_text_len: default_max_text_len(),
            max_file_refs: default_max_file_refs(),
            publish_max_attempts: default_publish_max_attempts(),
            publish_backoff_ms: default_publish_backoff_ms(),
            inbound_inbox: None,
        }
    }
}

/// Configuration for the router's retry and deadline behaviour.
#[derive(Deserialize, Clone, Debug)]
pub struct RouterSettings {
    /// Attempts per recipient, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Jitter applied to each backoff delay, as a fraction of the delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Deadline for a single outbound dispatch call.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_dispatch_timeout_ms() -> u64 {
    5_000
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter: default_jitter(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

/// Per-platform connector configuration. A platform without a section here
/// is not served by this deployment.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ConnectorsSettings {
    pub whatsapp: Option<WhatsAppSettings>,
    pub telegram: Option<TelegramSettings>,
    pub instagram: Option<InstagramSettings>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WhatsAppSettings {
    pub api_base: String,
    pub phone_number_id: String,
    pub access_token: String,
    /// Application secret used to verify webhook signatures.
    pub app_secret: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelegramSettings {
    pub api_base: String,
    pub bot_token: String,
    /// Shared secret expected in the webhook secret-token header.
    pub webhook_secret: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct InstagramSettings {
    pub api_base: String,
    pub account_id: String,
    pub access_token: String,
    pub app_secret: String,
}

/// Settings for an external object storage provider.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Endpoint for the storage provider
    pub endpoint: String,
    /// Region for the storage provider
    pub region: String,
    /// Access key ID for the storage provider
    pub access_key_id: String,
    /// Secret access key for the storage provider
    pub secret_access_key: String,
    /// Force path style for the storage provider
    #[serde(default)]
    pub force_path_style: bool,
    /// Expiration for signed upload URLs
    ///
    /// Default is 5 minutes.
    #[serde(default = "default_5min", with = "duration_seconds")]
    pub upload_expiration: Duration,
    /// Expiration for signed download URLs
    ///
    /// Default is 5 minutes.
    #[serde(default = "default_5min", with = "duration_seconds")]
    pub download_expiration: Duration,
}

fn default_5min() -> Duration {
    Duration::minutes(5)
}

mod duration_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(seconds))
    }
}
