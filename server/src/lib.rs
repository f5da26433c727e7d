// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP surface and process wiring of the messaging gateway.

use std::{sync::Arc, time::Duration};

use courierbackend::{
    backend_service::{BackendService, connect},
    connector::{
        CircuitBreakerConfig, ConnectorRegistry, InstagramConnector, RateLimitConfig,
        TelegramConnector, WhatsAppConnector,
    },
    errors::ServiceCreationError,
    event_log::{EventLog, PostgresEventLog, memory::MemoryEventLog},
    files::{
        FileService, FileServiceError, FileStore, MemoryFileStore, PgFileStore,
        storage_from_settings,
    },
    idempotency::{IdempotencyStore, MemoryIdempotencyStore, PgIdempotencyStore},
    identity_service::{IdentityService, IdentityStore, memory::MemoryIdentityStore},
    ingress::{Ingress, WebhookIntake},
    live::{LiveHub, SharedLiveHub},
    message_store::{MessageService, MessageStore, memory::MemoryMessageStore},
    router::Router,
    settings::Settings,
    status_propagator::StatusPropagator,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod configurations;
pub mod endpoints;
pub mod telemetry;

pub use endpoints::AppState;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    ServiceCreation(#[from] ServiceCreationError),
    #[error(transparent)]
    Files(#[from] FileServiceError),
}

/// The wired gateway: shared state for the HTTP layer plus the background
/// pipeline workers.
pub struct Gateway {
    pub state: AppState,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub fn router(&self) -> axum::Router {
        endpoints::router(self.state.clone())
    }

    /// Drains the pipeline workers. Uncommitted records replay on the next
    /// start and are deduplicated.
    pub async fn stop(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Builds all services from the settings and spawns the pipeline. With no
/// database configured, everything runs on in-memory providers.
pub async fn build_gateway(settings: Settings) -> Result<Gateway, StartupError> {
    let (identity, store, log, idempotency, file_store) = build_providers(&settings).await?;

    let storage = storage_from_settings(settings.storage.as_ref()).await?;
    let files = FileService::new(file_store, storage);

    let http = reqwest::Client::new();
    let mut registry = ConnectorRegistry::new();
    if let Some(whatsapp) = settings.connectors.whatsapp.clone() {
        registry.register(
            Arc::new(WhatsAppConnector::new(whatsapp, http.clone(), files.clone())),
            CircuitBreakerConfig::default(),
            RateLimitConfig::default(),
        );
    }
    if let Some(telegram) = settings.connectors.telegram.clone() {
        registry.register(
            Arc::new(TelegramConnector::new(telegram, http.clone(), files.clone())),
            CircuitBreakerConfig::default(),
            RateLimitConfig::default(),
        );
    }
    if let Some(instagram) = settings.connectors.instagram.clone() {
        registry.register(
            Arc::new(InstagramConnector::new(instagram, http.clone(), files.clone())),
            CircuitBreakerConfig::default(),
            RateLimitConfig::default(),
        );
    }
    let registry = Arc::new(registry);
    for (platform, result) in registry.validate_all().await {
        match result {
            Ok(()) => info!(%platform, "connector credentials validated"),
            Err(_) => {} // already logged by the registry
        }
    }

    let live: SharedLiveHub = Arc::new(LiveHub::new());

    let ingress = Arc::new(Ingress::new(
        store.clone(),
        log.clone(),
        idempotency.clone(),
        files.clone(),
        settings.ingress.clone(),
    ));
    let webhooks = Arc::new(WebhookIntake::new(
        registry.clone(),
        ingress.clone(),
        identity.clone(),
        store.clone(),
        log.clone(),
    ));

    let shutdown = CancellationToken::new();
    let fetch_wait = Duration::from_millis(settings.event_log.fetch_wait_ms);
    let lease = Duration::from_secs(settings.event_log.lease_secs);

    let router = Arc::new(Router::new(
        store.clone(),
        identity.clone(),
        log.clone(),
        registry.clone(),
        live.clone(),
        settings.router.clone(),
    ));
    let mut workers = router.spawn(fetch_wait, lease, shutdown.clone());

    let propagator = Arc::new(StatusPropagator::new(
        store.clone(),
        log.clone(),
        live.clone(),
    ));
    workers.extend(propagator.spawn(fetch_wait, lease, shutdown.clone()));

    info!(
        partitions = settings.event_log.partitions,
        platforms = ?registry.platforms(),
        "pipeline started"
    );

    let state = AppState {
        identity,
        store,
        ingress,
        webhooks,
        files,
        live,
    };
    Ok(Gateway {
        state,
        shutdown,
        workers,
    })
}

type Providers = (
    Arc<dyn IdentityStore>,
    Arc<dyn MessageStore>,
    Arc<dyn EventLog>,
    Arc<dyn IdempotencyStore>,
    Arc<dyn FileStore>,
);

async fn build_providers(settings: &Settings) -> Result<Providers, StartupError> {
    match &settings.database {
        Some(database) => {
            let pool = connect(database).await?;
            let identity = IdentityService::initialize(pool.clone()).await?;
            let store = MessageService::initialize(pool.clone()).await?;
            let log = PostgresEventLog::initialize(pool.clone())
                .await?
                .with_partitions(settings.event_log.partitions);
            let idempotency = PgIdempotencyStore::initialize(pool.clone())
                .await?
                .with_ttl(chrono::Duration::hours(
                    settings.event_log.idempotency_ttl_hours as i64,
                ));
            let file_store = PgFileStore::initialize(pool).await?;
            Ok((
                Arc::new(identity),
                Arc::new(store),
                Arc::new(log),
                Arc::new(idempotency),
                Arc::new(file_store),
            ))
        }
        None => {
            info!("no database configured; running on in-memory providers");
            Ok((
                Arc::new(MemoryIdentityStore::new()),
                Arc::new(MemoryMessageStore::new()),
                Arc::new(MemoryEventLog::new(settings.event_log.partitions)),
                Arc::new(MemoryIdempotencyStore::default()),
                Arc::new(MemoryFileStore::new()),
            ))
        }
    }
}
