// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use courierserver::{build_gateway, configurations::get_configuration, telemetry};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = telemetry::get_subscriber("info".into());
    telemetry::init_subscriber(subscriber);

    let settings = get_configuration("")?;
    let address = format!(
        "{}:{}",
        settings.application.host, settings.application.port
    );

    let gateway = build_gateway(settings).await?;
    let app = gateway.router();

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(%address, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining pipeline workers");
    gateway.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to install shutdown signal handler");
    }
}
