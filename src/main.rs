//! Courier - outbound messaging-gateway connection manager

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier::{
    config::Args,
    server::{self, StatusState},
    transport::{Connector, DryRunConnector},
    GatewayFacade,
};

/// How long shutdown waits for queued messages
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("courier={},info", args.log_level).into());
    if args.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = args.gateway.to_config();

    info!("======================================");
    info!("  Courier - messaging gateway sessions");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT (dry-run transport)" } else { "PRODUCTION" });
    info!("Clients: {}", config.client_ids.join(", "));
    info!("Session storage: {}", config.auth_data_path.display());
    info!("Ready timeout: {}ms", config.ready_timeout.as_millis());
    info!("Connect timeout: {}ms", config.connect_timeout.as_millis());
    info!("Admin targets: {}", config.admin_targets.len());
    info!("======================================");

    if !args.dev_mode {
        error!("No gateway transport is linked into this build; set DEV_MODE=true to run with the dry-run transport");
        std::process::exit(1);
    }
    let connector: Arc<dyn Connector> = Arc::new(DryRunConnector::new());

    let gateway = Arc::new(GatewayFacade::new(config, connector)?);

    if args.skip_init {
        warn!("WA_SERVICE_SKIP_INIT set - clients registered without connecting");
    } else {
        for client in gateway.clients() {
            tokio::spawn(async move {
                if let Err(e) = client.connect().await {
                    warn!(client_id = %client.client_id(), "Initial connect failed: {}", e);
                }
            });
        }

        if args.fail_fast_on_init {
            for client in gateway.clients() {
                let _ = client.wait_for_ready(None).await;
            }
            let issues = gateway.init_issues();
            if !issues.is_empty() {
                for issue in &issues {
                    error!(
                        client_id = %issue.client_id,
                        kind = ?issue.kind,
                        "Client not ready: {} ({})",
                        issue.detail,
                        issue.remediation
                    );
                }
                anyhow::bail!("{} client(s) failed to initialize", issues.len());
            }
        }
    }

    gateway.notify_admins("Courier started");

    let status = Arc::new(StatusState::new(Arc::clone(&gateway), args.skip_init));
    tokio::select! {
        result = server::run(args.listen, status) => {
            if let Err(e) = result {
                error!("Status server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, gateway.wait_for_all_queues()).await.is_err() {
        warn!("Send queues did not drain within {:?}", DRAIN_TIMEOUT);
    }
    gateway.shutdown().await;
    Ok(())
}
