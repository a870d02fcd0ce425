use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use ranger_discovery::{
    logging, Config, ConnectionManager, HealthFlag, InstanceDescriptor, InstanceProvider,
    MemoryEnsemble, ServiceRegistration,
};

const DEFAULT_PORT: u16 = 8080;

#[derive(Parser)]
#[command(name = "ranger")]
#[command(about = "Service registration and discovery client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "RANGER_CONFIG")]
    config: Option<String>,

    /// Number of instances to resolve and print
    #[arg(short, long, default_value_t = 10)]
    selections: usize,

    /// Keep the registration alive until Ctrl+C or SIGTERM
    #[arg(long)]
    serve: bool,
}

/// Hostname of this machine, `localhost` when it cannot be read
fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn instance_descriptor(config: &Config, health: Arc<HealthFlag>) -> InstanceDescriptor {
    let instance = &config.instance;
    let service_name = if instance.service_name.is_empty() {
        config.provider.service_name.clone()
    } else {
        instance.service_name.clone()
    };
    let host = if instance.host.is_empty() {
        local_hostname()
    } else {
        instance.host.clone()
    };
    let port = if instance.port == 0 { DEFAULT_PORT } else { instance.port };

    InstanceDescriptor::new(service_name, host, port)
        .with_environment(instance.environment.clone())
        .with_secure(instance.secure)
        .with_health_check(health)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if config.provider.service_name.is_empty() {
        config.provider.service_name.clone_from(&config.instance.service_name);
    }
    if config.provider.service_name.is_empty() {
        return Err(anyhow::anyhow!(
            "provider.service_name or instance.service_name must be configured"
        ));
    }

    // 2. Validate configuration (fail fast, report every problem)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Ranger starting...");
    info!("Connection string: {}", config.connection.connection_string);
    info!("Base path: {}", config.base_path());

    // 4. Connect. The embedded ensemble stands in for the coordination store.
    let ensemble = MemoryEnsemble::new();
    let settings = config.connection.settings();
    let rounds = u32::try_from(settings.retry_count).unwrap_or(u32::MAX);
    let connect_timeout = settings.connect_timeout * rounds;
    let connection = Arc::new(ConnectionManager::new(settings, Arc::new(ensemble.connector())));
    connection.start()?;
    connection
        .wait_until_connected(connect_timeout.max(Duration::from_secs(1)))
        .await
        .context("Coordination store unreachable")?;

    // 5. Advertise this process
    let health = Arc::new(HealthFlag::new(true));
    let registration = ServiceRegistration::new(
        connection.clone(),
        &config.discovery.base_path,
        instance_descriptor(&config, health.clone()),
        config.discovery.refresh_interval(),
    );
    let node_path = registration.register().await?;
    info!("Registered instance at {node_path}");

    // 6. Resolve
    let provider = InstanceProvider::new(
        connection.clone(),
        &config.discovery.base_path,
        config.provider.service_name.clone(),
        config.provider_options(),
    );
    provider.init().await?;

    for _ in 0..cli.selections {
        match provider.get_instance() {
            Ok(instance) => println!("{}", serde_json::to_string(&instance)?),
            Err(e) => warn!("Selection failed: {e}"),
        }
    }

    if cli.serve {
        info!("Serving until shutdown signal");
        shutdown_signal().await;
    }

    // 7. Graceful shutdown
    health.set_healthy(false);
    if let Err(e) = registration.refresh().await {
        warn!("Failed to publish unhealthy status: {e}");
    }
    provider.shutdown();
    if let Err(e) = registration.unregister(&node_path).await {
        error!("Failed to unregister {node_path}: {e}");
    }
    connection.close().await;
    info!("Ranger stopped");

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
