use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use warmgate::admin::{PKG_NAME, VERSION};
use warmgate::backup::BackupReconciler;
use warmgate::config::{Config, SleepPolicy};
use warmgate::env::GatewayEnv;
use warmgate::gateway_config::ProviderSelection;
use warmgate::proxy::{ProxyServer, ProxyState};
use warmgate::sandbox::LocalSandbox;
use warmgate::scheduler::{self, IDLE_CHECK_INTERVAL};
use warmgate::storage::DirStore;
use warmgate::supervisor::GatewaySupervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warmgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration; without an explicit path a missing file means defaults
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file, using defaults");
        let config = Config::default();
        config.validate()?;
        config
    } else {
        Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?
    };

    let env = GatewayEnv::from_env();
    if let Some(raw) = env.sleep_after() {
        match raw.parse::<SleepPolicy>() {
            Ok(policy) => config.gateway.sleep_after = policy,
            Err(e) => warn!(value = raw, error = %e, "Ignoring invalid SLEEP_AFTER"),
        }
    }

    print_startup_banner(&config, &env);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sandbox = LocalSandbox::new();
    let supervisor = GatewaySupervisor::new(sandbox, config.gateway.clone(), env);

    // Restore before the push timer is armed so the two never overlap
    let backup = if config.backup.enabled {
        let store = Arc::new(DirStore::new(config.backup.root.clone()));
        let reconciler = Arc::new(BackupReconciler::new(
            store,
            config.backup.clone(),
            &config.gateway,
        ));
        // Outcome is logged by the reconciler
        reconciler.restore().await;

        tokio::spawn(scheduler::backup_loop(
            Arc::clone(&reconciler),
            config.backup.interval(),
            shutdown_rx.clone(),
        ));
        Some(reconciler)
    } else {
        info!("Backup disabled");
        None
    };

    tokio::spawn(scheduler::idle_loop(
        Arc::clone(&supervisor),
        config.gateway.sleep_after,
        IDLE_CHECK_INTERVAL,
        shutdown_rx.clone(),
    ));

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let state = ProxyState::new(&config, Arc::clone(&supervisor), backup);
    let proxy = ProxyServer::new(bind_addr, state, shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    info!("Stopping gateway...");
    supervisor.stop().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, env: &GatewayEnv) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        command = %config.gateway.command,
        host = %config.gateway.host,
        port = config.gateway.port,
        startup_timeout_secs = config.gateway.startup_timeout_secs,
        sleep_after = ?config.gateway.sleep_after,
        "Gateway settings"
    );
    info!(
        provider = ProviderSelection::from_env(env).label(),
        dev_mode = env.dev_mode(),
        debug_routes = env.debug_routes(),
        token = env.gateway_token().is_some(),
        "Gateway environment"
    );
    if config.backup.enabled {
        info!(
            root = %config.backup.root.display(),
            interval_secs = config.backup.interval_secs,
            "Backup settings"
        );
    }
}
