//! Keystone server binary.
//!
//! Boots the interception core against the configured build, puts the
//! reference WebSocket host in front of it and runs until a termination
//! signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::Context;
use clap::Parser;
use cli::CliArgs;
use config::AppConfig;
use keystone_core::{variants, Core, CoreError, ImplementationCatalog, TickLoop};
use keystone_host::HostServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

// ============================================================================
// Application
// ============================================================================

pub struct Application {
    config: AppConfig,
    tick_loop: Arc<TickLoop>,
    core: Arc<Core>,
    server: Arc<HostServer>,
}

impl Application {
    /// Loads configuration, initialises logging and boots the core.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration and, fatally, when the configured
    /// build does not resolve to a known revision.
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        // Apply CLI overrides
        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }
        if let Some(build_version) = args.build_version {
            config.build.version = build_version;
        }

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

        logging::setup_logging(&config.logging);
        display_banner();

        let tick_loop = Arc::new(TickLoop::spawn(config.tick_interval())?);

        let mut catalog = ImplementationCatalog::new();
        variants::install_builtin(&mut catalog);
        info!("📚 {} implementations registered", catalog.len());

        let core = match Core::bootstrap(
            config.build_identity(),
            tick_loop.clone(),
            catalog,
            config.to_core_config()?,
        ) {
            Ok(core) => Arc::new(core),
            Err(CoreError::Revision(e)) => {
                error!("❌ {}; refusing to start", e);
                tick_loop.shutdown();
                return Err(e).context("revision resolution");
            }
            Err(e) => {
                tick_loop.shutdown();
                return Err(e.into());
            }
        };

        let server = Arc::new(HostServer::new(config.to_host_config()?, core.clone()));

        info!(
            "📂 Config: {} | Build: {}",
            args.config_path.display(),
            config.build.version
        );

        Ok(Self {
            config,
            tick_loop,
            core,
            server,
        })
    }

    /// Serves until a termination signal, then shuts down in order: stop
    /// accepting, release every interceptor, stop the main thread.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("🌟 Starting Keystone");
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!("  🧬 Revision: {}", self.core.resolve_revision());
        info!(
            "  👥 Max connections: {}",
            self.config.server.max_connections
        );
        info!(
            "  ⏱️ Dispatch timeout: {}ms ({} on timeout)",
            self.config.core.dispatch_timeout_ms, self.config.core.timeout_policy
        );

        let server_handle = {
            let server = self.server.clone();
            tokio::spawn(async move { server.start().await })
        };

        let monitoring_handle = {
            let core = self.core.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let stats = core.dispatch_stats();
                    info!(
                        "📊 {} connections | {} dispatched | {} skipped | {} cancelled | {} timed out",
                        core.connections().len(),
                        stats.dispatched,
                        stats.skipped,
                        stats.cancelled,
                        stats.timed_out
                    );
                }
            })
        };

        info!("🛑 Press Ctrl+C to gracefully shutdown");

        tokio::select! {
            signal = signals::wait_for_shutdown_signal() => {
                signal.context("installing signal handlers")?;
                info!("🛑 Shutdown signal received, initiating graceful shutdown...");
            }
            _ = server_finished(&server_handle) => {
                warn!("Server stopped on its own");
            }
        }

        monitoring_handle.abort();
        self.server.shutdown();

        let outcome = match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
            Ok(Ok(result)) => result.map_err(anyhow::Error::from),
            Ok(Err(e)) => Err(anyhow::anyhow!("server task failed: {e}")),
            Err(_) => {
                warn!("⏳ Server did not stop within 5s");
                self.core.shutdown();
                Ok(())
            }
        };

        self.tick_loop.shutdown();

        let stats = self.core.dispatch_stats();
        info!("📊 Final Statistics:");
        info!("  - Events dispatched: {}", stats.dispatched);
        info!("  - Events cancelled: {}", stats.cancelled);
        info!("  - Timed out: {}", stats.timed_out);
        info!("  - Consumer errors: {}", stats.consumer_errors);
        info!("✅ Keystone shutdown complete");

        outcome
    }
}

/// Resolves once the server task has finished, without consuming it.
async fn server_finished<T>(handle: &tokio::task::JoinHandle<T>) {
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {:?}", e);
            std::process::exit(1);
        }
    }
}

/// Display startup banner using proper logging
fn display_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("╔══════════════════════════════════════════╗");
    info!("║              🔑 KEYSTONE 🔑              ║");
    info!("║                 v{:<8}                ║", version);
    info!("║                                          ║");
    info!("║  Version-adaptive packet interception    ║");
    info!("╚══════════════════════════════════════════╝");
}
