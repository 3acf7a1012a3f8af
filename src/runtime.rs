use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::ToolDispatcher;
use crate::exec::registry::SessionRegistry;
use crate::security::allowed_dirs::{DirectoryAllowList, WorkingDirectoryPolicy};
use crate::security::command_gate::CommandGate;
use crate::server::ToolServer;

pub struct ShellGateRuntime {
    config: Config,
    dispatcher: Arc<ToolDispatcher>,
}

impl ShellGateRuntime {
    pub async fn new(config: Config) -> Result<Self> {
        let dispatcher = build_dispatcher(&config).await?;
        Ok(Self { config, dispatcher })
    }

    pub async fn run(self) -> Result<()> {
        info!(
            "starting shellgate (bind={}, http_bind={}, shell={}, default_timeout_ms={}, grace_ms={}, blocklist={})",
            self.config.server.bind,
            self.config.server.http_bind.as_deref().unwrap_or("off"),
            self.config.exec.shell,
            self.config.exec.default_timeout_ms,
            self.config.exec.termination_grace_ms,
            self.config.security.blocklist_path.display()
        );

        let server = ToolServer::new(
            self.config.server.clone(),
            self.config.exec.sweep_interval_ms,
            self.dispatcher.clone(),
        );
        server
            .run_until(async {
                match signal::ctrl_c().await {
                    Ok(()) => info!("received ctrl-c, shutting down"),
                    Err(err) => {
                        warn!("ctrl-c handler unavailable: {err}");
                        std::future::pending::<()>().await;
                    }
                }
            })
            .await
    }
}

/// Wires the blocklist, directory allow-list and session registry into one
/// dispatcher. Shared by the server and the one-shot CLI commands.
pub async fn build_dispatcher(config: &Config) -> Result<Arc<ToolDispatcher>> {
    let gate = Arc::new(
        CommandGate::load(
            config.security.blocklist_path.clone(),
            &config.security.default_blocked_commands,
        )
        .await?,
    );
    let directories: Arc<dyn WorkingDirectoryPolicy> = Arc::new(DirectoryAllowList::new(
        &config.security.allowed_directories,
    )?);
    let registry = SessionRegistry::new(config.exec.clone(), gate.clone(), directories.clone());
    Ok(Arc::new(ToolDispatcher::new(registry, gate, directories)))
}
