pub mod args;
pub mod bridge;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fabric;
pub mod registry;
pub mod runtime;
mod server;
pub mod spawn;
pub mod wire;

pub use bridge::Bridge;
pub use client::GatewayClient;
pub use error::GatewayError;
pub use registry::ProcessRegistry;
pub use spawn::Spawner;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use flowgate_types::config::GatewayConfig;

use dispatch::{Dispatch, DriverTable};
use fabric::{Fabric, TcpFabric};
use runtime::{Launcher, WorkerLauncher};
use server::Services;

/// The running gateway: an RPC listener in front of the fabric, plus every
/// process it spawned on behalf of clients.
pub struct Gateway {
    name: String,
    identity: String,
    local_addr: SocketAddr,
    registry: ProcessRegistry,
    shutdown: CancellationToken,
    ready: AtomicBool,
    stopped: AtomicBool,
}

impl Gateway {
    /// Start with the TCP fabric and worker binary named in `config`.
    pub async fn start(config: GatewayConfig) -> Result<Self> {
        let fabric = Arc::new(TcpFabric::new(config.fabric.address(), config.max_message_size));
        let launcher = Arc::new(WorkerLauncher::locate(&config.worker.program));
        Self::start_with(config, fabric, Arc::new(DriverTable::new()), launcher).await
    }

    /// Start with explicit collaborators. Binding the listener is the only
    /// fatal step; once this returns the gateway accepts calls.
    pub async fn start_with(
        config: GatewayConfig,
        fabric: Arc<dyn Fabric>,
        dispatch: Arc<dyn Dispatch>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        if config.allow_spawn {
            warn!(
                "SECURITY ALERT! {} accepts spawn requests from remote clients, \
                 anyone who can reach it can start processes on this host",
                config.name
            );
        }

        let identity = if config.identity.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            config.identity.clone()
        };

        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {} to {address}", config.name))?;
        let local_addr = listener.local_addr()?;

        let registry = ProcessRegistry::new();
        let services = Arc::new(Services {
            bridge: Bridge::new(
                fabric,
                dispatch,
                identity.clone(),
                Duration::from_millis(config.sleep_ms),
            ),
            spawner: Spawner::new(config.allow_spawn, local_addr.to_string(), registry.clone(), launcher),
            max_message_size: config.max_message_size,
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(server::serve(listener, services, shutdown.clone()));
        info!("{} is listening at: {local_addr}", config.name);

        Ok(Self {
            name: config.name,
            identity,
            local_addr,
            registry,
            shutdown,
            ready: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity this gateway presents on the fabric.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// True from a successful start until [`Gateway::stop`].
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Stop the listener, then close every spawned process. Calling it again
    /// does nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ready.store(false, Ordering::Release);
        self.shutdown.cancel();
        self.registry.close_all();
        info!("{} terminated", self.name);
    }

    /// Block until the gateway is stopped or the process is interrupted.
    /// Stopping after an interrupt is left to the caller.
    pub async fn join(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => info!("{} interrupted", self.name),
                Err(e) => {
                    warn!("Failed to listen for interrupts: {e}");
                    self.shutdown.cancelled().await;
                }
            },
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.stop();
    }
}

const PROXY_VARS: [&str; 4] = ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY"];

/// Unset the `http(s)_proxy` variables for this process, for gateways
/// configured with `proxy = false`.
///
/// Mutates the process environment, so call it before starting the async
/// runtime or any other thread. [`Gateway::start`] never calls it.
pub fn scrub_proxy_env() {
    scrub_env(&PROXY_VARS);
}

#[cfg(not(target_os = "windows"))]
fn scrub_env(vars: &[&str]) {
    for var in vars {
        if std::env::var_os(var).is_some() {
            std::env::remove_var(var);
            info!("Unset {var} for this process");
        }
    }
}

#[cfg(target_os = "windows")]
fn scrub_env(_vars: &[&str]) {}
