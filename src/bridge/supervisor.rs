//! Connection supervisor with statum lifecycle.
//!
//! ```text
//! Configured ──start──► Running ──shutdown──► Stopped
//! ```
//!
//! While running, three tasks share one cancellation token: the broker network
//! loop (which doubles as the connect/retry loop), the request forwarder, and
//! the catalog flush loop.

use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::BridgeEngine;
use crate::mqtt::{BrokerError, ConnectionState, MqttHandler};

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DISCONNECT_WAIT: Duration = Duration::from_secs(5);

#[state]
#[derive(Debug, Clone)]
pub enum SupervisorState {
    Configured,
    Running,
    Stopped,
}

#[machine]
pub struct Supervisor<S: SupervisorState> {
    engine: Arc<BridgeEngine>,
    handler: Arc<MqttHandler>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    flush_interval: Duration,
    disconnect_wait: Duration,
}

impl<S: SupervisorState> Supervisor<S> {
    pub fn engine(&self) -> &Arc<BridgeEngine> {
        &self.engine
    }
}

impl Supervisor<Configured> {
    pub fn create(engine: Arc<BridgeEngine>, handler: Arc<MqttHandler>) -> Self {
        Self::new(
            engine,
            handler,
            CancellationToken::new(),
            Vec::new(),
            FLUSH_INTERVAL,
            DISCONNECT_WAIT,
        )
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_disconnect_wait(mut self, wait: Duration) -> Self {
        self.disconnect_wait = wait;
        self
    }

    /// Spawns the network loop, the forwarder and the catalog flush loop.
    pub fn start(mut self) -> Result<Supervisor<Running>, BrokerError> {
        info!("Starting connection supervisor");
        let mut tasks = self
            .handler
            .start(self.engine.clone(), self.cancel.clone())?;
        tasks.push(tokio::spawn(run_flush_loop(
            self.engine.clone(),
            self.flush_interval,
            self.cancel.clone(),
        )));
        self.tasks = tasks;
        Ok(self.transition())
    }
}

impl Supervisor<Running> {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Publishes DISCONNECTED (bounded wait for the acknowledgement), closes
    /// the session, cancels all loops and joins them.
    pub async fn shutdown(mut self) -> Supervisor<Stopped> {
        info!("Shutting down connection supervisor");
        let status = self
            .engine
            .record_connection_state(ConnectionState::Disconnected);
        self.handler.disconnect(status, self.disconnect_wait).await;

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Supervisor task ended abnormally: {}", e);
            }
        }
        self.engine.detach();
        info!("Connection supervisor stopped");
        self.transition()
    }
}

impl Supervisor<Stopped> {}

/// Publishes catalog changes every `interval` until cancelled.
pub async fn run_flush_loop(
    engine: Arc<BridgeEngine>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {
                if engine.flush_catalog() {
                    debug!("Published topic catalog");
                }
            }
        }
    }
    debug!("Catalog flush loop stopped");
}
