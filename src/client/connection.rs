//! Connection lifecycle
//!
//! A [`Connection`] owns at most one engine connection handle, kept inside a
//! [`ConnectionBridge`] that channels observe through a `Weak` reference.
//! There is no automatic reconnection: a connection whose engine handle died,
//! or whose heartbeat check failed, reports itself as not connected and stays
//! that way until `connect` or `reconnect` is called.

use crate::config::ConnectionConfig;
use crate::connection_span;
use crate::error::{AmqpResult, ErrorKind, ExceptionHandler};
use crate::heartbeat::{
    heartbeat_check_interval, ConnectionId, HeartbeatScheduler, HeartbeatTarget,
};
use crate::transport::{Connector, EngineConnection, SocketDirection, SocketTimeout};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
}

/// Effect of changing a timeout on a live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningChange {
    /// Stored; applies now or on the next connect
    Applied,
    /// The live connection was closed so the value can take effect on reconnect
    ConnectionClosed,
}

/// Association between a connection and its engine handle
///
/// Owned by the [`Connection`]; channels hold it weakly.
pub struct ConnectionBridge {
    config: RwLock<ConnectionConfig>,
    handle: RwLock<Option<Arc<dyn EngineConnection>>>,
    // Raised by the heartbeat task; replaced on every connect
    missed_heartbeat: RwLock<Arc<AtomicBool>>,
}

impl ConnectionBridge {
    fn new(config: ConnectionConfig) -> Self {
        Self {
            config: RwLock::new(config),
            handle: RwLock::new(None),
            missed_heartbeat: RwLock::new(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Current engine handle, if any
    pub fn handle(&self) -> Option<Arc<dyn EngineConnection>> {
        self.handle.read().clone()
    }

    /// Whether a handle is present, the engine reports it connected, and no
    /// heartbeat check has failed on it
    pub fn is_connected(&self) -> bool {
        !self.missed_heartbeat()
            && self
                .handle
                .read()
                .as_ref()
                .is_some_and(|handle| handle.is_connected())
    }

    /// Whether the heartbeat task declared the current handle dead
    pub fn missed_heartbeat(&self) -> bool {
        self.missed_heartbeat.read().load(Ordering::SeqCst)
    }

    pub fn config(&self) -> ConnectionConfig {
        self.config.read().clone()
    }

    fn take_handle(&self) -> Option<Arc<dyn EngineConnection>> {
        self.handle.write().take()
    }
}

/// Client connection to one broker
pub struct Connection {
    id: ConnectionId,
    bridge: Arc<ConnectionBridge>,
    connector: Arc<dyn Connector>,
    heartbeat: Arc<dyn HeartbeatScheduler>,
    state: ConnectionState,
}

impl Connection {
    /// Create an unconnected connection
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        heartbeat: Arc<dyn HeartbeatScheduler>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            bridge: Arc::new(ConnectionBridge::new(config)),
            connector,
            heartbeat,
            state: ConnectionState::Unconnected,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Lifecycle state, reporting a dead engine handle as unconnected
    pub fn state(&self) -> ConnectionState {
        match self.state {
            ConnectionState::Connected if !self.bridge.is_connected() => {
                ConnectionState::Unconnected
            }
            state => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.bridge.is_connected()
    }

    pub(crate) fn bridge(&self) -> &Arc<ConnectionBridge> {
        &self.bridge
    }

    /// Open the engine connection; does nothing when already connected
    pub async fn connect(&mut self) -> AmqpResult<()> {
        if self.is_connected() {
            debug!("Connection {} already connected", self.id);
            return Ok(());
        }

        let span = connection_span!(connection_id = %self.id, operation = "connect");
        self.open().instrument(span).await
    }

    async fn open(&mut self) -> AmqpResult<()> {
        // A handle left behind by a dead connection is discarded first
        if let Some(stale) = self.bridge.take_handle() {
            self.heartbeat.unregister(self.id);
            if let Err(e) = stale.close().await {
                debug!("Ignoring close failure on dead connection: {}", e);
            }
        }

        self.state = ConnectionState::Connecting;
        let config = self.bridge.config();
        info!("Connecting to {}", config.loggable());

        match self.connector.open(&config).await {
            Ok(handle) => {
                let missed = Arc::new(AtomicBool::new(false));
                *self.bridge.missed_heartbeat.write() = missed.clone();
                if let Some(interval) = heartbeat_check_interval(handle.heartbeat()) {
                    let target = HeartbeatTarget::new(Arc::downgrade(&handle), missed);
                    self.heartbeat.register(self.id, target, interval);
                }
                *self.bridge.handle.write() = Some(handle);
                self.state = ConnectionState::Connected;
                info!("Connection {} established", self.id);
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Unconnected;
                Err(ExceptionHandler::translate(
                    e,
                    "connect",
                    ErrorKind::Connection,
                ))
            }
        }
    }

    /// Close the engine connection; does nothing when there is none
    pub async fn disconnect(&mut self) -> AmqpResult<()> {
        let Some(handle) = self.bridge.take_handle() else {
            debug!("Connection {} has no handle to close", self.id);
            return Ok(());
        };

        let span = connection_span!(connection_id = %self.id, operation = "disconnect");
        async {
            self.heartbeat.unregister(self.id);
            self.state = ConnectionState::Unconnected;
            handle
                .close()
                .await
                .map_err(|e| ExceptionHandler::translate(e, "disconnect", ErrorKind::Connection))?;
            info!("Connection {} closed", self.id);
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Disconnect, then connect again with the current configuration
    pub async fn reconnect(&mut self) -> AmqpResult<()> {
        self.disconnect().await?;
        self.connect().await
    }

    /// Negotiated heartbeat when connected, the configured one otherwise
    pub fn heartbeat(&self) -> u16 {
        self.bridge
            .handle()
            .map(|handle| handle.heartbeat())
            .unwrap_or_else(|| self.bridge.config.read().heartbeat())
    }

    pub fn config(&self) -> ConnectionConfig {
        self.bridge.config()
    }

    pub fn host(&self) -> String {
        self.bridge.config.read().host().to_string()
    }

    pub fn port(&self) -> u16 {
        self.bridge.config.read().port()
    }

    pub fn login(&self) -> String {
        self.bridge.config.read().login().to_string()
    }

    pub fn vhost(&self) -> String {
        self.bridge.config.read().vhost().to_string()
    }

    pub fn read_timeout(&self) -> f64 {
        self.bridge.config.read().read_timeout()
    }

    pub fn write_timeout(&self) -> f64 {
        self.bridge.config.read().write_timeout()
    }

    pub fn connect_timeout(&self) -> f64 {
        self.bridge.config.read().connect_timeout()
    }

    pub fn rpc_timeout(&self) -> f64 {
        self.bridge.config.read().rpc_timeout()
    }

    /// Takes effect on the next connect
    pub fn set_host(&mut self, host: impl Into<String>) -> AmqpResult<()> {
        self.bridge.config.write().set_host(host)
    }

    /// Takes effect on the next connect
    pub fn set_port(&mut self, port: u32) -> AmqpResult<()> {
        self.bridge.config.write().set_port(port)
    }

    /// Takes effect on the next connect
    pub fn set_login(&mut self, login: impl Into<String>) -> AmqpResult<()> {
        self.bridge.config.write().set_login(login)
    }

    /// Takes effect on the next connect
    pub fn set_password(&mut self, password: impl Into<String>) -> AmqpResult<()> {
        self.bridge.config.write().set_password(password)
    }

    /// Takes effect on the next connect
    pub fn set_vhost(&mut self, vhost: impl Into<String>) -> AmqpResult<()> {
        self.bridge.config.write().set_vhost(vhost)
    }

    /// Requested heartbeat in seconds
    ///
    /// The heartbeat is negotiated at connect, so a live connection is closed
    /// and the new value applies on reconnect.
    pub async fn set_heartbeat(&mut self, heartbeat: u16) -> AmqpResult<TuningChange> {
        self.bridge.config.write().set_heartbeat(heartbeat);
        self.close_for_tuning("heartbeat").await
    }

    /// Client-provided connection name; takes effect on the next connect
    pub fn set_connection_name(&mut self, name: Option<String>) {
        self.bridge.config.write().set_connection_name(name);
    }

    /// Only affects the next connect
    pub fn set_connect_timeout(&mut self, timeout: f64) -> AmqpResult<()> {
        self.bridge.config.write().set_connect_timeout(timeout)
    }

    /// Store the read timeout and apply it to a live socket in place
    pub fn set_read_timeout(&mut self, timeout: f64) -> AmqpResult<()> {
        self.bridge.config.write().set_read_timeout(timeout)?;

        if let Some(handle) = self.bridge.handle().filter(|_| self.is_connected()) {
            let socket_timeout = SocketTimeout::from_secs_f64(timeout);
            handle
                .set_socket_timeout(SocketDirection::Receive, socket_timeout)
                .map_err(|e| {
                    ExceptionHandler::translate(e, "set read timeout", ErrorKind::Connection)
                })?;
            debug!("Read timeout of connection {} set to {}s", self.id, timeout);
        }
        Ok(())
    }

    /// Store the write timeout; a live connection is closed so it applies on reconnect
    pub async fn set_write_timeout(&mut self, timeout: f64) -> AmqpResult<TuningChange> {
        self.bridge.config.write().set_write_timeout(timeout)?;
        self.close_for_tuning("write_timeout").await
    }

    /// Store the RPC timeout; a live connection is closed so it applies on reconnect
    pub async fn set_rpc_timeout(&mut self, timeout: f64) -> AmqpResult<TuningChange> {
        self.bridge.config.write().set_rpc_timeout(timeout)?;
        self.close_for_tuning("rpc_timeout").await
    }

    async fn close_for_tuning(&mut self, parameter: &str) -> AmqpResult<TuningChange> {
        if !self.is_connected() {
            return Ok(TuningChange::Applied);
        }
        warn!(
            "Changing {} requires a new connection, closing connection {}",
            parameter, self.id
        );
        self.disconnect().await?;
        Ok(TuningChange::ConnectionClosed)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.heartbeat.unregister(self.id);

        let Some(handle) = self.bridge.take_handle() else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                let id = self.id;
                runtime.spawn(async move {
                    if let Err(e) = handle.close().await {
                        warn!("Failed to close dropped connection {}: {}", id, e);
                    }
                });
            }
            Err(_) => warn!(
                "Connection {} dropped outside a runtime, engine handle not closed",
                self.id
            ),
        }
    }
}
