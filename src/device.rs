//! Individual Tuya device session and state management.
//! Wires application callbacks to a [`Connection`] and maintains the local
//! mirror of the device's data points.

use crate::connection::{Connection, DeviceInfo, PayloadHandler, StopHandler};
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, Version};
use futures_util::future::BoxFuture;
use log::{debug, warn};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// DPS index of the main power switch.
pub const DPS_INDEX_ON: &str = "1";

const DEFAULT_PORT: u16 = 6668;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Async callback registered by the application for stop/update notifications.
pub type SessionCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
/// Hook letting adaptors observe inbound payloads ahead of the mirror merge.
pub(crate) type PayloadHook = Arc<dyn Fn(u32, &Value) + Send + Sync>;
/// Hook letting adaptors reset derived state when the session stops.
pub(crate) type StopHook = Arc<dyn Fn() + Send + Sync>;

struct SessionInner {
    info: Arc<DeviceInfo>,
    local_key: [u8; 16],
    connect_timeout: Duration,
    connection: RwLock<Option<Arc<Connection>>>,
    dps: RwLock<Option<Map<String, Value>>>,
    on_stop: RwLock<Option<SessionCallback>>,
    on_update: RwLock<Option<SessionCallback>>,
    payload_hook: RwLock<Option<PayloadHook>>,
    stop_hook: RwLock<Option<StopHook>>,
}

/// Builder for [`Device`] sessions.
pub struct DeviceBuilder {
    address: String,
    id: String,
    local_key: Vec<u8>,
    port: u16,
    version: Version,
    timeout: Duration,
    gw_id: Option<String>,
}

impl DeviceBuilder {
    /// Start a builder for the device at `address` with the given ID and
    /// 16-byte local key.
    pub fn new<A, I, K>(address: A, id: I, local_key: K) -> Self
    where
        A: Into<String>,
        I: Into<String>,
        K: Into<Vec<u8>>,
    {
        Self {
            address: address.into(),
            id: id.into(),
            local_key: local_key.into(),
            port: DEFAULT_PORT,
            version: Version::default(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
            gw_id: None,
        }
    }

    /// TCP port; 6668 unless the device is configured otherwise.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Protocol version; defaults to 3.1.
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Bound on DNS resolution and TCP connect; defaults to 30 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Gateway ID; defaults to the device ID.
    pub fn gw_id<S: Into<String>>(mut self, gw_id: S) -> Self {
        self.gw_id = Some(gw_id.into());
        self
    }

    /// Validate the configuration and produce a disconnected session.
    pub fn build(self) -> Result<Device> {
        if self.local_key.len() != 16 {
            return Err(TuyaError::InvalidKeyLength);
        }
        let mut local_key = [0u8; 16];
        local_key.copy_from_slice(&self.local_key);

        let gw_id = self.gw_id.unwrap_or_else(|| self.id.clone());
        let info = Arc::new(DeviceInfo {
            address: self.address,
            port: self.port,
            id: self.id,
            gw_id,
            version: self.version,
        });

        Ok(Device {
            inner: Arc::new(SessionInner {
                info,
                local_key,
                connect_timeout: self.timeout,
                connection: RwLock::new(None),
                dps: RwLock::new(None),
                on_stop: RwLock::new(None),
                on_update: RwLock::new(None),
                payload_hook: RwLock::new(None),
                stop_hook: RwLock::new(None),
            }),
        })
    }
}

/// A stateful session with a single Tuya device.
///
/// Cheap to clone; all clones share the same session state.
#[derive(Clone)]
pub struct Device {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

impl Device {
    /// Start building a session; `local_key` must be 16 bytes.
    pub fn builder<A, I, K>(address: A, id: I, local_key: K) -> DeviceBuilder
    where
        A: Into<String>,
        I: Into<String>,
        K: Into<Vec<u8>>,
    {
        DeviceBuilder::new(address, id, local_key)
    }

    /// The device ID.
    pub fn id(&self) -> &str {
        &self.inner.info.id
    }

    /// The configured device address.
    pub fn address(&self) -> &str {
        &self.inner.info.address
    }

    /// The configured protocol version.
    pub fn version(&self) -> Version {
        self.inner.info.version
    }

    /// Whether the session currently holds a live connection.
    pub fn is_connected(&self) -> bool {
        self.inner.connection.read().is_some()
    }

    /// Register a callback fired once whenever an established connection stops.
    pub fn set_on_stop<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.inner.on_stop.write() = Some(Arc::new(move || -> BoxFuture<'static, ()> {
            Box::pin(callback())
        }));
    }

    /// Register a callback fired after each inbound payload is folded into
    /// the session state.
    pub fn set_on_update<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.inner.on_update.write() = Some(Arc::new(move || -> BoxFuture<'static, ()> {
            Box::pin(callback())
        }));
    }

    /// Connect to the device and prime the DPS mirror with an initial query.
    ///
    /// Fails with [`TuyaError::AlreadyConnected`] on a live session. Any
    /// failure after the socket opens rolls the session back to fully
    /// stopped before the error is returned.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.connection.read().is_some() {
            return Err(TuyaError::AlreadyConnected);
        }

        let weak = Arc::downgrade(&self.inner);
        let on_payload: PayloadHandler = Arc::new(move |command, payload| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    handle_payload(&inner, command, payload).await;
                }
            })
        });

        let weak = Arc::downgrade(&self.inner);
        let on_stop: StopHandler = Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    handle_stop(&inner).await;
                }
            })
        });

        let connection = Connection::connect(
            self.inner.info.clone(),
            self.inner.local_key,
            self.inner.connect_timeout,
            on_payload,
            on_stop,
        )
        .await?;
        *self.inner.connection.write() = Some(connection.clone());

        if let Err(e) = self.update().await {
            // Roll back to fully stopped; the caller already gets the error.
            *self.inner.connection.write() = None;
            connection.stop().await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop the session's connection.
    ///
    /// Fails with [`TuyaError::NotConnected`] when there is none.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = self.inner.connection.read().clone();
        let Some(connection) = connection else {
            return Err(TuyaError::NotConnected);
        };
        connection.stop().await;
        Ok(())
    }

    /// Query all data points; the reply replaces the DPS mirror.
    pub async fn update(&self) -> Result<()> {
        self.send(CommandType::DpQuery, Value::Object(Map::new()), false)
            .await
    }

    /// Switch the device on or off. The mirror is updated optimistically
    /// before the device confirms.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.require_dps()?;
        let mut update = Map::new();
        update.insert(DPS_INDEX_ON.into(), Value::Bool(enabled));
        self.merge_dps(&update);
        self.send(CommandType::Control, Value::Object(update), false)
            .await
    }

    /// The cached power state, if the mirror knows it.
    pub fn get_enabled(&self) -> Option<bool> {
        self.inner.dps.read().as_ref()?.get(DPS_INDEX_ON)?.as_bool()
    }

    /// A snapshot of the DPS mirror, if a query has completed.
    pub fn get_dps(&self) -> Option<Map<String, Value>> {
        self.inner.dps.read().clone()
    }

    pub(crate) async fn send(
        &self,
        command: CommandType,
        dps: Value,
        encrypted: bool,
    ) -> Result<()> {
        let connection = self
            .inner
            .connection
            .read()
            .clone()
            .ok_or(TuyaError::NotConnected)?;
        connection.send(command, &dps, encrypted).await
    }

    pub(crate) fn require_dps(&self) -> Result<()> {
        if self.inner.dps.read().is_some() {
            Ok(())
        } else {
            Err(TuyaError::StateUnknown)
        }
    }

    /// Optimistically fold a mutation into the mirror ahead of confirmation.
    pub(crate) fn merge_dps(&self, update: &Map<String, Value>) {
        if let Some(dps) = self.inner.dps.write().as_mut() {
            for (key, value) in update {
                dps.insert(key.clone(), value.clone());
            }
        }
    }

    pub(crate) fn set_payload_hook(&self, hook: PayloadHook) {
        *self.inner.payload_hook.write() = Some(hook);
    }

    pub(crate) fn set_stop_hook(&self, hook: StopHook) {
        *self.inner.stop_hook.write() = Some(hook);
    }
}

async fn handle_payload(inner: &Arc<SessionInner>, command: u32, payload: Value) {
    // Adaptor hooks observe the payload before the mirror changes.
    if let Some(hook) = inner.payload_hook.read().clone() {
        hook(command, &payload);
    }

    if command == CommandType::DpQuery as u32 {
        let Some(dps) = payload.get("dps").and_then(Value::as_object) else {
            warn!("Query reply from {} carried no dps object", inner.info.id);
            return;
        };
        *inner.dps.write() = Some(dps.clone());
    } else if command == CommandType::Status as u32 {
        let Some(dps) = payload.get("dps").and_then(Value::as_object) else {
            warn!("Status from {} carried no dps object", inner.info.id);
            return;
        };
        let mut mirror = inner.dps.write();
        match mirror.as_mut() {
            Some(existing) => {
                for (key, value) in dps {
                    existing.insert(key.clone(), value.clone());
                }
            }
            None => {
                warn!("Status from {} before first query, ignoring", inner.info.id);
                return;
            }
        }
    }

    let callback = inner.on_update.read().clone();
    if let Some(callback) = callback {
        callback().await;
    }
}

async fn handle_stop(inner: &Arc<SessionInner>) {
    let had_connection = inner.connection.write().take().is_some();
    *inner.dps.write() = None;
    if let Some(hook) = inner.stop_hook.read().clone() {
        hook();
    }
    debug!("Session with {} stopped", inner.info.id);

    if had_connection {
        let callback = inner.on_stop.read().clone();
        if let Some(callback) = callback {
            callback().await;
        }
    }
}
