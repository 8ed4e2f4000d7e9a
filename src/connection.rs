//! Persistent TCP connection to a Tuya device.
//! Owns the socket, the framed read loop, the coalescing dispatcher, and the
//! heartbeat timer. Outbound writes are serialized on a single write lock.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::payload::{self, CommandPayload};
use crate::protocol::{self, CommandType, HEADER_SIZE, PREFIX_55AA, TuyaMessage, Version};
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{Duration, Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Interval between keep-alive pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// Inbound frames arriving within this window of each other are delivered as one batch.
const COALESCE_WINDOW: Duration = Duration::from_millis(100);
/// Bound on prefix resynchronization before the scan is restarted.
const MAX_RESYNC_BYTES: usize = 1024;

/// Handler invoked for every decoded non-heartbeat inbound payload.
pub type PayloadHandler = Arc<dyn Fn(u32, Value) -> BoxFuture<'static, ()> + Send + Sync>;
/// Handler invoked exactly once when the connection stops.
pub type StopHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Identity and protocol parameters of the device a connection talks to.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Host name or IP address
    pub address: String,
    /// TCP port (6668 unless overridden)
    pub port: u16,
    /// Device ID
    pub id: String,
    /// Gateway ID; equals the device ID for standalone devices
    pub gw_id: String,
    /// Protocol version
    pub version: Version,
}

/// A live, framed TCP session with a single device.
///
/// Created through [`Connection::connect`], which spawns the read loop, the
/// coalescing dispatcher, and the heartbeat loop. The connection is terminal
/// after [`Connection::stop`]; callers wanting to reconnect create a new one.
pub struct Connection {
    info: Arc<DeviceInfo>,
    local_key: [u8; 16],
    cipher: TuyaCipher,
    writer: AsyncMutex<Option<tokio::net::tcp::OwnedWriteHalf>>,
    seqno: Mutex<u32>,
    stopped: AtomicBool,
    cancel: CancellationToken,
    on_payload: PayloadHandler,
    on_stop: StopHandler,
}

impl Connection {
    /// Resolve the device address, open the socket, and start the background loops.
    ///
    /// Both DNS resolution and the TCP connect are bounded by `connect_timeout`.
    pub async fn connect(
        info: Arc<DeviceInfo>,
        local_key: [u8; 16],
        connect_timeout: Duration,
        on_payload: PayloadHandler,
        on_stop: StopHandler,
    ) -> Result<Arc<Self>> {
        debug!("Resolving address for {}", info.address);
        let addr = resolve_address(&info, connect_timeout).await?;

        info!("Connecting to Tuya device {} at {}", info.id, addr);
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
                _ => TuyaError::Io(e.to_string()),
            })?;
        stream.set_nodelay(true)?;
        debug!("Socket opened for {}", addr);

        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Self {
            cipher: TuyaCipher::new(local_key),
            local_key,
            info,
            writer: AsyncMutex::new(Some(write_half)),
            seqno: Mutex::new(0),
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            on_payload,
            on_stop,
        });

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        tokio::spawn(conn.clone().run_read_loop(read_half, frame_tx));
        tokio::spawn(conn.clone().run_dispatcher(frame_rx));
        tokio::spawn(conn.clone().run_heartbeat_loop());

        Ok(conn)
    }

    /// Whether [`Connection::stop`] has run.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Build the standard command payload around `dps` and write it as a frame.
    pub async fn send(&self, command: CommandType, dps: &Value, encrypted: bool) -> Result<()> {
        let body = CommandPayload {
            gw_id: &self.info.gw_id,
            dev_id: &self.info.id,
            t: epoch_seconds(),
            dps,
            uid: &self.info.id,
        };
        let plain = serde_json::to_vec(&body)?;
        self.send_frame(command, &plain, encrypted).await
    }

    /// Wrap a raw payload in the version envelope and write it under the write lock.
    ///
    /// The sequence number is allocated inside the write critical section so
    /// that wire order always matches sequence order.
    async fn send_frame(&self, command: CommandType, plain: &[u8], encrypted: bool) -> Result<()> {
        let body = payload::encode_body(
            &self.cipher,
            &self.local_key,
            self.info.version,
            command as u32,
            plain,
            encrypted,
        )?;

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(TuyaError::NotConnected);
        };

        let seqno = {
            let mut seq = self.seqno.lock();
            let n = *seq;
            *seq += 1;
            n
        };
        let msg = TuyaMessage {
            seqno,
            cmd: command as u32,
            retcode: None,
            payload: body,
        };
        let frame = protocol::pack_message(&msg)?;

        debug!(
            "Sending cmd={:?} seqno={} len={} to {}",
            command,
            seqno,
            frame.len(),
            self.info.address
        );
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Stop the connection. Idempotent; the stop handler fires exactly once.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        {
            let mut writer = self.writer.lock().await;
            if let Some(mut stream) = writer.take() {
                let _ = stream.shutdown().await;
            }
        }
        info!(
            "Closed socket to Tuya device at {}:{}",
            self.info.address, self.info.port
        );
        (self.on_stop)().await;
    }

    async fn run_read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        frame_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = read_frame(&mut reader) => match result {
                    Ok(Some(frame)) => {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    // Resync window exhausted; keep scanning.
                    Ok(None) => continue,
                    Err(e) => {
                        if !self.is_stopped() {
                            info!("Error while reading from {}: {}", self.info.address, e);
                            self.stop().await;
                        }
                        break;
                    }
                },
            }
        }
        debug!("Read loop for {} stopped", self.info.id);
    }

    /// Accumulates raw frames and flushes them as one batch once the line has
    /// been quiet for [`COALESCE_WINDOW`]. The deadline is restarted on every
    /// arrival, so a burst of status reports is handled as a single batch.
    async fn run_dispatcher(self: Arc<Self>, mut frame_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut pending: Vec<Vec<u8>> = Vec::new();
        let window = sleep(COALESCE_WINDOW);
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                maybe = frame_rx.recv() => {
                    let Some(raw) = maybe else { break };
                    pending.push(raw);
                    window.as_mut().reset(Instant::now() + COALESCE_WINDOW);
                }
                () = window.as_mut(), if !pending.is_empty() => {
                    let batch = std::mem::take(&mut pending);
                    debug!("Processing {} message(s) from {}", batch.len(), self.info.id);
                    for raw in &batch {
                        self.handle_frame(raw).await;
                    }
                }
            }
        }
        debug!("Dispatcher for {} stopped", self.info.id);
    }

    /// Decode a single frame and hand it to the payload handler.
    /// Frame-level errors are logged and isolated; they never tear the
    /// connection down.
    async fn handle_frame(&self, raw: &[u8]) {
        let msg = match protocol::unpack_message(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Throwing out message from {}: {}", self.info.address, e);
                return;
            }
        };

        if msg.cmd == CommandType::HeartBeat as u32 {
            debug!("Received pong from {}", self.info.address);
            return;
        }

        let decoded =
            payload::decode_body(&self.cipher, self.info.version, msg.cmd, &msg.payload);
        let value = match decoded {
            Ok(value) => value,
            Err(e) => {
                warn!("Unable to read payload from {}: {}", self.info.address, e);
                return;
            }
        };

        debug!("Received cmd={} payload={}", msg.cmd, value);
        (self.on_payload)(msg.cmd, value).await;
    }

    async fn run_heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(HEARTBEAT_INTERVAL) => {
                    if let Err(e) = self.send_frame(CommandType::HeartBeat, &[], false).await {
                        warn!("Unable to send ping to {}: {}", self.info.address, e);
                    }
                }
            }
        }
        debug!("Heartbeat loop for {} stopped", self.info.id);
    }
}

async fn resolve_address(info: &DeviceInfo, connect_timeout: Duration) -> Result<SocketAddr> {
    let addrs = timeout(
        connect_timeout,
        tokio::net::lookup_host((info.address.as_str(), info.port)),
    )
    .await
    .map_err(|_| TuyaError::Timeout)?
    .map_err(|e| TuyaError::Io(format!("Error resolving address: {}", e)))?;

    addrs
        .into_iter()
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| TuyaError::Io(format!("No IPv4 address for {}", info.address)))
}

/// Read one full frame, scanning forward to the packet prefix if the stream
/// is not aligned on a frame boundary. Returns `Ok(None)` when no prefix was
/// found within [`MAX_RESYNC_BYTES`].
async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;

    let mut discarded = 0usize;
    while u32::from_be_bytes(prefix) != PREFIX_55AA {
        if discarded >= MAX_RESYNC_BYTES {
            warn!("No packet prefix within {} bytes, rescanning", MAX_RESYNC_BYTES);
            return Ok(None);
        }
        prefix.rotate_left(1);
        prefix[3] = reader.read_u8().await?;
        discarded += 1;
    }
    if discarded > 0 {
        warn!("Discarded {} bytes before packet prefix", discarded);
    }

    let mut header_rest = [0u8; 12];
    reader.read_exact(&mut header_rest).await?;
    let length = u32::from_be_bytes([
        header_rest[8],
        header_rest[9],
        header_rest[10],
        header_rest[11],
    ]) as usize;

    let mut frame = Vec::with_capacity(HEADER_SIZE + length);
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(&header_rest);
    frame.resize(HEADER_SIZE + length, 0);
    reader.read_exact(&mut frame[HEADER_SIZE..]).await?;
    Ok(Some(frame))
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
