//! End-to-end session tests against a scripted in-process TCP device.

use crc::{CRC_32_ISO_HDLC, Crc};
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tuyalan::crypto::TuyaCipher;
use tuyalan::protocol::{self, CommandType, TuyaMessage, Version};
use tuyalan::{Device, Light, LightMode, TuyaError, payload};

const DEVICE_ID: &str = "bf1234567890abcd";
const KEY: &str = "0123456789abcdef";
const KEY_BYTES: [u8; 16] = *b"0123456789abcdef";

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn bind_device(version: Version) -> (TcpListener, Device) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let device = Device::builder("127.0.0.1", DEVICE_ID, KEY)
        .port(port)
        .version(version)
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    (listener, device)
}

fn notify_channel() -> (
    impl Fn() -> futures_util::future::Ready<()> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move || {
        let _ = tx.send(());
        futures_util::future::ready(())
    };
    (callback, rx)
}

/// Read one complete frame written by the client and decode it.
async fn read_client_frame(stream: &mut TcpStream) -> TuyaMessage {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await.unwrap();
    let length = u32::from_be_bytes([header[12], header[13], header[14], header[15]]) as usize;
    let mut frame = header.to_vec();
    frame.resize(16 + length, 0);
    stream.read_exact(&mut frame[16..]).await.unwrap();
    protocol::unpack_message(&frame).unwrap()
}

/// Build a device-style response frame with a zero return code.
fn response_frame(seqno: u32, cmd: CommandType, body: &[u8]) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&protocol::PREFIX_55AA.to_be_bytes());
    data.extend_from_slice(&seqno.to_be_bytes());
    data.extend_from_slice(&(cmd as u32).to_be_bytes());
    data.extend_from_slice(&((body.len() + 12) as u32).to_be_bytes());
    data.extend_from_slice(&0u32.to_be_bytes());
    data.extend_from_slice(body);
    let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&data);
    data.extend_from_slice(&crc.to_be_bytes());
    data.extend_from_slice(&protocol::SUFFIX_55AA.to_be_bytes());
    data
}

fn v33_body(cmd: CommandType, json: &[u8]) -> Vec<u8> {
    let cipher = TuyaCipher::new(KEY_BYTES);
    payload::encode_body(&cipher, &KEY_BYTES, Version::V3_3, cmd as u32, json, false).unwrap()
}

#[tokio::test]
async fn v33_session_primes_controls_and_merges() {
    init_logging();
    let (listener, device) = bind_device(Version::V3_3).await;

    let (on_update, mut updates) = notify_channel();
    device.set_on_update(on_update);
    let (on_stop, mut stops) = notify_channel();
    device.set_on_stop(on_stop);

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let cipher = TuyaCipher::new(KEY_BYTES);

        // Priming query carries the device identity, encrypted, no header.
        let msg = read_client_frame(&mut stream).await;
        assert_eq!(msg.cmd, CommandType::DpQuery as u32);
        assert_eq!(msg.seqno, 0);
        let query = payload::decode_body(&cipher, Version::V3_3, msg.cmd, &msg.payload).unwrap();
        assert_eq!(query["gwId"], DEVICE_ID);
        assert_eq!(query["devId"], DEVICE_ID);
        assert_eq!(query["uid"], DEVICE_ID);
        assert_eq!(query["dps"], json!({}));

        let reply = v33_body(CommandType::DpQuery, br#"{"dps":{"1":true,"3":200}}"#);
        stream
            .write_all(&response_frame(msg.seqno, CommandType::DpQuery, &reply))
            .await
            .unwrap();

        // The switch-off control frame.
        let msg = read_client_frame(&mut stream).await;
        assert_eq!(msg.cmd, CommandType::Control as u32);
        assert_eq!(msg.seqno, 1);
        let control = payload::decode_body(&cipher, Version::V3_3, msg.cmd, &msg.payload).unwrap();
        assert_eq!(control["dps"], json!({"1": false}));

        // A burst of status reports written back-to-back; the client must
        // apply them in order.
        let mut burst = response_frame(7, CommandType::Status, &v33_body(
            CommandType::Status,
            br#"{"dps":{"3":42}}"#,
        ));
        burst.extend_from_slice(&response_frame(8, CommandType::Status, &v33_body(
            CommandType::Status,
            br#"{"dps":{"3":43,"4":7}}"#,
        )));
        stream.write_all(&burst).await.unwrap();

        stream
    });

    device.connect().await.unwrap();
    assert!(device.is_connected());
    assert!(matches!(
        device.connect().await,
        Err(TuyaError::AlreadyConnected)
    ));

    // Wait for the priming reply to land in the mirror.
    timeout(RECV_TIMEOUT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(device.get_enabled(), Some(true));
    assert_eq!(device.get_dps().unwrap()["3"], 200);

    // Optimistic write: mirror flips before the device confirms anything.
    device.set_enabled(false).await.unwrap();
    assert_eq!(device.get_enabled(), Some(false));

    // Two updates from the status burst, merged right-biased.
    timeout(RECV_TIMEOUT, updates.recv()).await.unwrap().unwrap();
    timeout(RECV_TIMEOUT, updates.recv()).await.unwrap().unwrap();
    let dps = device.get_dps().unwrap();
    assert_eq!(dps["1"], false);
    assert_eq!(dps["3"], 43);
    assert_eq!(dps["4"], 7);

    let _stream = server.await.unwrap();

    device.disconnect().await.unwrap();
    timeout(RECV_TIMEOUT, stops.recv()).await.unwrap().unwrap();
    assert!(!device.is_connected());
    assert!(matches!(device.update().await, Err(TuyaError::NotConnected)));
    assert!(matches!(
        device.disconnect().await,
        Err(TuyaError::NotConnected)
    ));
}

#[tokio::test]
async fn v31_light_session_uses_signed_control() {
    init_logging();
    let (listener, device) = bind_device(Version::V3_1).await;
    let light = Light::new(device);

    let (on_update, mut updates) = notify_channel();
    light.device().set_on_update(on_update);

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let cipher = TuyaCipher::new(KEY_BYTES);

        // v3.1 queries go out as plaintext JSON.
        let msg = read_client_frame(&mut stream).await;
        assert_eq!(msg.cmd, CommandType::DpQuery as u32);
        assert_eq!(msg.payload.first(), Some(&b'{'));

        stream
            .write_all(&response_frame(
                0,
                CommandType::DpQuery,
                br#"{"dps":{"1":true,"2":"white","3":200,"4":128}}"#,
            ))
            .await
            .unwrap();

        // Color controls are base64-encrypted and MD5-signed.
        let msg = read_client_frame(&mut stream).await;
        assert_eq!(msg.cmd, CommandType::Control as u32);
        assert_eq!(&msg.payload[..3], b"3.1");
        let control = payload::decode_body(&cipher, Version::V3_1, msg.cmd, &msg.payload).unwrap();
        assert_eq!(control["dps"]["1"], true);
        assert_eq!(control["dps"]["2"], "colour");
        assert_eq!(control["dps"]["5"], "ff00000000ffff");

        stream
    });

    light.connect().await.unwrap();
    timeout(RECV_TIMEOUT, updates.recv()).await.unwrap().unwrap();

    // The priming reply populated both the mirror and the derived state.
    assert_eq!(light.get_enabled(), Some(true));
    assert_eq!(light.get_mode(), Some(LightMode::White));
    assert_eq!(light.get_brightness(), Some(200));
    assert_eq!(light.get_color_temp(), Some(128));

    light.set_color_rgb(255, 0, 0, true).await.unwrap();
    assert_eq!(light.get_mode(), Some(LightMode::Colour));
    assert_eq!(light.get_color_hs(), Some((0, 255)));
    assert_eq!(light.get_brightness(), Some(255));

    let _stream = server.await.unwrap();
}

#[tokio::test]
async fn reader_resyncs_after_garbage_bytes() {
    init_logging();
    let (listener, device) = bind_device(Version::V3_1).await;

    let (on_update, mut updates) = notify_channel();
    device.set_on_update(on_update);

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let msg = read_client_frame(&mut stream).await;
        assert_eq!(msg.cmd, CommandType::DpQuery as u32);
        stream
            .write_all(&response_frame(
                0,
                CommandType::DpQuery,
                br#"{"dps":{"1":true}}"#,
            ))
            .await
            .unwrap();

        // A frame with a corrupted CRC, then noise, then a valid status
        // frame. Only the valid frame may reach the session.
        let mut corrupted = response_frame(1, CommandType::Status, br#"{"dps":{"9":99}}"#);
        let tamper_at = corrupted.len() - 12;
        corrupted[tamper_at] ^= 0xFF;

        let mut noisy = corrupted;
        noisy.extend_from_slice(b"\x13\x37 not a frame");
        noisy.extend_from_slice(&response_frame(
            2,
            CommandType::Status,
            br#"{"dps":{"9":1}}"#,
        ));
        stream.write_all(&noisy).await.unwrap();

        stream
    });

    device.connect().await.unwrap();
    timeout(RECV_TIMEOUT, updates.recv()).await.unwrap().unwrap();
    timeout(RECV_TIMEOUT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(device.get_dps().unwrap()["9"], 1);

    let _stream = server.await.unwrap();
}

#[tokio::test]
async fn peer_close_stops_session_and_fires_on_stop() {
    init_logging();
    let (listener, device) = bind_device(Version::V3_1).await;

    let (on_update, mut updates) = notify_channel();
    device.set_on_update(on_update);
    let (on_stop, mut stops) = notify_channel();
    device.set_on_stop(on_stop);

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let msg = read_client_frame(&mut stream).await;
        assert_eq!(msg.cmd, CommandType::DpQuery as u32);
        stream
            .write_all(&response_frame(
                0,
                CommandType::DpQuery,
                br#"{"dps":{"1":false}}"#,
            ))
            .await
            .unwrap();

        // Give the client time to dispatch the reply, then drop the socket.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    device.connect().await.unwrap();
    timeout(RECV_TIMEOUT, updates.recv()).await.unwrap().unwrap();
    assert_eq!(device.get_enabled(), Some(false));

    server.await.unwrap();
    timeout(RECV_TIMEOUT, stops.recv()).await.unwrap().unwrap();

    assert!(!device.is_connected());
    assert!(device.get_dps().is_none());
    assert!(matches!(device.update().await, Err(TuyaError::NotConnected)));
}

#[tokio::test]
async fn connect_times_out_against_dead_port() {
    init_logging();
    // Bind a listener and drop it so the port is closed.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let device = Device::builder("127.0.0.1", DEVICE_ID, KEY)
        .port(port)
        .timeout(Duration::from_millis(500))
        .build()
        .unwrap();

    let err = device.connect().await.unwrap_err();
    assert!(matches!(
        err,
        TuyaError::ConnectionFailed | TuyaError::Timeout | TuyaError::Io(_)
    ));
    assert!(!device.is_connected());
}
