//! Tuya wire protocol implementation.
//! Handles 55AA packet framing, header parsing, and CRC32 verification.

use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x0000_55AA;
pub const SUFFIX_55AA: u32 = 0x0000_AA55;

/// Fixed header size: prefix(4) + seq(4) + cmd(4) + length(4).
pub const HEADER_SIZE: usize = 16;
/// Trailing bytes accounted for in every length field: CRC32(4) + suffix(4).
pub const FOOTER_SIZE: usize = 8;

define_command_type! {
    Udp = 0x00,
    ApConfig = 0x01,
    Active = 0x02,
    Bind = 0x03,
    RenameGw = 0x04,
    RenameDevice = 0x05,
    Unbind = 0x06,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    QueryWifi = 0x0b,
    TokenBind = 0x0c,
    ControlNew = 0x0d,
    EnableWifi = 0x0e,
    DpQueryNew = 0x10,
    SceneExecute = 0x11,
    UdpNew = 0x13,
    ApConfigNew = 0x14,
    LanGwActive = 0xf0,
    LanSubDevRequest = 0xf1,
    LanDeleteSubDev = 0xf2,
    LanReportSubDev = 0xf3,
    LanScene = 0xf4,
    LanPublishCloudConfig = 0xf5,
    LanPublishAppConfig = 0xf6,
    LanExportAppConfig = 0xf7,
    LanPublishScenePanel = 0xf8,
    LanRemoveGw = 0xf9,
    LanCheckGwUpdate = 0xfa,
    LanGwUpdate = 0xfb,
    LanSetGwChannel = 0xfc,
}

define_version! {
    V3_1 = "3.1",
    V3_3 = "3.3",
}

impl Default for Version {
    fn default() -> Self {
        Version::V3_1
    }
}

/// Tuya protocol message structure
#[derive(Debug, Clone, Default)]
pub struct TuyaMessage {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Return code (inbound only; absent when the device omits it)
    pub retcode: Option<u32>,
    /// Actual payload (JSON or encrypted binary)
    pub payload: Vec<u8>,
}

/// Tuya protocol header structure
#[derive(Debug, Clone)]
pub struct TuyaHeader {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Declared length (payload + CRC + suffix, and retcode when present)
    pub payload_len: u32,
    /// Total message length (header + payload_len)
    pub total_length: u32,
}

/// Pack a TuyaMessage into binary frame data.
///
/// Layout: Prefix(4), Seq(4), Cmd(4), Len(4), Payload, CRC32(4), Suffix(4).
/// The length field counts payload plus the trailing CRC and suffix; the CRC
/// covers everything before itself.
pub fn pack_message(msg: &TuyaMessage) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(HEADER_SIZE + msg.payload.len() + FOOTER_SIZE);

    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(msg.seqno)?;
    data.write_u32::<BigEndian>(msg.cmd)?;
    data.write_u32::<BigEndian>((msg.payload.len() + FOOTER_SIZE) as u32)?;
    data.extend_from_slice(&msg.payload);

    let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    let crc_val = crc32.checksum(&data);
    data.write_u32::<BigEndian>(crc_val)?;
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;

    Ok(data)
}

/// Parse a Tuya frame header from binary data.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_SIZE {
        return Err(TuyaError::DecodeError("Header too short".into()));
    }

    let mut cursor = Cursor::new(data);
    let prefix = cursor.read_u32::<BigEndian>()?;
    if prefix != PREFIX_55AA {
        return Err(TuyaError::InvalidHeader);
    }

    let seqno = cursor.read_u32::<BigEndian>()?;
    let cmd = cursor.read_u32::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;
    Ok(TuyaHeader {
        seqno,
        cmd,
        payload_len,
        total_length: payload_len + HEADER_SIZE as u32,
    })
}

/// Unpack binary frame data into a TuyaMessage.
///
/// Device frames normally carry a 4-byte return code ahead of the payload,
/// but some firmware omits it. When the first 4 bytes of the variable region
/// have any of their upper 24 bits set they cannot be a return code and are
/// kept as payload instead. The CRC is verified only when a payload is
/// present, matching device behavior for bare ACK frames.
pub fn unpack_message(data: &[u8]) -> Result<TuyaMessage> {
    let header = parse_header(data)?;

    if data.len() < header.total_length as usize {
        return Err(TuyaError::DecodeError("Data shorter than expected".into()));
    }
    if (header.payload_len as usize) < FOOTER_SIZE {
        return Err(TuyaError::DecodeError(format!(
            "Declared length {} below footer size",
            header.payload_len
        )));
    }

    let raw_retcode = BigEndian::read_u32(&data[HEADER_SIZE..HEADER_SIZE + 4]);

    let (payload_start, payload_len, retcode) = if raw_retcode & 0xFFFF_FF00 != 0 {
        (HEADER_SIZE, header.payload_len as i64 - 8, None)
    } else {
        (HEADER_SIZE + 4, header.payload_len as i64 - 12, Some(raw_retcode))
    };

    if payload_len <= 0 {
        return Ok(TuyaMessage {
            seqno: header.seqno,
            cmd: header.cmd,
            retcode,
            payload: Vec::new(),
        });
    }

    let payload_end = payload_start + payload_len as usize;
    let expected_crc = BigEndian::read_u32(&data[payload_end..payload_end + 4]);
    let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    let actual_crc = crc32.checksum(&data[..payload_end]);
    if actual_crc != expected_crc {
        return Err(TuyaError::CrcMismatch);
    }

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode,
        payload: data[payload_start..payload_end].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_u32(data: &[u8], offset: usize) -> u32 {
        BigEndian::read_u32(&data[offset..offset + 4])
    }

    #[test]
    fn pack_control_frame_structure() {
        let msg = TuyaMessage {
            seqno: 3,
            cmd: CommandType::Control as u32,
            retcode: None,
            payload: b"hello".to_vec(),
        };
        let data = pack_message(&msg).unwrap();

        assert_eq!(data.len(), HEADER_SIZE + 5 + FOOTER_SIZE);
        assert_eq!(frame_u32(&data, 0), PREFIX_55AA);
        assert_eq!(frame_u32(&data, 4), 3);
        assert_eq!(frame_u32(&data, 8), 0x07);
        assert_eq!(frame_u32(&data, 12), 5 + FOOTER_SIZE as u32);
        assert_eq!(&data[HEADER_SIZE..HEADER_SIZE + 5], b"hello");

        let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let expected = crc32.checksum(&data[..HEADER_SIZE + 5]);
        assert_eq!(frame_u32(&data, HEADER_SIZE + 5), expected);
        assert_eq!(frame_u32(&data, data.len() - 4), SUFFIX_55AA);
    }

    #[test]
    fn heartbeat_frame_is_header_and_footer_only() {
        let msg = TuyaMessage {
            seqno: 7,
            cmd: CommandType::HeartBeat as u32,
            retcode: None,
            payload: Vec::new(),
        };
        let data = pack_message(&msg).unwrap();

        assert_eq!(data.len(), 24);
        assert_eq!(frame_u32(&data, 12), 8);

        // An empty frame still round-trips through the decoder.
        let decoded = unpack_message(&data).unwrap();
        assert_eq!(decoded.seqno, 7);
        assert_eq!(decoded.cmd, CommandType::HeartBeat as u32);
        assert!(decoded.payload.is_empty());
    }

    /// Build a device-style frame carrying an explicit return code.
    fn device_frame(seqno: u32, cmd: u32, retcode: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&PREFIX_55AA.to_be_bytes());
        data.extend_from_slice(&seqno.to_be_bytes());
        data.extend_from_slice(&cmd.to_be_bytes());
        data.extend_from_slice(&((payload.len() + 4 + FOOTER_SIZE) as u32).to_be_bytes());
        data.extend_from_slice(&retcode.to_be_bytes());
        data.extend_from_slice(payload);
        let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
        let crc = crc32.checksum(&data);
        data.extend_from_slice(&crc.to_be_bytes());
        data.extend_from_slice(&SUFFIX_55AA.to_be_bytes());
        data
    }

    #[test]
    fn unpack_frame_with_return_code() {
        let payload = br#"{"dps":{"1":true}}"#;
        let data = device_frame(9, CommandType::Status as u32, 0, payload);
        let msg = unpack_message(&data).unwrap();
        assert_eq!(msg.seqno, 9);
        assert_eq!(msg.cmd, CommandType::Status as u32);
        assert_eq!(msg.retcode, Some(0));
        assert_eq!(msg.payload, payload);
    }

    #[test]
    fn unpack_frame_without_return_code() {
        // Firmware that omits the return code: the variable region starts
        // directly with JSON, whose first bytes cannot be a return code.
        let payload = br#"{"dps":{"1":false}}"#;
        let msg = TuyaMessage {
            seqno: 1,
            cmd: CommandType::Status as u32,
            retcode: None,
            payload: payload.to_vec(),
        };
        let data = pack_message(&msg).unwrap();

        let decoded = unpack_message(&data).unwrap();
        assert_eq!(decoded.retcode, None);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn corrupted_frame_fails_crc() {
        let mut data = device_frame(2, CommandType::Status as u32, 0, br#"{"dps":{}}"#);
        data[HEADER_SIZE + 6] ^= 0xFF;
        assert!(matches!(unpack_message(&data), Err(TuyaError::CrcMismatch)));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let data = device_frame(2, CommandType::Status as u32, 0, br#"{"dps":{}}"#);
        assert!(unpack_message(&data[..data.len() - 6]).is_err());
        assert!(parse_header(&data[..10]).is_err());
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let mut data = device_frame(2, CommandType::Status as u32, 0, br#"{"dps":{}}"#);
        data[0] = 0x55;
        assert!(matches!(parse_header(&data), Err(TuyaError::InvalidHeader)));
    }

    #[test]
    fn command_type_raw_conversions() {
        assert_eq!(CommandType::HeartBeat as u32, 9);
        assert_eq!(CommandType::DpQuery as u32, 10);
        assert_eq!(CommandType::LanSetGwChannel as u32, 252);
        assert_eq!(CommandType::from_u32(7), Some(CommandType::Control));
        assert_eq!(CommandType::from_u32(0xdead), None);
    }

    #[test]
    fn version_string_conversions() {
        assert_eq!(Version::V3_3.as_str(), "3.3");
        assert_eq!(Version::V3_1.as_bytes(), b"3.1");
        assert_eq!("3.1".parse::<Version>().unwrap(), Version::V3_1);
        assert!("3.5".parse::<Version>().is_err());
        assert_eq!(Version::default(), Version::V3_1);
    }
}
