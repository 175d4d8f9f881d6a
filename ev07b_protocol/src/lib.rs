// lib.rs: EV07B/EV04 wire protocol (frames, TLV bodies, geofence payloads)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use crc::{CRC_16_XMODEM, Crc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

// =============================== Common =====================================

pub type Timestamp = DateTime<Utc>;

pub const HEADER: u8 = 0xAB;
pub const MAX_BODY_LEN: usize = 4096;
/// header + properties + length(2) + checksum(2) + sequence(2)
pub const FRAME_OVERHEAD: usize = 8;
pub const DEFAULT_GATEWAY_PORT: u16 = 7000;

/// Properties bit 4: the sender wants an ACK frame back.
pub const PROP_ACK_REQUESTED: u8 = 0x10;

pub const UNKNOWN_DEVICE: &str = "UNKNOWN";
pub const ACK_PAYLOAD: [u8; 3] = [cmd::ACK, 0x01, 0x00];

/// Command ids (first body byte).
pub mod cmd {
    pub const DATA: u8 = 0x01;
    pub const CONFIG: u8 = 0x02;
    pub const SERVICES: u8 = 0x03;
    pub const HEARTBEAT: u8 = 0x10;
    pub const GEOFENCE: u8 = 0x51;
    pub const ACK: u8 = 0x7F;
}

/// TLV keys inside a body.
pub mod key {
    pub const DEVICE_ID: u8 = 0x01;
    pub const ALARM_CODE: u8 = 0x02;
    pub const GPS: u8 = 0x20;
    pub const GENERAL_DATA: u8 = 0x24;
    pub const GEOFENCE: u8 = 0x51;
}

pub const ALARM_SUBCODE_GEOFENCE: u8 = 0xA1;
/// `[0x51][0xA1][index][state][radius LE][lat LE][lon LE]`; a fence config is one byte shorter.
pub const GEOFENCE_ALARM_LEN: usize = 14;

// =============================== Errors =====================================

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid geofence config: {0}")]
    InvalidGeofence(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

// ================================ CRC16 =====================================

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16/CCITT: polynomial 0x1021, init 0, no final xor.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

// ================================ Frames ====================================

/// Outbound frame before serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub properties: u8,
    pub sequence_id: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(properties: u8, sequence_id: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            properties,
            sequence_id,
            payload: payload.into(),
        }
    }

    /// ACK for an inbound frame: echoes the sequence id, never asks for an ACK itself.
    pub fn ack(sequence_id: u16) -> Self {
        Self::new(0x00, sequence_id, Bytes::from_static(&ACK_PAYLOAD))
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        encode_frame(self.properties, self.sequence_id, &self.payload)
    }
}

/// `[0xAB][props][len LE][crc LE][seq LE][payload]`
pub fn encode_frame(properties: u8, sequence_id: u16, payload: &[u8]) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    write_frame(properties, sequence_id, payload, &mut dst)?;
    Ok(dst.freeze())
}

fn write_frame(properties: u8, sequence_id: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > MAX_BODY_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_BODY_LEN,
        });
    }
    dst.reserve(FRAME_OVERHEAD + payload.len());
    dst.put_u8(HEADER);
    dst.put_u8(properties);
    dst.put_u16_le(payload.len() as u16);
    dst.put_u16_le(crc16(payload));
    dst.put_u16_le(sequence_id);
    dst.put_slice(payload);
    Ok(())
}

// =============================== Message ====================================

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub device_id: String,
    pub command_id: u8,
    pub body: Bytes,
    pub properties: u8,
    pub sequence_id: u16,
    pub received_at: Timestamp,
}

impl Message {
    pub fn from_body(properties: u8, sequence_id: u16, body: Bytes) -> Self {
        Self {
            device_id: extract_device_id(&body),
            command_id: body.first().copied().unwrap_or(0),
            body,
            properties,
            sequence_id,
            received_at: Utc::now(),
        }
    }

    pub fn ack_requested(&self) -> bool {
        self.properties & PROP_ACK_REQUESTED != 0
    }

    pub fn has_identity(&self) -> bool {
        !self.device_id.is_empty() && self.device_id != UNKNOWN_DEVICE
    }

    /// Copy carrying an identity recovered elsewhere (e.g. from the session registry).
    pub fn with_device_id(&self, device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..self.clone()
        }
    }

    pub fn tlv(&self) -> TlvReader<'_> {
        TlvReader::new(&self.body)
    }
}

// ================================ Codec =====================================

/// Stream codec for device connections.
///
/// Decoding never fails on bad input: oversized lengths and CRC mismatches drop
/// the header byte and rescan, so one corrupt frame cannot tear down the stream.
#[derive(Debug, Default)]
pub struct FrameCodec {
    rejected: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames dropped for length or CRC violations since creation.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match src.iter().position(|&b| b == HEADER) {
                Some(0) => {}
                Some(skip) => src.advance(skip),
                None => {
                    src.clear();
                    return Ok(None);
                }
            }

            // properties + length
            if src.len() < 4 {
                return Ok(None);
            }
            let properties = src[1];
            let body_len = u16::from_le_bytes([src[2], src[3]]) as usize;
            if body_len > MAX_BODY_LEN {
                warn!(body_len, max = MAX_BODY_LEN, "protocol violation: body length over limit, frame rejected");
                self.rejected += 1;
                src.advance(1);
                continue;
            }

            let total = FRAME_OVERHEAD + body_len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let checksum = u16::from_le_bytes([src[4], src[5]]);
            let sequence_id = u16::from_le_bytes([src[6], src[7]]);
            let calculated = crc16(&src[FRAME_OVERHEAD..total]);
            if calculated != checksum {
                warn!(
                    calc = format_args!("{calculated:04X}"),
                    recv = format_args!("{checksum:04X}"),
                    seq = sequence_id,
                    "CRC mismatch, frame dropped"
                );
                self.rejected += 1;
                src.advance(1);
                continue;
            }

            let mut frame = src.split_to(total);
            frame.advance(FRAME_OVERHEAD);
            return Ok(Some(Message::from_body(properties, sequence_id, frame.freeze())));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if let Some(msg) = self.decode(src)? {
            return Ok(Some(msg));
        }
        if !src.is_empty() {
            debug!(bytes = src.len(), "discarding partial frame at end of stream");
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        write_frame(item.properties, item.sequence_id, &item.payload, dst)
    }
}

// ================================= TLV ======================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub key: u8,
    pub value: &'a [u8],
}

/// Walks `[keyLen][key][value: keyLen-1]` entries after the command byte.
/// Stops quietly at the first entry that does not fit the body.
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { body, pos: 1 }
    }

    /// Value of the first entry with `key`.
    pub fn value_of(mut self, key: u8) -> Option<&'a [u8]> {
        self.find(|t| t.key == key).map(|t| t.value)
    }
}

impl<'a> Iterator for TlvReader<'a> {
    type Item = Tlv<'a>;

    fn next(&mut self) -> Option<Tlv<'a>> {
        let key_len = *self.body.get(self.pos)? as usize;
        let key = match self.body.get(self.pos + 1) {
            Some(&k) if key_len >= 1 => k,
            _ => {
                self.pos = self.body.len();
                return None;
            }
        };
        let start = self.pos + 2;
        let end = start + key_len - 1;
        if end > self.body.len() {
            self.pos = self.body.len();
            return None;
        }
        self.pos = end;
        Some(Tlv {
            key,
            value: &self.body[start..end],
        })
    }
}

/// Device identity from key 0x01, else the longest digit run (>= 10), else `UNKNOWN`.
pub fn extract_device_id(body: &[u8]) -> String {
    device_id_from_keys(body)
        .or_else(|| longest_digit_run(body))
        .unwrap_or_else(|| UNKNOWN_DEVICE.to_string())
}

fn device_id_from_keys(body: &[u8]) -> Option<String> {
    TlvReader::new(body)
        .filter(|t| t.key == key::DEVICE_ID && t.value.len() >= 8)
        .find_map(|t| {
            let digits = &t.value[..t.value.len().min(15)];
            if digits.len() >= 6 && digits.iter().all(u8::is_ascii_digit) {
                Some(String::from_utf8_lossy(digits).into_owned())
            } else {
                None
            }
        })
}

fn longest_digit_run(body: &[u8]) -> Option<String> {
    let best = body
        .split(|b| !b.is_ascii_digit())
        .fold(&[][..], |best, run| if run.len() > best.len() { run } else { best });
    if best.len() >= 10 {
        Some(String::from_utf8_lossy(&best[..best.len().min(15)]).into_owned())
    } else {
        None
    }
}

// ============================ Field decoders =================================

fn le_u32(value: &[u8], at: usize) -> Option<u32> {
    value.get(at..at + 4)?.try_into().ok().map(u32::from_le_bytes)
}

fn le_i32(value: &[u8], at: usize) -> Option<i32> {
    value.get(at..at + 4)?.try_into().ok().map(i32::from_le_bytes)
}

fn to_fixed(degrees: f64) -> i32 {
    (degrees * 1e7).round() as i32
}

/// Key 0x20: LE i32 latitude, LE i32 longitude, both scaled by 1e7.
/// Trailing speed/heading/altitude fields vary by firmware and are ignored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
}

impl GpsFix {
    pub fn parse(value: &[u8]) -> Option<Self> {
        Some(Self {
            lat: le_i32(value, 0)? as f64 / 1e7,
            lon: le_i32(value, 4)? as f64 / 1e7,
        })
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&to_fixed(self.lat).to_le_bytes());
        out[4..].copy_from_slice(&to_fixed(self.lon).to_le_bytes());
        out
    }

    pub fn maps_url(&self) -> String {
        format!("https://www.google.com/maps?q={:.7},{:.7}", self.lat, self.lon)
    }
}

/// Key 0x24: LE u32 epoch seconds.
pub fn parse_timestamp(value: &[u8]) -> Option<Timestamp> {
    Utc.timestamp_opt(le_u32(value, 0)? as i64, 0).single()
}

/// Key 0x02: alarm bit field, optional UTC word, optional extend word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmCode {
    pub code: u32,
    pub utc: Option<u32>,
    pub extend: Option<u32>,
}

/// Geofence alarm carried in an alarm code. `inside` is `None` when the
/// device did not mark the in/out bits valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeofenceEvent {
    pub index: u8,
    pub inside: Option<bool>,
}

impl AlarmCode {
    pub fn parse(value: &[u8]) -> Option<Self> {
        Some(Self {
            code: le_u32(value, 0)?,
            utc: le_u32(value, 4),
            extend: le_u32(value, 8),
        })
    }

    /// Bits 4..=7 map to fences 1..=4, lowest bit wins. Extend bit 16 marks
    /// bits 26..=29 as valid in/out flags (1 = inside).
    pub fn geofence_event(&self) -> Option<GeofenceEvent> {
        let bit = (4..=7u32).find(|b| (self.code >> b) & 1 == 1)?;
        let index = (bit - 3) as u8;
        let inside = self
            .extend
            .filter(|ext| (ext >> 16) & 1 == 1)
            .map(|ext| (ext >> (26 + u32::from(index) - 1)) & 1 == 1);
        Some(GeofenceEvent { index, inside })
    }
}

// =============================== Geofence ===================================

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceDirection {
    /// Alarm when the device leaves the fence.
    Exit = 0,
    /// Alarm when the device enters the fence.
    Entry = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FenceShape {
    #[default]
    Circle = 0,
    Polygon = 1,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    /// Store-assigned id; keys the evaluator's inside/outside state.
    #[serde(default)]
    pub id: u64,
    pub device_id: String,
    pub index: u8,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub direction: FenceDirection,
    #[serde(default)]
    pub shape: FenceShape,
    #[serde(default)]
    pub points: u8,
    pub radius_m: u16,
    pub center_lat: f64,
    pub center_lon: f64,
}

fn default_enabled() -> bool {
    true
}

impl Geofence {
    pub fn circle(
        device_id: &str,
        index: u8,
        direction: FenceDirection,
        radius_m: u16,
        center_lat: f64,
        center_lon: f64,
    ) -> Self {
        Self {
            id: 0,
            device_id: device_id.to_string(),
            index: index & 0x0F,
            enabled: true,
            direction,
            shape: FenceShape::Circle,
            points: 0,
            radius_m,
            center_lat,
            center_lon,
        }
    }

    /// bits 0-3 index, 4-7 points, 8 enable, 9 direction, 10 shape, 16-31 radius
    pub fn flags(&self) -> u32 {
        u32::from(self.index & 0x0F)
            | u32::from(self.points & 0x0F) << 4
            | u32::from(self.enabled) << 8
            | (self.direction as u32) << 9
            | (self.shape as u32) << 10
            | u32::from(self.radius_m) << 16
    }

    /// `[0x51][flags LE][lat LE][lon LE]`
    pub fn encode_config(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(13);
        out.put_u8(cmd::GEOFENCE);
        out.put_u32_le(self.flags());
        out.put_i32_le(to_fixed(self.center_lat));
        out.put_i32_le(to_fixed(self.center_lon));
        out.freeze()
    }

    /// Config push body: the fence config wrapped under key 0x51 of a 0x02 command.
    pub fn config_push_payload(&self) -> Bytes {
        let config = self.encode_config();
        let mut out = BytesMut::with_capacity(2 + config.len());
        out.put_u8(cmd::CONFIG);
        out.put_u8(config.len() as u8);
        out.put_slice(&config);
        out.freeze()
    }

    /// Parses a fence config, with or without the leading 0x51 command byte.
    pub fn decode_config(device_id: &str, payload: &[u8]) -> Result<Self> {
        let mut buf = match payload.first() {
            Some(&cmd::GEOFENCE) => &payload[1..],
            _ => payload,
        };
        if buf.len() < 12 {
            return Err(ProtocolError::InvalidGeofence(format!(
                "need 12 bytes of flags and center, got {}",
                buf.len()
            )));
        }
        let flags = buf.get_u32_le();
        let lat = buf.get_i32_le();
        let lon = buf.get_i32_le();
        Ok(Self {
            id: 0,
            device_id: device_id.to_string(),
            index: (flags & 0x0F) as u8,
            points: ((flags >> 4) & 0x0F) as u8,
            enabled: (flags >> 8) & 1 == 1,
            direction: if (flags >> 9) & 1 == 1 { FenceDirection::Entry } else { FenceDirection::Exit },
            shape: if (flags >> 10) & 1 == 1 { FenceShape::Polygon } else { FenceShape::Circle },
            radius_m: (flags >> 16) as u16,
            center_lat: lat as f64 / 1e7,
            center_lon: lon as f64 / 1e7,
        })
    }

    pub fn distance_m(&self, lat: f64, lon: f64) -> f64 {
        haversine_m(lat, lon, self.center_lat, self.center_lon)
    }

    /// A zero radius never contains anything.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.radius_m > 0 && self.distance_m(lat, lon) <= f64::from(self.radius_m)
    }
}

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// `[0x51][0xA1][index][state][radius LE][lat LE][lon LE]`, state 0x00 = in, 0x01 = out.
pub fn geofence_alarm_payload(index: u8, state: u8, radius_m: u16, lat: f64, lon: f64) -> Bytes {
    let mut out = BytesMut::with_capacity(GEOFENCE_ALARM_LEN);
    out.put_u8(cmd::GEOFENCE);
    out.put_u8(ALARM_SUBCODE_GEOFENCE);
    out.put_u8(index);
    out.put_u8(state);
    out.put_u16_le(radius_m);
    out.put_i32_le(to_fixed(lat));
    out.put_i32_le(to_fixed(lon));
    out.freeze()
}

// ================================ Tests =====================================
