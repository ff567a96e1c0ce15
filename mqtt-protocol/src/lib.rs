//! MQTT 3.1.1 (protocol level 4) wire codec.
//!
//! Spec: http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html
//!
//! Packet types are plain structs with public fields; serialization lives in
//! per-packet `read`/`write` functions under [`v4`]. The broker reads from a
//! `BytesMut` it fills from the socket and writes into a `Vec<u8>` it hands
//! to the socket, so the codec never touches I/O itself.

use bytes::{Buf, Bytes};

pub mod v4;

/// Quality of service of a PUBLISH or a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

pub fn qos(num: u8) -> Result<QoS, Error> {
    match num {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        qos => Err(Error::InvalidQoS(qos)),
    }
}

/// Packet type from the first nibble of the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// Fixed header of an MQTT control packet: one flags byte plus a variable
/// length encoding of the number of bytes that follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// Packet type nibble and flags nibble.
    pub byte1: u8,
    /// Length of the fixed header itself: 1 flags byte + 1..=4 length bytes.
    pub fixed_header_len: usize,
    /// Number of bytes in the variable header and payload.
    pub remaining_len: usize,
}

impl FixedHeader {
    pub fn new(byte1: u8, remaining_len_len: usize, remaining_len: usize) -> FixedHeader {
        FixedHeader {
            byte1,
            fixed_header_len: remaining_len_len + 1,
            remaining_len,
        }
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        let num = self.byte1 >> 4;
        match num {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            num => Err(Error::InvalidPacketType(num)),
        }
    }

    /// Length of the full frame: fixed header plus variable header and payload.
    pub fn frame_length(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet. The username/password pair is carried in [`Login`];
/// the password is kept as raw bytes because the spec allows binary data
/// there (3.1.3.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub keep_alive: u16,
    pub client_id: String,
    pub clean_session: bool,
    pub last_will: Option<LastWill>,
    pub login: Option<Login>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    pub password: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// CONNACK return codes (3.2.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Success = 0,
    RefusedProtocolVersion = 1,
    BadClientId = 2,
    ServiceUnavailable = 3,
    BadUserNamePassword = 4,
    NotAuthorized = 5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// Zero when `qos` is [`QoS::AtMostOnce`].
    pub pkid: u16,
    pub topic: Bytes,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRec {
    pub pkid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubRel {
    pub pkid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubComp {
    pub pkid: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
}

/// SUBACK return codes. Anything other than a success-with-QoS is the
/// failure code 0x80 (3.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Success(QoS),
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not an error: the caller should read at least this many more bytes
    /// from the socket and try again.
    #[error("at least {0} more bytes required to frame the packet")]
    InsufficientBytes(usize),
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("invalid protocol")]
    InvalidProtocol,
    #[error("invalid protocol level: {0}")]
    InvalidProtocolLevel(u8),
    #[error("invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("invalid CONNECT return code: {0}")]
    InvalidConnectReturnCode(u8),
    #[error("invalid SUBACK return code: {0}")]
    InvalidSubscribeReasonCode(u8),
    #[error("packet of {pkt_len} bytes exceeds the size limit of {max} bytes")]
    PayloadSizeLimitExceeded { pkt_len: usize, max: usize },
    #[error("payload too long to encode")]
    PayloadTooLong,
    #[error("promised boundary {0} crossed")]
    BoundaryCrossed(usize),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed remaining length")]
    MalformedRemainingLength,
    #[error("malformed packet")]
    MalformedPacket,
}

/// Parse the fixed header from the start of `stream` without consuming it.
///
/// Returns [`Error::InsufficientBytes`] while the length encoding is still
/// incomplete, which callers treat as "read more and retry".
pub fn parse_fixed_header(stream: &[u8]) -> Result<FixedHeader, Error> {
    if stream.is_empty() {
        return Err(Error::InsufficientBytes(2));
    }

    let byte1 = stream[0];
    let (len_len, remaining_len) = length(&stream[1..])?;

    Ok(FixedHeader::new(byte1, len_len, remaining_len))
}

/// Decode the variable length encoding used for the remaining length
/// (2.2.3): 7 bits per byte, continuation in the high bit, at most 4 bytes.
fn length(stream: &[u8]) -> Result<(usize, usize), Error> {
    let mut len = 0;
    let mut shift = 0;
    let mut len_len = 0;
    let mut done = false;

    for &byte in stream {
        len_len += 1;
        len += ((byte & 0x7F) as usize) << shift;

        if byte & 0x80 == 0 {
            done = true;
            break;
        }

        shift += 7;
        if shift > 21 {
            return Err(Error::MalformedRemainingLength);
        }
    }

    if !done {
        return Err(Error::InsufficientBytes(1));
    }

    Ok((len_len, len))
}

pub(crate) fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u8())
}

pub(crate) fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u16())
}

/// Read a length-prefixed byte string (1.5.3 without the UTF-8 requirement).
pub(crate) fn read_mqtt_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    let len = read_u16(stream)? as usize;

    if len > stream.len() {
        return Err(Error::BoundaryCrossed(len));
    }

    Ok(stream.split_to(len))
}

pub(crate) fn read_mqtt_string(stream: &mut Bytes) -> Result<String, Error> {
    let bytes = read_mqtt_bytes(stream)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
}

pub(crate) fn write_mqtt_bytes(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buffer.extend_from_slice(bytes);
}

pub(crate) fn write_mqtt_string(buffer: &mut Vec<u8>, string: &str) {
    write_mqtt_bytes(buffer, string.as_bytes());
}

/// Encode the remaining length, returning the number of bytes it took.
pub(crate) fn write_remaining_length(buffer: &mut Vec<u8>, len: usize) -> Result<usize, Error> {
    // 2.2.3: four length bytes encode at most 268,435,455.
    if len > 268_435_455 {
        return Err(Error::PayloadTooLong);
    }

    let mut done = false;
    let mut x = len;
    let mut count = 0;

    while !done {
        let mut byte = (x % 128) as u8;
        x /= 128;
        if x > 0 {
            byte |= 0x80;
        }

        buffer.push(byte);
        count += 1;
        done = x == 0;
    }

    Ok(count)
}

/// A topic name a client is allowed to publish to: non-empty and free of
/// wildcards (4.7.3, 3.3.2.1).
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

/// A subscription filter: non-empty, `#` only as the last whole level,
/// `+` only as a whole level (4.7.1).
pub fn valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }

    let mut levels = filter.split('/').peekable();

    while let Some(level) = levels.next() {
        if level == "#" {
            return levels.peek().is_none();
        }

        if level != "+" && level.contains(['+', '#']) {
            return false;
        }
    }

    true
}
