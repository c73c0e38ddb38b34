//! MQTT 3.1.1 control packet codec.
//!
//! Decoding is strictly two-phase: [`check`] frames a packet by parsing the
//! fixed header and comparing the advertised Remaining Length against the
//! buffered bytes, and only once the whole frame is buffered do the per-packet
//! readers run. A short buffer therefore always surfaces as
//! [`Error::InsufficientBytes`]; any shortage *inside* a complete frame means
//! the advertised lengths lie and the packet is malformed.
//!
//! http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718019

use bytes::{Buf, Bytes, BytesMut};

mod acks;
mod connack;
mod connect;
mod publish;
mod suback;
mod subscribe;
mod unsubscribe;

pub use acks::{PubAck, PubComp, PubRec, PubRel};
pub use connack::{ConnAck, ConnectReturnCode};
pub use connect::{Connect, LastWill, Login};
pub use publish::Publish;
pub use suback::{SubAck, SubscribeReasonCode};
pub use subscribe::{Subscribe, SubscribeFilter};
pub use unsubscribe::{UnsubAck, Unsubscribe};

/// The Remaining Length field encodes up to four 7-bit digits.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

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

/// MQTT control packet types (the high nibble of the first header byte).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
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

/// Quality of service levels, ordered so that `cmp::min` picks the weaker
/// guarantee.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(Error::InvalidQoS(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The buffer ends before the advertised end of the packet.
    ///
    /// This is the only non-fatal error: the caller should read at least this
    /// many more bytes and retry.
    #[error("at least {0} more bytes required to frame the packet")]
    InsufficientBytes(usize),
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),
    #[error("reserved flag bits {flags:#06b} set for {packet_type:?}")]
    InvalidFixedHeaderFlags { packet_type: PacketType, flags: u8 },
    #[error("invalid QoS: {0}")]
    InvalidQoS(u8),
    #[error("invalid CONNACK return code: {0}")]
    InvalidConnectReturnCode(u8),
    #[error("invalid SUBACK return code: {0}")]
    InvalidSubscribeReasonCode(u8),
    #[error("packet ID cannot be zero")]
    PacketIdZero,
    #[error("DUP flag set on a QoS 0 PUBLISH")]
    DupOnQoSZero,
    #[error("reserved bit in the CONNECT flags must be zero")]
    ConnectReservedFlag,
    #[error("malformed Remaining Length field")]
    MalformedRemainingLength,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("packet content does not match its advertised length")]
    MalformedPacket,
    #[error("SUBSCRIBE must carry at least one filter")]
    EmptySubscription,
    #[error("packet of {size} bytes exceeds the read limit of {limit} bytes")]
    PayloadSizeLimitExceeded { size: usize, limit: usize },
    #[error("packet is too large to encode: {0} bytes")]
    PayloadTooLong(usize),
}

impl Error {
    /// Whether the caller can recover by reading more bytes.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::InsufficientBytes(_))
    }
}

/// The parsed first byte and Remaining Length of a packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FixedHeader {
    byte1: u8,
    /// Length of the fixed header itself: one type/flags byte plus 1..=4
    /// Remaining Length bytes.
    fixed_header_len: usize,
    remaining_len: usize,
}

impl FixedHeader {
    fn new(byte1: u8, remaining_len_len: usize, remaining_len: usize) -> Self {
        Self {
            byte1,
            fixed_header_len: remaining_len_len + 1,
            remaining_len,
        }
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        match self.byte1 >> 4 {
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
            reserved => Err(Error::InvalidPacketType(reserved)),
        }
    }

    pub fn flags(&self) -> u8 {
        self.byte1 & 0x0F
    }

    pub fn remaining_len(&self) -> usize {
        self.remaining_len
    }

    /// Total frame length: fixed header plus variable header and payload.
    pub fn frame_length(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }
}

/// Parse the fixed header and confirm the whole frame is buffered.
pub fn check(stream: &[u8], max_packet_size: usize) -> Result<FixedHeader, Error> {
    let fixed_header = parse_fixed_header(stream)?;

    if fixed_header.remaining_len > max_packet_size {
        return Err(Error::PayloadSizeLimitExceeded {
            size: fixed_header.remaining_len,
            limit: max_packet_size,
        });
    }

    let frame_length = fixed_header.frame_length();
    if stream.len() < frame_length {
        return Err(Error::InsufficientBytes(frame_length - stream.len()));
    }

    Ok(fixed_header)
}

fn parse_fixed_header(stream: &[u8]) -> Result<FixedHeader, Error> {
    if stream.len() < 2 {
        return Err(Error::InsufficientBytes(2 - stream.len()));
    }

    let byte1 = stream[0];
    let (len_len, remaining_len) = decode_remaining_length(&stream[1..])?;

    Ok(FixedHeader::new(byte1, len_len, remaining_len))
}

/// Decode the Remaining Length varint; bit 7 of each byte is the continuation
/// flag and the value is limited to four bytes.
fn decode_remaining_length(stream: &[u8]) -> Result<(usize, usize), Error> {
    let mut len = 0;
    let mut len_len = 0;
    let mut shift = 0;
    let mut done = false;

    for &byte in stream {
        len_len += 1;
        len += ((byte & 0x7F) as usize) << shift;

        done = byte & 0x80 == 0;
        if done {
            break;
        }

        shift += 7;

        // A continuation bit on the fourth byte overflows the 28-bit bound.
        if shift > 21 {
            return Err(Error::MalformedRemainingLength);
        }
    }

    if !done {
        return Err(Error::InsufficientBytes(1));
    }

    Ok((len_len, len))
}

/// Decode one packet from the front of `stream`, splitting it off on success.
///
/// `max_packet_size` caps the Remaining Length of any single packet; see
/// [`Error::PayloadSizeLimitExceeded`].
pub fn read_mut(stream: &mut BytesMut, max_packet_size: usize) -> Result<Packet, Error> {
    let fixed_header = check(stream, max_packet_size)?;
    let packet_type = fixed_header.packet_type()?;

    // The frame is complete; any error past this point is fatal.
    let frame = stream.split_to(fixed_header.frame_length()).freeze();

    // PUBLISH carries its flags in the header; every other type reserves them.
    // [MQTT-2.2.2-1] and table 2.2.
    if packet_type != PacketType::Publish {
        let expected = match packet_type {
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => 0b0010,
            _ => 0b0000,
        };

        if fixed_header.flags() != expected {
            return Err(Error::InvalidFixedHeaderFlags {
                packet_type,
                flags: fixed_header.flags(),
            });
        }
    }

    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(connect::read(fixed_header, frame)?),
        PacketType::ConnAck => Packet::ConnAck(connack::read(fixed_header, frame)?),
        PacketType::Publish => Packet::Publish(publish::read(fixed_header, frame)?),
        PacketType::PubAck => Packet::PubAck(PubAck {
            pkid: acks::read(fixed_header, frame)?,
        }),
        PacketType::PubRec => Packet::PubRec(PubRec {
            pkid: acks::read(fixed_header, frame)?,
        }),
        PacketType::PubRel => Packet::PubRel(PubRel {
            pkid: acks::read(fixed_header, frame)?,
        }),
        PacketType::PubComp => Packet::PubComp(PubComp {
            pkid: acks::read(fixed_header, frame)?,
        }),
        PacketType::Subscribe => Packet::Subscribe(subscribe::read(fixed_header, frame)?),
        PacketType::SubAck => Packet::SubAck(suback::read(fixed_header, frame)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(unsubscribe::read(fixed_header, frame)?),
        PacketType::UnsubAck => Packet::UnsubAck(unsubscribe::read_ack(fixed_header, frame)?),
        PacketType::PingReq => read_empty(fixed_header, Packet::PingReq)?,
        PacketType::PingResp => read_empty(fixed_header, Packet::PingResp)?,
        PacketType::Disconnect => read_empty(fixed_header, Packet::Disconnect)?,
    };

    Ok(packet)
}

fn read_empty(fixed_header: FixedHeader, packet: Packet) -> Result<Packet, Error> {
    if fixed_header.remaining_len != 0 {
        return Err(Error::MalformedPacket);
    }

    Ok(packet)
}

/// Append the canonical encoding of `packet` to `buffer`.
///
/// The Remaining Length is computed up front, so the buffer only ever grows by
/// whole packets; the codec never leaves a partial packet behind.
pub fn write(packet: &Packet, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    match packet {
        Packet::Connect(connect) => connect::write(connect, buffer),
        Packet::ConnAck(connack) => connack::write(connack, buffer),
        Packet::Publish(publish) => publish::write(publish, buffer),
        Packet::PubAck(puback) => acks::write(0x40, puback.pkid, buffer),
        Packet::PubRec(pubrec) => acks::write(0x50, pubrec.pkid, buffer),
        Packet::PubRel(pubrel) => acks::write(0x62, pubrel.pkid, buffer),
        Packet::PubComp(pubcomp) => acks::write(0x70, pubcomp.pkid, buffer),
        Packet::Subscribe(subscribe) => subscribe::write(subscribe, buffer),
        Packet::SubAck(suback) => suback::write(suback, buffer),
        Packet::Unsubscribe(unsubscribe) => unsubscribe::write(unsubscribe, buffer),
        Packet::UnsubAck(unsuback) => unsubscribe::write_ack(unsuback, buffer),
        Packet::PingReq => write_empty(0xC0, buffer),
        Packet::PingResp => write_empty(0xD0, buffer),
        Packet::Disconnect => write_empty(0xE0, buffer),
    }
}

fn write_empty(byte1: u8, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.extend_from_slice(&[byte1, 0x00]);
    Ok(2)
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

// Shared field readers. These run only on fully framed packets, so a shortage
// here means the advertised lengths were wrong.

fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    if stream.is_empty() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u8())
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    if stream.len() < 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.get_u16())
}

fn read_mqtt_bytes(stream: &mut Bytes) -> Result<Bytes, Error> {
    let len = read_u16(stream)? as usize;

    if len > stream.len() {
        return Err(Error::MalformedPacket);
    }

    Ok(stream.split_to(len))
}

fn read_mqtt_string(stream: &mut Bytes) -> Result<String, Error> {
    let bytes = read_mqtt_bytes(stream)?;

    String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidUtf8)
}

fn write_mqtt_bytes(buffer: &mut Vec<u8>, bytes: &[u8]) {
    buffer.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buffer.extend_from_slice(bytes);
}

fn write_mqtt_string(buffer: &mut Vec<u8>, string: &str) {
    write_mqtt_bytes(buffer, string.as_bytes());
}

/// Encode the Remaining Length varint, returning the number of bytes written.
fn write_remaining_length(buffer: &mut Vec<u8>, len: usize) -> Result<usize, Error> {
    if len > MAX_REMAINING_LENGTH {
        return Err(Error::PayloadTooLong(len));
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

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;

    pub(crate) fn sample_packets() -> Vec<Packet> {
        vec![
            Packet::Connect(Connect {
                protocol_name: "MQTT".into(),
                protocol_level: 4,
                clean_session: true,
                keep_alive: 30,
                client_id: "sample".into(),
                last_will: Some(LastWill {
                    topic: "w".into(),
                    message: Bytes::from_static(b"bye"),
                    qos: QoS::AtLeastOnce,
                    retain: false,
                }),
                login: Some(Login {
                    username: "user".into(),
                    password: "pass".into(),
                }),
            }),
            Packet::ConnAck(ConnAck {
                session_present: true,
                code: ConnectReturnCode::Success,
            }),
            Packet::Publish(Publish {
                dup: false,
                qos: QoS::ExactlyOnce,
                retain: true,
                topic: "a/b".into(),
                pkid: 7,
                payload: Bytes::from_static(b"hello"),
            }),
            Packet::PubAck(PubAck { pkid: 1 }),
            Packet::PubRec(PubRec { pkid: 2 }),
            Packet::PubRel(PubRel { pkid: 3 }),
            Packet::PubComp(PubComp { pkid: 4 }),
            Packet::Subscribe(Subscribe {
                pkid: 5,
                filters: vec![
                    SubscribeFilter {
                        path: "a/+".into(),
                        qos: QoS::AtLeastOnce,
                    },
                    SubscribeFilter {
                        path: "#".into(),
                        qos: QoS::AtMostOnce,
                    },
                ],
            }),
            Packet::SubAck(SubAck {
                pkid: 5,
                return_codes: vec![
                    SubscribeReasonCode::Success(QoS::AtLeastOnce),
                    SubscribeReasonCode::Failure,
                ],
            }),
            Packet::Unsubscribe(Unsubscribe {
                pkid: 6,
                filters: vec!["a/+".into()],
            }),
            Packet::UnsubAck(UnsubAck { pkid: 6 }),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ]
    }

    #[test]
    fn round_trip_all_packet_types() {
        for packet in sample_packets() {
            let mut buffer = Vec::new();
            let written = write(&packet, &mut buffer).unwrap();
            assert_eq!(written, buffer.len());

            let mut stream = BytesMut::from(&buffer[..]);
            let decoded = read_mut(&mut stream, usize::MAX)
                .unwrap_or_else(|e| panic!("failed to decode {packet:?}: {e}"));

            assert_eq!(decoded, packet);
            assert!(stream.is_empty(), "decode left bytes behind for {packet:?}");
        }
    }

    #[test]
    fn truncated_packets_are_incomplete_never_malformed() {
        for packet in sample_packets() {
            let mut buffer = Vec::new();
            write(&packet, &mut buffer).unwrap();

            for len in 0..buffer.len() {
                let mut stream = BytesMut::from(&buffer[..len]);
                let err = read_mut(&mut stream, usize::MAX)
                    .expect_err("truncated packet should not decode");

                assert!(
                    err.is_incomplete(),
                    "prefix of {len} bytes of {packet:?} gave {err:?}"
                );
            }
        }
    }

    #[test]
    fn remaining_length_boundaries() {
        let mut buffer = Vec::new();
        write_remaining_length(&mut buffer, 0).unwrap();
        write_remaining_length(&mut buffer, 127).unwrap();
        write_remaining_length(&mut buffer, 128).unwrap();
        write_remaining_length(&mut buffer, 16_383).unwrap();
        write_remaining_length(&mut buffer, 16_384).unwrap();
        write_remaining_length(&mut buffer, MAX_REMAINING_LENGTH).unwrap();

        expect_test::expect![[r#"
            [
                0,
                127,
                128,
                1,
                255,
                127,
                128,
                128,
                1,
                255,
                255,
                255,
                127,
            ]
        "#]]
        .assert_debug_eq(&buffer);

        assert_eq!(
            write_remaining_length(&mut Vec::new(), MAX_REMAINING_LENGTH + 1),
            Err(Error::PayloadTooLong(MAX_REMAINING_LENGTH + 1))
        );
    }

    #[test]
    fn remaining_length_overflow_is_malformed() {
        // Four continuation bytes in a row can never terminate in bounds.
        let stream = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert_eq!(
            check(&stream, usize::MAX),
            Err(Error::MalformedRemainingLength)
        );
    }

    #[test]
    fn reserved_packet_types_are_rejected() {
        for byte1 in [0x00, 0xF0] {
            let mut stream = BytesMut::from(&[byte1, 0x00][..]);
            assert_eq!(
                read_mut(&mut stream, usize::MAX),
                Err(Error::InvalidPacketType(byte1 >> 4))
            );
        }
    }

    #[test]
    fn reserved_flags_are_rejected() {
        // PINGREQ with flag bits set.
        let mut stream = BytesMut::from(&[0xC1, 0x00][..]);
        assert_eq!(
            read_mut(&mut stream, usize::MAX),
            Err(Error::InvalidFixedHeaderFlags {
                packet_type: PacketType::PingReq,
                flags: 0b0001,
            })
        );

        // PUBREL must use flags 0b0010.
        let mut stream = BytesMut::from(&[0x60, 0x02, 0x00, 0x03][..]);
        assert_eq!(
            read_mut(&mut stream, usize::MAX),
            Err(Error::InvalidFixedHeaderFlags {
                packet_type: PacketType::PubRel,
                flags: 0b0000,
            })
        );
    }

    #[test]
    fn read_limit_is_enforced() {
        let publish = Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "a".into(),
            pkid: 0,
            payload: Bytes::from(vec![0u8; 1024]),
        });

        let mut buffer = Vec::new();
        write(&publish, &mut buffer).unwrap();

        let mut stream = BytesMut::from(&buffer[..]);
        let err = read_mut(&mut stream, 64).unwrap_err();
        assert!(matches!(err, Error::PayloadSizeLimitExceeded { .. }));
    }

    #[test]
    fn fixed_header_frame_math() {
        let mut buffer = Vec::new();
        write(&Packet::PingReq, &mut buffer).unwrap();

        let header = check(&buffer, usize::MAX).unwrap();
        assert_eq!(header.frame_length(), 2);
        assert_eq!(header.remaining_len(), 0);
    }
}
