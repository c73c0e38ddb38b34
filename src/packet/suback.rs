use bytes::{Buf, Bytes};

use super::{read_u16, read_u8, write_remaining_length, Error, FixedHeader, QoS};

/// The SUBACK packet: one return code per filter in the SUBSCRIBE it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
}

/// SUBACK return codes are restricted to `0x00`, `0x01`, `0x02` and `0x80`
/// [MQTT-3.9.3-2].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    /// The subscription was accepted at the given maximum QoS.
    Success(QoS),
    Failure,
}

impl SubscribeReasonCode {
    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0x00 => Ok(SubscribeReasonCode::Success(QoS::AtMostOnce)),
            0x01 => Ok(SubscribeReasonCode::Success(QoS::AtLeastOnce)),
            0x02 => Ok(SubscribeReasonCode::Success(QoS::ExactlyOnce)),
            0x80 => Ok(SubscribeReasonCode::Failure),
            other => Err(Error::InvalidSubscribeReasonCode(other)),
        }
    }

    fn code(self) -> u8 {
        match self {
            SubscribeReasonCode::Success(qos) => qos as u8,
            SubscribeReasonCode::Failure => 0x80,
        }
    }
}

pub(super) fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<SubAck, Error> {
    bytes.advance(fixed_header.fixed_header_len);

    let pkid = read_u16(&mut bytes)?;
    if pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    if !bytes.has_remaining() {
        return Err(Error::MalformedPacket);
    }

    let mut return_codes = Vec::new();
    while bytes.has_remaining() {
        return_codes.push(SubscribeReasonCode::try_from(read_u8(&mut bytes)?)?);
    }

    Ok(SubAck { pkid, return_codes })
}

pub(super) fn write(suback: &SubAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    if suback.pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    let remaining_len = 2 + suback.return_codes.len();

    buffer.push(0x90);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.extend_from_slice(&suback.pkid.to_be_bytes());
    buffer.extend(suback.return_codes.iter().map(|code| code.code()));

    Ok(1 + remaining_len_bytes + remaining_len)
}
