use bytes::{Buf, Bytes};

use super::{read_u8, Error, FixedHeader};

/// The CONNACK packet: the broker's answer to CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Whether the broker resumed stored session state for the client ID
    /// [MQTT-3.2.2-2].
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

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

impl ConnectReturnCode {
    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(ConnectReturnCode::Success),
            1 => Ok(ConnectReturnCode::RefusedProtocolVersion),
            2 => Ok(ConnectReturnCode::BadClientId),
            3 => Ok(ConnectReturnCode::ServiceUnavailable),
            4 => Ok(ConnectReturnCode::BadUserNamePassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            other => Err(Error::InvalidConnectReturnCode(other)),
        }
    }
}

pub(super) fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<ConnAck, Error> {
    bytes.advance(fixed_header.fixed_header_len);

    let flags = read_u8(&mut bytes)?;

    // The upper seven bits of the acknowledge flags are reserved [MQTT-3.2.2-1].
    if flags & 0b1111_1110 != 0 {
        return Err(Error::MalformedPacket);
    }

    let code = ConnectReturnCode::try_from(read_u8(&mut bytes)?)?;

    Ok(ConnAck {
        session_present: flags & 0b0000_0001 != 0,
        code,
    })
}

pub(super) fn write(connack: &ConnAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.extend_from_slice(&[
        0x20,
        0x02,
        connack.session_present as u8,
        connack.code as u8,
    ]);

    Ok(4)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use crate::packet::{read_mut, write, Packet};

    use super::*;

    #[test]
    fn session_present_round_trips() {
        for (session_present, code) in [
            (false, ConnectReturnCode::Success),
            (true, ConnectReturnCode::Success),
            (false, ConnectReturnCode::NotAuthorized),
        ] {
            let connack = ConnAck {
                session_present,
                code,
            };

            let mut buffer = Vec::new();
            write(&Packet::ConnAck(connack), &mut buffer).unwrap();

            assert_eq!(
                read_mut(&mut BytesMut::from(&buffer[..]), usize::MAX),
                Ok(Packet::ConnAck(connack))
            );
        }
    }

    #[test]
    fn unknown_return_code_is_rejected() {
        let mut stream = BytesMut::from(&[0x20, 0x02, 0x00, 0x06][..]);
        assert_eq!(
            read_mut(&mut stream, usize::MAX),
            Err(Error::InvalidConnectReturnCode(6))
        );
    }
}
