use bytes::{Buf, Bytes};

use super::{
    read_mqtt_bytes, read_mqtt_string, read_u16, read_u8, write_mqtt_bytes, write_mqtt_string,
    write_remaining_length, Error, FixedHeader, QoS,
};

/// The CONNECT packet: the first packet a client sends on any connection.
///
/// http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718028
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name as sent; `MQTT` for any 3.1.1 client. Validated by the
    /// broker, not the codec, so the broker can answer with the appropriate
    /// CONNACK return code.
    pub protocol_name: String,
    /// Protocol level; `4` for 3.1.1.
    pub protocol_level: u8,
    pub clean_session: bool,
    /// Keep alive interval in seconds; 0 disables the keep alive mechanism.
    pub keep_alive: u16,
    pub client_id: String,
    pub last_will: Option<LastWill>,
    pub login: Option<Login>,
}

/// A message the broker publishes on the client's behalf if the connection
/// terminates abnormally.
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
    pub password: String,
}

pub(super) fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Connect, Error> {
    bytes.advance(fixed_header.fixed_header_len);

    let protocol_name = read_mqtt_string(&mut bytes)?;
    let protocol_level = read_u8(&mut bytes)?;

    let connect_flags = read_u8(&mut bytes)?;

    // The reserved flag must be zero [MQTT-3.1.2-3].
    if connect_flags & 0b0000_0001 != 0 {
        return Err(Error::ConnectReservedFlag);
    }

    let clean_session = connect_flags & 0b0000_0010 != 0;
    let keep_alive = read_u16(&mut bytes)?;

    let client_id = read_mqtt_string(&mut bytes)?;

    let last_will = read_last_will(connect_flags, &mut bytes)?;
    let login = read_login(connect_flags, &mut bytes)?;

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session,
        keep_alive,
        client_id,
        last_will,
        login,
    })
}

fn read_last_will(connect_flags: u8, bytes: &mut Bytes) -> Result<Option<LastWill>, Error> {
    let will_flag = connect_flags & 0b0000_0100 != 0;
    let will_qos = (connect_flags & 0b0001_1000) >> 3;
    let will_retain = connect_flags & 0b0010_0000 != 0;

    if !will_flag {
        // Will QoS and Will Retain must be zero when there is no will
        // [MQTT-3.1.2-13], [MQTT-3.1.2-15].
        if will_qos != 0 || will_retain {
            return Err(Error::MalformedPacket);
        }

        return Ok(None);
    }

    let qos = QoS::try_from(will_qos)?;
    let topic = read_mqtt_string(bytes)?;
    let message = read_mqtt_bytes(bytes)?;

    Ok(Some(LastWill {
        topic,
        message,
        qos,
        retain: will_retain,
    }))
}

fn read_login(connect_flags: u8, bytes: &mut Bytes) -> Result<Option<Login>, Error> {
    let username_flag = connect_flags & 0b1000_0000 != 0;
    let password_flag = connect_flags & 0b0100_0000 != 0;

    // A password without a username is illegal [MQTT-3.1.2-22].
    if password_flag && !username_flag {
        return Err(Error::MalformedPacket);
    }

    if !username_flag {
        return Ok(None);
    }

    let username = read_mqtt_string(bytes)?;
    let password = if password_flag {
        read_mqtt_string(bytes)?
    } else {
        String::new()
    };

    Ok(Some(Login { username, password }))
}

fn len(connect: &Connect) -> usize {
    // Protocol name + level + connect flags + keep alive.
    let mut len = 2 + connect.protocol_name.len() + 1 + 1 + 2;

    len += 2 + connect.client_id.len();

    if let Some(will) = &connect.last_will {
        len += 2 + will.topic.len() + 2 + will.message.len();
    }

    if let Some(login) = &connect.login {
        len += 2 + login.username.len();
        if !login.password.is_empty() {
            len += 2 + login.password.len();
        }
    }

    len
}

pub(super) fn write(connect: &Connect, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    let remaining_len = len(connect);

    buffer.push(0x10);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    write_mqtt_string(buffer, &connect.protocol_name);
    buffer.push(connect.protocol_level);

    let mut connect_flags = 0u8;
    if connect.clean_session {
        connect_flags |= 0b0000_0010;
    }

    if let Some(will) = &connect.last_will {
        connect_flags |= 0b0000_0100 | (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0b0010_0000;
        }
    }

    if let Some(login) = &connect.login {
        connect_flags |= 0b1000_0000;
        if !login.password.is_empty() {
            connect_flags |= 0b0100_0000;
        }
    }

    buffer.push(connect_flags);
    buffer.extend_from_slice(&connect.keep_alive.to_be_bytes());

    write_mqtt_string(buffer, &connect.client_id);

    if let Some(will) = &connect.last_will {
        write_mqtt_string(buffer, &will.topic);
        write_mqtt_bytes(buffer, &will.message);
    }

    if let Some(login) = &connect.login {
        write_mqtt_string(buffer, &login.username);
        if !login.password.is_empty() {
            write_mqtt_string(buffer, &login.password);
        }
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use crate::packet::{read_mut, write, Packet};

    use super::*;

    fn decode(bytes: &[u8]) -> Result<Packet, Error> {
        read_mut(&mut BytesMut::from(bytes), usize::MAX)
    }

    #[test]
    fn minimal_connect_round_trips() {
        let connect = Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 0,
            client_id: String::new(),
            last_will: None,
            login: None,
        };

        let mut buffer = Vec::new();
        write(&Packet::Connect(connect.clone()), &mut buffer).unwrap();

        assert_eq!(
            buffer,
            [
                0x10, 12, // fixed header
                0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
                0x04, // protocol level
                0b0000_0010, // connect flags: clean session
                0x00, 0x00, // keep alive
                0x00, 0x00, // empty client id
            ]
        );

        assert_eq!(decode(&buffer), Ok(Packet::Connect(connect)));
    }

    #[test]
    fn username_without_password_round_trips() {
        let connect = Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session: false,
            keep_alive: 60,
            client_id: "c1".into(),
            last_will: None,
            login: Some(Login {
                username: "user".into(),
                password: String::new(),
            }),
        };

        let mut buffer = Vec::new();
        write(&Packet::Connect(connect.clone()), &mut buffer).unwrap();
        assert_eq!(decode(&buffer), Ok(Packet::Connect(connect)));
    }

    #[test]
    fn reserved_flag_is_rejected() {
        let mut buffer = Vec::new();
        write(
            &Packet::Connect(Connect {
                protocol_name: "MQTT".into(),
                protocol_level: 4,
                clean_session: true,
                keep_alive: 0,
                client_id: "c1".into(),
                last_will: None,
                login: None,
            }),
            &mut buffer,
        )
        .unwrap();

        // Set the reserved bit in the connect flags byte.
        buffer[9] |= 0b0000_0001;
        assert_eq!(decode(&buffer), Err(Error::ConnectReservedFlag));
    }

    #[test]
    fn will_qos_3_is_rejected() {
        let mut buffer = Vec::new();
        write(
            &Packet::Connect(Connect {
                protocol_name: "MQTT".into(),
                protocol_level: 4,
                clean_session: true,
                keep_alive: 0,
                client_id: "c1".into(),
                last_will: Some(LastWill {
                    topic: "w".into(),
                    message: Bytes::from_static(b"bye"),
                    qos: QoS::AtMostOnce,
                    retain: false,
                }),
                login: None,
            }),
            &mut buffer,
        )
        .unwrap();

        // Force Will QoS to the reserved value 3.
        buffer[9] |= 0b0001_1000;
        assert_eq!(decode(&buffer), Err(Error::InvalidQoS(3)));
    }

    #[test]
    fn will_qos_without_will_flag_is_rejected() {
        let mut buffer = Vec::new();
        write(
            &Packet::Connect(Connect {
                protocol_name: "MQTT".into(),
                protocol_level: 4,
                clean_session: true,
                keep_alive: 0,
                client_id: "c1".into(),
                last_will: None,
                login: None,
            }),
            &mut buffer,
        )
        .unwrap();

        buffer[9] |= 0b0000_1000;
        assert_eq!(decode(&buffer), Err(Error::MalformedPacket));
    }

    #[test]
    fn password_without_username_is_rejected() {
        let mut buffer = Vec::new();
        write(
            &Packet::Connect(Connect {
                protocol_name: "MQTT".into(),
                protocol_level: 4,
                clean_session: true,
                keep_alive: 0,
                client_id: "c1".into(),
                last_will: None,
                login: None,
            }),
            &mut buffer,
        )
        .unwrap();

        buffer[9] |= 0b0100_0000;
        assert_eq!(decode(&buffer), Err(Error::MalformedPacket));
    }
}
