use bytes::{Buf, Bytes};

use super::{
    read_mqtt_string, read_u16, write_mqtt_string, write_remaining_length, Error, FixedHeader, QoS,
};

/// The PUBLISH packet, used in both directions to transport application
/// messages.
///
/// http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718037
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Packet identifier; `0` (and absent from the wire) for QoS 0.
    pub pkid: u16,
    /// A zero-length payload is legal and is how retained messages are
    /// cleared.
    pub payload: Bytes,
}

pub(super) fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Publish, Error> {
    let flags = fixed_header.flags();

    let dup = flags & 0b1000 != 0;
    let qos = QoS::try_from((flags & 0b0110) >> 1)?;
    let retain = flags & 0b0001 != 0;

    // A DUP flag on a QoS 0 publish is a protocol violation [MQTT-3.3.1-2].
    if dup && qos == QoS::AtMostOnce {
        return Err(Error::DupOnQoSZero);
    }

    bytes.advance(fixed_header.fixed_header_len);

    let topic = read_mqtt_string(&mut bytes)?;

    let pkid = match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce | QoS::ExactlyOnce => {
            let pkid = read_u16(&mut bytes)?;
            if pkid == 0 {
                return Err(Error::PacketIdZero);
            }

            pkid
        }
    };

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        pkid,
        payload: bytes,
    })
}

fn len(publish: &Publish) -> usize {
    let mut len = 2 + publish.topic.len();

    if publish.qos != QoS::AtMostOnce {
        len += 2;
    }

    len + publish.payload.len()
}

pub(super) fn write(publish: &Publish, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    let remaining_len = len(publish);

    let byte1 = 0x30
        | (publish.dup as u8) << 3
        | (publish.qos as u8) << 1
        | publish.retain as u8;

    buffer.push(byte1);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    write_mqtt_string(buffer, &publish.topic);

    if publish.qos != QoS::AtMostOnce {
        if publish.pkid == 0 {
            return Err(Error::PacketIdZero);
        }

        buffer.extend_from_slice(&publish.pkid.to_be_bytes());
    }

    buffer.extend_from_slice(&publish.payload);

    Ok(1 + remaining_len_bytes + remaining_len)
}
