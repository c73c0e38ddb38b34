use bytes::{Buf, Bytes};

use super::{
    read_mqtt_string, read_u16, read_u8, write_mqtt_string, write_remaining_length, Error,
    FixedHeader, QoS,
};

/// The SUBSCRIBE packet: a batch of topic filters with requested QoS levels.
///
/// http://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718063
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

pub(super) fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Subscribe, Error> {
    bytes.advance(fixed_header.fixed_header_len);

    let pkid = read_u16(&mut bytes)?;
    if pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    let mut filters = Vec::new();
    while bytes.has_remaining() {
        let path = read_mqtt_string(&mut bytes)?;
        let options = read_u8(&mut bytes)?;

        // The upper six bits of the requested QoS byte are reserved
        // [MQTT-3.8.3-4].
        if options & 0b1111_1100 != 0 {
            return Err(Error::MalformedPacket);
        }

        filters.push(SubscribeFilter {
            path,
            qos: QoS::try_from(options)?,
        });
    }

    // A SUBSCRIBE with no filters is a protocol violation [MQTT-3.8.3-3].
    if filters.is_empty() {
        return Err(Error::EmptySubscription);
    }

    Ok(Subscribe { pkid, filters })
}

fn len(subscribe: &Subscribe) -> usize {
    // Packet ID, then a length-prefixed path and a QoS byte per filter.
    2 + subscribe
        .filters
        .iter()
        .map(|filter| 2 + filter.path.len() + 1)
        .sum::<usize>()
}

pub(super) fn write(subscribe: &Subscribe, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    if subscribe.pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    if subscribe.filters.is_empty() {
        return Err(Error::EmptySubscription);
    }

    let remaining_len = len(subscribe);

    buffer.push(0x82);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.extend_from_slice(&subscribe.pkid.to_be_bytes());

    for filter in &subscribe.filters {
        write_mqtt_string(buffer, &filter.path);
        buffer.push(filter.qos as u8);
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}
