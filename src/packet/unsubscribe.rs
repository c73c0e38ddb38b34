use bytes::{Buf, Bytes};

use super::{read_mqtt_string, read_u16, write_mqtt_string, write_remaining_length, Error, FixedHeader};

/// The UNSUBSCRIBE packet: a batch of filters to drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub filters: Vec<String>,
}

/// The UNSUBACK packet; it carries no payload in MQTT 3.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

pub(super) fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Unsubscribe, Error> {
    bytes.advance(fixed_header.fixed_header_len);

    let pkid = read_u16(&mut bytes)?;
    if pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    let mut filters = Vec::new();
    while bytes.has_remaining() {
        filters.push(read_mqtt_string(&mut bytes)?);
    }

    // An UNSUBSCRIBE with no filters is a protocol violation [MQTT-3.10.3-2].
    if filters.is_empty() {
        return Err(Error::EmptySubscription);
    }

    Ok(Unsubscribe { pkid, filters })
}

pub(super) fn read_ack(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<UnsubAck, Error> {
    if fixed_header.remaining_len != 2 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);

    let pkid = read_u16(&mut bytes)?;
    if pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    Ok(UnsubAck { pkid })
}

fn len(unsubscribe: &Unsubscribe) -> usize {
    2 + unsubscribe
        .filters
        .iter()
        .map(|filter| 2 + filter.len())
        .sum::<usize>()
}

pub(super) fn write(unsubscribe: &Unsubscribe, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    if unsubscribe.pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    if unsubscribe.filters.is_empty() {
        return Err(Error::EmptySubscription);
    }

    let remaining_len = len(unsubscribe);

    buffer.push(0xA2);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.extend_from_slice(&unsubscribe.pkid.to_be_bytes());

    for filter in &unsubscribe.filters {
        write_mqtt_string(buffer, filter);
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}

pub(super) fn write_ack(unsuback: &UnsubAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    if unsuback.pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    buffer.push(0xB0);
    buffer.push(0x02);
    buffer.extend_from_slice(&unsuback.pkid.to_be_bytes());

    Ok(4)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use crate::packet::{read_mut, write, Packet};

    use super::*;

    #[test]
    fn unsubscribe_round_trips() {
        let unsubscribe = Unsubscribe {
            pkid: 11,
            filters: vec!["a/b".into(), "sport/#".into()],
        };

        let mut buffer = Vec::new();
        write(&Packet::Unsubscribe(unsubscribe.clone()), &mut buffer).unwrap();

        assert_eq!(
            read_mut(&mut BytesMut::from(&buffer[..]), usize::MAX),
            Ok(Packet::Unsubscribe(unsubscribe))
        );
    }

    #[test]
    fn empty_filter_list_is_rejected() {
        let mut stream = BytesMut::from(&[0xA2, 0x02, 0x00, 0x0B][..]);
        assert_eq!(
            read_mut(&mut stream, usize::MAX),
            Err(Error::EmptySubscription)
        );
    }

    #[test]
    fn unsuback_round_trips() {
        let unsuback = UnsubAck { pkid: 11 };

        let mut buffer = Vec::new();
        write(&Packet::UnsubAck(unsuback), &mut buffer).unwrap();

        assert_eq!(buffer, [0xB0, 0x02, 0x00, 0x0B]);
        assert_eq!(
            read_mut(&mut BytesMut::from(&buffer[..]), usize::MAX),
            Ok(Packet::UnsubAck(unsuback))
        );
    }
}
