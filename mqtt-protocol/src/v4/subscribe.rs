use bytes::{Buf, Bytes};

use crate::{
    qos, read_mqtt_string, read_u16, read_u8, write_mqtt_string, write_remaining_length, Error,
    FixedHeader, Subscribe, SubscribeFilter,
};

fn len(subscribe: &Subscribe) -> usize {
    // Packet identifier plus length-prefixed path and a QoS byte per filter.
    2 + subscribe
        .filters
        .iter()
        .fold(0, |s, f| s + 2 + f.path.len() + 1)
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Subscribe, Error> {
    // 3.8.1: bits 3..0 of the first byte are reserved as 0b0010.
    if fixed_header.byte1 & 0x0F != 0x02 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    // 3.8.3: the payload must contain at least one filter.
    if !bytes.has_remaining() {
        return Err(Error::MalformedPacket);
    }

    let mut filters = Vec::new();
    while bytes.has_remaining() {
        let path = read_mqtt_string(&mut bytes)?;
        let requested_qos = read_u8(&mut bytes)?;

        // 3.8.3-4: the upper 6 bits of the QoS byte are reserved.
        if requested_qos & 0xFC != 0 {
            return Err(Error::MalformedPacket);
        }

        filters.push(SubscribeFilter {
            path,
            qos: qos(requested_qos)?,
        });
    }

    Ok(Subscribe { pkid, filters })
}

pub fn write(subscribe: &Subscribe, buffer: &mut Vec<u8>) -> Result<usize, Error> {
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
