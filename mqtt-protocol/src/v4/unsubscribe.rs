use bytes::{Buf, Bytes};

use crate::{
    read_mqtt_string, read_u16, write_mqtt_string, write_remaining_length, Error, FixedHeader,
    Unsubscribe,
};

fn len(unsubscribe: &Unsubscribe) -> usize {
    2 + unsubscribe
        .filters
        .iter()
        .fold(0, |s, f| s + 2 + f.len())
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Unsubscribe, Error> {
    // 3.10.1: bits 3..0 of the first byte are reserved as 0b0010.
    if fixed_header.byte1 & 0x0F != 0x02 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    // 3.10.3: the payload must contain at least one filter.
    if !bytes.has_remaining() {
        return Err(Error::MalformedPacket);
    }

    let mut filters = Vec::new();
    while bytes.has_remaining() {
        filters.push(read_mqtt_string(&mut bytes)?);
    }

    Ok(Unsubscribe { pkid, filters })
}

pub fn write(unsubscribe: &Unsubscribe, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    let remaining_len = len(unsubscribe);

    buffer.push(0xA2);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.extend_from_slice(&unsubscribe.pkid.to_be_bytes());
    for filter in &unsubscribe.filters {
        write_mqtt_string(buffer, filter);
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}
