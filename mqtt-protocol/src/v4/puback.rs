use bytes::{Buf, Bytes};

use crate::{read_u16, Error, FixedHeader, PubAck};

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubAck, Error> {
    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    Ok(PubAck { pkid })
}

pub fn write(puback: &PubAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.push(0x40);
    buffer.push(0x02);
    buffer.extend_from_slice(&puback.pkid.to_be_bytes());

    Ok(4)
}
