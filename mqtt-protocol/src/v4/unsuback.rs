use bytes::{Buf, Bytes};

use crate::{read_u16, Error, FixedHeader, UnsubAck};

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<UnsubAck, Error> {
    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    Ok(UnsubAck { pkid })
}

pub fn write(unsuback: &UnsubAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.push(0xB0);
    buffer.push(0x02);
    buffer.extend_from_slice(&unsuback.pkid.to_be_bytes());

    Ok(4)
}
