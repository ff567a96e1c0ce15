use bytes::{Buf, Bytes};

use crate::{read_u16, Error, FixedHeader, PubRel};

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubRel, Error> {
    // 3.6.1: bits 3..0 of the first byte are reserved as 0b0010.
    if fixed_header.byte1 & 0x0F != 0x02 {
        return Err(Error::MalformedPacket);
    }

    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    Ok(PubRel { pkid })
}

pub fn write(pubrel: &PubRel, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.push(0x62);
    buffer.push(0x02);
    buffer.extend_from_slice(&pubrel.pkid.to_be_bytes());

    Ok(4)
}
