use bytes::{Buf, Bytes};

use crate::{read_u16, Error, FixedHeader, PubComp};

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubComp, Error> {
    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    Ok(PubComp { pkid })
}

pub fn write(pubcomp: &PubComp, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.push(0x70);
    buffer.push(0x02);
    buffer.extend_from_slice(&pubcomp.pkid.to_be_bytes());

    Ok(4)
}
