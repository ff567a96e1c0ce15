use bytes::{Buf, Bytes};

use crate::{read_u16, Error, FixedHeader, PubRec};

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubRec, Error> {
    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    Ok(PubRec { pkid })
}

pub fn write(pubrec: &PubRec, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.push(0x50);
    buffer.push(0x02);
    buffer.extend_from_slice(&pubrec.pkid.to_be_bytes());

    Ok(4)
}
