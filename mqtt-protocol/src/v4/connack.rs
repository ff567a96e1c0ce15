use bytes::{Buf, Bytes};

use crate::{read_u8, ConnAck, ConnectReturnCode, Error, FixedHeader};

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<ConnAck, Error> {
    bytes.advance(fixed_header.fixed_header_len);

    let flags = read_u8(&mut bytes)?;
    let return_code = read_u8(&mut bytes)?;

    Ok(ConnAck {
        session_present: flags & 0x01 != 0,
        code: connect_return(return_code)?,
    })
}

pub fn write(connack: &ConnAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    buffer.push(0x20);
    buffer.push(0x02);
    buffer.push(connack.session_present as u8);
    buffer.push(connack.code as u8);

    Ok(4)
}

fn connect_return(num: u8) -> Result<ConnectReturnCode, Error> {
    match num {
        0 => Ok(ConnectReturnCode::Success),
        1 => Ok(ConnectReturnCode::RefusedProtocolVersion),
        2 => Ok(ConnectReturnCode::BadClientId),
        3 => Ok(ConnectReturnCode::ServiceUnavailable),
        4 => Ok(ConnectReturnCode::BadUserNamePassword),
        5 => Ok(ConnectReturnCode::NotAuthorized),
        num => Err(Error::InvalidConnectReturnCode(num)),
    }
}
