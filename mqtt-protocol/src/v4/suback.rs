use bytes::{Buf, Bytes};

use crate::{
    read_u16, read_u8, write_remaining_length, Error, FixedHeader, QoS, SubAck,
    SubscribeReasonCode,
};

fn len(suback: &SubAck) -> usize {
    2 + suback.return_codes.len()
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<SubAck, Error> {
    bytes.advance(fixed_header.fixed_header_len);
    let pkid = read_u16(&mut bytes)?;

    if !bytes.has_remaining() {
        return Err(Error::MalformedPacket);
    }

    let mut return_codes = Vec::new();
    while bytes.has_remaining() {
        let return_code = read_u8(&mut bytes)?;
        return_codes.push(reason(return_code)?);
    }

    Ok(SubAck { pkid, return_codes })
}

pub fn write(suback: &SubAck, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    let remaining_len = len(suback);

    buffer.push(0x90);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.extend_from_slice(&suback.pkid.to_be_bytes());
    buffer.extend(suback.return_codes.iter().map(|&c| code(c)));

    Ok(1 + remaining_len_bytes + remaining_len)
}

fn reason(code: u8) -> Result<SubscribeReasonCode, Error> {
    let v = match code {
        0 => SubscribeReasonCode::Success(QoS::AtMostOnce),
        1 => SubscribeReasonCode::Success(QoS::AtLeastOnce),
        2 => SubscribeReasonCode::Success(QoS::ExactlyOnce),
        0x80 => SubscribeReasonCode::Failure,
        v => return Err(Error::InvalidSubscribeReasonCode(v)),
    };

    Ok(v)
}

fn code(reason: SubscribeReasonCode) -> u8 {
    match reason {
        SubscribeReasonCode::Success(qos) => qos as u8,
        // Return codes other than 0x00, 0x01, 0x02 and 0x80 are reserved [MQTT-3.9.3-2].
        SubscribeReasonCode::Failure => 0x80,
    }
}
