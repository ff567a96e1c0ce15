use bytes::{Buf, Bytes};

use crate::{
    qos, read_mqtt_bytes, read_u16, write_remaining_length, Error, FixedHeader, Publish, QoS,
};

fn len(publish: &Publish) -> usize {
    let mut len = 2 + publish.topic.len();

    if publish.qos != QoS::AtMostOnce {
        len += 2;
    }

    len + publish.payload.len()
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Publish, Error> {
    let qos = qos((fixed_header.byte1 & 0x06) >> 1)?;
    let dup = fixed_header.byte1 & 0x08 != 0;
    let retain = fixed_header.byte1 & 0x01 != 0;

    bytes.advance(fixed_header.fixed_header_len);

    let topic = read_mqtt_bytes(&mut bytes)?;

    // 3.3.2.2: the packet identifier is only present for QoS 1 and 2.
    let pkid = match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce | QoS::ExactlyOnce => {
            let pkid = read_u16(&mut bytes)?;
            if pkid == 0 {
                return Err(Error::MalformedPacket);
            }

            pkid
        }
    };

    Ok(Publish {
        dup,
        qos,
        retain,
        pkid,
        topic,
        payload: bytes,
    })
}

pub fn write(publish: &Publish, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    if publish.qos != QoS::AtMostOnce && publish.pkid == 0 {
        return Err(Error::MalformedPacket);
    }

    let remaining_len = len(publish);

    let mut byte1 = 0x30 | ((publish.qos as u8) << 1);
    if publish.dup {
        byte1 |= 0x08;
    }
    if publish.retain {
        byte1 |= 0x01;
    }

    buffer.push(byte1);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    buffer.extend_from_slice(&(publish.topic.len() as u16).to_be_bytes());
    buffer.extend_from_slice(&publish.topic);

    if publish.qos != QoS::AtMostOnce {
        buffer.extend_from_slice(&publish.pkid.to_be_bytes());
    }

    buffer.extend_from_slice(&publish.payload);

    Ok(1 + remaining_len_bytes + remaining_len)
}
