use bytes::{Buf, Bytes};

use crate::{
    qos, read_mqtt_bytes, read_mqtt_string, read_u16, read_u8, write_mqtt_bytes,
    write_mqtt_string, write_remaining_length, Connect, Error, FixedHeader, LastWill, Login,
};

fn len(connect: &Connect) -> usize {
    // Protocol name "MQTT" + level + connect flags + keep alive.
    let mut len = 2 + 4 + 1 + 1 + 2;

    len += 2 + connect.client_id.len();

    if let Some(will) = &connect.last_will {
        len += 2 + will.topic.len() + 2 + will.message.len();
    }

    if let Some(login) = &connect.login {
        len += 2 + login.username.len();
        // An empty password is written as no password field at all.
        if !login.password.is_empty() {
            len += 2 + login.password.len();
        }
    }

    len
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Connect, Error> {
    bytes.advance(fixed_header.fixed_header_len);

    let protocol_name = read_mqtt_bytes(&mut bytes)?;
    if &protocol_name[..] != b"MQTT" {
        return Err(Error::InvalidProtocol);
    }

    let protocol_level = read_u8(&mut bytes)?;
    if protocol_level != 4 {
        return Err(Error::InvalidProtocolLevel(protocol_level));
    }

    let connect_flags = read_u8(&mut bytes)?;
    // 3.1.2.3: the reserved flag must be zero.
    if connect_flags & 0x01 != 0 {
        return Err(Error::MalformedPacket);
    }

    let clean_session = connect_flags & 0x02 != 0;
    let keep_alive = read_u16(&mut bytes)?;

    let client_id = read_mqtt_string(&mut bytes)?;

    let last_will = if connect_flags & 0x04 != 0 {
        let topic = read_mqtt_string(&mut bytes)?;
        let message = read_mqtt_bytes(&mut bytes)?;

        Some(LastWill {
            topic,
            message,
            qos: qos((connect_flags >> 3) & 0x03)?,
            retain: connect_flags & 0x20 != 0,
        })
    } else {
        // 3.1.2.6: will QoS and will retain must be zero without the will flag.
        if connect_flags & 0x38 != 0 {
            return Err(Error::MalformedPacket);
        }

        None
    };

    // 3.1.2.9: a password without a username is a protocol violation.
    let login = match (connect_flags & 0x80 != 0, connect_flags & 0x40 != 0) {
        (true, has_password) => {
            let username = read_mqtt_string(&mut bytes)?;
            let password = if has_password {
                read_mqtt_bytes(&mut bytes)?
            } else {
                Bytes::new()
            };

            Some(Login { username, password })
        }
        (false, true) => return Err(Error::MalformedPacket),
        (false, false) => None,
    };

    Ok(Connect {
        keep_alive,
        client_id,
        clean_session,
        last_will,
        login,
    })
}

pub fn write(connect: &Connect, buffer: &mut Vec<u8>) -> Result<usize, Error> {
    let remaining_len = len(connect);

    buffer.push(0x10);
    let remaining_len_bytes = write_remaining_length(buffer, remaining_len)?;

    write_mqtt_string(buffer, "MQTT");
    buffer.push(4);

    let mut connect_flags = 0u8;
    if connect.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(will) = &connect.last_will {
        connect_flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if let Some(login) = &connect.login {
        connect_flags |= 0x80;
        if !login.password.is_empty() {
            connect_flags |= 0x40;
        }
    }

    buffer.push(connect_flags);
    buffer.extend_from_slice(&connect.keep_alive.to_be_bytes());

    write_mqtt_string(buffer, &connect.client_id);

    if let Some(will) = &connect.last_will {
        write_mqtt_string(buffer, &will.topic);
        write_mqtt_bytes(buffer, &will.message);
    }

    if let Some(login) = &connect.login {
        write_mqtt_string(buffer, &login.username);
        if !login.password.is_empty() {
            write_mqtt_bytes(buffer, &login.password);
        }
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}
