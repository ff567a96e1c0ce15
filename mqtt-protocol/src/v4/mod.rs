//! Protocol level 4 codec: framing and dispatch to the per-packet modules.

use bytes::BytesMut;

use crate::{parse_fixed_header, Error, Packet, PacketType};

mod connack;
mod connect;
mod puback;
mod pubcomp;
mod publish;
mod pubrec;
mod pubrel;
mod suback;
mod subscribe;
mod unsuback;
mod unsubscribe;

/// Stateless protocol level 4 codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4;

impl V4 {
    /// Frame and decode one packet from the front of `stream`.
    ///
    /// [`Error::InsufficientBytes`] means the buffer does not hold a full
    /// frame yet; the caller should read at least that many more bytes from
    /// the socket and call again. Anything else is fatal for the connection.
    pub fn read_mut(&self, stream: &mut BytesMut, max_size: usize) -> Result<Packet, Error> {
        let fixed_header = parse_fixed_header(stream)?;

        let pkt_len = fixed_header.frame_length();
        if pkt_len > max_size {
            return Err(Error::PayloadSizeLimitExceeded {
                pkt_len,
                max: max_size,
            });
        }

        if stream.len() < pkt_len {
            return Err(Error::InsufficientBytes(pkt_len - stream.len()));
        }

        let packet = stream.split_to(pkt_len).freeze();

        let packet = match fixed_header.packet_type()? {
            // 2-byte packets need no decoding beyond the fixed header.
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
            PacketType::Connect => Packet::Connect(connect::read(fixed_header, packet)?),
            PacketType::ConnAck => Packet::ConnAck(connack::read(fixed_header, packet)?),
            PacketType::Publish => Packet::Publish(publish::read(fixed_header, packet)?),
            PacketType::PubAck => Packet::PubAck(puback::read(fixed_header, packet)?),
            PacketType::PubRec => Packet::PubRec(pubrec::read(fixed_header, packet)?),
            PacketType::PubRel => Packet::PubRel(pubrel::read(fixed_header, packet)?),
            PacketType::PubComp => Packet::PubComp(pubcomp::read(fixed_header, packet)?),
            PacketType::Subscribe => Packet::Subscribe(subscribe::read(fixed_header, packet)?),
            PacketType::SubAck => Packet::SubAck(suback::read(fixed_header, packet)?),
            PacketType::Unsubscribe => {
                Packet::Unsubscribe(unsubscribe::read(fixed_header, packet)?)
            }
            PacketType::UnsubAck => Packet::UnsubAck(unsuback::read(fixed_header, packet)?),
        };

        Ok(packet)
    }

    /// Encode `packet` onto the end of `buffer`, returning the encoded size.
    pub fn write(&self, packet: Packet, buffer: &mut Vec<u8>) -> Result<usize, Error> {
        match packet {
            Packet::Connect(connect) => connect::write(&connect, buffer),
            Packet::ConnAck(connack) => connack::write(&connack, buffer),
            Packet::Publish(publish) => publish::write(&publish, buffer),
            Packet::PubAck(puback) => puback::write(&puback, buffer),
            Packet::PubRec(pubrec) => pubrec::write(&pubrec, buffer),
            Packet::PubRel(pubrel) => pubrel::write(&pubrel, buffer),
            Packet::PubComp(pubcomp) => pubcomp::write(&pubcomp, buffer),
            Packet::Subscribe(subscribe) => subscribe::write(&subscribe, buffer),
            Packet::SubAck(suback) => suback::write(&suback, buffer),
            Packet::Unsubscribe(unsubscribe) => unsubscribe::write(&unsubscribe, buffer),
            Packet::UnsubAck(unsuback) => unsuback::write(&unsuback, buffer),
            Packet::PingReq => {
                buffer.extend_from_slice(&[0xC0, 0x00]);
                Ok(2)
            }
            Packet::PingResp => {
                buffer.extend_from_slice(&[0xD0, 0x00]);
                Ok(2)
            }
            Packet::Disconnect => {
                buffer.extend_from_slice(&[0xE0, 0x00]);
                Ok(2)
            }
        }
    }
}
