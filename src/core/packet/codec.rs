//! Byte-level encoding and decoding of MQTT control packets.
//!
//! ```text
//! +--------+-----------------+-----------------+----------------+
//! | type|fl | remaining len   | variable header | payload        |
//! | u8     | 1..=4 bytes     |                 |                |
//! +--------+-----------------+-----------------+----------------+
//! ```
//!
//! All integers are big-endian. Strings are UTF-8 with a u16 length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    ConnAck, Connect, ConnectReturnCode, Packet, PacketType, Publish, QoS, SubAck,
    SubAckReturnCode, Subscribe, Unsubscribe, Will, PROTOCOL_NAME,
};
use crate::core::error::ProtocolError;

/// Largest value a 4-byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const MIN_CONNECT_LEN: usize = 12;

// ───────────────────────────────────────────────────────────
// Remaining length
// ───────────────────────────────────────────────────────────

/// Appends the minimal base-128 encoding of `len`.
pub fn encode_remaining_length(len: usize, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::RemainingLengthTooLarge(len));
    }
    let mut value = len;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Decodes a remaining length from the bytes following the header byte.
///
/// Returns `(value, bytes_used)`, or `None` when `src` ends in the middle
/// of the field.
pub fn decode_remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    for i in 0..4 {
        let Some(&byte) = src.get(i) else {
            return Ok(None);
        };
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Err(ProtocolError::MalformedRemainingLength)
}

/// Total size of the frame at the front of `src` once its fixed header is
/// complete; `None` while the header itself is still partial.
pub fn frame_len(src: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if src.is_empty() {
        return Ok(None);
    }
    PacketType::from_nibble(src[0] >> 4)?;
    Ok(decode_remaining_length(&src[1..])?.map(|(len, used)| 1 + used + len))
}

/// Streaming decode: splits one whole frame off `src` if one is buffered.
pub fn try_decode(src: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
    match frame_len(src)? {
        Some(total) if src.len() >= total => {
            let frame = src.split_to(total).freeze();
            decode(&frame).map(Some)
        }
        _ => Ok(None),
    }
}

// ───────────────────────────────────────────────────────────
// Decoding
// ───────────────────────────────────────────────────────────

/// Decodes exactly one complete frame.
pub fn decode(frame: &[u8]) -> Result<Packet, ProtocolError> {
    let Some(&first) = frame.first() else {
        return Err(ProtocolError::Truncated { needed: 1 });
    };
    let packet_type = PacketType::from_nibble(first >> 4)?;
    let flags = first & 0x0F;
    if let Some(expected) = packet_type.fixed_flags() {
        if flags != expected {
            return Err(ProtocolError::InvalidFlags { packet_type, flags });
        }
    }

    let Some((len, used)) = decode_remaining_length(&frame[1..])? else {
        return Err(ProtocolError::Truncated { needed: 1 });
    };
    let body = &frame[1 + used..];
    if body.len() < len {
        return Err(ProtocolError::Truncated {
            needed: len - body.len(),
        });
    }
    if body.len() > len {
        return Err(ProtocolError::TrailingBytes(body.len() - len));
    }

    let mut reader = Reader::new(body);
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut reader)?),
        PacketType::ConnAck => {
            let ack_flags = reader.u8()?;
            let code = ConnectReturnCode::try_from(reader.u8()?)?;
            Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 == 0x01,
                code,
            })
        }
        PacketType::Publish => Packet::Publish(decode_publish(flags, &mut reader)?),
        PacketType::PubAck => Packet::PubAck(reader.packet_id()?),
        PacketType::PubRec => Packet::PubRec(reader.packet_id()?),
        PacketType::PubRel => Packet::PubRel(reader.packet_id()?),
        PacketType::PubComp => Packet::PubComp(reader.packet_id()?),
        PacketType::UnsubAck => Packet::UnsubAck(reader.packet_id()?),
        PacketType::Subscribe => {
            let packet_id = reader.packet_id()?;
            let mut filters = Vec::new();
            while reader.has_remaining() {
                let filter = reader.string()?;
                check_filter(&filter)?;
                let qos = QoS::try_from(reader.u8()?)?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(ProtocolError::NoTopicFilters(packet_type));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        PacketType::SubAck => {
            let packet_id = reader.packet_id()?;
            let mut return_codes = Vec::with_capacity(reader.remaining());
            while reader.has_remaining() {
                return_codes.push(SubAckReturnCode::from_byte(reader.u8()?)?);
            }
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsubscribe => {
            let packet_id = reader.packet_id()?;
            let mut filters = Vec::new();
            while reader.has_remaining() {
                let filter = reader.string()?;
                check_filter(&filter)?;
                filters.push(filter);
            }
            if filters.is_empty() {
                return Err(ProtocolError::NoTopicFilters(packet_type));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };
    reader.finish()?;
    Ok(packet)
}

fn decode_connect(reader: &mut Reader<'_>) -> Result<Connect, ProtocolError> {
    if reader.remaining() < MIN_CONNECT_LEN {
        return Err(ProtocolError::ConnectTooShort(reader.remaining()));
    }
    let protocol_name = reader.string()?;
    if protocol_name != PROTOCOL_NAME {
        return Err(ProtocolError::InvalidProtocolName(protocol_name));
    }
    let protocol_level = reader.u8()?;
    let flags = reader.u8()?;
    let keep_alive = reader.u16()?;

    if flags & 0x01 != 0 {
        return Err(ProtocolError::InvalidConnectFlags("reserved bit set"));
    }
    let clean_session = flags & 0x02 != 0;
    let will_flag = flags & 0x04 != 0;
    let will_qos = (flags >> 3) & 0x03;
    let will_retain = flags & 0x20 != 0;
    let password_flag = flags & 0x40 != 0;
    let username_flag = flags & 0x80 != 0;

    if !will_flag && (will_qos != 0 || will_retain) {
        return Err(ProtocolError::InvalidConnectFlags(
            "will QoS or retain set without will flag",
        ));
    }
    if will_qos == 3 {
        return Err(ProtocolError::InvalidConnectFlags("will QoS 3"));
    }
    if password_flag && !username_flag {
        return Err(ProtocolError::InvalidConnectFlags(
            "password flag without username flag",
        ));
    }

    let client_id = reader.string()?;
    let will = if will_flag {
        let topic = reader.string()?;
        if topic.is_empty() {
            return Err(ProtocolError::EmptyTopic);
        }
        let payload = reader.binary()?;
        Some(Will {
            topic,
            payload,
            qos: QoS::try_from(will_qos)?,
            retain: will_retain,
        })
    } else {
        None
    };
    let username = if username_flag {
        Some(reader.string()?)
    } else {
        None
    };
    let password = if password_flag {
        Some(reader.binary()?)
    } else {
        None
    };
    if reader.has_remaining() {
        return Err(ProtocolError::InvalidConnectFlags(
            "payload field present without its flag",
        ));
    }

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_publish(flags: u8, reader: &mut Reader<'_>) -> Result<Publish, ProtocolError> {
    let invalid = ProtocolError::InvalidFlags {
        packet_type: PacketType::Publish,
        flags,
    };
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03).map_err(|_| invalid.clone())?;
    if dup && qos == QoS::AtMostOnce {
        return Err(invalid);
    }

    let topic = reader.string()?;
    check_topic_name(&topic)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(reader.packet_id()?),
    };
    let payload = reader.rest();
    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload,
    })
}

fn check_filter(filter: &str) -> Result<(), ProtocolError> {
    if filter.is_empty() {
        return Err(ProtocolError::EmptyTopic);
    }
    if filter.contains('\0') {
        return Err(ProtocolError::NullInTopic);
    }
    Ok(())
}

fn check_topic_name(topic: &str) -> Result<(), ProtocolError> {
    check_filter(topic)?;
    if topic.contains(['+', '#']) {
        return Err(ProtocolError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

/// Bounds-checked cursor over a packet body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn has_remaining(&self) -> bool {
        !self.buf.is_empty()
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated {
                needed: n - self.buf.len(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    fn packet_id(&mut self) -> Result<u16, ProtocolError> {
        match self.u16()? {
            0 => Err(ProtocolError::ZeroPacketId),
            id => Ok(id),
        }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn binary(&mut self) -> Result<Bytes, ProtocolError> {
        let len = usize::from(self.u16()?);
        Ok(Bytes::copy_from_slice(self.bytes(len)?))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = usize::from(self.u16()?);
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn rest(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(self.buf);
        self.buf = &[];
        rest
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        match self.buf.len() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

// ───────────────────────────────────────────────────────────
// Encoding
// ───────────────────────────────────────────────────────────

/// Encodes `packet` into a freshly allocated buffer.
pub fn encode(packet: &Packet) -> Result<Bytes, ProtocolError> {
    let mut dst = BytesMut::new();
    encode_into(packet, &mut dst)?;
    Ok(dst.freeze())
}

/// Appends the wire form of `packet` to `dst`. On error `dst` is left as it
/// was.
pub fn encode_into(packet: &Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let packet_type = packet.packet_type();
    let mut body = BytesMut::new();
    let flags = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            0
        }
        Packet::ConnAck(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.code as u8);
            0
        }
        Packet::Publish(publish) => {
            put_string(&mut body, &publish.topic)?;
            match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, _) => {}
                (_, Some(id)) if id != 0 => body.put_u16(id),
                _ => return Err(ProtocolError::ZeroPacketId),
            }
            body.extend_from_slice(&publish.payload);
            publish.flags()
        }
        Packet::PubAck(id)
        | Packet::PubRec(id)
        | Packet::PubRel(id)
        | Packet::PubComp(id)
        | Packet::UnsubAck(id) => {
            put_packet_id(&mut body, *id)?;
            packet_type.fixed_flags().unwrap_or_default()
        }
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                return Err(ProtocolError::NoTopicFilters(packet_type));
            }
            put_packet_id(&mut body, subscribe.packet_id)?;
            for (filter, qos) in &subscribe.filters {
                put_string(&mut body, filter)?;
                body.put_u8((*qos).into());
            }
            0x02
        }
        Packet::SubAck(suback) => {
            put_packet_id(&mut body, suback.packet_id)?;
            for code in &suback.return_codes {
                body.put_u8(code.to_byte());
            }
            0
        }
        Packet::Unsubscribe(unsubscribe) => {
            if unsubscribe.filters.is_empty() {
                return Err(ProtocolError::NoTopicFilters(packet_type));
            }
            put_packet_id(&mut body, unsubscribe.packet_id)?;
            for filter in &unsubscribe.filters {
                put_string(&mut body, filter)?;
            }
            0x02
        }
        Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
    };

    let mut header = BytesMut::with_capacity(5);
    header.put_u8(((packet_type as u8) << 4) | flags);
    encode_remaining_length(body.len(), &mut header)?;

    dst.reserve(header.len() + body.len());
    dst.extend_from_slice(&header);
    dst.extend_from_slice(&body);
    Ok(())
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), ProtocolError> {
    if connect.password.is_some() && connect.username.is_none() {
        return Err(ProtocolError::InvalidConnectFlags(
            "password flag without username flag",
        ));
    }
    let mut flags = 0u8;
    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &connect.will {
        flags |= 0x04 | (u8::from(will.qos) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if connect.password.is_some() {
        flags |= 0x40;
    }
    if connect.username.is_some() {
        flags |= 0x80;
    }

    put_string(body, &connect.protocol_name)?;
    body.put_u8(connect.protocol_level);
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);
    put_string(body, &connect.client_id)?;
    if let Some(will) = &connect.will {
        put_string(body, &will.topic)?;
        put_binary(body, &will.payload)?;
    }
    if let Some(username) = &connect.username {
        put_string(body, username)?;
    }
    if let Some(password) = &connect.password {
        put_binary(body, password)?;
    }
    Ok(())
}

fn put_packet_id(dst: &mut BytesMut, id: u16) -> Result<(), ProtocolError> {
    if id == 0 {
        return Err(ProtocolError::ZeroPacketId);
    }
    dst.put_u16(id);
    Ok(())
}

fn put_binary(dst: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len()).map_err(|_| ProtocolError::StringTooLong(data.len()))?;
    dst.put_u16(len);
    dst.extend_from_slice(data);
    Ok(())
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    put_binary(dst, s.as_bytes())
}
