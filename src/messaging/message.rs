use std::fmt::{Debug, Display, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;

use crate::messaging::peer_id::PeerId;
use crate::util::buf::{put_string, try_get_string};


/// Correlation token of a message. The sender generates it, and an ACK (or UNREACHABLE) carries
///  the id of the message it refers to.
///
/// Ids are generated per session from a counter starting at [MessageId::FIRST]; [MessageId::HELLO]
///  is reserved for the handshake.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub u64);

impl MessageId {
    pub const HELLO: MessageId = MessageId(0);
    pub const FIRST: MessageId = MessageId(1);

    pub fn next(self) -> MessageId {
        MessageId(self.0 + 1)
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageKind {
    /// application payload
    Data = 1,
    /// acknowledges the DATA (or HELLO) message with the same id
    Ack = 2,
    /// sent once by a client when connecting, announcing its [PeerId] in the `sender` field
    Hello = 3,
    /// the server refuses a HELLO, the payload contains the reason as UTF-8 text
    Reject = 4,
    /// negative acknowledgement: the relay target of the DATA message with the same id has no
    ///  active session
    Unreachable = 5,
}

impl TryFrom<u8> for MessageKind {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Data),
            2 => Ok(MessageKind::Ack),
            3 => Ok(MessageKind::Hello),
            4 => Ok(MessageKind::Reject),
            5 => Ok(MessageKind::Unreachable),
            n => Err(anyhow!("invalid message kind: {}", n)),
        }
    }
}

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// A single message as it goes over the wire. Messages are immutable once constructed.
///
/// Serialized layout (inside a frame, all numbers in network byte order):
/// ```ascii
///  0: CRC-32 (ISCSI) of everything after the checksum (u32)
///  4: kind (u8)
///  5: id (u64)
/// 13: sender (u16 length + UTF-8)
///  *: target (u16 length + UTF-8, length 0 for 'no target')
///  *: payload (rest of the frame)
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    id: MessageId,
    kind: MessageKind,
    sender: PeerId,
    target: Option<PeerId>,
    payload: Bytes,
}

impl Message {
    pub fn data(id: MessageId, sender: PeerId, target: Option<PeerId>, payload: impl Into<Bytes>) -> Message {
        Message {
            id,
            kind: MessageKind::Data,
            sender,
            target,
            payload: payload.into(),
        }
    }

    pub fn ack(id: MessageId, sender: PeerId) -> Message {
        Self::control(id, MessageKind::Ack, sender, None, Bytes::new())
    }

    pub fn hello(id: MessageId, sender: PeerId) -> Message {
        Self::control(id, MessageKind::Hello, sender, None, Bytes::new())
    }

    pub fn reject(id: MessageId, sender: PeerId, reason: &str) -> Message {
        Self::control(id, MessageKind::Reject, sender, None, Bytes::copy_from_slice(reason.as_bytes()))
    }

    pub fn unreachable(id: MessageId, sender: PeerId, target: PeerId) -> Message {
        Self::control(id, MessageKind::Unreachable, sender, Some(target), Bytes::new())
    }

    fn control(id: MessageId, kind: MessageKind, sender: PeerId, target: Option<PeerId>, payload: Bytes) -> Message {
        Message {
            id,
            kind,
            sender,
            target,
            payload,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> &PeerId {
        &self.sender
    }

    pub fn target(&self) -> Option<&PeerId> {
        self.target.as_ref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The payload as text, if it is valid UTF-8 (which it always is in the chat use case)
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u32(0); // placeholder, patched once the rest is serialized

        buf.put_u8(self.kind as u8);
        buf.put_u64(self.id.0);
        put_string(buf, self.sender.as_str());
        put_string(buf, self.target.as_ref().map(|t| t.as_str()).unwrap_or(""));
        buf.put_slice(&self.payload);

        let checksum = CHECKSUM.checksum(&buf[start + 4..]);
        buf[start..start + 4].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<Message> {
        let checksum = buf.try_get_u32()?;
        let actual_checksum = CHECKSUM.checksum(&buf);
        if checksum != actual_checksum {
            bail!("checksum mismatch: expected {:08x}, was {:08x}", checksum, actual_checksum);
        }

        let kind = MessageKind::try_from(buf.try_get_u8()?)?;
        let id = MessageId(buf.try_get_u64()?);
        let sender = PeerId::new(try_get_string(&mut buf)?)?;
        let target = match try_get_string(&mut buf)? {
            s if s.is_empty() => None,
            s => Some(PeerId::new(s)?),
        };

        Ok(Message {
            id,
            kind,
            sender,
            target,
            payload: buf,
        })
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{{id:{:?}, sender:{:?}", self.kind, self.id, self.sender)?;
        if let Some(target) = &self.target {
            write!(f, ", target:{:?}", target)?;
        }
        write!(f, ", {} bytes}}", self.payload.len())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn peer(name: &str) -> PeerId {
        PeerId::new(name).unwrap()
    }

    #[rstest]
    #[case::data(Message::data(MessageId(1), peer("alice"), None, "ping"))]
    #[case::data_with_target(Message::data(MessageId(99), peer("alice"), Some(peer("bob")), "hi bob"))]
    #[case::data_empty(Message::data(MessageId(u64::MAX), peer("alice"), None, ""))]
    #[case::ack(Message::ack(MessageId(1), peer("server")))]
    #[case::hello(Message::hello(MessageId::HELLO, peer("alice")))]
    #[case::reject(Message::reject(MessageId::HELLO, peer("server"), "name 'alice' is already taken"))]
    #[case::unreachable(Message::unreachable(MessageId(17), peer("server"), peer("carol")))]
    fn test_ser_deser(#[case] msg: Message) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);

        let deser = Message::deser(buf.freeze()).unwrap();
        assert_eq!(deser, msg);
    }

    #[test]
    fn test_ser_layout() {
        let mut buf = BytesMut::new();
        Message::data(MessageId(0x0102), peer("ab"), None, "xy").ser(&mut buf);

        assert_eq!(&buf[4..], b"\x01\0\0\0\0\0\0\x01\x02\0\x02ab\0\0xy");
        let checksum = CHECKSUM.checksum(&buf[4..]);
        assert_eq!(&buf[..4], &checksum.to_be_bytes());
    }

    #[test]
    fn test_deser_checksum_mismatch() {
        let mut buf = BytesMut::new();
        Message::data(MessageId(5), peer("alice"), None, "hello").ser(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0x20;

        assert!(Message::deser(buf.freeze()).is_err());
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::checksum_only(b"\0\0\0\0")]
    #[case::unknown_kind(b"\x09\0\0\0\0\0\0\0\x01\0\x01a\0\0")]
    #[case::truncated_sender(b"\x01\0\0\0\0\0\0\0\x01\0\x05ab")]
    #[case::empty_sender(b"\x01\0\0\0\0\0\0\0\x01\0\0\0\0")]
    fn test_deser_malformed(#[case] body: &[u8]) {
        // prefix a valid checksum so that parsing gets past the checksum test
        let mut buf = BytesMut::new();
        if !body.is_empty() {
            buf.put_u32(CHECKSUM.checksum(body));
        }
        buf.put_slice(body);

        assert!(Message::deser(buf.freeze()).is_err());
    }

    #[test]
    fn test_payload_str() {
        assert_eq!(Message::data(MessageId(1), peer("a"), None, "ä").payload_str(), Some("ä"));
        assert_eq!(Message::data(MessageId(1), peer("a"), None, vec![0xc0u8, 0xaf]).payload_str(), None);
    }
}
