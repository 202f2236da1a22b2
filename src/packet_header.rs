//! Wire layout of the packets, all numbers in network byte order (BE):
//!
//! ```ascii
//! 0: packet type (u8)
//! 1: protocol version (u8)
//! 2: type specific header
//! *: payload (data packets only)
//! ```
//!
//! *HANDSHAKE_REQUEST*, *HANDSHAKE*
//!
//! ```ascii
//! 0: features of the sending endpoint (u64 bit set)
//! ```
//!
//! *EAGER* (data)
//!
//! ```ascii
//! 0: message id, i.e. the sender's transfer id (u32)
//! 4: flags (u8): bit 0 - sender requests a receipt (delivery complete)
//! 5: total message length (varint u32)
//! *: offset of this packet's payload in the message (varint u32)
//! ```
//!
//! *RECEIPT*
//!
//! ```ascii
//! 0: message id that is acknowledged (u32)
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use anyhow::bail;
use crate::ids::TransferId;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketType {
    HandshakeRequest = 1,
    Handshake = 2,
    Eager = 3,
    Receipt = 4,
}

bitflags! {
    /// Capabilities that are exchanged during the handshake
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
    pub struct PeerFeatures: u64 {
        /// the peer sends RECEIPT packets for messages that request them
        const DELIVERY_COMPLETE = 0b0000_0001;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    struct EagerFlags: u8 {
        const DELIVERY_COMPLETE = 0b0000_0001;
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EagerHeader {
    pub msg_id: TransferId,
    pub delivery_complete: bool,
    pub total_len: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketHeader {
    HandshakeRequest { features: PeerFeatures },
    Handshake { features: PeerFeatures },
    Eager(EagerHeader),
    Receipt { msg_id: TransferId },
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;

    const BASE_LEN: usize = 2*size_of::<u8>();
    pub const MAX_CTRL_HEADER_LEN: usize = Self::BASE_LEN + size_of::<u64>();
    pub const MAX_EAGER_HEADER_LEN: usize = Self::BASE_LEN
        + size_of::<u32>()  // message id
        + size_of::<u8>()   // flags
        + 5                 // total length, varint
        + 5;                // offset, varint

    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketHeader::HandshakeRequest { .. } => PacketType::HandshakeRequest,
            PacketHeader::Handshake { .. } => PacketType::Handshake,
            PacketHeader::Eager(_) => PacketType::Eager,
            PacketHeader::Receipt { .. } => PacketType::Receipt,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.packet_type().into());
        buf.put_u8(Self::PROTOCOL_VERSION_1);

        match self {
            PacketHeader::HandshakeRequest { features } |
            PacketHeader::Handshake { features } => {
                buf.put_u64(features.bits());
            }
            PacketHeader::Eager(header) => {
                buf.put_u32(header.msg_id.to_raw());
                let flags = if header.delivery_complete { EagerFlags::DELIVERY_COMPLETE } else { EagerFlags::empty() };
                buf.put_u8(flags.bits());
                buf.put_u32_varint(header.total_len);
                buf.put_u32_varint(header.offset);
            }
            PacketHeader::Receipt { msg_id } => {
                buf.put_u32(msg_id.to_raw());
            }
        }
    }

    /// Parses the header, leaving `buf` positioned at the start of the payload
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let packet_type = PacketType::try_from(buf.try_get_u8()?)?;
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }

        let result = match packet_type {
            PacketType::HandshakeRequest => PacketHeader::HandshakeRequest {
                // features we do not know are ignored, so newer peers can talk to us
                features: PeerFeatures::from_bits_truncate(buf.try_get_u64()?),
            },
            PacketType::Handshake => PacketHeader::Handshake {
                features: PeerFeatures::from_bits_truncate(buf.try_get_u64()?),
            },
            PacketType::Eager => {
                let msg_id = TransferId::from_raw(buf.try_get_u32()?);
                let flags = EagerFlags::from_bits_truncate(buf.try_get_u8()?);
                let total_len = buf.try_get_u32_varint()?;
                let offset = buf.try_get_u32_varint()?;
                PacketHeader::Eager(EagerHeader {
                    msg_id,
                    delivery_complete: flags.contains(EagerFlags::DELIVERY_COMPLETE),
                    total_len,
                    offset,
                })
            }
            PacketType::Receipt => PacketHeader::Receipt {
                msg_id: TransferId::from_raw(buf.try_get_u32()?),
            },
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::handshake_request(PacketHeader::HandshakeRequest { features: PeerFeatures::DELIVERY_COMPLETE }, vec![1,1, 0,0,0,0,0,0,0,1])]
    #[case::handshake(PacketHeader::Handshake { features: PeerFeatures::empty() }, vec![2,1, 0,0,0,0,0,0,0,0])]
    #[case::eager(PacketHeader::Eager(EagerHeader { msg_id: TransferId::from_raw(7), delivery_complete: true, total_len: 300, offset: 5 }), vec![3,1, 0,0,0,7, 1, 0xac,0x02, 5])]
    #[case::receipt(PacketHeader::Receipt { msg_id: TransferId::from_raw(0x01020304) }, vec![4,1, 1,2,3,4])]
    fn test_ser(#[case] header: PacketHeader, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut parse_buf: &[u8] = &buf;
        assert_eq!(PacketHeader::deser(&mut parse_buf).unwrap(), header);
        assert!(parse_buf.is_empty());
    }

    #[test]
    fn test_deser_leaves_payload() {
        let mut buf = BytesMut::new();
        PacketHeader::Eager(EagerHeader { msg_id: TransferId::from_raw(1), delivery_complete: false, total_len: 3, offset: 0 })
            .ser(&mut buf);
        buf.put_slice(&[9, 8, 7]);

        let mut parse_buf: &[u8] = &buf;
        PacketHeader::deser(&mut parse_buf).unwrap();
        assert_eq!(parse_buf, &[9, 8, 7]);
    }

    #[test]
    fn test_deser_ignores_unknown_features() {
        let mut parse_buf: &[u8] = &[2,1, 0x80,0,0,0,0,0,0,1];
        assert_eq!(PacketHeader::deser(&mut parse_buf).unwrap(), PacketHeader::Handshake { features: PeerFeatures::DELIVERY_COMPLETE });
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_type(vec![99,1])]
    #[case::wrong_version(vec![4,2, 0,0,0,1])]
    #[case::truncated_handshake(vec![1,1, 0,0,0])]
    #[case::truncated_eager(vec![3,1, 0,0,0,7, 0])]
    fn test_deser_invalid(#[case] raw: Vec<u8>) {
        let mut parse_buf: &[u8] = &raw;
        assert!(PacketHeader::deser(&mut parse_buf).is_err());
    }

    #[test]
    fn test_max_eager_header_len() {
        let mut buf = BytesMut::new();
        PacketHeader::Eager(EagerHeader { msg_id: TransferId::from_raw(u32::MAX), delivery_complete: true, total_len: u32::MAX, offset: u32::MAX })
            .ser(&mut buf);
        assert_eq!(buf.len(), PacketHeader::MAX_EAGER_HEADER_LEN);
    }
}
