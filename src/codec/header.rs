// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! The fixed 40-byte wire header (spec.md §3 "Header (wire)").
//!
//! Byte layout, big-endian throughout:
//!
//! ```text
//! 0   version_major, version_minor   (1, 1)
//! 2   msg_type                       (2)
//! 4   com_id                         (4)
//! 8   etb_topo_cnt                   (4)
//! 12  op_trn_topo_cnt                (4)
//! 16  service_id                     (4)
//! 20  sequence_counter               (4)
//! 24  payload_length                 (4)
//! 28  tail (8 bytes, PD/MD-specific — see `Tail`)
//! 36  header_crc                     (4)
//! ```
//!
//! PD telegrams (and MD framed in the same discipline) use the 8-byte tail
//! as `reply_com_id` + `reply_ip`, matching the pull-request fields spec.md
//! lists on the PD header. MD telegrams reuse the same 8 bytes as a 64-bit
//! session tag derived from the session's UUID (DESIGN.md "Header tail
//! compaction") rather than growing the header to fit a full 128-bit UUID.

use crate::codec::crc;
use crate::constant::{HEADER_SIZE, MsgType, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// The PD/MD-specific half of the header's 8-byte tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    Pd { reply_com_id: u32, reply_ip: Ipv4Addr },
    Md { session_tag: u64 },
}

impl Tail {
    fn pack(self, out: &mut [u8; 8]) {
        match self {
            Tail::Pd { reply_com_id, reply_ip } => {
                out[0..4].copy_from_slice(&reply_com_id.to_be_bytes());
                out[4..8].copy_from_slice(&reply_ip.octets());
            }
            Tail::Md { session_tag } => {
                out[0..8].copy_from_slice(&session_tag.to_be_bytes());
            }
        }
    }

    fn unpack(bytes: &[u8], msg_type: MsgType) -> Tail {
        if msg_type.is_md() {
            Tail::Md { session_tag: u64::from_be_bytes(bytes[0..8].try_into().unwrap()) }
        } else {
            let reply_com_id = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
            let reply_ip = Ipv4Addr::from(<[u8; 4]>::try_from(&bytes[4..8]).unwrap());
            Tail::Pd { reply_com_id, reply_ip }
        }
    }
}

/// Derives a session's 64-bit wire tag from its full UUID. Collisions are
/// possible in principle but astronomically unlikely across a train's
/// concurrent MD session set; the full UUID remains the session's true
/// identity host-side.
pub fn session_tag(uuid: uuid::Uuid) -> u64 {
    let bytes = uuid.as_bytes();
    u64::from_be_bytes(bytes[0..8].try_into().unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MsgType,
    pub com_id: u32,
    pub etb_topo_cnt: u32,
    pub op_trn_topo_cnt: u32,
    pub service_id: u32,
    pub sequence_counter: u32,
    pub payload_length: u32,
    pub tail: Tail,
}

impl Header {
    /// Pack the header into its 40-byte wire form, computing and appending
    /// the header CRC over the 36 preceding bytes.
    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PROTOCOL_VERSION.0;
        buf[1] = PROTOCOL_VERSION.1;
        buf[2..4].copy_from_slice(&(self.msg_type as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&self.com_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.etb_topo_cnt.to_be_bytes());
        buf[12..16].copy_from_slice(&self.op_trn_topo_cnt.to_be_bytes());
        buf[16..20].copy_from_slice(&self.service_id.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sequence_counter.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_length.to_be_bytes());
        let mut tail = [0u8; 8];
        self.tail.pack(&mut tail);
        buf[28..36].copy_from_slice(&tail);
        let header_crc = crc::crc32_ieee(&buf[0..36]);
        buf[36..40].copy_from_slice(&header_crc.to_be_bytes());
        buf
    }

    /// Unpack and CRC-verify a header from the first [`HEADER_SIZE`] bytes
    /// of `bytes`. Per spec.md §4.1, no field beyond the version is trusted
    /// until the header CRC verifies.
    pub fn unpack(bytes: &[u8]) -> Result<Header> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Wire("buffer shorter than header"));
        }
        if bytes[0] != PROTOCOL_VERSION.0 {
            return Err(Error::Wire("unsupported protocol version"));
        }
        let header_crc = u32::from_be_bytes(bytes[36..40].try_into().unwrap());
        if crc::crc32_ieee(&bytes[0..36]) != header_crc {
            return Err(Error::Crc);
        }
        let msg_type_raw = u16::from_be_bytes(bytes[2..4].try_into().unwrap());
        let msg_type = MsgType::from_u16(msg_type_raw).ok_or(Error::Wire("unknown msg type"))?;
        Ok(Header {
            msg_type,
            com_id: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            etb_topo_cnt: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            op_trn_topo_cnt: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            service_id: u32::from_be_bytes(bytes[16..20].try_into().unwrap()),
            sequence_counter: u32::from_be_bytes(bytes[20..24].try_into().unwrap()),
            payload_length: u32::from_be_bytes(bytes[24..28].try_into().unwrap()),
            tail: Tail::unpack(&bytes[28..36], msg_type),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pd_header(seq: u32) -> Header {
        Header {
            msg_type: MsgType::Pd,
            com_id: 1000,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            service_id: 0,
            sequence_counter: seq,
            payload_length: 5,
            tail: Tail::Pd { reply_com_id: 0, reply_ip: Ipv4Addr::UNSPECIFIED },
        }
    }

    #[test]
    fn pack_is_exactly_forty_bytes() {
        assert_eq!(sample_pd_header(1).pack().len(), HEADER_SIZE);
    }

    #[test]
    fn round_trips_through_pack_unpack() {
        let header = sample_pd_header(42);
        let packed = header.pack();
        let unpacked = Header::unpack(&packed).unwrap();
        assert_eq!(unpacked, header);
    }

    #[test]
    fn rejects_bit_flip_with_crc_error() {
        let mut packed = sample_pd_header(1).pack();
        packed[10] ^= 0xFF;
        assert!(matches!(Header::unpack(&packed), Err(Error::Crc)));
    }

    #[test]
    fn rejects_short_buffer() {
        let packed = sample_pd_header(1).pack();
        assert!(matches!(Header::unpack(&packed[..30]), Err(Error::Wire(_))));
    }

    #[test]
    fn md_tail_round_trips_as_session_tag() {
        let uuid = uuid::Uuid::from_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        let header = Header {
            msg_type: MsgType::Mr,
            com_id: 5000,
            etb_topo_cnt: 0,
            op_trn_topo_cnt: 0,
            service_id: 0,
            sequence_counter: 1,
            payload_length: 0,
            tail: Tail::Md { session_tag: session_tag(uuid) },
        };
        let packed = header.pack();
        let unpacked = Header::unpack(&packed).unwrap();
        assert_eq!(unpacked.tail, Tail::Md { session_tag: session_tag(uuid) });
    }
}
