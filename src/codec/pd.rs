// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! `encode_pd` / `decode_pd` (spec.md §4.1): assemble and validate a
//! complete wire frame — header, payload, payload CRC.

use crate::codec::crc;
use crate::codec::header::Header;
use crate::constant::{CRC_SIZE, HEADER_SIZE};
use crate::error::{Error, Result};

/// Fill in `header.payload_length`, pack the header (with its own CRC),
/// append `payload`, then append the payload CRC.
pub fn encode_pd(mut header: Header, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > u32::MAX as usize {
        return Err(Error::Wire("payload too large"));
    }
    header.payload_length = payload.len() as u32;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    out.extend_from_slice(&header.pack());
    out.extend_from_slice(payload);
    let payload_crc = crc::crc32_ieee(payload);
    out.extend_from_slice(&payload_crc.to_be_bytes());
    Ok(out)
}

/// Unpack and fully CRC-verify a frame. Neither the header fields nor the
/// payload are trusted until both CRCs have checked out (spec.md §4.1).
pub fn decode_pd(bytes: &[u8]) -> Result<(Header, &[u8])> {
    let header = Header::unpack(bytes)?;
    let declared_len = header.payload_length as usize;
    let expected_total = HEADER_SIZE + declared_len + CRC_SIZE;
    if bytes.len() != expected_total {
        return Err(Error::Wire("length mismatch"));
    }
    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + declared_len];
    let payload_crc_bytes = &bytes[HEADER_SIZE + declared_len..expected_total];
    let payload_crc = u32::from_be_bytes(payload_crc_bytes.try_into().unwrap());
    if crc::crc32_ieee(payload) != payload_crc {
        return Err(Error::Crc);
    }
    Ok((header, payload))
}
