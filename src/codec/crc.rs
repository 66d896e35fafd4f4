// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! CRC-32 implementations, grounded in
//! `original_source/trdp/src/vos/common/vos_utils.c`.
//!
//! Two variants exist on the wire:
//!
//! - The primary CRC-32 (IEEE 802.3 / IEC 61375-2-3 A.3), reflected, updated
//!   `crc = (crc >> 8) ^ table[(crc ^ byte) & 0xFF]`, with the caller
//!   applying a final bitwise NOT ("inverted-final convention").
//! - The safety-layer SC-32 variant (IEC 61375-2-3 B.7), *not* reflected,
//!   updated `crc = table[((crc >> 24) ^ byte) & 0xFF] ^ (crc << 8)`, with no
//!   final inversion. DESIGN.md resolves its scope as header-only.

const IEEE_POLY: u32 = 0xEDB8_8320;
const SC32_POLY: u32 = 0x1EDC_6F41;

fn build_reflected_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ poly } else { crc >> 1 };
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
}

fn build_forward_table(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i << 24;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 0x8000_0000 != 0 { (crc << 1) ^ poly } else { crc << 1 };
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
}

fn ieee_table() -> &'static [u32; 256] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| build_reflected_table(IEEE_POLY))
}

fn sc32_table() -> &'static [u32; 256] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| build_forward_table(SC32_POLY))
}

/// Seed value mandated for both CRC variants.
pub const SEED: u32 = 0xFFFF_FFFF;

/// Primary CRC-32 (IEEE 802.3). Pass `seed = SEED` for a fresh computation,
/// or a running value to extend a previous one. The result is *not* yet
/// inverted — call [`finish`] once the whole buffer has been folded in.
pub fn crc32_ieee_update(seed: u32, bytes: &[u8]) -> u32 {
    let table = ieee_table();
    let mut crc = seed;
    for &b in bytes {
        crc = (crc >> 8) ^ table[((crc ^ b as u32) & 0xFF) as usize];
    }
    crc
}

/// Apply the inverted-final convention to a running CRC-32 value.
pub fn finish(crc: u32) -> u32 {
    !crc
}

/// One-shot IEEE CRC-32 over `bytes`, seeded and inverted per the wire
/// convention.
pub fn crc32_ieee(bytes: &[u8]) -> u32 {
    finish(crc32_ieee_update(SEED, bytes))
}

/// Safety-layer SC-32 (IEC 61375-2-3 B.7), non-reflected, no final inversion.
pub fn sc32(seed: u32, bytes: &[u8]) -> u32 {
    let table = sc32_table();
    let mut crc = seed;
    for &b in bytes {
        crc = table[(((crc >> 24) ^ b as u32) & 0xFF) as usize] ^ (crc << 8);
    }
    crc
}
