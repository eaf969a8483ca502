//! CRC-based device addressing.
//!
//! Every outbound packet carries, unencrypted, a CRC-32 token derived from the
//! device id and the negotiation seed. Devices sharing a broadcast segment use it
//! to pick out their own traffic before attempting to decrypt anything, so the
//! output must match the firmware bit for bit.

use crc::{CRC_32_ISO_HDLC, Crc};

/// Width, in hex characters, of the id field fed to the CRC.
const ID_FIELD_HEX_LEN: usize = 50;
const TERMINATOR: u8 = 0x00;

/// Computes the device's wire-level address token as 8 lowercase hex characters.
pub fn compute_address(id: &str, seed: u32) -> String {
    format!("{:08x}", address_value(id, seed))
}

/// Binary form of [`compute_address`].
pub fn address_value(id: &str, seed: u32) -> u32 {
    let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
    crc32.checksum(&address_input(id, seed))
}

/// Builds the byte sequence the CRC runs over:
/// `pad50(hex(id)) ‖ 00 ‖ seed_bytes(seed)`.
///
/// Each id byte is two hex characters, so zero-padding the hex text on the left
/// is the same as prepending zero bytes, and truncating keeps the leading bytes.
fn address_input(id: &str, seed: u32) -> Vec<u8> {
    let id_bytes = id.as_bytes();
    let field_len = ID_FIELD_HEX_LEN / 2;

    let mut bytes = Vec::with_capacity(field_len + 1 + 4);
    if id_bytes.len() >= field_len {
        bytes.extend_from_slice(&id_bytes[..field_len]);
    } else {
        bytes.resize(field_len - id_bytes.len(), 0);
        bytes.extend_from_slice(id_bytes);
    }
    bytes.push(TERMINATOR);
    bytes.extend(seed_bytes(seed));
    bytes
}

/// The seed's unpadded hex digits read two at a time from the left.
///
/// `0x00123456` gives `12 34 56`. An odd trailing digit becomes a byte of its
/// own, so `0x01234567` gives `12 34 56 07`.
fn seed_bytes(seed: u32) -> Vec<u8> {
    let digits = (8 - seed.leading_zeros() as usize / 4).max(1);
    let nibbles: Vec<u8> = (0..digits)
        .rev()
        .map(|i| ((seed >> (i * 4)) & 0xf) as u8)
        .collect();
    nibbles
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => (hi << 4) | lo,
            [lone] => *lone,
            _ => 0,
        })
        .collect()
}
