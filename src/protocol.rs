//! Wire format for local lighting datagrams.
//!
//! Outbound frames use the Tuya 3.5 `0x6699` envelope with the CRC address in
//! the authenticated header:
//!
//! ```text
//! header(4) ‖ AAD(14) ‖ nonce(12) ‖ crc(4) ‖ ct_len(4) ‖ ciphertext ‖ tag(16) ‖ tail(4)
//! AAD = reserved(2) ‖ crc(4) ‖ message type(4) ‖ declared length(4)
//! ```
//!
//! Discovery announcements (55AA with CRC trailer, 6699 with GCM) are also
//! unpacked here for the broadcast listener.

use crate::crypto::{AesGcmEncryptor, Encryptor, Key, NONCE_LEN, NonceBytes, TAG_LEN, Tag};
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;

pub const AAD_LEN: usize = 14;
const HEADER_LEN: usize = 4;
const TAIL_LEN: usize = 4;
/// crc(4) + ciphertext length(4) + tag(16), counted in the declared length.
const BODY_OVERHEAD: u32 = 4 + 4 + TAG_LEN as u32;
const MIN_PACKET_LEN: usize = HEADER_LEN + AAD_LEN + NONCE_LEN + 8 + TAG_LEN + TAIL_LEN;

define_message_type! {
    NegotiationRequest = 0x03,
    NegotiationResponse = 0x04,
    Stream = 0x40,
}

/// A sealed datagram addressed to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// CRC address of the target device
    pub crc: u32,
    /// Leading AAD field, zero on everything this crate sends
    pub reserved: u16,
    pub message_type: MessageType,
    pub nonce: NonceBytes,
    pub ciphertext: Vec<u8>,
    pub tag: Tag,
}

/// Builds the authenticated header for a body of `ciphertext_len` bytes.
pub fn build_aad(
    reserved: u16,
    crc: u32,
    message_type: MessageType,
    ciphertext_len: usize,
) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    BigEndian::write_u16(&mut aad[0..2], reserved);
    BigEndian::write_u32(&mut aad[2..6], crc);
    BigEndian::write_u32(&mut aad[6..10], message_type.code());
    BigEndian::write_u32(&mut aad[10..14], declared_len(ciphertext_len));
    aad
}

fn declared_len(ciphertext_len: usize) -> u32 {
    ciphertext_len as u32 + BODY_OVERHEAD
}

impl Packet {
    /// Encrypts `plaintext` under `key` and wraps it for the device at `crc`.
    pub fn seal(
        encryptor: &dyn Encryptor,
        key: &Key,
        crc: u32,
        message_type: MessageType,
        nonce: NonceBytes,
        plaintext: &[u8],
    ) -> Result<Self> {
        // GCM ciphertext is as long as the plaintext
        let aad = build_aad(0, crc, message_type, plaintext.len());
        let (ciphertext, tag) = encryptor.encrypt(key, &nonce, &aad, plaintext)?;
        Ok(Self {
            crc,
            reserved: 0,
            message_type,
            nonce,
            ciphertext,
            tag,
        })
    }

    /// The 14 authenticated header bytes. For a parsed packet these are the
    /// bytes as received.
    pub fn aad(&self) -> [u8; AAD_LEN] {
        build_aad(self.reserved, self.crc, self.message_type, self.ciphertext.len())
    }

    /// Verifies the header and body, returning the plaintext.
    pub fn open(&self, encryptor: &dyn Encryptor, key: &Key) -> Result<Vec<u8>> {
        encryptor.decrypt(key, &self.nonce, &self.aad(), &self.ciphertext, &self.tag)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(MIN_PACKET_LEN + self.ciphertext.len());
        data.write_u32::<BigEndian>(PREFIX_6699)?;
        data.extend_from_slice(&self.aad());
        data.extend_from_slice(&self.nonce);
        data.write_u32::<BigEndian>(self.crc)?;
        data.write_u32::<BigEndian>(self.ciphertext.len() as u32)?;
        data.extend_from_slice(&self.ciphertext);
        data.extend_from_slice(&self.tag);
        data.write_u32::<BigEndian>(SUFFIX_6699)?;
        Ok(data)
    }

    /// Hex form of the datagram, as it appears in debug logs.
    pub fn to_hex(&self) -> Result<String> {
        Ok(hex::encode(self.to_bytes()?))
    }

    /// Parses a datagram without decrypting it.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_PACKET_LEN {
            return Err(TuyaError::DecodeError(format!(
                "Packet too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        if cursor.read_u32::<BigEndian>()? != PREFIX_6699 {
            return Err(TuyaError::InvalidHeader);
        }
        let reserved = cursor.read_u16::<BigEndian>()?;
        let aad_crc = cursor.read_u32::<BigEndian>()?;
        let type_code = cursor.read_u32::<BigEndian>()?;
        let declared = cursor.read_u32::<BigEndian>()?;

        let mut nonce = [0u8; NONCE_LEN];
        let nonce_start = HEADER_LEN + AAD_LEN;
        nonce.copy_from_slice(&data[nonce_start..nonce_start + NONCE_LEN]);
        cursor.set_position((nonce_start + NONCE_LEN) as u64);

        let body_crc = cursor.read_u32::<BigEndian>()?;
        let ct_len = cursor.read_u32::<BigEndian>()? as usize;
        let ct_start = cursor.position() as usize;

        if ct_start + ct_len + TAG_LEN + TAIL_LEN != data.len() {
            return Err(TuyaError::DecodeError(format!(
                "Body length {} does not match packet of {} bytes",
                ct_len,
                data.len()
            )));
        }
        if body_crc != aad_crc || declared != declared_len(ct_len) {
            return Err(TuyaError::InvalidPayload);
        }

        let tag_start = ct_start + ct_len;
        let tail = BigEndian::read_u32(&data[data.len() - TAIL_LEN..]);
        if tail != SUFFIX_6699 {
            return Err(TuyaError::InvalidHeader);
        }

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[tag_start..tag_start + TAG_LEN]);

        Ok(Self {
            crc: aad_crc,
            reserved,
            message_type: MessageType::try_from(type_code)?,
            nonce,
            ciphertext: data[ct_start..tag_start].to_vec(),
            tag,
        })
    }
}

/// Unpacks a framed discovery announcement and returns its payload.
///
/// 55AA frames are checked against their CRC-32 trailer and returned as-is
/// (the payload may still be ECB encrypted). 6699 frames are GCM decrypted with
/// `key`, using header bytes 4..18 as AAD.
pub fn unpack_announcement(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 16 {
        return Err(TuyaError::DecodeError("Header too short".into()));
    }

    let mut cursor = Cursor::new(data);
    match cursor.read_u32::<BigEndian>()? {
        PREFIX_55AA => {
            // Prefix(4), Seq(4), Cmd(4), Len(4) ‖ payload ‖ CRC(4) ‖ Suffix(4)
            let _seqno = cursor.read_u32::<BigEndian>()?;
            let _cmd = cursor.read_u32::<BigEndian>()?;
            let payload_len = cursor.read_u32::<BigEndian>()? as usize;
            let total = payload_len + 16;
            if payload_len < 8 || data.len() < total {
                return Err(TuyaError::DecodeError("Data shorter than expected".into()));
            }

            let payload_end = total - 8;
            let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
            if crc32.checksum(&data[..payload_end]) != BigEndian::read_u32(&data[payload_end..])
            {
                return Err(TuyaError::InvalidPayload);
            }
            if BigEndian::read_u32(&data[payload_end + 4..total]) != SUFFIX_55AA {
                return Err(TuyaError::InvalidHeader);
            }
            Ok(data[16..payload_end].to_vec())
        }
        PREFIX_6699 => {
            // Prefix(4), Unknown(2), Seq(4), Cmd(4), Len(4) ‖ IV(12) ‖ ct ‖ tag(16) ‖ Suffix(4)
            const HEADER_6699: usize = 18;
            if data.len() < HEADER_6699 {
                return Err(TuyaError::DecodeError("6699 header too short".into()));
            }
            let payload_len = BigEndian::read_u32(&data[14..18]) as usize;
            let total = HEADER_6699 + payload_len + TAIL_LEN;
            if payload_len < NONCE_LEN + TAG_LEN || data.len() < total {
                return Err(TuyaError::DecodeError("Data shorter than expected".into()));
            }
            if key.len() != 16 {
                return Err(TuyaError::DecryptionFailed);
            }

            let body = &data[HEADER_6699..HEADER_6699 + payload_len];
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&body[..NONCE_LEN]);
            let mut tag = [0u8; TAG_LEN];
            tag.copy_from_slice(&body[body.len() - TAG_LEN..]);
            let mut k = [0u8; 16];
            k.copy_from_slice(key);

            AesGcmEncryptor.decrypt(
                &k,
                &nonce,
                &data[4..HEADER_6699],
                &body[NONCE_LEN..body.len() - TAG_LEN],
                &tag,
            )
        }
        _ => Err(TuyaError::InvalidHeader),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: Key = *b"sessionkey012345";

    fn sealed(plaintext: &[u8]) -> Packet {
        Packet::seal(
            &AesGcmEncryptor,
            &KEY,
            0x1234_abcd,
            MessageType::Stream,
            [3u8; NONCE_LEN],
            plaintext,
        )
        .unwrap()
    }

    #[test]
    fn packet_layout_matches_envelope() {
        let packet = sealed(&[0xc8, 0xa8, 0x00, 0x00, 0x01, 0x00]);
        let bytes = packet.to_bytes().unwrap();

        assert_eq!(bytes.len(), MIN_PACKET_LEN + 6);
        assert_eq!(&bytes[..4], &[0x00, 0x00, 0x66, 0x99]);
        assert_eq!(&bytes[4..6], &[0, 0]);
        assert_eq!(&bytes[6..10], &[0x12, 0x34, 0xab, 0xcd]);
        assert_eq!(&bytes[10..14], &[0, 0, 0, 0x40]);
        assert_eq!(BigEndian::read_u32(&bytes[14..18]), 6 + 24);
        assert_eq!(&bytes[18..30], &[3u8; 12]);
        assert_eq!(&bytes[30..34], &[0x12, 0x34, 0xab, 0xcd]);
        assert_eq!(BigEndian::read_u32(&bytes[34..38]), 6);
        assert_eq!(&bytes[bytes.len() - 4..], &[0x00, 0x00, 0x99, 0x66]);
        assert_eq!(packet.to_hex().unwrap(), hex::encode(&bytes));
    }

    #[test]
    fn parse_then_open_recovers_payload() {
        let packet = sealed(b"0004payload");
        let parsed = Packet::parse(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.open(&AesGcmEncryptor, &KEY).unwrap(), b"0004payload");
    }

    #[test]
    fn reserved_field_is_authenticated_as_received() {
        let aad = build_aad(0x0102, 0x1234_abcd, MessageType::NegotiationResponse, 5);
        let nonce = [9u8; NONCE_LEN];
        let (ciphertext, tag) = AesGcmEncryptor.encrypt(&KEY, &nonce, &aad, b"reply").unwrap();
        let bytes = Packet {
            crc: 0x1234_abcd,
            reserved: 0x0102,
            message_type: MessageType::NegotiationResponse,
            nonce,
            ciphertext,
            tag,
        }
        .to_bytes()
        .unwrap();
        assert_eq!(&bytes[4..18], &aad);

        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.reserved, 0x0102);
        assert_eq!(parsed.aad(), aad);
        assert_eq!(parsed.open(&AesGcmEncryptor, &KEY).unwrap(), b"reply");
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let mut bytes = sealed(b"frame").to_bytes().unwrap();
        // switch message type in the AAD, keep the frame well formed
        bytes[13] = 0x03;
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.message_type, MessageType::NegotiationRequest);
        assert_eq!(
            parsed.open(&AesGcmEncryptor, &KEY),
            Err(TuyaError::DecryptionFailed)
        );
    }

    #[test]
    fn parse_rejects_malformed_frames() {
        let bytes = sealed(b"frame").to_bytes().unwrap();

        assert!(Packet::parse(&bytes[..20]).is_err());

        let mut bad_prefix = bytes.clone();
        bad_prefix[2] = 0x55;
        assert_eq!(Packet::parse(&bad_prefix), Err(TuyaError::InvalidHeader));

        let mut bad_crc = bytes.clone();
        bad_crc[33] ^= 0xff;
        assert_eq!(Packet::parse(&bad_crc), Err(TuyaError::InvalidPayload));

        let mut bad_tail = bytes.clone();
        let n = bad_tail.len();
        bad_tail[n - 1] = 0;
        assert_eq!(Packet::parse(&bad_tail), Err(TuyaError::InvalidHeader));

        let mut truncated = bytes.clone();
        truncated.pop();
        assert!(matches!(Packet::parse(&truncated), Err(TuyaError::DecodeError(_))));

        let mut bad_type = bytes;
        bad_type[13] = 0x77;
        assert!(matches!(Packet::parse(&bad_type), Err(TuyaError::DecodeError(_))));
    }

    #[test]
    fn unpacks_55aa_announcement() {
        let payload = br#"{"gwId":"abc","ip":"10.0.0.5"}"#;
        let mut data = Vec::new();
        data.write_u32::<BigEndian>(PREFIX_55AA).unwrap();
        data.write_u32::<BigEndian>(0).unwrap();
        data.write_u32::<BigEndian>(0x13).unwrap();
        data.write_u32::<BigEndian>(payload.len() as u32 + 8).unwrap();
        data.extend_from_slice(payload);
        let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&data);
        data.write_u32::<BigEndian>(crc).unwrap();
        data.write_u32::<BigEndian>(SUFFIX_55AA).unwrap();

        assert_eq!(unpack_announcement(&data, &[]).unwrap(), payload);

        let n = data.len();
        data[n - 6] ^= 1;
        assert_eq!(unpack_announcement(&data, &[]), Err(TuyaError::InvalidPayload));
    }

    #[test]
    fn unpacks_6699_announcement() {
        let payload = br#"{"gwId":"abc","ip":"10.0.0.5"}"#;
        let mut header = Vec::new();
        header.write_u32::<BigEndian>(PREFIX_6699).unwrap();
        header.write_u16::<BigEndian>(0).unwrap();
        header.write_u32::<BigEndian>(0).unwrap();
        header.write_u32::<BigEndian>(0x25).unwrap();
        header
            .write_u32::<BigEndian>((NONCE_LEN + payload.len() + TAG_LEN) as u32)
            .unwrap();

        let nonce = [9u8; NONCE_LEN];
        let (ct, tag) = AesGcmEncryptor
            .encrypt(&KEY, &nonce, &header[4..], payload)
            .unwrap();

        let mut data = header;
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&ct);
        data.extend_from_slice(&tag);
        data.write_u32::<BigEndian>(SUFFIX_6699).unwrap();

        assert_eq!(unpack_announcement(&data, &KEY).unwrap(), payload);
        assert_eq!(
            unpack_announcement(&data, b"wrongkey01234567"),
            Err(TuyaError::DecryptionFailed)
        );
    }
}
