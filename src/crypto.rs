//! Authenticated encryption for the local lighting protocol.
//! AES-128-GCM for every datagram, plus AES-128-ECB for legacy v3.3 discovery announcements.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use cipher::BlockDecryptMut;
use ecb::Decryptor;
use rand::RngCore;

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub type Key = [u8; KEY_LEN];
pub type NonceBytes = [u8; NONCE_LEN];
pub type Tag = [u8; TAG_LEN];

/// Authenticated encryption with associated data.
///
/// Implementations must never return plaintext when the tag fails to verify.
pub trait Encryptor: Send + Sync {
    /// Encrypts `plaintext`, returning the ciphertext and its detached tag.
    fn encrypt(
        &self,
        key: &Key,
        nonce: &NonceBytes,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, Tag)>;

    /// Verifies `tag` over `aad` and `ciphertext`, then decrypts.
    fn decrypt(
        &self,
        key: &Key,
        nonce: &NonceBytes,
        aad: &[u8],
        ciphertext: &[u8],
        tag: &Tag,
    ) -> Result<Vec<u8>>;
}

/// AES-128-GCM backed [`Encryptor`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmEncryptor;

impl AesGcmEncryptor {
    pub fn new() -> Self {
        Self
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(
        &self,
        key: &Key,
        nonce: &NonceBytes,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, Tag)> {
        let gcm = Aes128Gcm::new(&(*key).into());
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        // aes-gcm appends the tag to the ciphertext
        let mut ciphertext = gcm
            .encrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| TuyaError::EncryptionFailed)?;
        if ciphertext.len() < TAG_LEN {
            return Err(TuyaError::EncryptionFailed);
        }
        let tag_bytes = ciphertext.split_off(ciphertext.len() - TAG_LEN);

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&tag_bytes);
        Ok((ciphertext, tag))
    }

    fn decrypt(
        &self,
        key: &Key,
        nonce: &NonceBytes,
        aad: &[u8],
        ciphertext: &[u8],
        tag: &Tag,
    ) -> Result<Vec<u8>> {
        let gcm = Aes128Gcm::new(&(*key).into());

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        gcm.decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|_| TuyaError::DecryptionFailed)
    }
}

/// Derives the 16-byte negotiation key from a device's pairing secret.
pub trait KeyDerivation: Send + Sync {
    fn derive(&self, local_key: &str) -> Result<Key>;
}

/// Uses the 16 ASCII characters of the Tuya local key directly as the AES key.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalKeyDerivation;

impl KeyDerivation for LocalKeyDerivation {
    fn derive(&self, local_key: &str) -> Result<Key> {
        let bytes = local_key.as_bytes();
        if bytes.len() != KEY_LEN {
            return Err(TuyaError::InvalidKey(format!(
                "local key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(key)
    }
}

/// Generates a fresh random nonce. Never reuse one across messages.
pub fn random_nonce() -> NonceBytes {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

/// Random bytes rendered as lowercase hex (`2 * len` characters).
pub fn random_hex_bytes(len: usize) -> String {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Parses a 32-character hex string into a key.
pub fn key_from_hex(text: &str) -> Result<Key> {
    let bytes = hex::decode(text)?;
    if bytes.len() != KEY_LEN {
        return Err(TuyaError::InvalidKey(format!(
            "expected {} hex bytes, got {}",
            KEY_LEN,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// AES-128-ECB decrypt with PKCS7 unpadding (v3.3 discovery announcements).
pub fn ecb_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(TuyaError::DecryptionFailed);
    }
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(TuyaError::DecryptionFailed);
    }

    let mut k = [0u8; KEY_LEN];
    k.copy_from_slice(key);
    let mut decryptor = Decryptor::<Aes128>::new(&k.into());
    let mut plaintext = data.to_vec();

    for chunk in plaintext.chunks_mut(16) {
        let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
        decryptor.decrypt_block_mut(block);
    }

    let pad_len = plaintext[plaintext.len() - 1] as usize;
    if pad_len == 0 || pad_len > 16 || pad_len > plaintext.len() {
        return Err(TuyaError::DecryptionFailed);
    }
    if plaintext[plaintext.len() - pad_len..]
        .iter()
        .any(|&b| b as usize != pad_len)
    {
        return Err(TuyaError::DecryptionFailed);
    }
    plaintext.truncate(plaintext.len() - pad_len);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: Key = *b"0123456789abcdef";
    const NONCE: NonceBytes = [7u8; NONCE_LEN];
    const AAD: &[u8] = b"\x00\x00header-bytes";

    fn flip(bytes: &mut [u8], bit: usize) {
        bytes[bit / 8] ^= 1 << (bit % 8);
    }

    #[test]
    fn round_trip_recovers_plaintext() {
        let enc = AesGcmEncryptor::new();
        let plaintext = b"c8a800000100";
        let (ct, tag) = enc.encrypt(&KEY, &NONCE, AAD, plaintext).unwrap();
        assert_eq!(ct.len(), plaintext.len());
        assert_ne!(ct.as_slice(), plaintext.as_slice());
        let out = enc.decrypt(&KEY, &NONCE, AAD, &ct, &tag).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn empty_plaintext_still_authenticates() {
        let enc = AesGcmEncryptor::new();
        let (ct, tag) = enc.encrypt(&KEY, &NONCE, AAD, &[]).unwrap();
        assert!(ct.is_empty());
        assert!(enc.decrypt(&KEY, &NONCE, AAD, &ct, &tag).unwrap().is_empty());
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let enc = AesGcmEncryptor::new();
        let plaintext = b"0004c86464";
        let (ct, tag) = enc.encrypt(&KEY, &NONCE, AAD, plaintext).unwrap();

        for bit in 0..TAG_LEN * 8 {
            let mut t = tag;
            flip(&mut t, bit);
            assert_eq!(
                enc.decrypt(&KEY, &NONCE, AAD, &ct, &t),
                Err(TuyaError::DecryptionFailed)
            );
        }
        for bit in 0..AAD.len() * 8 {
            let mut a = AAD.to_vec();
            flip(&mut a, bit);
            assert!(enc.decrypt(&KEY, &NONCE, &a, &ct, &tag).is_err());
        }
        for bit in 0..ct.len() * 8 {
            let mut c = ct.clone();
            flip(&mut c, bit);
            assert!(enc.decrypt(&KEY, &NONCE, AAD, &c, &tag).is_err());
        }
        for bit in 0..KEY_LEN * 8 {
            let mut k = KEY;
            flip(&mut k, bit);
            assert!(enc.decrypt(&k, &NONCE, AAD, &ct, &tag).is_err());
        }
    }

    #[test]
    fn nonces_are_fresh() {
        assert_ne!(random_nonce(), random_nonce());
        assert_eq!(random_hex_bytes(16).len(), 32);
    }

    #[test]
    fn local_key_derivation_requires_sixteen_bytes() {
        let kd = LocalKeyDerivation;
        assert_eq!(kd.derive("0123456789abcdef").unwrap(), KEY);
        assert!(matches!(kd.derive("short"), Err(TuyaError::InvalidKey(_))));
        assert!(kd.derive("").is_err());
    }

    #[test]
    fn key_from_hex_checks_length() {
        let key = key_from_hex("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(key[15], 0x0f);
        assert!(key_from_hex("0001").is_err());
        assert!(key_from_hex("zz").is_err());
    }

    #[test]
    fn ecb_decrypt_strips_padding() {
        use cipher::BlockEncryptMut;
        let mut encryptor = ecb::Encryptor::<Aes128>::new(&KEY.into());
        let mut data = b"{\"gwId\":\"x\"}".to_vec();
        let pad = 16 - data.len() % 16;
        data.extend(std::iter::repeat_n(pad as u8, pad));
        for chunk in data.chunks_mut(16) {
            encryptor.encrypt_block_mut(cipher::generic_array::GenericArray::from_mut_slice(chunk));
        }
        assert_eq!(ecb_decrypt(&KEY, &data).unwrap(), b"{\"gwId\":\"x\"}");
        assert!(ecb_decrypt(&KEY, &data[..15]).is_err());
    }
}
