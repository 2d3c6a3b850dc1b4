//! The three primitives the identifier pipeline is built from. All of them
//! are pure; callers own every buffer.

use crate::error::ExposureError;
use aes::cipher::generic_array::GenericArray;
use aes::{Aes128, BlockCipher, NewBlockCipher};
use aes_ctr::cipher::stream::{NewStreamCipher, SyncStreamCipher};
use aes_ctr::Aes128Ctr;
use ring::hkdf::{Salt, HKDF_SHA256};

pub const KEY_LEN: usize = 16;
pub const AES_BLOCK_LEN: usize = 16;

struct OkmLen(usize);

impl ring::hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// An absent salt means the all-zero salt of hash length.
const ZERO_SALT: [u8; 32] = [0u8; 32];

/// RFC 5869 HKDF with SHA-256. The protocol only ever derives 16-byte keys;
/// any other `okm` length is rejected.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    okm: &mut [u8],
) -> Result<(), ExposureError> {
    if okm.len() != KEY_LEN {
        return Err(ExposureError::UnsupportedLength(okm.len()));
    }
    Salt::new(HKDF_SHA256, salt.unwrap_or(&ZERO_SALT))
        .extract(ikm)
        .expand(&[info], OkmLen(okm.len()))
        .map_err(|_| ExposureError::Crypto("HKDF expand"))?
        .fill(okm)
        .map_err(|_| ExposureError::Crypto("HKDF fill"))?;
    Ok(())
}

/// Bulk AES-128-ECB over `data` in place. `data` must be a whole number of
/// blocks; there is no padding. Each plaintext block in this protocol is
/// unique (distinct interval numbers), so ECB's repeating-plaintext weakness
/// does not apply.
pub fn aes128_ecb_encrypt(key: &[u8; KEY_LEN], data: &mut [u8]) -> Result<(), ExposureError> {
    if data.len() % AES_BLOCK_LEN != 0 {
        return Err(ExposureError::InvalidArgument(
            "ECB input is not block aligned",
        ));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(AES_BLOCK_LEN) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// AES-128-CTR keystream application in place; encrypt and decrypt are the
/// same call. The protocol uses this for the 4-byte metadata only, with the
/// RPI as IV.
pub fn aes128_ctr_apply(key: &[u8; KEY_LEN], iv: &[u8; AES_BLOCK_LEN], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(iv),
    );
    cipher.apply_keystream(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    #[test]
    fn test_hkdf_rfc5869_case_1_prefix() {
        // RFC 5869 A.1, truncated to the 16-byte output the protocol uses.
        let ikm = [0x0bu8; 22];
        let salt = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c,
        ];
        let info = [0xf0, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9];
        let mut okm = [0u8; 16];
        hkdf_sha256(&ikm, Some(&salt), &info, &mut okm).unwrap();
        let expected = [
            0x3c, 0xb2, 0x5f, 0x25, 0xfa, 0xac, 0xd5, 0x7a, 0x90, 0x43, 0x4f, 0x64, 0xd0, 0x36,
            0x2f, 0x2a,
        ];
        assert_eq!(okm, expected);
    }

    #[test]
    fn test_hkdf_absent_salt_equals_zero_salt() {
        // HMAC zero-pads short keys, so the empty salt and the 32-byte
        // zero salt extract the same PRK.
        let ikm = [0x42u8; 16];
        let mut absent = [0u8; 16];
        let mut empty = [0u8; 16];
        let mut zeroed = [0u8; 16];
        hkdf_sha256(&ikm, None, b"EN-RPIK", &mut absent).unwrap();
        hkdf_sha256(&ikm, Some(&[]), b"EN-RPIK", &mut empty).unwrap();
        hkdf_sha256(&ikm, Some(&[0u8; 32]), b"EN-RPIK", &mut zeroed).unwrap();
        assert_eq!(absent, empty);
        assert_eq!(absent, zeroed);
    }

    #[test]
    fn test_hkdf_rejects_other_lengths() {
        let ikm = [0x42u8; 16];
        let mut okm = [0u8; 32];
        match hkdf_sha256(&ikm, None, b"EN-RPIK", &mut okm) {
            Err(ExposureError::UnsupportedLength(32)) => {}
            other => panic!("expected UnsupportedLength, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_hkdf_info_separates_keys() {
        let ikm = [0x42u8; 16];
        let mut rpik = [0u8; 16];
        let mut aemk = [0u8; 16];
        hkdf_sha256(&ikm, None, b"EN-RPIK", &mut rpik).unwrap();
        hkdf_sha256(&ikm, None, b"EN-AEMK", &mut aemk).unwrap();
        assert_ne!(rpik, aemk);
    }

    #[test]
    fn test_ecb_bulk_matches_per_block() {
        let key = [0x13u8; 16];
        let mut bulk = [0u8; 64];
        for (i, byte) in bulk.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let blocks: Vec<[u8; 16]> = bulk
            .chunks_exact(16)
            .map(|block| {
                let mut single: [u8; 16] = block.try_into().unwrap();
                aes128_ecb_encrypt(&key, &mut single).unwrap();
                single
            })
            .collect();
        aes128_ecb_encrypt(&key, &mut bulk).unwrap();
        for (i, block) in bulk.chunks_exact(16).enumerate() {
            assert_eq!(block, blocks[i]);
        }
    }

    #[test]
    fn test_ecb_rejects_partial_blocks() {
        let key = [0u8; 16];
        let mut data = [0u8; 17];
        assert!(aes128_ecb_encrypt(&key, &mut data).is_err());
    }

    #[test]
    fn test_ctr_is_an_involution() {
        let key = [0x07u8; 16];
        let iv = [0x99u8; 16];
        let mut data = [0x40, 0x08, 0x00, 0x00];
        let original = data;
        aes128_ctr_apply(&key, &iv, &mut data);
        assert_ne!(data, original);
        aes128_ctr_apply(&key, &iv, &mut data);
        assert_eq!(data, original);
    }
}
