//! AES-128 helpers for the band authentication handshake.

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// 16 byte key used for a single authentication attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Fresh key from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a pre-shared key given as exactly 32 hex characters.
    pub fn from_hex(key: &str) -> Result<Self, CryptoError> {
        let key = key.trim();
        if key.len() != KEY_LEN * 2 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CryptoError::InvalidKey(
                "expected 32 hexadecimal characters".to_string(),
            ));
        }

        let bytes = hex::decode(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for SessionKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// AES-128 in ECB mode without padding. ECB has no IV, which is the same as
/// running CBC with an all-zero IV over a single block.
pub fn encrypt_ecb(key: &SessionKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.is_empty() || data.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::InvalidLength(data.len()));
    }

    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut out = data.to_vec();
    for block in out.chunks_exact_mut(BLOCK_LEN) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }

    Ok(out)
}
