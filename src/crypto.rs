//! Broadlink protocol encryption and decryption logic.
//! AES-128-CBC with a fixed per-device IV and no padding.

use crate::error::{BroadlinkError, Result};
use aes::Aes128;
use cbc::{Decryptor, Encryptor};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

/// DeviceCipher provides AES-128-CBC encryption and decryption for one device.
///
/// The IV is fixed for the lifetime of the cipher. That is a property of the
/// wire protocol: every packet for a device reuses the same IV, and freshness
/// comes from the per-session device key and the rolling packet counter.
#[derive(Clone, Debug)]
pub struct DeviceCipher {
    /// 16-byte encryption key
    key: [u8; 16],
    /// 16-byte initialization vector
    iv: [u8; 16],
}

impl DeviceCipher {
    /// Create a new DeviceCipher with a 16-byte key and a 16-byte IV.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if key.len() != 16 || iv.len() != 16 {
            return Err(BroadlinkError::InvalidKeyLength);
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        let mut v = [0u8; 16];
        v.copy_from_slice(iv);
        Ok(Self { key: k, iv: v })
    }

    /// Encrypt data. The input length must be a multiple of 16 bytes;
    /// callers pre-pad their payloads, no padding is applied here.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !data.len().is_multiple_of(16) {
            return Err(BroadlinkError::EncryptionFailed);
        }
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into(), &self.iv.into());
        let mut ciphertext = data.to_vec();
        for chunk in ciphertext.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }
        Ok(ciphertext)
    }

    /// Decrypt data. The input length must be a multiple of 16 bytes.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(16) {
            return Err(BroadlinkError::DecryptionFailed);
        }
        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into(), &self.iv.into());
        let mut plaintext = data.to_vec();
        for chunk in plaintext.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }
        Ok(plaintext)
    }
}
