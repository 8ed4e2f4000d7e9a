//! Tuya protocol encryption and decryption logic.
//! AES-128-ECB with PKCS7 padding, as used by protocol versions 3.1 and 3.3.

use crate::error::{Result, TuyaError};
use aes::Aes128;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use ecb::{Decryptor, Encryptor};

const BLOCK_SIZE: usize = 16;

/// TuyaCipher provides AES-128-ECB encryption and decryption with the device's local key.
pub struct TuyaCipher {
    /// 16-byte encryption key
    key: [u8; 16],
}

impl TuyaCipher {
    /// Create a new TuyaCipher from a 16-byte local key.
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Encrypt data.
    /// * `use_base64`: If true, encode the result in Base64.
    ///
    /// Input is always PKCS7 padded to a 16-byte boundary before encryption.
    pub fn encrypt(&self, data: &[u8], use_base64: bool) -> Result<Vec<u8>> {
        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into());

        // Manual PKCS7 padding
        let padding_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
        let mut ciphertext = data.to_vec();
        for _ in 0..padding_len {
            ciphertext.push(padding_len as u8);
        }

        for chunk in ciphertext.chunks_mut(BLOCK_SIZE) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }

        if use_base64 {
            use base64::{Engine as _, engine::general_purpose};
            let b64_str = general_purpose::STANDARD.encode(&ciphertext);
            Ok(b64_str.into_bytes())
        } else {
            Ok(ciphertext)
        }
    }

    /// Decrypt data.
    /// * `use_base64`: If true, the input data is expected to be Base64 encoded.
    pub fn decrypt(&self, data: &[u8], use_base64: bool) -> Result<Vec<u8>> {
        let input_data = if use_base64 {
            use base64::{Engine as _, engine::general_purpose};
            general_purpose::STANDARD
                .decode(data)
                .map_err(|_| TuyaError::DecryptionFailed)?
        } else {
            data.to_vec()
        };

        if input_data.is_empty() || input_data.len() % BLOCK_SIZE != 0 {
            return Err(TuyaError::DecryptionFailed);
        }

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into());
        let mut plaintext = input_data;
        for chunk in plaintext.chunks_mut(BLOCK_SIZE) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        // Manual PKCS7 unpadding
        let pad_len = plaintext[plaintext.len() - 1] as usize;
        if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > plaintext.len() {
            return Err(TuyaError::DecryptionFailed);
        }
        for i in 0..pad_len {
            if plaintext[plaintext.len() - 1 - i] != pad_len as u8 {
                return Err(TuyaError::DecryptionFailed);
            }
        }
        plaintext.truncate(plaintext.len() - pad_len);
        Ok(plaintext)
    }
}
