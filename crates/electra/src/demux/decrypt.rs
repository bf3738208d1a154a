use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};

use crate::error::DemuxError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Whole-segment decryption, applied before parsing.
pub trait SegmentDecrypter: Send + Sync {
    fn decrypt(&self, data: Bytes) -> Result<Bytes, DemuxError>;
}

/// AES-128-CBC with PKCS#7 padding, as used for HLS `METHOD=AES-128`.
#[derive(Clone)]
pub struct Aes128CbcDecrypter {
    key: [u8; 16],
    iv: [u8; 16],
}

impl Aes128CbcDecrypter {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// IV derived from a media sequence number, big-endian in the low bytes.
    pub fn with_sequence_iv(key: [u8; 16], media_sequence: u64) -> Self {
        let mut iv = [0u8; 16];
        iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
        Self::new(key, iv)
    }
}

impl std::fmt::Debug for Aes128CbcDecrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes128CbcDecrypter").finish_non_exhaustive()
    }
}

impl SegmentDecrypter for Aes128CbcDecrypter {
    fn decrypt(&self, data: Bytes) -> Result<Bytes, DemuxError> {
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(DemuxError::decryption(format!(
                "ciphertext length {} is not a positive multiple of the block size",
                data.len()
            )));
        }
        let mut buffer = data.to_vec();
        let cipher = Aes128CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| DemuxError::decryption(format!("failed to initialize AES decryptor: {e}")))?;
        let len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| DemuxError::decryption(format!("bad padding: {e}")))?
            .len();
        buffer.truncate(len);
        Ok(Bytes::from(buffer))
    }
}
