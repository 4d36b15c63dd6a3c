use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};

use super::FetchError;
use super::transport::ChunkHash;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Builds the counter block for a chunk: the first 12 bytes of the
/// redirect IV followed by the big-endian block index of `offset`.
pub fn mirror_iv(base_iv: &[u8], offset: u64) -> Result<[u8; 16], FetchError> {
    if base_iv.len() != 16 {
        return Err(FetchError::Unavailable(format!(
            "mirror iv must be 16 bytes, got {}",
            base_iv.len()
        )));
    }
    let block = u32::try_from(offset / 16).map_err(|_| {
        FetchError::Unavailable(format!("offset {offset} is beyond the mirror counter range"))
    })?;

    let mut iv = [0u8; 16];
    iv[..12].copy_from_slice(&base_iv[..12]);
    iv[12..].copy_from_slice(&block.to_be_bytes());
    Ok(iv)
}

pub fn decrypt_chunk(
    data: &mut [u8],
    key: &[u8],
    base_iv: &[u8],
    offset: u64,
) -> Result<(), FetchError> {
    let iv = mirror_iv(base_iv, offset)?;
    let mut cipher = Aes256Ctr::new_from_slices(key, &iv).map_err(|_| {
        FetchError::Unavailable(format!("mirror key must be 32 bytes, got {}", key.len()))
    })?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Checks every hash segment the origin supplied for the chunk at `offset`.
pub fn verify_chunk(data: &[u8], offset: u64, hashes: &[ChunkHash]) -> Result<(), FetchError> {
    for hash in hashes {
        let Some(segment) = segment(data, offset, hash) else {
            return Err(FetchError::IntegrityMismatch { offset });
        };
        if Sha256::digest(segment).as_slice() != hash.hash.as_slice() {
            return Err(FetchError::IntegrityMismatch { offset });
        }
    }
    Ok(())
}

fn segment<'a>(data: &'a [u8], offset: u64, hash: &ChunkHash) -> Option<&'a [u8]> {
    let start = usize::try_from(hash.offset.checked_sub(offset)?).ok()?;
    if start >= data.len() {
        return None;
    }
    let limit = usize::try_from(hash.limit).ok()?;
    let end = start.saturating_add(limit).min(data.len());
    Some(&data[start..end])
}
