// Fixed-size cipher block model: XOR algebra over 16-byte blocks and PKCS#7
// pad/unpad. Blocks are immutable once produced; forgeries are built from a
// copied byte array and wrapped back up.
use crate::error::ExtractionError;

use thiserror::Error;

pub const BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block([u8; BLOCK_SIZE]);

impl Block {
    pub fn new(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ExtractionError> {
        let arr: [u8; BLOCK_SIZE] = bytes.try_into().map_err(|_| {
            ExtractionError::MalformedInput(format!(
                "block must be exactly {BLOCK_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn zero() -> Self {
        Self([0u8; BLOCK_SIZE])
    }

    pub fn xor(&self, other: &Block) -> Block {
        let mut out = [0u8; BLOCK_SIZE];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        Block(out)
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    pub fn to_array(self) -> [u8; BLOCK_SIZE] {
        self.0
    }
}

/// Split a byte string into blocks. The input must be a non-empty multiple
/// of the block size; anything else is malformed at this layer.
pub fn split_blocks(bytes: &[u8]) -> Result<Vec<Block>, ExtractionError> {
    if bytes.is_empty() || bytes.len() % BLOCK_SIZE != 0 {
        return Err(ExtractionError::MalformedInput(format!(
            "ciphertext length {} is not a non-zero multiple of {BLOCK_SIZE}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks(BLOCK_SIZE)
        .map(|chunk| Block(chunk.try_into().expect("chunks are block sized")))
        .collect())
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid pkcs7 padding")]
pub struct PaddingError;

pub fn pkcs7_pad(bytes: &[u8], block_size: u8) -> Vec<u8> {
    let n_pad = if bytes.len() % block_size as usize == 0 {
        block_size
    } else {
        block_size - (bytes.len() % block_size as usize) as u8
    };
    let mut out = Vec::with_capacity(bytes.len() + n_pad as usize);
    out.extend_from_slice(bytes);
    (0..n_pad).for_each(|_| out.push(n_pad));
    out
}

pub fn pkcs7_unpad(bytes: &mut Vec<u8>) -> Result<(), PaddingError> {
    if let Some(n_pad) = is_pkcs7_padded(bytes) {
        bytes.truncate(bytes.len() - n_pad as usize);
        return Ok(());
    }
    Err(PaddingError)
}

fn is_pkcs7_padded(bytes: &[u8]) -> Option<u8> {
    if let Some(n_pad) = bytes.last() {
        if *n_pad == 0 || *n_pad as usize > bytes.len() {
            return None;
        }
        let padded = &bytes[(bytes.len() - *n_pad as usize)..];
        if padded.iter().all(|el| el == n_pad) {
            return Some(*n_pad);
        }
    }
    None
}
