// Wire layout of an authenticated CBC ciphertext: MAC || IV || blocks.
//
// The MAC is opaque to the engine; it is parsed once and forwarded verbatim
// in every forged query. Forged queries always preserve the original total
// wire length: the oracle under attack checks length before anything else,
// and a length failure tells us nothing about padding.
use crate::block::{split_blocks, Block, BLOCK_SIZE};
use crate::error::ExtractionError;

pub const MAC_SIZE: usize = 32;

#[derive(Debug, Clone)]
pub struct CipherBundle {
    mac: Vec<u8>,
    iv: Block,
    blocks: Vec<Block>,
}

impl CipherBundle {
    /// Parse `mac || iv || blocks` with the default 32-byte MAC field.
    pub fn parse(raw: &[u8]) -> Result<Self, ExtractionError> {
        Self::parse_with_mac_len(raw, MAC_SIZE)
    }

    pub fn parse_with_mac_len(raw: &[u8], mac_len: usize) -> Result<Self, ExtractionError> {
        if raw.len() < mac_len + 2 * BLOCK_SIZE {
            return Err(ExtractionError::MalformedInput(format!(
                "ciphertext is {} bytes; need at least {} (mac + iv + one block)",
                raw.len(),
                mac_len + 2 * BLOCK_SIZE
            )));
        }
        let mac = raw[..mac_len].to_vec();
        let iv = Block::from_slice(&raw[mac_len..mac_len + BLOCK_SIZE])?;
        let blocks = split_blocks(&raw[mac_len + BLOCK_SIZE..])?;
        Ok(Self { mac, iv, blocks })
    }

    pub fn mac(&self) -> &[u8] {
        &self.mac
    }

    pub fn iv(&self) -> &Block {
        &self.iv
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn wire_len(&self) -> usize {
        self.mac.len() + (1 + self.blocks.len()) * BLOCK_SIZE
    }

    /// The ciphertext block (or IV) that gets XORed into the decryption of
    /// block `idx`. This is the only cross-block dependency of the attack.
    pub fn predecessor(&self, idx: usize) -> &Block {
        if idx == 0 {
            &self.iv
        } else {
            &self.blocks[idx - 1]
        }
    }

    /// Assemble a forged query targeting one block.
    ///
    /// The forged predecessor and the target block are placed at the tail of
    /// the block chain so the oracle's PKCS#7 check runs against the target's
    /// decryption; the head of the original chain fills the remaining slots.
    /// The result is always exactly `wire_len()` bytes.
    pub fn forge_query(&self, forged_prev: &Block, target: &Block) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.mac);
        let filler = (1 + self.blocks.len()) - 2;
        for block in std::iter::once(&self.iv).chain(self.blocks.iter()).take(filler) {
            out.extend_from_slice(block.as_bytes());
        }
        out.extend_from_slice(forged_prev.as_bytes());
        out.extend_from_slice(target.as_bytes());
        debug_assert_eq!(out.len(), self.wire_len());
        out
    }
}
