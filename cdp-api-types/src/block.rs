use std::fmt;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// A 32-byte SHA-256 digest identifying a block.
///
/// Equality is byte-wise. On the wire it travels as base64; on disk it is
/// the lowercase hex filename of the block file.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(openssl::sha::sha256(data))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let raw = hex::decode(s)?;
        if raw.len() != 32 {
            bail!("hash {s:?} has wrong length {}", raw.len());
        }
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&raw);
        Ok(Self(buf))
    }

    pub fn to_base64(self) -> String {
        base64::encode(self.0)
    }

    pub fn from_base64(s: &str) -> Result<Self, Error> {
        let raw = base64::decode(s)?;
        if raw.len() != 32 {
            bail!("base64 hash {s:?} has wrong length {}", raw.len());
        }
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&raw);
        Ok(Self(buf))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for BlockHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BlockHash::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// How a block's payload is encoded on disk and on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionTag {
    None,
    Deflate,
}

impl Default for CompressionTag {
    fn default() -> Self {
        CompressionTag::None
    }
}

/// A single content-addressed block as produced by the chunker.
///
/// `length` is always the *uncompressed* size; `data` may be the deflated
/// payload when `cmptype == Deflate`.
#[derive(Clone, Debug)]
pub struct Block {
    pub hash: BlockHash,
    pub data: Vec<u8>,
    pub length: u32,
    pub cmptype: CompressionTag,
}

impl Block {
    pub fn new_uncompressed(data: Vec<u8>) -> Self {
        let hash = BlockHash::from_bytes(&data);
        let length = data.len() as u32;
        Self {
            hash,
            data,
            length,
            cmptype: CompressionTag::None,
        }
    }
}

/// The `{hash, data, size, cmptype, uncmpsize}` JSON shape used by
/// `/Data.json`, `/Data_Array.json` and the `/Data/<hash>.json` response.
#[derive(Serialize, Deserialize)]
pub struct WireBlock {
    pub hash: String,
    /// base64-encoded payload bytes
    pub data: String,
    pub size: u32,
    pub cmptype: CompressionTag,
    pub uncmpsize: u32,
}

impl WireBlock {
    pub fn from_block(block: &Block) -> Self {
        Self {
            hash: block.hash.to_base64(),
            data: base64::encode(&block.data),
            size: block.data.len() as u32,
            cmptype: block.cmptype,
            uncmpsize: block.length,
        }
    }

    pub fn into_block(self) -> Result<Block, Error> {
        let hash = BlockHash::from_base64(&self.hash)?;
        let data = base64::decode(&self.data)?;
        Ok(Block {
            hash,
            data,
            length: self.uncmpsize,
            cmptype: self.cmptype,
        })
    }
}
