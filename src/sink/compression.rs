//! 容器负载压缩（LZ4 / None）

use crate::common::{Result, SystError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    None,
    #[default]
    Lz4,
}

impl Codec {
    pub fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4  => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            t => Err(SystError::Compression(format!("unknown codec tag {t}"))),
        }
    }
}

pub fn compress(data: &[u8], codec: Codec) -> Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(data.to_vec()),
        Codec::Lz4  =>
            lz4::block::compress(data, None, false)
                .map_err(|e| SystError::Compression(e.to_string())),
    }
}

pub fn decompress(data: &[u8], codec: Codec, uncompressed_len: usize) -> Result<Vec<u8>> {
    let raw = match codec {
        Codec::None => data.to_vec(),
        Codec::Lz4  => {
            let len = i32::try_from(uncompressed_len)
                .map_err(|_| SystError::Compression(format!("length {uncompressed_len} too large")))?;
            lz4::block::decompress(data, Some(len))
                .map_err(|e| SystError::Compression(e.to_string()))?
        }
    };
    if raw.len() != uncompressed_len {
        return Err(SystError::Compression(format!(
            "expected {uncompressed_len} bytes, got {}", raw.len())));
    }
    Ok(raw)
}
