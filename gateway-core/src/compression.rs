//! Artifact compression codec (§4.5, §9): a small tagged variant whose
//! extension names are part of the on-disk contract and must not change.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    Snappy,
    Lz4,
    None,
}

impl Codec {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "snappy" => Ok(Codec::Snappy),
            "lz4" => Ok(Codec::Lz4),
            "none" => Ok(Codec::None),
            other => Err(Error::Config(format!("unknown compression codec {other:?}"))),
        }
    }

    /// File extension for an artifact written with this codec (§6 on-disk layout).
    pub fn extension(self) -> &'static str {
        match self {
            Codec::Snappy => "snappy",
            Codec::Lz4 => "lz4",
            Codec::None => "html",
        }
    }

    /// Recover the codec an artifact was written with from its extension.
    /// Legacy `.html` artifacts predate compression support and must remain
    /// readable without migration.
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "snappy" => Codec::Snappy,
            "lz4" => Codec::Lz4,
            _ => Codec::None,
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Snappy => {
                let mut encoder = snap::raw::Encoder::new();
                encoder
                    .compress_vec(data)
                    .map_err(|e| Error::Internal(format!("snappy compress: {e}")))
            }
            Codec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Codec::None => Ok(data.to_vec()),
        }
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Snappy => {
                let mut decoder = snap::raw::Decoder::new();
                decoder
                    .decompress_vec(data)
                    .map_err(|e| Error::Internal(format!("snappy decompress: {e}")))
            }
            Codec::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::Internal(format!("lz4 decompress: {e}"))),
            Codec::None => Ok(data.to_vec()),
        }
    }
}

/// Compress `body` with `codec` unless it is below the configured
/// threshold, in which case it is stored uncompressed regardless of the
/// configured codec (§4.5).
pub fn compress_if_above_threshold(
    body: &[u8],
    codec: Codec,
    threshold_bytes: usize,
) -> Result<(Codec, Vec<u8>)> {
    if body.len() < threshold_bytes {
        return Ok((Codec::None, body.to_vec()));
    }
    let compressed = codec.compress(body)?;
    Ok((codec, compressed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snappy_round_trip() {
        let data = b"hello world, this is a test payload that repeats repeats repeats";
        let compressed = Codec::Snappy.compress(data).unwrap();
        let restored = Codec::Snappy.decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn lz4_round_trip() {
        let data = b"hello world, this is a test payload that repeats repeats repeats";
        let compressed = Codec::Lz4.compress(data).unwrap();
        let restored = Codec::Lz4.decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn none_is_passthrough() {
        let data = b"abc";
        let compressed = Codec::None.compress(data).unwrap();
        assert_eq!(compressed, data.to_vec());
    }

    #[test]
    fn extensions_match_contract() {
        assert_eq!(Codec::Snappy.extension(), "snappy");
        assert_eq!(Codec::Lz4.extension(), "lz4");
        assert_eq!(Codec::None.extension(), "html");
    }

    #[test]
    fn legacy_html_extension_maps_to_none() {
        assert_eq!(Codec::from_extension("html"), Codec::None);
    }

    #[test]
    fn below_threshold_stays_uncompressed() {
        let (codec, bytes) = compress_if_above_threshold(b"tiny", Codec::Snappy, 1024).unwrap();
        assert_eq!(codec, Codec::None);
        assert_eq!(bytes, b"tiny".to_vec());
    }

    #[test]
    fn at_or_above_threshold_compresses() {
        let body = vec![b'x'; 2048];
        let (codec, bytes) = compress_if_above_threshold(&body, Codec::Snappy, 1024).unwrap();
        assert_eq!(codec, Codec::Snappy);
        assert!(bytes.len() < body.len());
    }

    #[test]
    fn unknown_codec_name_is_config_error() {
        assert!(Codec::parse("zstd").is_err());
    }
}
