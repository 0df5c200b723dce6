//! Binary media helpers: base64, data URIs and WAV synthesis.

use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;

/// Default sample rate for raw PCM returned by speech models
pub const DEFAULT_PCM_SAMPLE_RATE: u32 = 24_000;

const WAV_HEADER_LEN: usize = 44;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Invalid data URL: {0}")]
    InvalidDataUrl(String),

    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, MediaError> {
    Ok(general_purpose::STANDARD.decode(data.trim())?)
}

/// Parsed `data:` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime_type: String,
    /// Base64 payload, undecoded
    pub data: String,
}

impl DataUrl {
    pub fn decode(&self) -> Result<Vec<u8>, MediaError> {
        decode_base64(&self.data)
    }
}

pub fn is_data_url(url: &str) -> bool {
    url.starts_with("data:")
}

/// Split a base64 `data:` URI into its MIME type and payload
pub fn parse_data_url(url: &str) -> Result<DataUrl, MediaError> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| MediaError::InvalidDataUrl("missing data: prefix".to_string()))?;
    let (meta, data) = rest
        .split_once(',')
        .ok_or_else(|| MediaError::InvalidDataUrl("missing ',' separator".to_string()))?;
    let mime_type = meta
        .strip_suffix(";base64")
        .ok_or_else(|| MediaError::InvalidDataUrl("only base64 payloads are supported".to_string()))?;

    let mime_type = if mime_type.is_empty() {
        "application/octet-stream"
    } else {
        mime_type
    };

    Ok(DataUrl {
        mime_type: mime_type.to_string(),
        data: data.to_string(),
    })
}

pub fn to_data_url(mime_type: &str, base64_data: &str) -> String {
    format!("data:{};base64,{}", mime_type, base64_data)
}

/// Wrap raw 16-bit mono PCM in a RIFF/WAVE container
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let channels: u16 = 1;
    let bits_per_sample: u16 = 16;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * block_align as u32;
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Sample rate from a MIME string such as `audio/L16;codec=pcm;rate=24000`
pub fn pcm_sample_rate(mime_type: &str) -> u32 {
    mime_type
        .split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
        .unwrap_or(DEFAULT_PCM_SAMPLE_RATE)
}

pub fn is_pcm_mime(mime_type: &str) -> bool {
    let lower = mime_type.to_ascii_lowercase();
    lower.starts_with("audio/l16") || lower.starts_with("audio/pcm") || lower.contains("codec=pcm")
}

/// Guess an audio MIME type from magic bytes, defaulting to WAV
pub fn sniff_audio_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"RIFF") {
        "audio/wav"
    } else if bytes.starts_with(b"ID3") || (bytes.len() > 1 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0) {
        "audio/mpeg"
    } else if bytes.starts_with(b"OggS") {
        "audio/ogg"
    } else if bytes.starts_with(b"fLaC") {
        "audio/flac"
    } else {
        "audio/wav"
    }
}

/// Guess an image MIME type from magic bytes, defaulting to PNG
pub fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/png"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
    }

    #[test]
    fn test_parse_data_url() {
        let parsed = parse_data_url("data:image/png;base64,iVBORw0K").unwrap();
        assert_eq!(parsed.mime_type, "image/png");
        assert_eq!(parsed.data, "iVBORw0K");
        assert_eq!(to_data_url(&parsed.mime_type, &parsed.data), "data:image/png;base64,iVBORw0K");
    }

    #[test]
    fn test_parse_data_url_rejects_non_base64() {
        assert!(parse_data_url("data:text/plain,hello").is_err());
        assert!(parse_data_url("https://example.com/a.png").is_err());
        assert!(parse_data_url("data:image/png;base64").is_err());
    }

    #[test]
    fn test_base64_roundtrip_and_invalid() {
        assert_eq!(decode_base64(&encode_base64(b"hello")).unwrap(), b"hello");
        assert!(decode_base64("not base64!!").is_err());
    }

    #[test]
    fn test_wav_header_fields() {
        let wav = pcm_to_wav(&[0u8; 10], 16_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(read_u32(&wav, 24), 16_000);
        assert_eq!(read_u32(&wav, 28), 32_000);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(wav.len(), 54);
    }

    #[test]
    fn test_pcm_sample_rate() {
        assert_eq!(pcm_sample_rate("audio/L16;codec=pcm;rate=16000"), 16_000);
        assert_eq!(pcm_sample_rate("audio/L16"), DEFAULT_PCM_SAMPLE_RATE);
        assert_eq!(pcm_sample_rate("audio/L16; rate=abc"), DEFAULT_PCM_SAMPLE_RATE);
        assert!(is_pcm_mime("audio/L16;codec=pcm;rate=24000"));
        assert!(!is_pcm_mime("audio/mpeg"));
    }

    #[test]
    fn test_sniffing() {
        assert_eq!(sniff_audio_mime(b"RIFF....WAVE"), "audio/wav");
        assert_eq!(sniff_audio_mime(b"ID3\x04"), "audio/mpeg");
        assert_eq!(sniff_audio_mime(b"OggS"), "audio/ogg");
        assert_eq!(sniff_audio_mime(b""), "audio/wav");
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_image_mime(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_image_mime(b"???"), "image/png");
    }

    proptest! {
        #[test]
        fn prop_wav_sizes(pcm in proptest::collection::vec(any::<u8>(), 0..2048), rate in 8_000u32..96_000) {
            let wav = pcm_to_wav(&pcm, rate);
            prop_assert_eq!(wav.len(), WAV_HEADER_LEN + pcm.len());
            prop_assert_eq!(read_u32(&wav, 4), 36 + pcm.len() as u32);
            prop_assert_eq!(read_u32(&wav, 40), pcm.len() as u32);
            prop_assert_eq!(&wav[WAV_HEADER_LEN..], &pcm[..]);
        }
    }
}
