//! Boundary-aware splitting of audio buffers into independently decodable chunks.
//!
//! The external transcription API rejects bare byte slices that start mid-frame, so each
//! emitted chunk must stand alone: WAV slices get a fresh RIFF header, MP3 chunks begin on
//! a frame sync. Formats without a boundary parser fall back to naive slicing with
//! `is_playable` cleared so callers can warn.

pub mod mp3;
pub mod wav;

use tracing::warn;

/// Container format, detected from the filename extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Mp4,
    Flac,
    Ogg,
    Other,
}

impl AudioFormat {
    pub fn from_filename(filename: &str) -> Self {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "wav" => Self::Wav,
            "mp3" => Self::Mp3,
            "mp4" | "m4a" => Self::Mp4,
            "flac" => Self::Flac,
            "ogg" => Self::Ogg,
            _ => Self::Other,
        }
    }

    /// Extension forwarded to the transcription API for chunks of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Mp4 => "mp4",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::Other => "bin",
        }
    }
}

/// One emitted chunk: the byte range it covers in the source buffer and the standalone
/// bytes to upload (which may carry a synthesized header, so `bytes.len()` can differ from
/// `end - start`).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub start: u64,
    pub end: u64,
    pub bytes: Vec<u8>,
    pub is_playable: bool,
}

/// Overlap carried between adjacent naive/WAV chunks, as a fraction of the chunk size.
const OVERLAP_DENOMINATOR: usize = 20; // ~5%

/// Split `buffer` into independently decodable chunks of at most roughly `chunk_size`
/// bytes. A buffer no larger than one chunk comes back whole.
pub fn chunk_buffer(buffer: &[u8], chunk_size: usize, filename: &str) -> Vec<AudioChunk> {
    let format = AudioFormat::from_filename(filename);

    if buffer.is_empty() {
        return Vec::new();
    }
    if buffer.len() <= chunk_size {
        return vec![AudioChunk {
            start: 0,
            end: buffer.len() as u64,
            bytes: buffer.to_vec(),
            is_playable: true,
        }];
    }

    match format {
        AudioFormat::Wav => wav::chunk_wav(buffer, chunk_size).unwrap_or_else(|| {
            warn!(filename, "wav header did not parse; falling back to naive chunking");
            naive_chunks(buffer, chunk_size, false)
        }),
        AudioFormat::Mp3 => mp3::chunk_mp3(buffer, chunk_size).unwrap_or_else(|| {
            warn!(filename, "no mp3 frame sync found; falling back to naive chunking");
            naive_chunks(buffer, chunk_size, false)
        }),
        AudioFormat::Mp4 | AudioFormat::Flac | AudioFormat::Ogg => {
            // Boundary detection for these containers is not implemented; the upstream
            // API may reject mid-stream slices.
            warn!(
                filename,
                format = ?format,
                "container has no boundary parser; chunks may not be independently decodable"
            );
            naive_chunks(buffer, chunk_size, false)
        }
        AudioFormat::Other => naive_chunks(buffer, chunk_size, false),
    }
}

/// Contiguous `chunk_size` slices with ~5% overlap and no playability guarantee.
pub fn naive_chunks(buffer: &[u8], chunk_size: usize, is_playable: bool) -> Vec<AudioChunk> {
    let overlap = chunk_size / OVERLAP_DENOMINATOR;
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut pos = 0usize;
    while pos < buffer.len() {
        let end = (pos + chunk_size).min(buffer.len());
        chunks.push(AudioChunk {
            start: pos as u64,
            end: end as u64,
            bytes: buffer[pos..end].to_vec(),
            is_playable,
        });
        if end == buffer.len() {
            break;
        }
        pos += step;
    }
    chunks
}

/// Fraction of zero bytes in the first `window` bytes of `buffer`. A mostly-zero head is
/// the usual signature of a truncated or corrupted upload.
pub fn zero_density(buffer: &[u8], window: usize) -> f64 {
    let head = &buffer[..buffer.len().min(window)];
    if head.is_empty() {
        return 0.0;
    }
    let zeros = head.iter().filter(|&&b| b == 0).count();
    zeros as f64 / head.len() as f64
}
