//! PCM sample conversions shared by the capture and playback paths.
//!
//! The wire format on both directions is 16-bit little-endian mono PCM;
//! capture runs at 16 kHz and playback at 24 kHz.

/// Convert i16 samples to little-endian bytes for transmission.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM bytes into i16 samples.
///
/// Returns `None` for an empty or odd-length payload; callers drop such
/// chunks rather than aborting the call.
pub fn bytes_to_samples(bytes: &[u8]) -> Option<Vec<i16>> {
    if bytes.is_empty() || bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    )
}
