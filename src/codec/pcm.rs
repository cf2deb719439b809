//! Signed 16-bit PCM conversions
//!
//! Chunks leave the engine as little-endian `i16` bytes, the same layout the
//! devices are driven with.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::BYTES_PER_SAMPLE;

/// Encode samples as little-endian bytes
pub fn samples_to_bytes(samples: &[i16]) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        out.put_i16_le(sample);
    }
    out.freeze()
}

/// Decode little-endian bytes into samples. A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert a normalized float sample to `i16`, saturating out-of-range input
pub fn f32_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32).round() as i16
}

/// Convert an `i16` sample to a normalized float
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Duration in milliseconds of `frames` frames at `sample_rate`
pub fn frames_to_millis(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames * 1000 / sample_rate as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_layout_is_little_endian() {
        let bytes = samples_to_bytes(&[0x0102, -1]);
        assert_eq!(&bytes[..], &[0x02, 0x01, 0xFF, 0xFF]);
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        assert_eq!(bytes_to_samples(&[0x10, 0x00, 0x7F]), vec![16]);
    }

    #[test]
    fn test_float_conversion_saturates() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert!((i16_to_f32(16384) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_frames_to_millis() {
        assert_eq!(frames_to_millis(44_100, 44_100), 1000);
        assert_eq!(frames_to_millis(4_000, 8_000), 500);
        assert_eq!(frames_to_millis(10, 0), 0);
    }
}
