//! Caller-facing PCM frames and encoded packets.

use anyhow::{Result, bail};

use crate::utils::errors::{ConfigError, LayoutError};

/// Interleaved integer PCM description: 16, 24 or 32 bits per sample,
/// little- or big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    pub bits_per_sample: u8,
    pub little_endian: bool,
}

impl SampleSpec {
    pub fn new(bits_per_sample: u8, little_endian: bool) -> Result<Self> {
        if !matches!(bits_per_sample, 16 | 24 | 32) {
            bail!(ConfigError::InvalidBitDepth(bits_per_sample));
        }

        Ok(Self {
            bits_per_sample,
            little_endian,
        })
    }

    pub fn bytes_per_sample(self) -> usize {
        self.bits_per_sample as usize / 8
    }

    fn decode_one(self, bytes: &[u8]) -> f32 {
        let v = match (self.bits_per_sample, self.little_endian) {
            (16, true) => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
            (16, false) => i16::from_be_bytes([bytes[0], bytes[1]]) as i32,
            (24, true) => i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8,
            (24, false) => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], 0]) >> 8,
            (32, true) => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (32, false) => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            _ => unreachable!("bit depth validated at construction"),
        };

        let full_scale = 1u32 << (self.bits_per_sample - 1);
        v as f32 / full_scale as f32
    }

    /// Deinterleaves `frame_size` samples of `channels` channels into
    /// planar normalized floats.
    pub fn deinterleave(
        self,
        pcm: &[u8],
        channels: usize,
        frame_size: usize,
    ) -> Result<Vec<Vec<f32>>> {
        let stride = self.bytes_per_sample();
        let need = frame_size * channels * stride;
        if pcm.len() < need {
            bail!(LayoutError::PcmLengthMismatch {
                got: pcm.len(),
                channels,
                frame_size
            });
        }

        let mut out = vec![vec![0.0f32; frame_size]; channels];
        for (i, sample) in pcm[..need].chunks_exact(stride).enumerate() {
            out[i % channels][i / channels] = self.decode_one(sample);
        }

        Ok(out)
    }
}

/// Converts normalized float channels to interleaved i16 for the codec
/// backends, saturating at full scale.
pub fn interleave_i16(channels: &[&[f32]], frame_size: usize) -> Vec<i16> {
    let mut out = vec![0i16; frame_size * channels.len()];

    for (ci, ch) in channels.iter().enumerate() {
        for (si, &sample) in ch.iter().take(frame_size).enumerate() {
            let v = (sample * 32768.0).round().clamp(-32768.0, 32767.0);
            out[si * channels.len() + ci] = v as i16;
        }
    }

    out
}

/// Converts decoded interleaved i16 back to planar floats.
pub fn deinterleave_i16(pcm: &[i16], channels: usize, frame_size: usize) -> Vec<Vec<f32>> {
    let mut out = vec![vec![0.0f32; frame_size]; channels];

    for (i, &sample) in pcm.iter().take(frame_size * channels).enumerate() {
        out[i % channels][i / channels] = sample as f32 / 32768.0;
    }

    out
}

/// One frame of input PCM for one audio element.
///
/// Caller-declared trim counts are added to whatever the codec's own
/// pre-roll and tail padding require.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub element_id: u32,
    pub pcm: &'a [u8],
    pub frame_size: usize,
    pub num_samples_to_trim_at_start: u32,
    pub num_samples_to_trim_at_end: u32,
}

impl Default for Frame<'_> {
    fn default() -> Self {
        Self {
            element_id: 0,
            pcm: &[],
            frame_size: 0,
            num_samples_to_trim_at_start: 0,
            num_samples_to_trim_at_end: 0,
        }
    }
}

/// One encoded packet: the OBUs of a temporal unit.
///
/// Empty until every element of the unit has supplied its frame.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub data: Vec<u8>,
    pub samples: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn deinterleave_16le() -> Result<()> {
        let spec = SampleSpec::new(16, true)?;
        // two channels, two samples: [1000, -1000], [16384, -16384]
        let mut pcm = Vec::new();
        for v in [1000i16, -1000, 16384, -16384] {
            pcm.extend_from_slice(&v.to_le_bytes());
        }

        let planar = spec.deinterleave(&pcm, 2, 2)?;
        assert!((planar[0][0] - 1000.0 / 32768.0).abs() < 1e-6);
        assert!((planar[1][0] + 1000.0 / 32768.0).abs() < 1e-6);
        assert!((planar[0][1] - 0.5).abs() < 1e-6);
        assert!((planar[1][1] + 0.5).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn deinterleave_24be_full_scale() -> Result<()> {
        let spec = SampleSpec::new(24, false)?;
        let pcm = [0x7F, 0xFF, 0xFF, 0x80, 0x00, 0x00];

        let planar = spec.deinterleave(&pcm, 1, 2)?;
        assert!((planar[0][0] - (8388607.0 / 8388608.0)).abs() < 1e-6);
        assert!((planar[0][1] + 1.0).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn i16_round_trip() {
        let left = [0.25f32, -0.5];
        let right = [1.0f32, -1.0];
        let interleaved = interleave_i16(&[&left, &right], 2);
        assert_eq!(interleaved, vec![8192, 32767, -16384, -32768]);

        let planar = deinterleave_i16(&interleaved, 2, 2);
        assert!((planar[0][0] - 0.25).abs() < 1e-4);
        assert!((planar[1][1] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn rejects_bad_depth() {
        assert!(SampleSpec::new(20, true).is_err());
    }

    #[test]
    fn rejects_short_pcm() -> Result<()> {
        let spec = SampleSpec::new(16, true)?;
        assert!(spec.deinterleave(&[0u8; 6], 2, 2).is_err());
        Ok(())
    }
}
