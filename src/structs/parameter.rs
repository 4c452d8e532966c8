//! Parameter block OBUs and animated parameter data.
//!
//! Three parameter families are authored per frame: mix gains
//! (step/linear/bezier animated, Q7.8 dB), down-mix parameters
//! (matrix type and weight direction) and reconstruction gains
//! (Q0.8 per demixed channel, one bitmask per layer).

use anyhow::{Result, bail};

use crate::utils::bitstream_io::{BsIoSliceReader, BsIoWriter};
use crate::utils::errors::{ConfigError, ObuError};

/// Converts a dB value to signed Q7.8.
pub fn q7_8_from_db(db: f32) -> i16 {
    let q = (db * 256.0).round();
    q.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Converts signed Q7.8 back to dB.
pub fn q7_8_to_db(q: i16) -> f32 {
    q as f32 / 256.0
}

/// Converts a linear gain in `[0, 1]` to unsigned Q0.8, `1.0 -> 0xFF`.
pub fn q0_8_from_gain(gain: f32) -> u8 {
    (gain.clamp(0.0, 1.0) * 255.0).round() as u8
}

pub fn q0_8_to_gain(q: u8) -> f32 {
    q as f32 / 255.0
}

/// One animated sub-block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnimatedSegment {
    Step { v0: f32 },
    Linear { v0: f32, v1: f32 },
    Bezier { v0: f32, v1: f32, vc: f32 },
}

impl AnimatedSegment {
    fn animation_type(self) -> u64 {
        match self {
            AnimatedSegment::Step { .. } => 0,
            AnimatedSegment::Linear { .. } => 1,
            AnimatedSegment::Bezier { .. } => 2,
        }
    }
}

/// An animated parameter: a duration split into segments which either
/// share `constant_segment_interval` or carry explicit intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimatedParameter {
    pub duration: u32,
    pub constant_segment_interval: u32,
    pub segment_interval: Vec<u32>,
    pub segments: Vec<AnimatedSegment>,
}

impl AnimatedParameter {
    /// A single step segment covering the whole duration.
    pub fn step(duration: u32, db: f32) -> Self {
        Self {
            duration,
            constant_segment_interval: duration,
            segment_interval: Vec::new(),
            segments: vec![AnimatedSegment::Step { v0: db }],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            bail!(ConfigError::EmptyParameterBlock);
        }

        if self.constant_segment_interval == 0 {
            let sum: u32 = self.segment_interval.iter().sum();
            if sum != self.duration || self.segment_interval.len() != self.segments.len() {
                bail!(ConfigError::IntervalSumMismatch {
                    sum,
                    duration: self.duration
                });
            }
        }

        Ok(())
    }

    pub fn write(&self, w: &mut BsIoWriter) -> Result<()> {
        w.put_leb128(self.duration as u64)?;
        w.put_leb128(self.segments.len() as u64)?;
        w.put_leb128(self.constant_segment_interval as u64)?;

        for (i, segment) in self.segments.iter().enumerate() {
            if self.constant_segment_interval == 0 {
                w.put_leb128(self.segment_interval[i] as u64)?;
            }

            w.put_leb128(segment.animation_type())?;
            match *segment {
                AnimatedSegment::Step { v0 } => {
                    w.put_s(16, q7_8_from_db(v0))?;
                }
                AnimatedSegment::Linear { v0, v1 } => {
                    w.put_s(16, q7_8_from_db(v0))?;
                    w.put_s(16, q7_8_from_db(v1))?;
                }
                AnimatedSegment::Bezier { v0, v1, vc } => {
                    w.put_s(16, q7_8_from_db(v0))?;
                    w.put_s(16, q7_8_from_db(v1))?;
                    w.put_s(16, q7_8_from_db(vc))?;
                }
            }
        }

        Ok(())
    }

    pub fn read(r: &mut BsIoSliceReader) -> Result<Self> {
        let duration = r.get_leb128()? as u32;
        let num_segments = r.get_leb128()? as usize;
        let constant_segment_interval = r.get_leb128()? as u32;

        let mut segment_interval = Vec::new();
        let mut segments = Vec::with_capacity(num_segments);

        for _ in 0..num_segments {
            if constant_segment_interval == 0 {
                segment_interval.push(r.get_leb128()? as u32);
            }

            let animation_type = r.get_leb128()?;
            segments.push(match animation_type {
                0 => AnimatedSegment::Step {
                    v0: q7_8_to_db(r.get_s(16)?),
                },
                1 => AnimatedSegment::Linear {
                    v0: q7_8_to_db(r.get_s(16)?),
                    v1: q7_8_to_db(r.get_s(16)?),
                },
                2 => AnimatedSegment::Bezier {
                    v0: q7_8_to_db(r.get_s(16)?),
                    v1: q7_8_to_db(r.get_s(16)?),
                    vc: q7_8_to_db(r.get_s(16)?),
                },
                other => bail!(ObuError::InvalidAnimationType(other)),
            });
        }

        Ok(Self {
            duration,
            constant_segment_interval,
            segment_interval,
            segments,
        })
    }
}

/// Payload of one parameter block OBU.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterPayload {
    MixGain(AnimatedParameter),
    Demixing {
        matrix_type: u8,
        weight_type: u8,
    },
    /// Per layer above the base: `(channel bitmask, Q0.8 gains)` for the
    /// flagged channels, mask bit order following the layer's demixed
    /// channel list.
    ReconGain(Vec<(u32, Vec<u8>)>),
}

/// A complete parameter block.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBlock {
    pub parameter_id: u32,
    pub payload: ParameterPayload,
}

impl ParameterBlock {
    pub fn write_payload(&self) -> Result<Vec<u8>> {
        let mut w = BsIoWriter::default();

        w.put_leb128(self.parameter_id as u64)?;

        match &self.payload {
            ParameterPayload::MixGain(animated) => {
                animated.validate()?;
                animated.write(&mut w)?;
            }
            ParameterPayload::Demixing {
                matrix_type,
                weight_type,
            } => {
                if !(1..=3).contains(matrix_type) {
                    bail!(ObuError::InvalidMatrixType(*matrix_type));
                }
                w.put_n(3, *matrix_type)?;
                w.put_n(1, *weight_type & 1)?;
                w.put_n(4, 0u8)?;
            }
            ParameterPayload::ReconGain(layers) => {
                w.put_leb128(layers.len() as u64)?;
                for (mask, gains) in layers {
                    w.put_leb128(*mask as u64)?;
                    w.put_bytes(gains)?;
                }
            }
        }

        Ok(w.finish()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn q_formats() {
        assert_eq!(q7_8_from_db(0.0), 0);
        assert_eq!(q7_8_from_db(-1.0), -256);
        assert_eq!(q7_8_from_db(6.5), 1664);
        assert_eq!(q0_8_from_gain(1.0), 0xFF);
        assert_eq!(q0_8_from_gain(0.0), 0);
        assert!((q0_8_to_gain(q0_8_from_gain(0.5)) - 0.5).abs() < 1.0 / 255.0);
    }

    #[test]
    fn animated_parameter_round_trip() -> Result<()> {
        let param = AnimatedParameter {
            duration: 960,
            constant_segment_interval: 0,
            segment_interval: vec![320, 320, 320],
            segments: vec![
                AnimatedSegment::Step { v0: -3.0 },
                AnimatedSegment::Linear { v0: -3.0, v1: 0.0 },
                AnimatedSegment::Bezier {
                    v0: 0.0,
                    v1: -6.0,
                    vc: -2.0,
                },
            ],
        };
        param.validate()?;

        let mut w = BsIoWriter::default();
        param.write(&mut w)?;
        let bytes = w.finish()?;

        let mut r = BsIoSliceReader::from_slice(&bytes);
        let back = AnimatedParameter::read(&mut r)?;
        assert_eq!(back, param);

        Ok(())
    }

    #[test]
    fn constant_interval_omits_interval_array() -> Result<()> {
        let with_constant = AnimatedParameter::step(960, -6.0);
        let mut w = BsIoWriter::default();
        with_constant.write(&mut w)?;
        let constant_len = w.finish()?.len();

        let explicit = AnimatedParameter {
            duration: 960,
            constant_segment_interval: 0,
            segment_interval: vec![960],
            segments: vec![AnimatedSegment::Step { v0: -6.0 }],
        };
        let mut w = BsIoWriter::default();
        explicit.write(&mut w)?;
        let explicit_len = w.finish()?.len();

        assert!(explicit_len > constant_len);
        Ok(())
    }

    #[test]
    fn invalid_blocks_rejected() {
        let empty = AnimatedParameter {
            duration: 960,
            constant_segment_interval: 960,
            segment_interval: Vec::new(),
            segments: Vec::new(),
        };
        assert!(empty.validate().is_err());

        let bad_sum = AnimatedParameter {
            duration: 960,
            constant_segment_interval: 0,
            segment_interval: vec![100],
            segments: vec![AnimatedSegment::Step { v0: 0.0 }],
        };
        assert!(bad_sum.validate().is_err());
    }
}
