//! Down-mix parameter determination.
//!
//! A pre-pass over the element's PCM that picks `matrix_type` and
//! `weight_type` per frame. The reference analysis is a neural network
//! living outside this crate; this module honours its I/O contract with
//! a deterministic energy heuristic and accepts externally determined
//! results as an override.

use crate::process::MatrixType;
use crate::structs::layout::{ChannelLayout, EncChannel};

/// Advances the weight state by one frame.
///
/// `weight_type = 1` steps up, `0` steps down, by 0.1 per frame,
/// saturating at the `[0.0, 2.0]` bounds.
pub fn step_weight(weight_type: u8, w_x_prev: f32) -> f32 {
    if weight_type != 0 {
        (w_x_prev + 0.1).min(2.0)
    } else {
        (w_x_prev - 0.1).max(0.0)
    }
}

/// Piecewise cube-root weight curve, halved.
///
/// Monotone from `w_z = 0` at `w_x = 0` to `w_z = 1` at `w_x = 2`, flat
/// around the inflection points 0.5 and 1.5.
pub fn weight_curve(w_x: f32) -> f32 {
    let third = 1.0f32 / 3.0;

    let w_y = if w_x <= 1.0 {
        if w_x < 0.5 {
            -((0.5 - w_x) / 4.0).powf(third) + 0.5
        } else {
            ((w_x - 0.5) / 4.0).powf(third) + 0.5
        }
    } else if w_x < 1.5 {
        -((1.5 - w_x) / 4.0).powf(third) + 1.5
    } else {
        ((w_x - 1.5) / 4.0).powf(third) + 1.5
    };

    w_y * 0.5
}

/// One weight update: returns the stepped `w_x` and the effective `w_z`.
///
/// Callers feed the previous `w_x` back in on the next frame.
pub fn calc_w(weight_type: u8, w_x_prev: f32) -> (f32, f32) {
    let w_x = step_weight(weight_type, w_x_prev);
    (w_x, weight_curve(w_x))
}

const SILENCE_FLOOR: f32 = 1e-10;

/// Per-frame matrix/weight determination over the input layout.
#[derive(Debug, Default)]
pub struct DmixParamDeterminer {
    results: Vec<(MatrixType, u8)>,
    overridden: Option<Vec<(MatrixType, u8)>>,
}

impl DmixParamDeterminer {
    pub fn reset(&mut self) {
        self.results.clear();
    }

    /// Replaces the heuristic output with externally determined
    /// parameters (the ctl override path).
    pub fn set_override(&mut self, params: Vec<(MatrixType, u8)>) {
        self.overridden = Some(params);
    }

    /// Analyzes one frame of the input layout, planar channels in
    /// rendering order.
    pub fn process_frame(&mut self, layout: ChannelLayout, channels: &[Vec<f32>]) {
        let mut front = 0.0f64;
        let mut surround = 0.0f64;
        let mut height = 0.0f64;

        for (ch, data) in layout.channels().iter().zip(channels) {
            let energy: f64 = data.iter().map(|&x| (x as f64) * (x as f64)).sum();

            use EncChannel::*;
            match ch {
                Sl5 | Sr5 | Sl7 | Sr7 | Bl7 | Br7 => surround += energy,
                Tl | Tr | Hl | Hr | Hfl | Hfr | Hbl | Hbr => height += energy,
                _ => front += energy,
            }
        }

        let total = front + surround + height;
        let (matrix_type, weight_type) = if total < SILENCE_FLOOR as f64 {
            (MatrixType::Type1, 0)
        } else {
            let surround_ratio = surround / (front + SILENCE_FLOOR as f64);
            let matrix_type = if surround_ratio > 0.5 {
                MatrixType::Type2
            } else if surround_ratio < 0.05 {
                MatrixType::Type3
            } else {
                MatrixType::Type1
            };

            let weight_type = u8::from(height > 0.001 * total);
            (matrix_type, weight_type)
        };

        self.results.push((matrix_type, weight_type));
    }

    /// Per-frame results, the override winning over the heuristic.
    pub fn results(&self) -> &[(MatrixType, u8)] {
        match &self.overridden {
            Some(params) => params,
            None => &self.results,
        }
    }

    /// Parameters for frame `index`, repeating the final frame once the
    /// pre-pass results run out.
    pub fn frame_params(&self, index: usize) -> (MatrixType, u8) {
        let results = self.results();
        results
            .get(index)
            .or_else(|| results.last())
            .copied()
            .unwrap_or((MatrixType::Type1, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_saturates_at_two() {
        let mut w_x = 0.0f32;
        for _ in 0..30 {
            (w_x, _) = calc_w(1, w_x);
        }
        assert!((w_x - 2.0).abs() < 1e-6);

        let (down, _) = calc_w(0, w_x);
        assert!((down - 1.9).abs() < 1e-6);
    }

    #[test]
    fn weight_saturates_at_zero() {
        let mut w_x = 0.3f32;
        for _ in 0..10 {
            (w_x, _) = calc_w(0, w_x);
        }
        assert_eq!(w_x, 0.0);
    }

    #[test]
    fn curve_endpoints_and_monotonicity() {
        assert!(weight_curve(0.0).abs() < 1e-6);
        assert!((weight_curve(0.5) - 0.25).abs() < 1e-6);
        assert!((weight_curve(1.0) - 0.5).abs() < 1e-6);
        assert!((weight_curve(1.5) - 0.75).abs() < 1e-6);
        assert!((weight_curve(2.0) - 1.0).abs() < 1e-6);

        let mut prev = weight_curve(0.0);
        for i in 1..=20 {
            let next = weight_curve(i as f32 * 0.1);
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn heuristic_is_deterministic_on_silence() {
        let mut determiner = DmixParamDeterminer::default();
        let silent = vec![vec![0.0f32; 960]; 2];
        determiner.process_frame(ChannelLayout::Stereo, &silent);
        determiner.process_frame(ChannelLayout::Stereo, &silent);

        assert_eq!(
            determiner.results(),
            &[(MatrixType::Type1, 0), (MatrixType::Type1, 0)]
        );
    }

    #[test]
    fn override_wins() {
        let mut determiner = DmixParamDeterminer::default();
        let silent = vec![vec![0.0f32; 960]; 2];
        determiner.process_frame(ChannelLayout::Stereo, &silent);
        determiner.set_override(vec![(MatrixType::Type3, 1)]);

        assert_eq!(determiner.frame_params(0), (MatrixType::Type3, 1));
        // repeats the last override entry past the end
        assert_eq!(determiner.frame_params(5), (MatrixType::Type3, 1));
    }
}
