//! Scalable ladder down-mixer.
//!
//! Folds the input layout down through the surround tiers
//! (7 → 5 → 3 → 2 → 1) and height tiers (4 → 2 → 3.1.2 tops), applying
//! the matrix coefficients selected per frame. To mask seams where the
//! matrix type or weight changes between frames, the first
//! [`PRESKIP_SIZE`](crate::process::PRESKIP_SIZE) samples of a frame are
//! folded with the previous frame's parameters.

use anyhow::{Result, anyhow, bail};

use crate::process::{ChannelBank, FrameParams, PRESKIP_SIZE};
use crate::structs::layout::{ChannelLayout, EncChannel, ScalableLadder};
use crate::utils::errors::LayoutError;

/// Front centre coupling into stereo, fixed across matrix types.
const P0: f32 = 0.707;

pub struct DownMixer {
    ladder: ScalableLadder,
    frame_size: usize,
}

/// One frame of down-mix results.
pub struct DownmixOutput {
    /// All tier channels before gain, original and folded. These are
    /// the references the reconstruction-gain estimator compares
    /// against.
    pub bank: ChannelBank,
    /// Per ladder step, the transmitted channels in wire order with the
    /// step's down-mix gain applied.
    pub layers: Vec<Vec<Vec<f32>>>,
}

impl DownMixer {
    pub fn new(ladder: ScalableLadder, frame_size: usize) -> Self {
        Self { ladder, frame_size }
    }

    pub fn ladder(&self) -> &ScalableLadder {
        &self.ladder
    }

    /// Folds one frame. `input` holds the top layout's channels in
    /// rendering order; `prev` are the previous frame's parameters for
    /// the pre-seam samples.
    pub fn process(
        &self,
        input: &[Vec<f32>],
        prev: &FrameParams,
        cur: &FrameParams,
    ) -> Result<DownmixOutput> {
        let top = self.ladder.input_layout();
        if input.len() != top.channel_count() {
            bail!(LayoutError::PcmLengthMismatch {
                got: input.len(),
                channels: top.channel_count(),
                frame_size: self.frame_size
            });
        }

        let mut bank = ChannelBank::new();
        for (&ch, data) in top.channels().iter().zip(input) {
            if data.len() != self.frame_size {
                bail!(LayoutError::PcmLengthMismatch {
                    got: data.len(),
                    channels: input.len(),
                    frame_size: self.frame_size
                });
            }
            bank.set(ch, data.clone());
        }

        self.fold(&mut bank, prev, cur)?;

        let mut layers = Vec::with_capacity(self.ladder.steps.len());
        let top_step = self.ladder.steps.len() - 1;

        for (si, step) in self.ladder.steps.iter().enumerate() {
            let flagged = fold_flags(step.layout, top, si == top_step);
            let gain_prev = prev.linear_gain(si);
            let gain_cur = cur.linear_gain(si);

            let mut channels = Vec::with_capacity(step.transmitted.len());
            for &ch in &step.transmitted {
                let Some(data) = bank.get(ch) else {
                    bail!("channel {ch:?} missing after fold");
                };

                let mut data = data.to_vec();
                if flagged.contains(&ch) {
                    for (i, sample) in data.iter_mut().enumerate() {
                        let g = if i < PRESKIP_SIZE { gain_prev } else { gain_cur };
                        *sample *= g;
                    }
                }
                channels.push(data);
            }

            layers.push(channels);
        }

        Ok(DownmixOutput { bank, layers })
    }

    /// Derives every tier the chain needs below the input layout.
    fn fold(&self, bank: &mut ChannelBank, prev: &FrameParams, cur: &FrameParams) -> Result<()> {
        use EncChannel::*;

        let top = self.ladder.input_layout();
        let (top_s, _, top_h) = top.swh();
        let (bottom_s, _, _) = self.ladder.steps[0].layout.swh();

        let has_312 = self
            .ladder
            .steps
            .iter()
            .any(|s| s.layout == ChannelLayout::Surround312);
        let needs_h2 = top_h == 4
            && self.ladder.steps.iter().any(|s| {
                s.layout.swh().2 == 2 && s.layout != ChannelLayout::Surround312 || has_312
            });

        let cp = prev.matrix_type.coeffs();
        let cc = cur.matrix_type.coeffs();
        let seam = PRESKIP_SIZE.min(self.frame_size);

        let pair = |bank: &ChannelBank, a: EncChannel, b: EncChannel| {
            bank.pair(a, b)
                .ok_or_else(|| anyhow!("channels {a:?}/{b:?} missing for fold"))
        };

        if top_s >= 7 && bottom_s < 7 {
            // Ls5 = alpha * Lss7 + beta * Lrs7; fronts pass through
            for (sl, side, back) in [(Sl5, Sl7, Bl7), (Sr5, Sr7, Br7)] {
                let (s, b) = pair(bank, side, back)?;
                let mut out = vec![0.0f32; self.frame_size];
                for i in 0..self.frame_size {
                    let (a, be, _, _) = if i < seam { cp } else { cc };
                    out[i] = a * s[i] + be * b[i];
                }
                bank.set(sl, out);
            }
            let (l, r) = pair(bank, L7, R7)?;
            bank.set(L5, l);
            bank.set(R5, r);
        }

        if top_s >= 5 && bottom_s < 5 {
            // L3 = L5 + delta * Ls5
            for (l3, l5, s5) in [(L3, L5, Sl5), (R3, R5, Sr5)] {
                let (l, s) = pair(bank, l5, s5)?;
                let mut out = vec![0.0f32; self.frame_size];
                for i in 0..self.frame_size {
                    let (_, _, _, d) = if i < seam { cp } else { cc };
                    out[i] = l[i] + d * s[i];
                }
                bank.set(l3, out);
            }
        }

        if top_s >= 3 && bottom_s < 3 {
            // L2 = L3 + p0 * C
            for (l2, l3) in [(L2, L3), (R2, R3)] {
                let (l, c) = pair(bank, l3, C)?;
                let mut out = vec![0.0f32; self.frame_size];
                for i in 0..self.frame_size {
                    out[i] = l[i] + P0 * c[i];
                }
                bank.set(l2, out);
            }
        }

        if top_s >= 2 && bottom_s < 2 {
            let (l, r) = pair(bank, L2, R2)?;
            let mut out = vec![0.0f32; self.frame_size];
            for i in 0..self.frame_size {
                out[i] = 0.5 * (l[i] + r[i]);
            }
            bank.set(Mono, out);
        }

        if needs_h2 {
            // Ltf2 = Ltf4 + gamma * Ltb4
            for (h, hf, hb) in [(Hl, Hfl, Hbl), (Hr, Hfr, Hbr)] {
                let (f, b) = pair(bank, hf, hb)?;
                let mut out = vec![0.0f32; self.frame_size];
                for i in 0..self.frame_size {
                    let (_, _, g, _) = if i < seam { cp } else { cc };
                    out[i] = f[i] + g * b[i];
                }
                bank.set(h, out);
            }
        }

        if has_312 && top_h >= 2 && top != ChannelLayout::Surround312 {
            // Ltf3 = Ltf2 + w * delta * Ls5
            for (t, h, s) in [(Tl, Hl, Sl5), (Tr, Hr, Sr5)] {
                let (hv, sv) = pair(bank, h, s)?;
                let mut out = vec![0.0f32; self.frame_size];
                for i in 0..self.frame_size {
                    let (d, w) = if i < seam {
                        (cp.3, prev.w_z)
                    } else {
                        (cc.3, cur.w_z)
                    };
                    out[i] = hv[i] + w * d * sv[i];
                }
                bank.set(t, out);
            }
        }

        Ok(())
    }
}

/// Transmitted channels of a step that carry folded-down content and
/// therefore receive the step's down-mix gain. The top layer carries
/// the original channels and is never flagged.
pub fn fold_flags(
    step_layout: ChannelLayout,
    input_layout: ChannelLayout,
    is_top: bool,
) -> Vec<EncChannel> {
    use EncChannel::*;

    if is_top {
        return Vec::new();
    }

    let (step_s, _, step_h) = step_layout.swh();
    let (input_s, _, input_h) = input_layout.swh();

    let mut flags = Vec::new();

    if step_s == 1 && input_s > 1 {
        flags.push(Mono);
    }
    if step_s == 2 && input_s > 2 {
        flags.extend([L2, R2]);
    }
    if step_s == 3 && input_s > 3 {
        flags.extend([L3, R3]);
    }
    if step_s == 5 && input_s > 5 {
        flags.extend([Sl5, Sr5]);
    }

    if step_layout == ChannelLayout::Surround312 && input_h >= 2 {
        flags.extend([Tl, Tr]);
    }
    if step_h == 2 && step_layout != ChannelLayout::Surround312 && input_h > 2 {
        flags.extend([Hl, Hr]);
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MatrixType;
    use crate::structs::layout::ChannelLayout::*;
    use anyhow::Result;

    fn constant_input(layout: ChannelLayout, frame_size: usize, value: f32) -> Vec<Vec<f32>> {
        vec![vec![value; frame_size]; layout.channel_count()]
    }

    #[test]
    fn fold_714_to_stereo_values() -> Result<()> {
        let ladder = ScalableLadder::new(&[Stereo, Surround714])?;
        let dm = DownMixer::new(ladder, 16);

        let input = constant_input(Surround714, 16, 0.1);
        let params = FrameParams::unity(2);
        let out = dm.process(&input, &params, &params)?;

        // type 1: Ls5 = 1.0*Lss7 + 1.0*Lrs7 = 0.2
        let sl5 = out.bank.get(EncChannel::Sl5).unwrap();
        assert!((sl5[0] - 0.2).abs() < 1e-6);

        // L3 = L5 + 0.707*Ls5 = 0.1 + 0.1414
        let l3 = out.bank.get(EncChannel::L3).unwrap();
        assert!((l3[0] - (0.1 + 0.707 * 0.2)).abs() < 1e-6);

        // L2 = L3 + 0.707*C
        let l2 = out.bank.get(EncChannel::L2).unwrap();
        assert!((l2[0] - (l3[0] + 0.707 * 0.1)).abs() < 1e-6);

        // base layer carries the folded stereo
        assert_eq!(out.layers[0].len(), 2);
        assert!((out.layers[0][0][0] - l2[0]).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn matrix_seam_uses_previous_coeffs() -> Result<()> {
        let ladder = ScalableLadder::new(&[Surround510, Surround714])?;
        let frame = 400;
        let dm = DownMixer::new(ladder, frame);

        let input = constant_input(Surround714, frame, 0.1);
        let mut prev = FrameParams::unity(2);
        prev.matrix_type = MatrixType::Type1;
        let mut cur = prev.clone();
        cur.matrix_type = MatrixType::Type2;

        let out = dm.process(&input, &prev, &cur)?;
        let sl5 = out.bank.get(EncChannel::Sl5).unwrap();

        // type 1 before the seam, type 2 after
        assert!((sl5[PRESKIP_SIZE - 1] - 0.2).abs() < 1e-6);
        assert!((sl5[PRESKIP_SIZE] - (0.707 + 0.707) * 0.1).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn dmix_gain_applies_to_folded_channels_only() -> Result<()> {
        let ladder = ScalableLadder::new(&[Stereo, Surround510])?;
        let dm = DownMixer::new(ladder, 8);

        let input = constant_input(Surround510, 8, 0.2);
        let prev = FrameParams {
            matrix_type: MatrixType::Type1,
            weight_type: 0,
            w_z: 0.0,
            dmix_gain_q: vec![-1536, 0], // -6 dB on the stereo layer
        };

        let out = dm.process(&input, &prev, &prev)?;

        let gain = 10.0f32.powf(-6.0 / 20.0);
        let l3 = 0.2 + 0.707 * 0.2;
        let l2 = l3 + 0.707 * 0.2;

        assert!((out.layers[0][0][0] - l2 * gain).abs() < 1e-5);
        // top layer keeps the original samples
        assert!((out.layers[1][0][0] - 0.2).abs() < 1e-6);

        Ok(())
    }

    #[test]
    fn tops_fold_through_weight() -> Result<()> {
        let ladder = ScalableLadder::new(&[Surround312, Surround512])?;
        let dm = DownMixer::new(ladder, 8);

        let input = constant_input(Surround512, 8, 0.1);
        let params = FrameParams {
            matrix_type: MatrixType::Type1,
            weight_type: 1,
            w_z: 0.25,
            dmix_gain_q: vec![0, 0],
        };

        let out = dm.process(&input, &params, &params)?;
        let tl = out.bank.get(EncChannel::Tl).unwrap();

        // Ltf3 = Ltf2 + w*delta*Ls5 = 0.1 + 0.25*0.707*0.1
        assert!((tl[0] - (0.1 + 0.25 * 0.707 * 0.1)).abs() < 1e-6);

        Ok(())
    }
}
