//! Up-mixer: reconstructs upper-layer channels from re-decoded lower
//! layers.
//!
//! This is the algebraic inverse of the down-mixer, run on what a
//! decoder would see. Demixed channels then get the smoothed
//! reconstruction gain applied, crossfaded over a Hann ramp so factor
//! changes between frames do not click.

use anyhow::{Result, anyhow, bail};

use crate::process::{ChannelBank, FrameParams, PRESKIP_SIZE};
use crate::structs::layout::{ChannelLayout, EncChannel, ScalableLadder};
use crate::structs::parameter::q0_8_to_gain;
use crate::utils::errors::LayoutError;
use crate::utils::window::CrossfadeWindows;

use super::downmix::fold_flags;

/// Smoothing constant: `2 / (N + 1)` with `N = 7`.
const SF_ALPHA: f32 = 2.0 / 8.0;

const P0: f32 = 0.707;

pub struct UpMixer {
    ladder: ScalableLadder,
    frame_size: usize,
    windows: CrossfadeWindows,
    recon_gain_flag: bool,
    /// Per step, per demixed channel: smoothed factor carried across
    /// frames, starting at 1.0.
    last_sfavg: Vec<Vec<f32>>,
}

impl UpMixer {
    pub fn new(ladder: ScalableLadder, frame_size: usize, recon_gain_flag: bool) -> Self {
        let windows = CrossfadeWindows::new(frame_size, PRESKIP_SIZE.min(frame_size));
        let last_sfavg = ladder
            .steps
            .iter()
            .map(|s| vec![1.0f32; s.demixed.len()])
            .collect();

        Self {
            ladder,
            frame_size,
            windows,
            recon_gain_flag,
            last_sfavg,
        }
    }

    pub fn set_recon_gain_flag(&mut self, flag: bool) {
        self.recon_gain_flag = flag;
    }

    /// Rebuilds the full channel bank from decoded per-layer
    /// transmitted channels (wire order, one `Vec` per ladder step).
    pub fn reconstruct(
        &self,
        decoded_layers: &[Vec<Vec<f32>>],
        prev: &FrameParams,
        cur: &FrameParams,
    ) -> Result<ChannelBank> {
        use EncChannel::*;

        if decoded_layers.len() != self.ladder.steps.len() {
            bail!(LayoutError::PcmLengthMismatch {
                got: decoded_layers.len(),
                channels: self.ladder.steps.len(),
                frame_size: self.frame_size
            });
        }

        let mut bank = ChannelBank::new();
        let top = self.ladder.input_layout();
        let top_step = self.ladder.steps.len() - 1;

        // undo the per-layer down-mix gain while placing the channels
        for (si, (step, layer)) in self.ladder.steps.iter().zip(decoded_layers).enumerate() {
            let flagged = fold_flags(step.layout, top, si == top_step);
            let gain_prev = prev.linear_gain(si);
            let gain_cur = cur.linear_gain(si);

            for (&ch, data) in step.transmitted.iter().zip(layer) {
                let mut data = data.clone();
                data.resize(self.frame_size, 0.0);

                if flagged.contains(&ch) {
                    for (i, sample) in data.iter_mut().enumerate() {
                        let g = if i < PRESKIP_SIZE { gain_prev } else { gain_cur };
                        *sample /= g;
                    }
                }

                bank.set(ch, data);
            }
        }

        let cp = prev.matrix_type.coeffs();
        let cc = cur.matrix_type.coeffs();
        let seam = PRESKIP_SIZE.min(self.frame_size);
        let n = self.frame_size;

        let pair = |bank: &ChannelBank, a: EncChannel, b: EncChannel| {
            bank.pair(a, b)
                .ok_or_else(|| anyhow!("channels {a:?}/{b:?} missing for demix"))
        };

        let needs = |tier: fn(ChannelLayout) -> bool| self.ladder.steps.iter().any(|s| tier(s.layout));

        // stereo from mono
        if bank.has(Mono) && bank.has(L2) && !bank.has(R2) {
            let (m, l) = pair(&bank, Mono, L2)?;
            let mut out = vec![0.0f32; n];
            for i in 0..n {
                out[i] = 2.0 * m[i] - l[i];
            }
            bank.set(R2, out);
        }

        // 3-tier fronts
        if bank.has(L2) && bank.has(C) && !bank.has(L3) && needs(|l| l.swh().0 >= 3) {
            for (l3, l2) in [(L3, L2), (R3, R2)] {
                let (l, c) = pair(&bank, l2, C)?;
                let mut out = vec![0.0f32; n];
                for i in 0..n {
                    out[i] = l[i] - P0 * c[i];
                }
                bank.set(l3, out);
            }
        }

        // 5-tier fronts alias the 7-tier fronts when only one of the
        // pairs was transmitted
        if bank.has(L7) && !bank.has(L5) {
            let (l, r) = pair(&bank, L7, R7)?;
            bank.set(L5, l);
            bank.set(R5, r);
        }
        if bank.has(L5) && !bank.has(L7) && needs(|l| l.swh().0 >= 7) {
            let (l, r) = pair(&bank, L5, R5)?;
            bank.set(L7, l);
            bank.set(R7, r);
        }

        // 5-tier surrounds: Ls5 = (L3 - L5) / delta
        if bank.has(L3) && bank.has(L5) && !bank.has(Sl5) && needs(|l| l.swh().0 >= 5) {
            for (s5, l3, l5) in [(Sl5, L3, L5), (Sr5, R3, R5)] {
                let (l3v, l5v) = pair(&bank, l3, l5)?;
                let mut out = vec![0.0f32; n];
                for i in 0..n {
                    let (_, _, _, d) = if i < seam { cp } else { cc };
                    out[i] = (l3v[i] - l5v[i]) / d;
                }
                bank.set(s5, out);
            }
        }

        // 7-tier rears: Lrs7 = (Ls5 - alpha * Lss7) / beta
        if bank.has(Sl5) && bank.has(Sl7) && !bank.has(Bl7) {
            for (b7, s5, s7) in [(Bl7, Sl5, Sl7), (Br7, Sr5, Sr7)] {
                let (s5v, s7v) = pair(&bank, s5, s7)?;
                let mut out = vec![0.0f32; n];
                for i in 0..n {
                    let (a, be, _, _) = if i < seam { cp } else { cc };
                    out[i] = (s5v[i] - a * s7v[i]) / be;
                }
                bank.set(b7, out);
            }
        }

        // x.1.2 heights from 3.1.2 tops: Ltf2 = Ltf3 - w * delta * Ls5
        if bank.has(Tl) && bank.has(Sl5) && !bank.has(Hl) && needs(|l| l.swh().2 >= 2 && l != ChannelLayout::Surround312) {
            for (h, t, s) in [(Hl, Tl, Sl5), (Hr, Tr, Sr5)] {
                let (tv, sv) = pair(&bank, t, s)?;
                let mut out = vec![0.0f32; n];
                for i in 0..n {
                    let (d, w) = if i < seam {
                        (cp.3, prev.w_z)
                    } else {
                        (cc.3, cur.w_z)
                    };
                    out[i] = tv[i] - w * d * sv[i];
                }
                bank.set(h, out);
            }
        }

        // 4-height rears: Ltb4 = (Ltf2 - Ltf4) / gamma
        if bank.has(Hl) && bank.has(Hfl) && !bank.has(Hbl) {
            for (hb, h, hf) in [(Hbl, Hl, Hfl), (Hbr, Hr, Hfr)] {
                let (hv, hfv) = pair(&bank, h, hf)?;
                let mut out = vec![0.0f32; n];
                for i in 0..n {
                    let (_, _, g, _) = if i < seam { cp } else { cc };
                    out[i] = (hv[i] - hfv[i]) / g;
                }
                bank.set(hb, out);
            }
        }

        Ok(bank)
    }

    /// Applies the frame's reconstruction gains to the demixed channels
    /// with EWMA smoothing and a crossfade against last frame's factor.
    ///
    /// `gains` holds one Q0.8 byte per demixed channel per step,
    /// matching [`LadderStep::demixed`](crate::structs::layout::LadderStep).
    pub fn apply_smoothing(&mut self, bank: &mut ChannelBank, gains: &[Vec<u8>]) -> Result<()> {
        if !self.recon_gain_flag {
            return Ok(());
        }

        for (si, step) in self.ladder.steps.iter().enumerate() {
            let Some(step_gains) = gains.get(si) else {
                continue;
            };

            for (ci, &ch) in step.demixed.iter().enumerate() {
                let sf = q0_8_to_gain(step_gains[ci]);
                let last = self.last_sfavg[si][ci];
                let sfavg = SF_ALPHA * sf + (1.0 - SF_ALPHA) * last;

                if let Some(data) = bank.get_mut(ch) {
                    for (j, sample) in data.iter_mut().enumerate() {
                        let filt =
                            last * self.windows.stop[j] + sfavg * self.windows.start[j];
                        *sample *= filt;
                    }
                }

                self.last_sfavg[si][ci] = sfavg;
            }
        }

        Ok(())
    }

    /// Channels of one chain layout from a reconstructed bank, in
    /// rendering order.
    pub fn layout_channels(
        &self,
        bank: &ChannelBank,
        layout: ChannelLayout,
    ) -> Result<Vec<Vec<f32>>> {
        layout
            .channels()
            .iter()
            .map(|&ch| {
                bank.get(ch)
                    .map(|d| d.to_vec())
                    .ok_or_else(|| anyhow!("channel {ch:?} was not reconstructed"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::MatrixType;
    use crate::process::downmix::DownMixer;
    use crate::structs::layout::ChannelLayout::*;
    use anyhow::Result;

    fn ramp_input(layout: ChannelLayout, frame_size: usize) -> Vec<Vec<f32>> {
        (0..layout.channel_count())
            .map(|c| {
                (0..frame_size)
                    .map(|i| ((i + c * 7) as f32 * 0.37).sin() * 0.4)
                    .collect()
            })
            .collect()
    }

    /// Down-mix followed by up-mix with matching parameters restores
    /// the top layer exactly (before any codec gets involved).
    #[test]
    fn down_then_up_is_identity() -> Result<()> {
        for chain in [
            vec![Stereo, Surround714],
            vec![Mono, Stereo, Surround510],
            vec![Surround312, Surround512, Surround714],
            vec![Stereo, Surround512, Surround714],
            vec![Surround510, Surround514],
        ] {
            let frame = 480;
            let ladder = ScalableLadder::new(&chain)?;
            let top = ladder.input_layout();
            let dm = DownMixer::new(ladder.clone(), frame);
            let um = UpMixer::new(ladder, frame, true);

            let input = ramp_input(top, frame);
            let params = FrameParams {
                matrix_type: MatrixType::Type3,
                weight_type: 1,
                w_z: 0.35,
                dmix_gain_q: vec![0; chain.len()],
            };

            let down = dm.process(&input, &params, &params)?;
            let bank = um.reconstruct(&down.layers, &params, &params)?;
            let output = um.layout_channels(&bank, top)?;

            for (orig, recon) in input.iter().zip(&output) {
                for (a, b) in orig.iter().zip(recon) {
                    assert!((a - b).abs() < 1e-5, "chain {chain:?}: {a} vs {b}");
                }
            }
        }

        Ok(())
    }

    /// The first `PRESKIP_SIZE` samples of a frame demix with the
    /// previous frame's matrix type.
    #[test]
    fn seam_parameters_match_downmix() -> Result<()> {
        let frame = 480;
        let chain = [Surround510, Surround714];
        let ladder = ScalableLadder::new(&chain)?;
        let dm = DownMixer::new(ladder.clone(), frame);
        let um = UpMixer::new(ladder, frame, true);

        let input = ramp_input(Surround714, frame);
        let mk = |matrix_type| FrameParams {
            matrix_type,
            weight_type: 0,
            w_z: 0.0,
            dmix_gain_q: vec![0; 2],
        };
        let prev = mk(MatrixType::Type1);
        let cur = mk(MatrixType::Type3);

        let down = dm.process(&input, &prev, &cur)?;
        let bank = um.reconstruct(&down.layers, &prev, &cur)?;
        let output = um.layout_channels(&bank, Surround714)?;

        for (orig, recon) in input.iter().zip(&output) {
            assert!((orig[PRESKIP_SIZE - 1] - recon[PRESKIP_SIZE - 1]).abs() < 1e-5);
            assert!((orig[PRESKIP_SIZE] - recon[PRESKIP_SIZE]).abs() < 1e-5);
        }

        Ok(())
    }

    /// Gains divide back out on the way up.
    #[test]
    fn gain_round_trip() -> Result<()> {
        let frame = 480;
        let chain = [Stereo, Surround510];
        let ladder = ScalableLadder::new(&chain)?;
        let dm = DownMixer::new(ladder.clone(), frame);
        let um = UpMixer::new(ladder, frame, true);

        let input = ramp_input(Surround510, frame);
        let params = FrameParams {
            matrix_type: MatrixType::Type1,
            weight_type: 0,
            w_z: 0.0,
            dmix_gain_q: vec![-1536, 0],
        };

        let down = dm.process(&input, &params, &params)?;
        let bank = um.reconstruct(&down.layers, &params, &params)?;
        let output = um.layout_channels(&bank, Surround510)?;

        for (orig, recon) in input.iter().zip(&output) {
            for (a, b) in orig.iter().zip(recon) {
                assert!((a - b).abs() < 1e-5);
            }
        }

        Ok(())
    }

    /// Unity gains with factors already at 1.0 leave samples untouched;
    /// a gain drop fades in over the crossfade window.
    #[test]
    fn smoothing_crossfades() -> Result<()> {
        let frame = 960;
        let ladder = ScalableLadder::new(&[Stereo, Surround510])?;
        let mut um = UpMixer::new(ladder.clone(), frame, true);

        let mut bank = ChannelBank::new();
        bank.set(EncChannel::Sl5, vec![1.0; frame]);
        bank.set(EncChannel::Sr5, vec![1.0; frame]);

        um.apply_smoothing(&mut bank, &[vec![], vec![0xFF, 0xFF]])?;
        let sl5 = bank.get(EncChannel::Sl5).unwrap();
        assert!((sl5[0] - 1.0).abs() < 1e-6);
        assert!((sl5[959] - 1.0).abs() < 1e-6);

        // halve the gain: early samples keep last factor, late samples
        // approach the new average
        um.apply_smoothing(&mut bank, &[vec![], vec![128, 128]])?;
        let sl5 = bank.get(EncChannel::Sl5).unwrap();
        let expected = SF_ALPHA * q0_8_to_gain(128) + (1.0 - SF_ALPHA);
        assert!((sl5[0] - 1.0).abs() < 1e-6);
        assert!((sl5[959] - expected).abs() < 1e-4);

        Ok(())
    }
}
