//! Loudness measurement per target layout.
//!
//! K-weighted integrated loudness: pre-shelf and RLB high-pass stages,
//! mean square over 400 ms blocks with 75 % overlap, a -70 LUFS
//! absolute gate and a -10 LU relative gate. Digital peak is the
//! largest absolute sample; true peak comes from a 4x polyphase
//! interpolator whose tap bank is computed at creation.

use crate::structs::layout::{ChannelLayout, EncChannel};

const ABSOLUTE_GATE_LUFS: f64 = -70.0;
const RELATIVE_GATE_LU: f64 = -10.0;
const BLOCK_MS: usize = 400;
const HOP_MS: usize = 100;

const OVERSAMPLE: usize = 4;
const TAPS_PER_PHASE: usize = 12;

/// Pre-shelf stage of the K-weighting filter, 48 kHz coefficients.
const STAGE1_B: [f64; 3] = [1.535_124_859_586_97, -2.691_696_189_406_38, 1.198_392_810_852_85];
const STAGE1_A: [f64; 2] = [-1.690_659_293_182_41, 0.732_480_774_215_85];

/// RLB high-pass stage.
const STAGE2_B: [f64; 3] = [1.0, -2.0, 1.0];
const STAGE2_A: [f64; 2] = [-1.990_047_454_833_98, 0.990_072_250_366_21];

/// BS.1770 channel weighting: surrounds count 1.41, LFE is excluded.
fn channel_weight(ch: EncChannel) -> f64 {
    use EncChannel::*;
    match ch {
        Lfe => 0.0,
        Sl5 | Sr5 | Sl7 | Sr7 | Bl7 | Br7 => 1.41,
        _ => 1.0,
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Biquad {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

impl Biquad {
    fn step(&mut self, b: &[f64; 3], a: &[f64; 2], x: f64) -> f64 {
        let y = b[0] * x + b[1] * self.x1 + b[2] * self.x2 - a[0] * self.y1 - a[1] * self.y2;
        self.x2 = self.x1;
        self.x1 = x;
        self.y2 = self.y1;
        self.y1 = y;
        y
    }
}

/// 4x oversampling FIR interpolator for one channel.
#[derive(Debug, Clone)]
struct TruePeakMeter {
    history: Vec<f32>,
    pos: usize,
}

impl TruePeakMeter {
    fn new() -> Self {
        Self {
            history: vec![0.0; TAPS_PER_PHASE],
            pos: 0,
        }
    }

    fn next(&mut self, phases: &[Vec<f32>], x: f32) -> f32 {
        self.history[self.pos] = x;
        self.pos = (self.pos + 1) % TAPS_PER_PHASE;

        let mut peak = 0.0f32;
        for taps in phases {
            let mut acc = 0.0f32;
            for (k, &tap) in taps.iter().enumerate() {
                let sample = self.history[(self.pos + TAPS_PER_PHASE - 1 - k) % TAPS_PER_PHASE];
                acc += tap * sample;
            }
            let mag = acc.abs();
            if mag > peak {
                peak = mag;
            }
        }

        peak
    }
}

/// Hann-windowed sinc bank for the interpolator, one tap set per phase.
fn polyphase_bank() -> Vec<Vec<f32>> {
    let total = OVERSAMPLE * TAPS_PER_PHASE;
    let center = (total - 1) as f64 / 2.0;

    let mut phases = vec![Vec::with_capacity(TAPS_PER_PHASE); OVERSAMPLE];
    for n in 0..total {
        let t = (n as f64 - center) / OVERSAMPLE as f64;
        let sinc = if t.abs() < 1e-9 {
            1.0
        } else {
            (std::f64::consts::PI * t).sin() / (std::f64::consts::PI * t)
        };
        let window = 0.5
            * (1.0 - (2.0 * std::f64::consts::PI * n as f64 / (total - 1) as f64).cos());

        phases[n % OVERSAMPLE].push((sinc * window) as f32);
    }

    phases
}

/// Integrated loudness, digital peak and true peak for one layout.
pub struct LoudnessMeter {
    weights: Vec<f64>,
    stage1: Vec<Biquad>,
    stage2: Vec<Biquad>,

    hop_len: usize,
    hops_per_block: usize,
    hop_pos: usize,
    hop_sums: Vec<f64>,
    hop_history: Vec<Vec<f64>>,
    block_powers: Vec<f64>,

    phases: Vec<Vec<f32>>,
    true_peak_meters: Vec<TruePeakMeter>,
    digital_peak: f32,
    true_peak: f32,
}

impl LoudnessMeter {
    pub fn new(layout: ChannelLayout, sample_rate: u32) -> Self {
        let channels = layout.channel_count();
        let weights = layout
            .channels()
            .iter()
            .map(|&ch| channel_weight(ch))
            .collect();

        Self {
            weights,
            stage1: vec![Biquad::default(); channels],
            stage2: vec![Biquad::default(); channels],
            hop_len: sample_rate as usize * HOP_MS / 1000,
            hops_per_block: BLOCK_MS / HOP_MS,
            hop_pos: 0,
            hop_sums: vec![0.0; channels],
            hop_history: Vec::new(),
            block_powers: Vec::new(),
            phases: polyphase_bank(),
            true_peak_meters: vec![TruePeakMeter::new(); channels],
            digital_peak: 0.0,
            true_peak: 0.0,
        }
    }

    /// Feeds one block of planar channels in the layout's rendering
    /// order.
    pub fn push(&mut self, channels: &[Vec<f32>]) {
        let frame_size = channels.first().map(|c| c.len()).unwrap_or(0);

        for i in 0..frame_size {
            for (ci, channel) in channels.iter().enumerate() {
                let x = channel[i];

                let mag = x.abs();
                if mag > self.digital_peak {
                    self.digital_peak = mag;
                }

                let tp = self.true_peak_meters[ci].next(&self.phases, x);
                if tp > self.true_peak {
                    self.true_peak = tp;
                }

                let filtered =
                    self.stage2[ci].step(&STAGE2_B, &STAGE2_A, self.stage1[ci].step(&STAGE1_B, &STAGE1_A, x as f64));
                self.hop_sums[ci] += filtered * filtered;
            }

            self.hop_pos += 1;
            if self.hop_pos == self.hop_len {
                self.complete_hop();
            }
        }
    }

    fn complete_hop(&mut self) {
        let means: Vec<f64> = self
            .hop_sums
            .iter()
            .map(|&sum| sum / self.hop_len as f64)
            .collect();

        self.hop_sums.iter_mut().for_each(|s| *s = 0.0);
        self.hop_pos = 0;
        self.hop_history.push(means);

        if self.hop_history.len() >= self.hops_per_block {
            let start = self.hop_history.len() - self.hops_per_block;
            let mut power = 0.0;
            for (ci, &weight) in self.weights.iter().enumerate() {
                let mean: f64 = self.hop_history[start..]
                    .iter()
                    .map(|h| h[ci])
                    .sum::<f64>()
                    / self.hops_per_block as f64;
                power += weight * mean;
            }
            self.block_powers.push(power);
        }
    }

    /// Gated integrated loudness in LUFS.
    ///
    /// Returns the meter floor when no block passes the gates (silence).
    pub fn integrated_lufs(&self) -> f64 {
        let to_lufs = |power: f64| -0.691 + 10.0 * power.log10();

        let above_absolute: Vec<f64> = self
            .block_powers
            .iter()
            .copied()
            .filter(|&p| to_lufs(p) > ABSOLUTE_GATE_LUFS)
            .collect();

        if above_absolute.is_empty() {
            return ABSOLUTE_GATE_LUFS;
        }

        let ungated_mean = above_absolute.iter().sum::<f64>() / above_absolute.len() as f64;
        let relative_gate = to_lufs(ungated_mean) + RELATIVE_GATE_LU;

        let gated: Vec<f64> = above_absolute
            .into_iter()
            .filter(|&p| to_lufs(p) > relative_gate)
            .collect();

        if gated.is_empty() {
            return ABSOLUTE_GATE_LUFS;
        }

        to_lufs(gated.iter().sum::<f64>() / gated.len() as f64)
    }

    /// Largest absolute sample seen, in dBFS.
    pub fn digital_peak_db(&self) -> f64 {
        amplitude_db(self.digital_peak)
    }

    /// Oversampled peak, in dBTP.
    pub fn true_peak_db(&self) -> f64 {
        amplitude_db(self.true_peak.max(self.digital_peak))
    }
}

fn amplitude_db(amplitude: f32) -> f64 {
    if amplitude <= 0.0 {
        -100.0
    } else {
        20.0 * (amplitude as f64).log10()
    }
}
