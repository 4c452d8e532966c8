//! Per-frame encoding pipeline.
//!
//! 1. **Down-mix parameter determination** ([`dmpd`]): per-frame matrix
//!    type and weight selection feeding the down-mixer.
//!
//! 2. **Down-mixing** ([`downmix`]): folds the input layout down the
//!    scalable ladder.
//!
//! 3. **Up-mixing** ([`upmix`]) and **reconstruction gain**
//!    ([`recon_gain`]): re-derives the upper layers from re-decoded
//!    lower layers and measures the restoring gain.
//!
//! 4. **Loudness** ([`loudness`]) and **limiting** ([`limiter`]) for the
//!    mix-presentation measurements.
//!
//! 5. **Orchestration** ([`encode`]): element registry, phase machine,
//!    OBU scheduling.

pub mod dmpd;
pub mod downmix;
pub mod encode;
pub mod limiter;
pub mod loudness;
pub mod recon_gain;
pub mod upmix;

use crate::structs::layout::{ENC_CHANNEL_COUNT, EncChannel};

/// Energy-measurement chunk for reconstruction gains.
pub const CHUNK_SIZE: usize = 960;

/// Crossfade boundary inside a frame: samples before it are computed
/// with the previous frame's down-mix parameters.
pub const PRESKIP_SIZE: usize = 312;

pub const MAX_CHANNELS: usize = 12;

pub const MAX_MEASURED_LAYOUTS: usize = 10;

pub const LIMITER_THRESHOLD_DB: f32 = -1.0;
pub const LIMITER_ATTACK_SEC: f32 = 0.001;
pub const LIMITER_RELEASE_SEC: f32 = 0.200;
pub const LIMITER_LOOKAHEAD: usize = 240;

/// Down-mix matrix type, 1-indexed on the wire; a stored 0 is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixType {
    Type1 = 1,
    Type2 = 2,
    Type3 = 3,
}

impl MatrixType {
    /// `(alpha, beta, gamma, delta)`: surround 7-to-5 pair, height
    /// coupling and surround-to-lower coupling.
    pub fn coeffs(self) -> (f32, f32, f32, f32) {
        match self {
            MatrixType::Type1 => (1.0, 1.0, 0.707, 0.707),
            MatrixType::Type2 => (0.707, 0.707, 0.707, 0.707),
            MatrixType::Type3 => (1.0, 0.866, 0.866, 0.866),
        }
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(MatrixType::Type1),
            2 => Some(MatrixType::Type2),
            3 => Some(MatrixType::Type3),
            _ => None,
        }
    }
}

/// Resolved down-mix parameters for one frame of one element.
#[derive(Debug, Clone)]
pub struct FrameParams {
    pub matrix_type: MatrixType,
    pub weight_type: u8,
    /// Effective weight after the cube-root curve.
    pub w_z: f32,
    /// Q7.8 dB down-mix gain per ladder step.
    pub dmix_gain_q: Vec<i16>,
}

impl FrameParams {
    pub fn unity(steps: usize) -> Self {
        Self {
            matrix_type: MatrixType::Type1,
            weight_type: 0,
            w_z: 0.0,
            dmix_gain_q: vec![0; steps],
        }
    }

    /// Linear gain of one ladder step, clamped to 1.0 on degenerate
    /// values so division never blows up.
    pub fn linear_gain(&self, step: usize) -> f32 {
        let db = crate::structs::parameter::q7_8_to_db(self.dmix_gain_q[step]);
        let lin = 10.0f32.powf(db / 20.0);
        if lin.is_finite() && lin > 0.0 { lin } else { 1.0 }
    }
}

/// Lifecycle phases of a channel-based element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementPhase {
    Created,
    DmpdStart,
    DmpdProcess,
    DmpdStop,
    LoudGainStart,
    LoudGainMeasure,
    LoudGainStop,
    Encode,
}

/// Owned per-channel sample buffers indexed by [`EncChannel`].
///
/// Derived channels get their own buffers; nothing aliases.
#[derive(Debug, Clone)]
pub struct ChannelBank {
    slots: Vec<Option<Vec<f32>>>,
}

impl ChannelBank {
    pub fn new() -> Self {
        Self {
            slots: vec![None; ENC_CHANNEL_COUNT],
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn set(&mut self, ch: EncChannel, data: Vec<f32>) {
        self.slots[ch.index()] = Some(data);
    }

    pub fn get(&self, ch: EncChannel) -> Option<&[f32]> {
        self.slots[ch.index()].as_deref()
    }

    pub fn get_mut(&mut self, ch: EncChannel) -> Option<&mut Vec<f32>> {
        self.slots[ch.index()].as_mut()
    }

    pub fn has(&self, ch: EncChannel) -> bool {
        self.slots[ch.index()].is_some()
    }

    /// Copies of two source channels, for derivations that read and
    /// write overlapping slots.
    pub fn pair(&self, a: EncChannel, b: EncChannel) -> Option<(Vec<f32>, Vec<f32>)> {
        Some((self.get(a)?.to_vec(), self.get(b)?.to_vec()))
    }
}

impl Default for ChannelBank {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn matrix_table() {
    assert_eq!(MatrixType::Type1.coeffs(), (1.0, 1.0, 0.707, 0.707));
    assert_eq!(MatrixType::Type2.coeffs(), (0.707, 0.707, 0.707, 0.707));
    assert_eq!(MatrixType::Type3.coeffs(), (1.0, 0.866, 0.866, 0.866));

    assert_eq!(MatrixType::from_wire(0), None);
    assert_eq!(MatrixType::from_wire(1), Some(MatrixType::Type1));
    assert_eq!(MatrixType::from_wire(4), None);
}

#[test]
fn unity_params_have_unit_gain() {
    let params = FrameParams::unity(3);
    assert_eq!(params.dmix_gain_q, vec![0, 0, 0]);
    assert_eq!(params.linear_gain(0), 1.0);
}
