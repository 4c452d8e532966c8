//! Reconstruction-gain estimation.
//!
//! Compares the energy of the genuine channels retained from the
//! un-degraded top layer against the channels a decoder reconstructs
//! from re-decoded lower layers, and emits the Q0.8 factor restoring
//! the original loudness.

use crate::process::{CHUNK_SIZE, ChannelBank};
use crate::structs::layout::ScalableLadder;
use crate::structs::parameter::q0_8_from_gain;

const ENERGY_FLOOR: f64 = 1e-12;

fn energy(data: &[f32], chunk: usize) -> f64 {
    data.iter()
        .take(chunk)
        .map(|&x| (x as f64) * (x as f64))
        .sum()
}

/// Gain for one channel: `min(1, sqrt(E_orig / E_recon))`.
///
/// A dead reconstruction cannot be amplified back, so it keeps unity;
/// a dead original mutes a noisy reconstruction outright.
fn channel_gain(e_orig: f64, e_recon: f64) -> f32 {
    if e_recon < ENERGY_FLOOR {
        1.0
    } else if e_orig < ENERGY_FLOOR {
        0.0
    } else {
        (e_orig / e_recon).sqrt().min(1.0) as f32
    }
}

/// Per-step Q0.8 gains for every demixed channel of the ladder.
///
/// The base layer carries no reconstructed channels and yields an empty
/// entry; channels missing from either bank keep unity gain.
pub fn estimate(
    ladder: &ScalableLadder,
    original: &ChannelBank,
    reconstructed: &ChannelBank,
) -> Vec<Vec<u8>> {
    ladder
        .steps
        .iter()
        .map(|step| {
            step.demixed
                .iter()
                .map(|&ch| {
                    let gain = match (original.get(ch), reconstructed.get(ch)) {
                        (Some(orig), Some(recon)) => {
                            channel_gain(energy(orig, CHUNK_SIZE), energy(recon, CHUNK_SIZE))
                        }
                        _ => 1.0,
                    };
                    q0_8_from_gain(gain)
                })
                .collect()
        })
        .collect()
}

/// Bitmask over a step's demixed channels, one bit per channel in list
/// order, for the recon-gain parameter payload.
pub fn channel_mask(gain_count: usize) -> u32 {
    (1u32 << gain_count) - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::layout::{ChannelLayout::*, EncChannel, ScalableLadder};
    use anyhow::Result;

    #[test]
    fn silent_input_yields_full_scale_gains() -> Result<()> {
        let ladder = ScalableLadder::new(&[Stereo, Surround510])?;

        let mut original = ChannelBank::new();
        let mut reconstructed = ChannelBank::new();
        for bank in [&mut original, &mut reconstructed] {
            bank.set(EncChannel::Sl5, vec![0.0; 960]);
            bank.set(EncChannel::Sr5, vec![0.0; 960]);
        }

        let gains = estimate(&ladder, &original, &reconstructed);
        assert_eq!(gains.len(), 2);
        assert!(gains[0].is_empty());
        assert_eq!(gains[1], vec![0xFF, 0xFF]);

        Ok(())
    }

    #[test]
    fn lossy_reconstruction_attenuates() -> Result<()> {
        let ladder = ScalableLadder::new(&[Stereo, Surround510])?;

        let mut original = ChannelBank::new();
        let mut reconstructed = ChannelBank::new();

        // reconstruction came back 2x too hot: gain must halve it
        original.set(EncChannel::Sl5, vec![0.25; 960]);
        reconstructed.set(EncChannel::Sl5, vec![0.5; 960]);
        // and the mirrored channel lost half: gain saturates at unity
        original.set(EncChannel::Sr5, vec![0.5; 960]);
        reconstructed.set(EncChannel::Sr5, vec![0.25; 960]);

        let gains = estimate(&ladder, &original, &reconstructed);
        assert_eq!(gains[1][0], q0_8_from_gain(0.5));
        assert_eq!(gains[1][1], 0xFF);

        Ok(())
    }

    #[test]
    fn dead_original_mutes() {
        assert_eq!(channel_gain(0.0, 1.0), 0.0);
        assert_eq!(channel_gain(1.0, 0.0), 1.0);
        assert_eq!(channel_gain(0.0, 0.0), 1.0);
    }

    #[test]
    fn mask_covers_channel_count() {
        assert_eq!(channel_mask(0), 0);
        assert_eq!(channel_mask(2), 0b11);
        assert_eq!(channel_mask(4), 0b1111);
    }
}
