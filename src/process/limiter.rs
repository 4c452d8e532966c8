//! True-peak limiter with lookahead.
//!
//! Scans a ring of per-sample channel-peak maxima over the lookahead
//! window, attacks along an accelerating curve when the delayed signal
//! would exceed the threshold, and releases back to unity. The first
//! `lookahead` output samples are pre-roll silence and are discarded.

use crate::process::{
    LIMITER_ATTACK_SEC, LIMITER_LOOKAHEAD, LIMITER_RELEASE_SEC, LIMITER_THRESHOLD_DB,
};
use crate::utils::ring::PeakRing;

pub struct PeakLimiter {
    threshold_lin: f32,
    attack_sec: f32,
    release_sec: f32,
    inc_tc: f32,

    channels: usize,
    delay_size: usize,
    delay: Vec<Vec<f32>>,
    entry_index: usize,
    ring: PeakRing,

    current_gain: f32,
    target_start_gain: f32,
    target_end_gain: f32,
    current_tc: f32,

    padsize: usize,
    inited: bool,
}

impl PeakLimiter {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self::with_params(
            LIMITER_THRESHOLD_DB,
            sample_rate,
            channels,
            LIMITER_ATTACK_SEC,
            LIMITER_RELEASE_SEC,
            LIMITER_LOOKAHEAD,
        )
    }

    pub fn with_params(
        threshold_db: f32,
        sample_rate: u32,
        channels: usize,
        attack_sec: f32,
        release_sec: f32,
        delay_size: usize,
    ) -> Self {
        let delay_size = delay_size.max(1);

        Self {
            threshold_lin: 10.0f32.powf(threshold_db / 20.0),
            attack_sec,
            release_sec,
            inc_tc: 1.0 / sample_rate as f32,
            channels,
            delay_size,
            delay: vec![vec![0.0; delay_size]; channels],
            entry_index: 0,
            ring: PeakRing::new(delay_size),
            current_gain: 1.0,
            target_start_gain: -1.0,
            target_end_gain: -1.0,
            current_tc: -1.0,
            padsize: delay_size,
            inited: false,
        }
    }

    /// Samples of latency currently held back.
    pub fn delay(&self) -> usize {
        self.delay_size - self.padsize
    }

    #[cfg(test)]
    pub(crate) fn gain(&self) -> f32 {
        self.current_gain
    }

    /// Limits one block in place, planar channels. Returns the number
    /// of valid output samples after the pre-roll discard; the channel
    /// buffers are truncated accordingly.
    pub fn process_block(&mut self, channels: &mut [Vec<f32>]) -> usize {
        debug_assert_eq!(channels.len(), self.channels);

        let frame_size = channels.first().map(|c| c.len()).unwrap_or(0);

        for k in 0..frame_size {
            let idx = (k + self.entry_index) % self.delay_size;

            let peak = self.ring.max();
            let gain = self.compute_target_gain(peak);

            let mut peak_max = 0.0f32;
            for (ci, channel) in channels.iter_mut().enumerate() {
                let incoming = channel[k];
                channel[k] = self.delay[ci][idx] * gain;
                self.delay[ci][idx] = incoming;

                let channel_peak = incoming.abs();
                if channel_peak > peak_max {
                    peak_max = channel_peak;
                }
            }

            self.ring.push(peak_max);
        }

        self.entry_index = (self.entry_index + frame_size) % self.delay_size;

        let emitted = if !self.inited {
            if self.padsize >= frame_size {
                self.padsize -= frame_size;
                0
            } else {
                let pad = self.padsize;
                for channel in channels.iter_mut() {
                    channel.drain(..pad);
                }
                self.padsize = 0;
                self.inited = true;
                frame_size - pad
            }
        } else {
            frame_size
        };

        for channel in channels.iter_mut() {
            channel.truncate(emitted);
        }

        emitted
    }

    fn compute_target_gain(&mut self, peak: f32) -> f32 {
        if self.current_tc >= 0.0 && self.current_tc < self.attack_sec {
            self.current_tc += self.inc_tc;
            let ratio = curve_accel(self.current_tc / self.attack_sec);
            self.current_gain =
                self.target_start_gain - ratio * (self.target_start_gain - self.target_end_gain);
        } else if self.current_tc >= 0.0 && self.current_tc < self.attack_sec + self.release_sec {
            self.current_tc += self.inc_tc;
            let ratio = curve_accel((self.current_tc - self.attack_sec) / self.release_sec);
            self.current_gain = self.target_end_gain + ratio * (1.0 - self.target_end_gain);
        } else {
            self.current_gain = 1.0;
        }

        if !self.current_gain.is_finite() {
            self.current_gain = 1.0;
        }

        if peak * self.current_gain > self.threshold_lin {
            self.target_start_gain = self.current_gain;
            self.target_end_gain = self.threshold_lin / peak;
            self.current_tc = 0.0;
        }

        self.current_gain
    }
}

/// Accelerating curve through (0,0) and (1,1).
fn curve_accel(x: f32) -> f32 {
    if x > 1.0 {
        return 1.0;
    }
    if x < 0.0 {
        return 0.0;
    }
    1.0 - (x - 1.0) * (x - 1.0)
}
