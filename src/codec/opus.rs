//! Opus backend over libopus.

use anyhow::{Result, anyhow};

use crate::codec::StreamCodec;
use crate::utils::errors::CodecError;

const BITRATE_PER_CHANNEL: i32 = 64_000;

pub struct OpusStream {
    encoder: opus::Encoder,
    decoder: opus::Decoder,
    channels: usize,
    sample_rate: u32,
    pre_skip: usize,
}

impl OpusStream {
    pub fn open(channels: usize, sample_rate: u32, _frame_size: usize) -> Result<Self> {
        let opus_channels = match channels {
            1 => opus::Channels::Mono,
            2 => opus::Channels::Stereo,
            other => {
                return Err(anyhow!(CodecError::Open {
                    codec: "Opus",
                    reason: format!("a sub-stream carries 1 or 2 channels, got {other}"),
                }));
            }
        };

        let mut encoder =
            opus::Encoder::new(sample_rate, opus_channels, opus::Application::Audio).map_err(
                |e| CodecError::Open {
                    codec: "Opus",
                    reason: e.to_string(),
                },
            )?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(BITRATE_PER_CHANNEL * channels as i32))
            .map_err(|e| CodecError::Open {
                codec: "Opus",
                reason: e.to_string(),
            })?;

        let pre_skip = encoder.get_lookahead().map_err(|e| CodecError::Open {
            codec: "Opus",
            reason: e.to_string(),
        })? as usize;

        let decoder =
            opus::Decoder::new(sample_rate, opus_channels).map_err(|e| CodecError::Open {
                codec: "Opus",
                reason: e.to_string(),
            })?;

        Ok(Self {
            encoder,
            decoder,
            channels,
            sample_rate,
            pre_skip,
        })
    }
}

impl StreamCodec for OpusStream {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        Ok(self.encoder.encode(pcm, out)?)
    }

    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize> {
        Ok(self.decoder.decode(packet, pcm, false)?)
    }

    fn delay_samples(&self) -> usize {
        self.pre_skip
    }

    /// Opus decoder config per RFC 7845, big-endian field order.
    fn decoder_config(&self) -> Vec<u8> {
        let mut config = Vec::with_capacity(11);
        config.push(1); // version
        config.push(self.channels as u8);
        config.extend_from_slice(&(self.pre_skip as u16).to_be_bytes());
        config.extend_from_slice(&self.sample_rate.to_be_bytes());
        config.extend_from_slice(&0i16.to_be_bytes()); // output gain
        config.push(0); // channel mapping family
        config
    }
}
