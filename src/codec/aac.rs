//! AAC-LC backend over libfdk-aac. Compiled with the `aac` feature.

use anyhow::{Result, anyhow};
use fdk_aac::dec::{Decoder as FdkDecoder, Transport as DecTransport};
use fdk_aac::enc::{BitRate, ChannelMode, Encoder as FdkEncoder, EncoderParams, Transport};

use crate::codec::StreamCodec;
use crate::utils::errors::CodecError;

const BITRATE_PER_CHANNEL: u32 = 64_000;

pub struct AacStream {
    encoder: FdkEncoder,
    decoder: FdkDecoder,
    channels: usize,
    frame_size: usize,
    delay: usize,
    audio_specific_config: Vec<u8>,
    decoder_configured: bool,
}

impl AacStream {
    pub fn open(channels: usize, sample_rate: u32, frame_size: usize) -> Result<Self> {
        let channel_mode = match channels {
            1 => ChannelMode::Mono,
            2 => ChannelMode::Stereo,
            other => {
                return Err(anyhow!(CodecError::Open {
                    codec: "AAC-LC",
                    reason: format!("a sub-stream carries 1 or 2 channels, got {other}"),
                }));
            }
        };

        let encoder = FdkEncoder::new(EncoderParams {
            bit_rate: BitRate::Cbr(BITRATE_PER_CHANNEL * channels as u32),
            sample_rate,
            transport: Transport::Raw,
            channels: channel_mode,
        })
        .map_err(|e| CodecError::Open {
            codec: "AAC-LC",
            reason: format!("{e:?}"),
        })?;

        let info = encoder.info().map_err(|e| CodecError::Open {
            codec: "AAC-LC",
            reason: format!("{e:?}"),
        })?;

        let audio_specific_config = info.conf_buf[..info.conf_size as usize].to_vec();
        let delay = info.n_delay as usize;

        let decoder = FdkDecoder::new(DecTransport::Raw);

        Ok(Self {
            encoder,
            decoder,
            channels,
            frame_size,
            delay,
            audio_specific_config,
            decoder_configured: false,
        })
    }
}

impl StreamCodec for AacStream {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let info = self
            .encoder
            .encode(pcm, out)
            .map_err(|e| CodecError::SubstreamEncode {
                stream: 0,
                reason: format!("{e:?}"),
            })?;

        Ok(info.output_size)
    }

    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize> {
        if !self.decoder_configured {
            self.decoder
                .config_raw(&self.audio_specific_config)
                .map_err(|e| CodecError::SubstreamDecode {
                    stream: 0,
                    reason: format!("{e:?}"),
                })?;
            self.decoder_configured = true;
        }

        self.decoder
            .fill(packet)
            .map_err(|e| CodecError::SubstreamDecode {
                stream: 0,
                reason: format!("{e:?}"),
            })?;
        self.decoder
            .decode_frame(pcm)
            .map_err(|e| CodecError::SubstreamDecode {
                stream: 0,
                reason: format!("{e:?}"),
            })?;

        Ok(self.frame_size.min(pcm.len() / self.channels))
    }

    fn delay_samples(&self) -> usize {
        self.delay
    }

    fn decoder_config(&self) -> Vec<u8> {
        self.audio_specific_config.clone()
    }
}
