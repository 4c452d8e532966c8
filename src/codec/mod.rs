//! Waveform codec adapters.
//!
//! A layer of a scalable element encodes as `coupled + mono` independent
//! codec instances in lock-step. The backends are byte-in/byte-out: each
//! consumes exactly one frame of interleaved samples and produces one
//! packet; the adapter concatenates the per-stream packets, each with a
//! ULEB128 length prefix unless the layer has a single stream.
//!
//! Backends also re-decode their own packets: the reconstruction-gain
//! estimator runs on what a decoder would see.

use anyhow::{Result, bail};

use crate::utils::bitstream_io::{BsIoSliceReader, BsIoWriter};
use crate::utils::errors::{CodecError, ConfigError};

#[cfg(feature = "aac")]
pub mod aac;
pub mod lpcm;
pub mod opus;

/// Maximum encoded bytes per sub-stream packet.
pub const MAX_STREAM_PACKET: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    Opus,
    AacLc,
    Lpcm,
}

impl CodecId {
    pub fn from_raw(id: u32) -> Result<Self> {
        Ok(match id {
            1 => CodecId::Opus,
            2 => CodecId::AacLc,
            3 => CodecId::Lpcm,
            other => bail!(ConfigError::UnknownCodecId(other)),
        })
    }

    /// Codec fourcc carried in the codec config OBU.
    pub fn fourcc(self) -> u32 {
        match self {
            CodecId::Opus => u32::from_be_bytes(*b"Opus"),
            CodecId::AacLc => u32::from_be_bytes(*b"mp4a"),
            CodecId::Lpcm => u32::from_be_bytes(*b"ipcm"),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::Opus => "Opus",
            CodecId::AacLc => "AAC-LC",
            CodecId::Lpcm => "LPCM",
        }
    }

    pub fn audio_roll_distance(self) -> i16 {
        match self {
            CodecId::Opus => -4,
            CodecId::AacLc => -1,
            CodecId::Lpcm => 0,
        }
    }

    pub fn valid_frame_size(self, frame_size: usize, sample_rate: u32) -> bool {
        match self {
            CodecId::Opus => {
                let base = sample_rate as usize / 400; // 2.5 ms
                [base, base * 2, base * 4, base * 8, base * 16, base * 24].contains(&frame_size)
            }
            CodecId::AacLc => frame_size == 1024,
            CodecId::Lpcm => frame_size > 0,
        }
    }
}

/// One codec instance: the backend contract of the adapter.
pub trait StreamCodec {
    /// Encodes exactly one frame of interleaved samples, returns the
    /// packet length written into `out`.
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize>;

    /// Decodes one packet back to interleaved samples, returns samples
    /// per channel.
    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize>;

    /// Algorithmic delay in samples.
    fn delay_samples(&self) -> usize;

    /// Codec-specific bytes for the codec config OBU.
    fn decoder_config(&self) -> Vec<u8>;
}

fn open_stream(
    codec: CodecId,
    channels: usize,
    sample_rate: u32,
    frame_size: usize,
) -> Result<Box<dyn StreamCodec>> {
    Ok(match codec {
        CodecId::Opus => Box::new(opus::OpusStream::open(channels, sample_rate, frame_size)?),
        CodecId::Lpcm => Box::new(lpcm::LpcmStream::open(channels, sample_rate, frame_size)),
        #[cfg(feature = "aac")]
        CodecId::AacLc => Box::new(aac::AacStream::open(channels, sample_rate, frame_size)?),
        #[cfg(not(feature = "aac"))]
        CodecId::AacLc => bail!(CodecError::BackendUnavailable("AAC-LC")),
    })
}

struct SubStream {
    codec: Box<dyn StreamCodec>,
    channels: usize,
}

/// Lock-step multi-stream adapter for one layer.
pub struct MultistreamCodec {
    codec_id: CodecId,
    frame_size: usize,
    channels: usize,
    streams: Vec<SubStream>,
}

impl MultistreamCodec {
    /// Opens `coupled` two-channel streams followed by `mono`
    /// single-channel streams. Channel order across streams matches the
    /// layer's transmission order.
    pub fn open(
        codec_id: CodecId,
        coupled: usize,
        mono: usize,
        sample_rate: u32,
        frame_size: usize,
    ) -> Result<Self> {
        if !codec_id.valid_frame_size(frame_size, sample_rate) {
            bail!(ConfigError::InvalidFrameSize {
                frame_size,
                codec: codec_id.name()
            });
        }

        let mut streams = Vec::with_capacity(coupled + mono);
        for _ in 0..coupled {
            streams.push(SubStream {
                codec: open_stream(codec_id, 2, sample_rate, frame_size)?,
                channels: 2,
            });
        }
        for _ in 0..mono {
            streams.push(SubStream {
                codec: open_stream(codec_id, 1, sample_rate, frame_size)?,
                channels: 1,
            });
        }

        Ok(Self {
            codec_id,
            frame_size,
            channels: coupled * 2 + mono,
            streams,
        })
    }

    pub fn codec_id(&self) -> CodecId {
        self.codec_id
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    pub fn delay_samples(&self) -> usize {
        self.streams
            .iter()
            .map(|s| s.codec.delay_samples())
            .max()
            .unwrap_or(0)
    }

    pub fn decoder_config(&self) -> Vec<u8> {
        self.streams
            .first()
            .map(|s| s.codec.decoder_config())
            .unwrap_or_default()
    }

    /// Encodes one frame of `channels` interleaved samples.
    ///
    /// Output is the concatenation of per-stream packets, each preceded
    /// by its ULEB128 length except when the layer has a single stream.
    /// Any sub-stream failure discards the whole layer.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        if pcm.len() != self.frame_size * self.channels {
            bail!(ConfigError::InvalidFrameSize {
                frame_size: pcm.len(),
                codec: self.codec_id.name()
            });
        }

        let single = self.streams.len() == 1;
        let mut w = BsIoWriter::default();
        let mut scratch = vec![0u8; MAX_STREAM_PACKET.max(self.frame_size * 4)];
        let mut stream_pcm = Vec::new();
        let mut base_channel = 0;

        for (si, stream) in self.streams.iter_mut().enumerate() {
            stream_pcm.clear();
            stream_pcm.reserve(self.frame_size * stream.channels);
            for sample in 0..self.frame_size {
                for ch in 0..stream.channels {
                    stream_pcm.push(pcm[sample * self.channels + base_channel + ch]);
                }
            }

            let len = stream
                .codec
                .encode(&stream_pcm, &mut scratch)
                .map_err(|e| CodecError::SubstreamEncode {
                    stream: si,
                    reason: e.to_string(),
                })?;

            if !single {
                w.put_leb128(len as u64)?;
            }
            w.put_bytes(&scratch[..len])?;

            base_channel += stream.channels;
        }

        Ok(w.finish()?)
    }

    /// Decodes a packet produced by [`Self::encode`] back to interleaved
    /// samples.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let mut out = vec![0i16; self.frame_size * self.channels];
        let mut r = BsIoSliceReader::from_slice(packet);
        let single = self.streams.len() == 1;
        let mut stream_pcm = vec![0i16; self.frame_size * 2];
        let mut base_channel = 0;

        for (si, stream) in self.streams.iter_mut().enumerate() {
            let len = if single {
                packet.len()
            } else {
                r.get_leb128()? as usize
            };

            let mut bytes = vec![0u8; len];
            r.get_bytes(&mut bytes)?;

            let decoded = stream
                .codec
                .decode(&bytes, &mut stream_pcm)
                .map_err(|e| CodecError::SubstreamDecode {
                    stream: si,
                    reason: e.to_string(),
                })?;

            for sample in 0..decoded.min(self.frame_size) {
                for ch in 0..stream.channels {
                    out[sample * self.channels + base_channel + ch] =
                        stream_pcm[sample * stream.channels + ch];
                }
            }

            base_channel += stream.channels;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn codec_id_mapping() -> Result<()> {
        assert_eq!(CodecId::from_raw(1)?, CodecId::Opus);
        assert_eq!(CodecId::from_raw(2)?, CodecId::AacLc);
        assert!(CodecId::from_raw(9).is_err());
        assert_eq!(&CodecId::Opus.fourcc().to_be_bytes(), b"Opus");
        Ok(())
    }

    #[test]
    fn lpcm_multistream_round_trip() -> Result<()> {
        // 1 coupled + 2 mono, like the upper layer of a 3.1.2 chain
        let mut ms = MultistreamCodec::open(CodecId::Lpcm, 1, 2, 48000, 8)?;
        assert_eq!(ms.stream_count(), 3);
        assert_eq!(ms.channel_count(), 4);
        assert_eq!(ms.delay_samples(), 0);

        let pcm: Vec<i16> = (0..8 * 4).map(|i| (i * 17) as i16).collect();
        let packet = ms.encode(&pcm)?;
        let decoded = ms.decode(&packet)?;
        assert_eq!(decoded, pcm);

        Ok(())
    }

    #[test]
    fn single_stream_has_no_length_prefix() -> Result<()> {
        let mut ms = MultistreamCodec::open(CodecId::Lpcm, 1, 0, 48000, 4)?;
        let pcm: Vec<i16> = vec![100, -100, 200, -200, 300, -300, 400, -400];
        let packet = ms.encode(&pcm)?;

        // raw big-endian samples, no ULEB prefix
        assert_eq!(packet.len(), 8 * 2);
        assert_eq!(&packet[..2], &100i16.to_be_bytes());

        Ok(())
    }

    #[test]
    fn frame_size_validation() {
        assert!(MultistreamCodec::open(CodecId::Opus, 1, 0, 48000, 961).is_err());
        assert!(CodecId::Opus.valid_frame_size(960, 48000));
        assert!(CodecId::AacLc.valid_frame_size(1024, 48000));
        assert!(!CodecId::AacLc.valid_frame_size(960, 48000));
    }
}
