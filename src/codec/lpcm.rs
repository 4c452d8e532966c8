//! LPCM backend (`ipcm`): big-endian 16-bit samples, zero delay.
//!
//! Besides being a legal IAMF codec configuration this backend gives
//! the pipeline a bit-exact path, which the algebraic tests rely on.

use anyhow::{Result, bail};

use crate::codec::StreamCodec;
use crate::utils::errors::CodecError;

pub struct LpcmStream {
    channels: usize,
    sample_rate: u32,
}

impl LpcmStream {
    pub fn open(channels: usize, sample_rate: u32, _frame_size: usize) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }
}

impl StreamCodec for LpcmStream {
    fn encode(&mut self, pcm: &[i16], out: &mut [u8]) -> Result<usize> {
        let need = pcm.len() * 2;
        if out.len() < need {
            bail!(CodecError::SubstreamEncode {
                stream: 0,
                reason: format!("output buffer too small for {need} bytes"),
            });
        }

        for (i, &sample) in pcm.iter().enumerate() {
            out[i * 2..i * 2 + 2].copy_from_slice(&sample.to_be_bytes());
        }

        Ok(need)
    }

    fn decode(&mut self, packet: &[u8], pcm: &mut [i16]) -> Result<usize> {
        let samples = packet.len() / 2;
        for (i, pair) in packet.chunks_exact(2).enumerate() {
            pcm[i] = i16::from_be_bytes([pair[0], pair[1]]);
        }

        Ok(samples / self.channels)
    }

    fn delay_samples(&self) -> usize {
        0
    }

    fn decoder_config(&self) -> Vec<u8> {
        // sample_format_flags (0 = big-endian), sample_size, sample_rate
        let mut config = vec![0u8, 16];
        config.extend_from_slice(&self.sample_rate.to_be_bytes());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn round_trip_is_bit_exact() -> Result<()> {
        let mut stream = LpcmStream::open(2, 48000, 4);
        let pcm = [0i16, -1, i16::MAX, i16::MIN, 5, -5, 100, -100];
        let mut packet = [0u8; 16];
        let len = stream.encode(&pcm, &mut packet)?;
        assert_eq!(len, 16);

        let mut decoded = [0i16; 8];
        let samples = stream.decode(&packet, &mut decoded)?;
        assert_eq!(samples, 4);
        assert_eq!(decoded, pcm);

        Ok(())
    }

    #[test]
    fn decoder_config_carries_rate() {
        let stream = LpcmStream::open(1, 48000, 960);
        let config = stream.decoder_config();
        assert_eq!(config, vec![0, 16, 0x00, 0x00, 0xBB, 0x80]);
    }
}
