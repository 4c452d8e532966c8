//! Descriptor OBU payloads.
//!
//! The descriptor prefix of a stream is an IA sequence header, one codec
//! config per codec configuration in use, one audio element OBU per
//! element and one mix presentation OBU per presentation. Writers and
//! readers are paired so the round trip can be checked without a
//! decoder.

use anyhow::{Result, bail};

use crate::structs::layout::ChannelLayout;
use crate::utils::bitstream_io::{BsIoSliceReader, BsIoWriter};
use crate::utils::errors::ObuError;

/// `"iamf"` as a big-endian fourcc.
pub const IA_CODE: u32 = 0x6961_6D66;

pub const PROFILE_SIMPLE: u8 = 0;

/// Parameter definition types carried in audio element OBUs.
pub const PARAM_DEFINITION_MIX_GAIN: u64 = 0;
pub const PARAM_DEFINITION_DEMIXING: u64 = 1;
pub const PARAM_DEFINITION_RECON_GAIN: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub primary_profile: u8,
    pub additional_profile: u8,
}

impl SequenceHeader {
    pub fn write_payload(&self) -> Result<Vec<u8>> {
        let mut w = BsIoWriter::default();
        w.put_n(32, IA_CODE)?;
        w.put_n(8, self.primary_profile)?;
        w.put_n(8, self.additional_profile)?;
        Ok(w.finish()?)
    }

    pub fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = BsIoSliceReader::from_slice(payload);

        let ia_code: u32 = r.get_n(32)?;
        if ia_code != IA_CODE {
            bail!(ObuError::InvalidIaCode(ia_code));
        }

        Ok(Self {
            primary_profile: r.get_n(8)?,
            additional_profile: r.get_n(8)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfig {
    pub codec_config_id: u32,
    /// Codec fourcc: `Opus`, `mp4a` or `ipcm`.
    pub codec_id: u32,
    pub num_samples_per_frame: u32,
    pub audio_roll_distance: i16,
    pub decoder_config: Vec<u8>,
}

impl CodecConfig {
    pub fn write_payload(&self) -> Result<Vec<u8>> {
        let mut w = BsIoWriter::default();
        w.put_leb128(self.codec_config_id as u64)?;
        w.put_n(32, self.codec_id)?;
        w.put_leb128(self.num_samples_per_frame as u64)?;
        w.put_s(16, self.audio_roll_distance)?;
        w.put_bytes(&self.decoder_config)?;
        Ok(w.finish()?)
    }

    pub fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = BsIoSliceReader::from_slice(payload);

        let codec_config_id = r.get_leb128()? as u32;
        let codec_id = r.get_n(32)?;
        let num_samples_per_frame = r.get_leb128()? as u32;
        let audio_roll_distance = r.get_s(16)?;

        let mut decoder_config = vec![0u8; (r.available()? / 8) as usize];
        r.get_bytes(&mut decoder_config)?;

        Ok(Self {
            codec_config_id,
            codec_id,
            num_samples_per_frame,
            audio_roll_distance,
            decoder_config,
        })
    }
}

/// Common parameter definition fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParamDefinition {
    pub parameter_id: u32,
    pub parameter_rate: u32,
    pub duration: u32,
}

impl ParamDefinition {
    fn write(&self, w: &mut BsIoWriter) -> Result<()> {
        w.put_leb128(self.parameter_id as u64)?;
        w.put_leb128(self.parameter_rate as u64)?;
        w.put_leb128(self.duration as u64)?;
        Ok(())
    }

    fn read(r: &mut BsIoSliceReader) -> Result<Self> {
        Ok(Self {
            parameter_id: r.get_leb128()? as u32,
            parameter_rate: r.get_leb128()? as u32,
            duration: r.get_leb128()? as u32,
        })
    }
}

/// One layer of the scalable channel layout config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelAudioLayer {
    pub loudspeaker_layout: ChannelLayout,
    pub output_gain_is_present: bool,
    pub recon_gain_is_present: bool,
    pub substream_count: u8,
    pub coupled_substream_count: u8,
    pub output_gain_flags: u8,
    pub output_gain: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioElementDescriptor {
    pub audio_element_id: u32,
    /// 0 = channel-based, 1 = scene-based.
    pub element_type: u8,
    pub codec_config_id: u32,
    pub substream_ids: Vec<u32>,
    pub parameters: Vec<(u64, ParamDefinition)>,
    pub layers: Vec<ChannelAudioLayer>,
}

impl AudioElementDescriptor {
    pub fn write_payload(&self) -> Result<Vec<u8>> {
        let mut w = BsIoWriter::default();

        w.put_leb128(self.audio_element_id as u64)?;
        w.put_n(3, self.element_type)?;
        w.put_n(5, 0u8)?;
        w.put_leb128(self.codec_config_id as u64)?;

        w.put_leb128(self.substream_ids.len() as u64)?;
        for &id in &self.substream_ids {
            w.put_leb128(id as u64)?;
        }

        w.put_leb128(self.parameters.len() as u64)?;
        for (definition_type, definition) in &self.parameters {
            w.put_leb128(*definition_type)?;
            definition.write(&mut w)?;
        }

        w.put_n(3, self.layers.len() as u8)?;
        w.put_n(5, 0u8)?;
        for layer in &self.layers {
            w.put_n(4, layer.loudspeaker_layout.code())?;
            w.put(layer.output_gain_is_present)?;
            w.put(layer.recon_gain_is_present)?;
            w.put_n(2, 0u8)?;
            w.put_n(8, layer.substream_count)?;
            w.put_n(8, layer.coupled_substream_count)?;

            if layer.output_gain_is_present {
                w.put_n(6, layer.output_gain_flags)?;
                w.put_n(2, 0u8)?;
                w.put_s(16, layer.output_gain)?;
            }
        }

        Ok(w.finish()?)
    }

    pub fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = BsIoSliceReader::from_slice(payload);

        let audio_element_id = r.get_leb128()? as u32;
        let element_type: u8 = r.get_n(3)?;
        let _reserved: u8 = r.get_n(5)?;
        let codec_config_id = r.get_leb128()? as u32;

        let num_substreams = r.get_leb128()? as usize;
        let mut substream_ids = Vec::with_capacity(num_substreams);
        for _ in 0..num_substreams {
            substream_ids.push(r.get_leb128()? as u32);
        }

        let num_parameters = r.get_leb128()? as usize;
        let mut parameters = Vec::with_capacity(num_parameters);
        for _ in 0..num_parameters {
            let definition_type = r.get_leb128()?;
            parameters.push((definition_type, ParamDefinition::read(&mut r)?));
        }

        let num_layers: u8 = r.get_n(3)?;
        let _reserved: u8 = r.get_n(5)?;
        let mut layers = Vec::with_capacity(num_layers as usize);
        for _ in 0..num_layers {
            let loudspeaker_layout = ChannelLayout::from_code(r.get_n(4)?)?;
            let output_gain_is_present = r.get()?;
            let recon_gain_is_present = r.get()?;
            let _reserved: u8 = r.get_n(2)?;
            let substream_count = r.get_n(8)?;
            let coupled_substream_count = r.get_n(8)?;

            let (output_gain_flags, output_gain) = if output_gain_is_present {
                let flags = r.get_n(6)?;
                let _reserved: u8 = r.get_n(2)?;
                (flags, r.get_s(16)?)
            } else {
                (0, 0)
            };

            layers.push(ChannelAudioLayer {
                loudspeaker_layout,
                output_gain_is_present,
                recon_gain_is_present,
                substream_count,
                coupled_substream_count,
                output_gain_flags,
                output_gain,
            });
        }

        Ok(Self {
            audio_element_id,
            element_type,
            codec_config_id,
            substream_ids,
            parameters,
            layers,
        })
    }
}

/// Measured loudness of one target layout, Q7.8 dB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoudnessInfo {
    pub info_type: u8,
    pub integrated_loudness: i16,
    pub digital_peak: i16,
    pub true_peak: i16,
}

/// A target layout a mix presentation was measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasuredLayout {
    SoundSystem(ChannelLayout),
    Binaural,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixElement {
    pub audio_element_id: u32,
    pub headphones_rendering_mode: u8,
    pub mix_gain: ParamDefinition,
    pub default_mix_gain: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixPresentationDescriptor {
    pub mix_presentation_id: u32,
    pub elements: Vec<MixElement>,
    pub output_mix_gain: ParamDefinition,
    pub default_output_mix_gain: i16,
    pub layouts: Vec<(MeasuredLayout, LoudnessInfo)>,
}

impl MixPresentationDescriptor {
    pub fn write_payload(&self) -> Result<Vec<u8>> {
        let mut w = BsIoWriter::default();

        w.put_leb128(self.mix_presentation_id as u64)?;
        // simple profile: a single sub mix
        w.put_leb128(1)?;

        w.put_leb128(self.elements.len() as u64)?;
        for element in &self.elements {
            w.put_leb128(element.audio_element_id as u64)?;
            w.put_n(2, element.headphones_rendering_mode)?;
            w.put_n(6, 0u8)?;
            element.mix_gain.write(&mut w)?;
            w.put_s(16, element.default_mix_gain)?;
        }

        self.output_mix_gain.write(&mut w)?;
        w.put_s(16, self.default_output_mix_gain)?;

        w.put_leb128(self.layouts.len() as u64)?;
        for (layout, loudness) in &self.layouts {
            match layout {
                MeasuredLayout::SoundSystem(system) => {
                    w.put_n(2, 2u8)?;
                    w.put_n(4, system.code())?;
                    w.put_n(2, 0u8)?;
                }
                MeasuredLayout::Binaural => {
                    w.put_n(2, 3u8)?;
                    w.put_n(6, 0u8)?;
                }
            }

            w.put_n(8, loudness.info_type)?;
            w.put_s(16, loudness.integrated_loudness)?;
            w.put_s(16, loudness.digital_peak)?;
            if loudness.info_type & 1 != 0 {
                w.put_s(16, loudness.true_peak)?;
            }
        }

        Ok(w.finish()?)
    }

    pub fn read_payload(payload: &[u8]) -> Result<Self> {
        let mut r = BsIoSliceReader::from_slice(payload);

        let mix_presentation_id = r.get_leb128()? as u32;
        let _num_sub_mixes = r.get_leb128()?;

        let num_elements = r.get_leb128()? as usize;
        let mut elements = Vec::with_capacity(num_elements);
        for _ in 0..num_elements {
            let audio_element_id = r.get_leb128()? as u32;
            let headphones_rendering_mode = r.get_n(2)?;
            let _reserved: u8 = r.get_n(6)?;
            let mix_gain = ParamDefinition::read(&mut r)?;
            let default_mix_gain = r.get_s(16)?;

            elements.push(MixElement {
                audio_element_id,
                headphones_rendering_mode,
                mix_gain,
                default_mix_gain,
            });
        }

        let output_mix_gain = ParamDefinition::read(&mut r)?;
        let default_output_mix_gain = r.get_s(16)?;

        let num_layouts = r.get_leb128()? as usize;
        let mut layouts = Vec::with_capacity(num_layouts);
        for _ in 0..num_layouts {
            let layout_type: u8 = r.get_n(2)?;
            let layout = match layout_type {
                2 => {
                    let system = ChannelLayout::from_code(r.get_n(4)?)?;
                    let _reserved: u8 = r.get_n(2)?;
                    MeasuredLayout::SoundSystem(system)
                }
                3 => {
                    let _reserved: u8 = r.get_n(6)?;
                    MeasuredLayout::Binaural
                }
                other => bail!(ObuError::InvalidLayoutType(other)),
            };

            let info_type: u8 = r.get_n(8)?;
            let integrated_loudness = r.get_s(16)?;
            let digital_peak = r.get_s(16)?;
            let true_peak = if info_type & 1 != 0 { r.get_s(16)? } else { 0 };

            layouts.push((
                layout,
                LoudnessInfo {
                    info_type,
                    integrated_loudness,
                    digital_peak,
                    true_peak,
                },
            ));
        }

        Ok(Self {
            mix_presentation_id,
            elements,
            output_mix_gain,
            default_output_mix_gain,
            layouts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn sequence_header_round_trip() -> Result<()> {
        let sh = SequenceHeader {
            primary_profile: PROFILE_SIMPLE,
            additional_profile: PROFILE_SIMPLE,
        };
        let payload = sh.write_payload()?;
        assert_eq!(payload.len(), 6);
        assert_eq!(&payload[..4], b"iamf");
        assert_eq!(SequenceHeader::read_payload(&payload)?, sh);
        Ok(())
    }

    #[test]
    fn audio_element_round_trip() -> Result<()> {
        let descriptor = AudioElementDescriptor {
            audio_element_id: 7,
            element_type: 0,
            codec_config_id: 1,
            substream_ids: vec![0, 1, 2, 3, 4],
            parameters: vec![
                (
                    PARAM_DEFINITION_DEMIXING,
                    ParamDefinition {
                        parameter_id: 100,
                        parameter_rate: 48000,
                        duration: 960,
                    },
                ),
                (
                    PARAM_DEFINITION_RECON_GAIN,
                    ParamDefinition {
                        parameter_id: 101,
                        parameter_rate: 48000,
                        duration: 960,
                    },
                ),
            ],
            layers: vec![
                ChannelAudioLayer {
                    loudspeaker_layout: ChannelLayout::Stereo,
                    output_gain_is_present: true,
                    recon_gain_is_present: false,
                    substream_count: 1,
                    coupled_substream_count: 1,
                    output_gain_flags: 0b100000,
                    output_gain: -256,
                },
                ChannelAudioLayer {
                    loudspeaker_layout: ChannelLayout::Surround512,
                    output_gain_is_present: false,
                    recon_gain_is_present: true,
                    substream_count: 4,
                    coupled_substream_count: 2,
                    output_gain_flags: 0,
                    output_gain: 0,
                },
            ],
        };

        let payload = descriptor.write_payload()?;
        assert_eq!(AudioElementDescriptor::read_payload(&payload)?, descriptor);
        Ok(())
    }

    #[test]
    fn mix_presentation_round_trip() -> Result<()> {
        let descriptor = MixPresentationDescriptor {
            mix_presentation_id: 42,
            elements: vec![MixElement {
                audio_element_id: 7,
                headphones_rendering_mode: 0,
                mix_gain: ParamDefinition {
                    parameter_id: 200,
                    parameter_rate: 48000,
                    duration: 960,
                },
                default_mix_gain: 0,
            }],
            output_mix_gain: ParamDefinition {
                parameter_id: 201,
                parameter_rate: 48000,
                duration: 960,
            },
            default_output_mix_gain: -512,
            layouts: vec![
                (
                    MeasuredLayout::SoundSystem(ChannelLayout::Stereo),
                    LoudnessInfo {
                        info_type: 1,
                        integrated_loudness: -6144, // -24 LUFS
                        digital_peak: -256,
                        true_peak: -128,
                    },
                ),
                (
                    MeasuredLayout::Binaural,
                    LoudnessInfo {
                        info_type: 0,
                        integrated_loudness: -5888,
                        digital_peak: -300,
                        true_peak: 0,
                    },
                ),
            ],
        };

        let payload = descriptor.write_payload()?;
        assert_eq!(
            MixPresentationDescriptor::read_payload(&payload)?,
            descriptor
        );
        Ok(())
    }
}
