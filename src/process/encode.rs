//! Encoder orchestration.
//!
//! Owns the element registry and mix presentations, drives the
//! per-element phase machine (down-mix parameter determination and
//! loudness/gain measurement must finish before the first `encode`),
//! runs the per-frame pipeline and assembles temporal units in
//! canonical OBU order: audio frames, then parameter blocks.

use std::collections::BTreeMap;

use anyhow::{Result, anyhow, bail};
use log::{debug, trace};

use crate::codec::{CodecId, MultistreamCodec};
use crate::process::dmpd::{DmixParamDeterminer, calc_w};
use crate::process::downmix::{DownMixer, fold_flags};
use crate::process::limiter::PeakLimiter;
use crate::process::loudness::LoudnessMeter;
use crate::process::upmix::UpMixer;
use crate::process::{ElementPhase, FrameParams, MAX_MEASURED_LAYOUTS, recon_gain};
use crate::structs::descriptor::{
    AudioElementDescriptor, ChannelAudioLayer, CodecConfig, LoudnessInfo, MeasuredLayout,
    MixElement, MixPresentationDescriptor, PARAM_DEFINITION_DEMIXING, PARAM_DEFINITION_RECON_GAIN,
    ParamDefinition, PROFILE_SIMPLE, SequenceHeader,
};
use crate::structs::frame::{Frame, Packet, SampleSpec, deinterleave_i16, interleave_i16};
use crate::structs::layout::{ChannelLayout, ScalableLadder};
use crate::structs::obu::{ObuHeader, ObuType, write_obu};
use crate::structs::parameter::{
    AnimatedParameter, ParameterBlock, ParameterPayload, q7_8_from_db,
};
use crate::utils::errors::{ConfigError, ObuError, StateError};

/// Encoder-wide configuration.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub sample_rate: u32,
    pub sample_spec: SampleSpec,
    pub codec: CodecId,
    pub frame_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbisonicsMode {
    Mono,
    Projection,
}

/// Scene-based element configs, accepted at the interface but not
/// implemented by this crate.
#[derive(Debug, Clone)]
pub struct AmbisonicsMonoConfig {
    pub output_channel_count: u8,
    pub substream_count: u8,
    pub channel_mapping: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AmbisonicsProjectionConfig {
    pub output_channel_count: u8,
    pub substream_count: u8,
    pub coupled_substream_count: u8,
    pub demixing_matrix: Vec<u16>,
}

#[derive(Debug, Clone)]
pub enum ElementConfig {
    /// A scalable chain ending at the input layout; a single entry is a
    /// non-scalable element.
    ChannelBased { chain: Vec<ChannelLayout> },
    SceneBased {
        mode: AmbisonicsMode,
        mono: Option<AmbisonicsMonoConfig>,
        projection: Option<AmbisonicsProjectionConfig>,
    },
}

/// One audio element inside a mix presentation.
#[derive(Debug, Clone)]
pub struct MixElementConfig {
    pub element_id: u32,
    pub headphones_rendering_mode: u8,
    pub default_mix_gain_db: f32,
    pub mix_gain_animation: Option<AnimatedParameter>,
}

#[derive(Debug, Clone)]
pub struct MixPresentation {
    pub elements: Vec<MixElementConfig>,
    pub default_output_mix_gain_db: f32,
    pub output_mix_gain_animation: Option<AnimatedParameter>,
    pub measured_layouts: Vec<MeasuredLayout>,
}

struct PendingFrame {
    layer_payloads: Vec<Vec<u8>>,
    trim_start: u32,
    trim_end: u32,
    demix_block: Option<ParameterBlock>,
    recon_block: Option<ParameterBlock>,
}

struct ElementState {
    id: u32,
    ladder: ScalableLadder,
    phase: ElementPhase,

    downmixer: DownMixer,
    upmixer: UpMixer,
    dmpd: DmixParamDeterminer,
    codecs: Vec<MultistreamCodec>,
    substream_ids: Vec<Vec<u32>>,

    demixing_param_id: u32,
    recon_param_id: u32,
    recon_gain_flag: bool,

    w_x: f32,
    lg_w_x: f32,
    lg_frame_index: usize,
    lg_peaks: Vec<f32>,
    dmix_gains_q: Vec<i16>,

    params_prev: FrameParams,
    frame_index: usize,
    pending: Option<PendingFrame>,
    finished: bool,
}

impl ElementState {
    fn is_scalable(&self) -> bool {
        self.ladder.is_scalable()
    }

    fn require_phase(&self, call: &'static str, allowed: &[ElementPhase]) -> Result<()> {
        if !allowed.contains(&self.phase) {
            bail!(StateError::WrongPhase {
                call,
                phase: self.phase,
                element: self.id
            });
        }
        Ok(())
    }

    /// Resolves the frame parameters for `frame_index` and advances the
    /// weight state.
    fn next_params(&mut self) -> FrameParams {
        let (matrix_type, weight_type) = self.dmpd.frame_params(self.frame_index);
        let (w_x, w_z) = calc_w(weight_type, self.w_x);
        self.w_x = w_x;

        FrameParams {
            matrix_type,
            weight_type,
            w_z,
            dmix_gain_q: self.dmix_gains_q.clone(),
        }
    }
}

/// Measurement state of one target layout, built once when the
/// loudness pass starts.
struct LayoutMeasure {
    render_layout: ChannelLayout,
    /// One renderer per presentation element; `None` when the element's
    /// input already is the target layout.
    renderers: Vec<Option<DownMixer>>,
    render_params: FrameParams,
    limiter: PeakLimiter,
    meter: LoudnessMeter,
}

struct MixPresentationState {
    id: u32,
    config: MixPresentation,
    element_mix_param_ids: Vec<u32>,
    output_mix_param_id: u32,
    measuring: Option<Vec<LayoutMeasure>>,
    measured: Vec<LoudnessInfo>,
}

/// The IAMF encoder handle.
///
/// Not safe for concurrent calls on the same instance; distinct
/// instances are independent.
pub struct IamfEncoder {
    config: EncoderConfig,
    elements: BTreeMap<u32, ElementState>,
    mixes: Vec<MixPresentationState>,

    next_element_id: u32,
    next_substream_id: u32,
    next_param_id: u32,
    next_mix_id: u32,
}

impl IamfEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        if !matches!(
            config.sample_rate,
            16000 | 24000 | 32000 | 44100 | 48000
        ) {
            bail!(ConfigError::UnsupportedSampleRate(config.sample_rate));
        }

        if !config
            .codec
            .valid_frame_size(config.frame_size, config.sample_rate)
        {
            bail!(ConfigError::InvalidFrameSize {
                frame_size: config.frame_size,
                codec: config.codec.name()
            });
        }

        Ok(Self {
            config,
            elements: BTreeMap::new(),
            mixes: Vec::new(),
            next_element_id: 0,
            next_substream_id: 0,
            next_param_id: 100,
            next_mix_id: 0,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Adds an audio element, returning its id.
    pub fn add_element(&mut self, element: ElementConfig) -> Result<u32> {
        let chain = match element {
            ElementConfig::ChannelBased { chain } => chain,
            ElementConfig::SceneBased { .. } => bail!(ConfigError::SceneBasedUnimplemented),
        };

        let ladder = ScalableLadder::new(&chain)?;

        let mut codecs = Vec::with_capacity(ladder.steps.len());
        let mut substream_ids = Vec::with_capacity(ladder.steps.len());
        for step in &ladder.steps {
            codecs.push(MultistreamCodec::open(
                self.config.codec,
                step.coupled_streams,
                step.mono_streams,
                self.config.sample_rate,
                self.config.frame_size,
            )?);

            let ids = (0..step.stream_count())
                .map(|i| self.next_substream_id + i as u32)
                .collect::<Vec<_>>();
            self.next_substream_id += ids.len() as u32;
            substream_ids.push(ids);
        }

        let id = self.next_element_id;
        self.next_element_id += 1;

        let demixing_param_id = self.next_param_id;
        let recon_param_id = self.next_param_id + 1;
        self.next_param_id += 2;

        let steps = ladder.steps.len();
        debug!(
            "add element {id}: {} layer(s), input {:?}",
            steps,
            ladder.input_layout()
        );

        let state = ElementState {
            id,
            downmixer: DownMixer::new(ladder.clone(), self.config.frame_size),
            upmixer: UpMixer::new(ladder.clone(), self.config.frame_size, true),
            ladder,
            phase: ElementPhase::Created,
            dmpd: DmixParamDeterminer::default(),
            codecs,
            substream_ids,
            demixing_param_id,
            recon_param_id,
            recon_gain_flag: true,
            w_x: 0.0,
            lg_w_x: 0.0,
            lg_frame_index: 0,
            lg_peaks: vec![0.0; steps],
            dmix_gains_q: vec![0; steps],
            params_prev: FrameParams::unity(steps),
            frame_index: 0,
            pending: None,
            finished: false,
        };

        self.elements.insert(id, state);
        Ok(id)
    }

    pub fn delete_element(&mut self, element_id: u32) -> Result<()> {
        self.elements
            .remove(&element_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!(ConfigError::UnknownElementId(element_id)))
    }

    pub fn set_mix_presentation(&mut self, mix: MixPresentation) -> Result<u32> {
        if mix.elements.is_empty() || mix.elements.len() > 2 {
            bail!(ConfigError::InvalidElementCount(mix.elements.len()));
        }
        if mix.measured_layouts.len() > MAX_MEASURED_LAYOUTS {
            bail!(ConfigError::TooManyMeasuredLayouts {
                max: MAX_MEASURED_LAYOUTS,
                actual: mix.measured_layouts.len()
            });
        }
        for element in &mix.elements {
            if !self.elements.contains_key(&element.element_id) {
                bail!(ConfigError::UnknownElementId(element.element_id));
            }
        }

        let element_mix_param_ids = (0..mix.elements.len())
            .map(|i| self.next_param_id + i as u32)
            .collect::<Vec<_>>();
        self.next_param_id += mix.elements.len() as u32 + 1;
        let output_mix_param_id = self.next_param_id - 1;

        let id = self.next_mix_id;
        self.next_mix_id += 1;

        let layout_count = mix.measured_layouts.len();
        self.mixes.push(MixPresentationState {
            id,
            config: mix,
            element_mix_param_ids,
            output_mix_param_id,
            measuring: None,
            measured: vec![LoudnessInfo::default(); layout_count],
        });

        Ok(id)
    }

    pub fn clear_mix_presentations(&mut self) {
        self.mixes.clear();
    }

    fn element_mut(&mut self, element_id: u32) -> Result<&mut ElementState> {
        self.elements
            .get_mut(&element_id)
            .ok_or_else(|| anyhow!(ConfigError::UnknownElementId(element_id)))
    }

    // --- down-mix parameter determination -------------------------------

    pub fn dmpd_start(&mut self, element_id: u32) -> Result<()> {
        let element = self.element_mut(element_id)?;
        element.require_phase(
            "dmpd_start",
            &[ElementPhase::Created, ElementPhase::DmpdStop],
        )?;
        element.dmpd.reset();
        element.phase = ElementPhase::DmpdStart;
        Ok(())
    }

    pub fn dmpd_process(&mut self, element_id: u32, pcm: &[u8]) -> Result<()> {
        let spec = self.config.sample_spec;
        let frame_size = self.config.frame_size;
        let element = self.element_mut(element_id)?;
        element.require_phase(
            "dmpd_process",
            &[ElementPhase::DmpdStart, ElementPhase::DmpdProcess],
        )?;

        let layout = element.ladder.input_layout();
        let channels = spec.deinterleave(pcm, layout.channel_count(), frame_size)?;
        element.dmpd.process_frame(layout, &channels);
        element.phase = ElementPhase::DmpdProcess;
        Ok(())
    }

    pub fn dmpd_stop(&mut self, element_id: u32) -> Result<()> {
        let element = self.element_mut(element_id)?;
        element.require_phase(
            "dmpd_stop",
            &[ElementPhase::DmpdStart, ElementPhase::DmpdProcess],
        )?;
        element.phase = ElementPhase::DmpdStop;
        Ok(())
    }

    /// Overrides the determined parameters (the external DMPD path).
    pub fn override_dmix_params(
        &mut self,
        element_id: u32,
        params: Vec<(crate::process::MatrixType, u8)>,
    ) -> Result<()> {
        let element = self.element_mut(element_id)?;
        element.dmpd.set_override(params);
        Ok(())
    }

    pub fn set_recon_gain_flag(&mut self, element_id: u32, flag: bool) -> Result<()> {
        let element = self.element_mut(element_id)?;
        element.recon_gain_flag = flag;
        element.upmixer.set_recon_gain_flag(flag);
        Ok(())
    }

    /// Codec delay of one layer, in samples.
    pub fn layer_delay(&self, element_id: u32, layer: usize) -> Result<usize> {
        let element = self
            .elements
            .get(&element_id)
            .ok_or_else(|| anyhow!(ConfigError::UnknownElementId(element_id)))?;
        element
            .codecs
            .get(layer)
            .map(|c| c.delay_samples())
            .ok_or_else(|| anyhow!("element {element_id} has no layer {layer}"))
    }

    // --- scalable loudness / gain measurement ---------------------------

    pub fn loudgain_start(&mut self, element_id: u32) -> Result<()> {
        let element = self.element_mut(element_id)?;
        element.require_phase(
            "loudgain_start",
            &[ElementPhase::DmpdStop, ElementPhase::LoudGainStop],
        )?;
        element.lg_w_x = 0.0;
        element.lg_frame_index = 0;
        element.lg_peaks.iter_mut().for_each(|p| *p = 0.0);
        element.phase = ElementPhase::LoudGainStart;
        Ok(())
    }

    /// Replays the determined down-mix over one frame and tracks the
    /// per-layer peaks that decide the down-mix gains.
    pub fn loudgain_measure(&mut self, element_id: u32, pcm: &[u8]) -> Result<()> {
        let spec = self.config.sample_spec;
        let frame_size = self.config.frame_size;
        let element = self.element_mut(element_id)?;
        element.require_phase(
            "loudgain_measure",
            &[ElementPhase::LoudGainStart, ElementPhase::LoudGainMeasure],
        )?;

        let layout = element.ladder.input_layout();
        let input = spec.deinterleave(pcm, layout.channel_count(), frame_size)?;

        let (matrix_type, weight_type) = element.dmpd.frame_params(element.lg_frame_index);
        let (w_x, w_z) = calc_w(weight_type, element.lg_w_x);
        element.lg_w_x = w_x;

        let params = FrameParams {
            matrix_type,
            weight_type,
            w_z,
            dmix_gain_q: vec![0; element.ladder.steps.len()],
        };

        let down = element.downmixer.process(&input, &params, &params)?;
        for (peak, layer) in element.lg_peaks.iter_mut().zip(&down.layers) {
            for channel in layer {
                for &sample in channel {
                    let mag = sample.abs();
                    if mag > *peak {
                        *peak = mag;
                    }
                }
            }
        }

        element.lg_frame_index += 1;
        element.phase = ElementPhase::LoudGainMeasure;
        Ok(())
    }

    /// Finalizes the per-layer down-mix gains: layers that clip get
    /// pulled down to full scale, everything else stays at unity.
    pub fn loudgain_stop(&mut self, element_id: u32) -> Result<()> {
        let element = self.element_mut(element_id)?;
        element.require_phase(
            "loudgain_stop",
            &[ElementPhase::LoudGainStart, ElementPhase::LoudGainMeasure],
        )?;

        let top = element.ladder.steps.len() - 1;
        for (si, &peak) in element.lg_peaks.iter().enumerate() {
            element.dmix_gains_q[si] = if si != top && peak > 1.0 {
                q7_8_from_db(-20.0 * peak.log10())
            } else {
                0
            };
        }

        trace!(
            "element {element_id}: dmix gains {:?} (Q7.8 dB)",
            element.dmix_gains_q
        );

        element.phase = ElementPhase::LoudGainStop;
        Ok(())
    }

    // --- mix presentation loudness --------------------------------------

    fn mix_mut(&mut self, mix_id: u32) -> Result<&mut MixPresentationState> {
        self.mixes
            .iter_mut()
            .find(|m| m.id == mix_id)
            .ok_or_else(|| anyhow!("unknown mix presentation {mix_id}"))
    }

    /// Builds the per-layout measurement state: limiter, meter and the
    /// element renderers, so the per-frame path reuses them.
    pub fn loudness_start(&mut self, mix_id: u32) -> Result<()> {
        let sample_rate = self.config.sample_rate;
        let frame_size = self.config.frame_size;

        let mix_index = self
            .mixes
            .iter()
            .position(|m| m.id == mix_id)
            .ok_or_else(|| anyhow!("unknown mix presentation {mix_id}"))?;

        let layouts = self.mixes[mix_index].config.measured_layouts.clone();
        let element_ids: Vec<u32> = self.mixes[mix_index]
            .config
            .elements
            .iter()
            .map(|e| e.element_id)
            .collect();

        let mut measuring = Vec::with_capacity(layouts.len());
        for layout in &layouts {
            let render_layout = match layout {
                MeasuredLayout::SoundSystem(l) => *l,
                MeasuredLayout::Binaural => ChannelLayout::Stereo,
            };

            let mut renderers = Vec::with_capacity(element_ids.len());
            for &element_id in &element_ids {
                let element = self
                    .elements
                    .get(&element_id)
                    .ok_or_else(|| anyhow!(ConfigError::UnknownElementId(element_id)))?;

                let input_layout = element.ladder.input_layout();
                renderers.push(if input_layout == render_layout {
                    None
                } else {
                    let ladder = ScalableLadder::new(&[render_layout, input_layout])?;
                    Some(DownMixer::new(ladder, frame_size))
                });
            }

            measuring.push(LayoutMeasure {
                render_layout,
                renderers,
                render_params: FrameParams::unity(2),
                limiter: PeakLimiter::new(sample_rate, render_layout.channel_count()),
                meter: LoudnessMeter::new(render_layout, sample_rate),
            });
        }

        self.mixes[mix_index].measuring = Some(measuring);
        Ok(())
    }

    /// Renders one frame of the presentation to every target layout,
    /// through the limiter, into the meters. `frames` carries one entry
    /// per element of the presentation.
    pub fn loudness_measure(&mut self, mix_id: u32, frames: &[Frame]) -> Result<()> {
        let spec = self.config.sample_spec;
        let frame_size = self.config.frame_size;

        let mix_index = self
            .mixes
            .iter()
            .position(|m| m.id == mix_id)
            .ok_or_else(|| anyhow!("unknown mix presentation {mix_id}"))?;

        let element_configs = self.mixes[mix_index].config.elements.clone();
        let output_gain =
            db_to_linear(self.mixes[mix_index].config.default_output_mix_gain_db);

        let measuring = self.mixes[mix_index]
            .measuring
            .as_mut()
            .ok_or_else(|| anyhow!(StateError::LoudnessNotStarted(mix_id)))?;

        for measure in measuring.iter_mut() {
            let mut mixed = vec![vec![0.0f32; frame_size]; measure.render_layout.channel_count()];

            for (ei, element_config) in element_configs.iter().enumerate() {
                let frame = frames
                    .iter()
                    .find(|f| f.element_id == element_config.element_id)
                    .ok_or_else(|| {
                        anyhow!("missing frame for element {}", element_config.element_id)
                    })?;

                let rendered = match &measure.renderers[ei] {
                    Some(renderer) => {
                        let input_layout = renderer.ladder().input_layout();
                        let input = spec.deinterleave(
                            frame.pcm,
                            input_layout.channel_count(),
                            frame_size,
                        )?;
                        let down = renderer.process(
                            &input,
                            &measure.render_params,
                            &measure.render_params,
                        )?;

                        measure
                            .render_layout
                            .channels()
                            .iter()
                            .map(|&ch| {
                                down.bank
                                    .get(ch)
                                    .map(|d| d.to_vec())
                                    .ok_or_else(|| anyhow!("channel {ch:?} not renderable"))
                            })
                            .collect::<Result<Vec<_>>>()?
                    }
                    None => spec.deinterleave(
                        frame.pcm,
                        measure.render_layout.channel_count(),
                        frame_size,
                    )?,
                };

                let gain = db_to_linear(element_config.default_mix_gain_db) * output_gain;
                for (mix_channel, rendered_channel) in mixed.iter_mut().zip(&rendered) {
                    for (m, &r) in mix_channel.iter_mut().zip(rendered_channel) {
                        *m += r * gain;
                    }
                }
            }

            measure.limiter.process_block(&mut mixed);
            measure.meter.push(&mixed);
        }

        Ok(())
    }

    /// Stops measuring and writes the loudness values back into the
    /// presentation.
    pub fn loudness_stop(&mut self, mix_id: u32) -> Result<()> {
        let mix = self.mix_mut(mix_id)?;
        let measuring = mix
            .measuring
            .take()
            .ok_or_else(|| anyhow!(StateError::LoudnessNotStarted(mix_id)))?;

        mix.measured = measuring
            .iter()
            .map(|measure| LoudnessInfo {
                info_type: 1,
                integrated_loudness: q7_8_from_db(measure.meter.integrated_lufs() as f32),
                digital_peak: q7_8_from_db(measure.meter.digital_peak_db() as f32),
                true_peak: q7_8_from_db(measure.meter.true_peak_db() as f32),
            })
            .collect();

        Ok(())
    }

    // --- per-frame encode -----------------------------------------------

    /// Submits one element's frame. Returns the temporal unit once
    /// every element has supplied its frame, an empty packet otherwise.
    pub fn encode(&mut self, frame: &Frame) -> Result<Packet> {
        let spec = self.config.sample_spec;
        let frame_size = self.config.frame_size;

        if frame.frame_size != frame_size {
            bail!(ConfigError::InvalidFrameSize {
                frame_size: frame.frame_size,
                codec: self.config.codec.name()
            });
        }

        let element = self
            .elements
            .get_mut(&frame.element_id)
            .ok_or_else(|| anyhow!(ConfigError::UnknownElementId(frame.element_id)))?;

        if element.pending.is_some() {
            bail!(StateError::DuplicateFrame {
                element: frame.element_id
            });
        }

        if element.is_scalable() {
            match element.phase {
                ElementPhase::LoudGainStop | ElementPhase::Encode => {}
                ElementPhase::Created
                | ElementPhase::DmpdStart
                | ElementPhase::DmpdProcess => {
                    bail!(StateError::DmpdNotStopped(frame.element_id))
                }
                _ => bail!(StateError::LoudGainNotStopped(frame.element_id)),
            }
        }
        element.phase = ElementPhase::Encode;

        let input_layout = element.ladder.input_layout();
        let input = spec.deinterleave(frame.pcm, input_layout.channel_count(), frame_size)?;

        let mut pending = Self::encode_element_frame(element, &input, frame_size, false)?;
        pending.trim_start += frame.num_samples_to_trim_at_start;
        pending.trim_end += frame.num_samples_to_trim_at_end;
        element.pending = Some(pending);

        self.try_assemble_unit()
    }

    /// Drains the codec delay: encodes one zero-padded tail frame per
    /// element and reports the trailing trim. Returns an empty packet
    /// when no element has delay to drain.
    pub fn flush(&mut self) -> Result<Packet> {
        let frame_size = self.config.frame_size;
        let mut any = false;

        let ids: Vec<u32> = self.elements.keys().copied().collect();
        for id in ids {
            let element = self
                .elements
                .get_mut(&id)
                .ok_or_else(|| anyhow!(ConfigError::UnknownElementId(id)))?;

            if element.finished || element.pending.is_some() {
                continue;
            }

            let delay = element
                .codecs
                .iter()
                .map(|c| c.delay_samples())
                .max()
                .unwrap_or(0);
            if delay == 0 || element.frame_index == 0 {
                element.finished = true;
                continue;
            }

            let input_layout = element.ladder.input_layout();
            let silence = vec![vec![0.0f32; frame_size]; input_layout.channel_count()];
            let mut pending = Self::encode_element_frame(element, &silence, frame_size, true)?;
            pending.trim_end = frame_size.saturating_sub(delay) as u32;
            element.pending = Some(pending);
            element.finished = true;
            any = true;
        }

        if !any {
            return Ok(Packet::default());
        }

        self.try_assemble_unit()
    }

    fn encode_element_frame(
        element: &mut ElementState,
        input: &[Vec<f32>],
        frame_size: usize,
        tail: bool,
    ) -> Result<PendingFrame> {
        let params = element.next_params();
        let prev = element.params_prev.clone();

        let down = element.downmixer.process(input, &prev, &params)?;

        let needs_decode = element.is_scalable() && element.recon_gain_flag && !tail;

        let mut layer_payloads = Vec::with_capacity(down.layers.len());
        let mut decoded_layers = Vec::with_capacity(down.layers.len());
        for (layer, codec) in down.layers.iter().zip(&mut element.codecs) {
            let refs: Vec<&[f32]> = layer.iter().map(|c| c.as_slice()).collect();
            let pcm = interleave_i16(&refs, frame_size);
            let payload = codec.encode(&pcm)?;
            if needs_decode {
                let decoded = codec.decode(&payload)?;
                decoded_layers.push(deinterleave_i16(
                    &decoded,
                    codec.channel_count(),
                    frame_size,
                ));
            }
            layer_payloads.push(payload);
        }

        let (demix_block, recon_block) = if element.is_scalable() {
            let demix = ParameterBlock {
                parameter_id: element.demixing_param_id,
                payload: ParameterPayload::Demixing {
                    matrix_type: params.matrix_type as u8,
                    weight_type: params.weight_type,
                },
            };

            let recon = if element.recon_gain_flag && !tail {
                let bank = element.upmixer.reconstruct(&decoded_layers, &prev, &params)?;
                let gains = recon_gain::estimate(&element.ladder, &down.bank, &bank);

                let mut smoothed = bank;
                element.upmixer.apply_smoothing(&mut smoothed, &gains)?;

                let layers = gains
                    .iter()
                    .skip(1)
                    .map(|g| (recon_gain::channel_mask(g.len()), g.clone()))
                    .collect();

                Some(ParameterBlock {
                    parameter_id: element.recon_param_id,
                    payload: ParameterPayload::ReconGain(layers),
                })
            } else {
                None
            };

            (Some(demix), recon)
        } else {
            (None, None)
        };

        let trim_start = if element.frame_index == 0 {
            element
                .codecs
                .iter()
                .map(|c| c.delay_samples())
                .max()
                .unwrap_or(0) as u32
        } else {
            0
        };

        element.params_prev = params;
        element.frame_index += 1;

        Ok(PendingFrame {
            layer_payloads,
            trim_start,
            trim_end: 0,
            demix_block,
            recon_block,
        })
    }

    /// Emits the temporal unit when every live element has a pending
    /// frame.
    fn try_assemble_unit(&mut self) -> Result<Packet> {
        let ready = self
            .elements
            .values()
            .all(|e| e.pending.is_some() || e.finished && e.pending.is_none());
        let any_pending = self.elements.values().any(|e| e.pending.is_some());

        if !ready || !any_pending {
            return Ok(Packet::default());
        }

        let frame_size = self.config.frame_size;
        let mut data = Vec::new();

        write_obu(
            &mut data,
            ObuType::TemporalDelimiter,
            &ObuHeader::default(),
            &[],
        )?;

        // audio frames first
        let mut parameter_blocks: Vec<ParameterBlock> = Vec::new();
        for element in self.elements.values_mut() {
            let Some(pending) = element.pending.take() else {
                continue;
            };

            for (layer_index, payload) in pending.layer_payloads.iter().enumerate() {
                let substream_id = element.substream_ids[layer_index][0];
                let trimming = pending.trim_start > 0 || pending.trim_end > 0;

                let header = ObuHeader {
                    trimming_status: trimming,
                    num_samples_to_trim_at_start: pending.trim_start,
                    num_samples_to_trim_at_end: pending.trim_end,
                    ..Default::default()
                };

                let (obu_type, body) = if substream_id <= 17 {
                    (ObuType::AudioFrameId(substream_id as u8), payload.clone())
                } else {
                    let mut body =
                        crate::utils::bitstream_io::BsIoWriter::default();
                    body.put_leb128(substream_id as u64)?;
                    body.put_bytes(payload)?;
                    (ObuType::AudioFrame, body.finish()?)
                };

                write_obu(&mut data, obu_type, &header, &body)?;
            }

            if let Some(block) = pending.demix_block {
                parameter_blocks.push(block);
            }
            if let Some(block) = pending.recon_block {
                parameter_blocks.push(block);
            }
        }

        // then parameter blocks: per-element demixing and recon gain,
        // per-presentation mix gains
        for block in &parameter_blocks {
            write_obu(
                &mut data,
                ObuType::ParameterBlock,
                &ObuHeader::default(),
                &block.write_payload()?,
            )?;
        }

        for mix in &self.mixes {
            for (element_config, &param_id) in
                mix.config.elements.iter().zip(&mix.element_mix_param_ids)
            {
                let animated = element_config.mix_gain_animation.clone().unwrap_or_else(|| {
                    AnimatedParameter::step(frame_size as u32, element_config.default_mix_gain_db)
                });
                let block = ParameterBlock {
                    parameter_id: param_id,
                    payload: ParameterPayload::MixGain(animated),
                };
                write_obu(
                    &mut data,
                    ObuType::ParameterBlock,
                    &ObuHeader::default(),
                    &block.write_payload()?,
                )?;
            }

            let animated = mix.config.output_mix_gain_animation.clone().unwrap_or_else(|| {
                AnimatedParameter::step(frame_size as u32, mix.config.default_output_mix_gain_db)
            });
            let block = ParameterBlock {
                parameter_id: mix.output_mix_param_id,
                payload: ParameterPayload::MixGain(animated),
            };
            write_obu(
                &mut data,
                ObuType::ParameterBlock,
                &ObuHeader::default(),
                &block.write_payload()?,
            )?;
        }

        Ok(Packet {
            data,
            samples: frame_size,
        })
    }

    // --- descriptor ------------------------------------------------------

    /// Writes the descriptor OBUs into `buf`, returning the total byte
    /// count. Nothing is written when the buffer is too small.
    pub fn get_descriptor(&self, buf: &mut [u8]) -> Result<usize> {
        let data = self.descriptor_bytes()?;

        if data.len() > buf.len() {
            bail!(ObuError::BufferTooSmall {
                need: data.len(),
                have: buf.len()
            });
        }

        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn descriptor_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();

        let header = SequenceHeader {
            primary_profile: PROFILE_SIMPLE,
            additional_profile: PROFILE_SIMPLE,
        };
        write_obu(
            &mut data,
            ObuType::SequenceHeader,
            &ObuHeader::default(),
            &header.write_payload()?,
        )?;

        let decoder_config = self
            .elements
            .values()
            .next()
            .map(|e| e.codecs[0].decoder_config())
            .unwrap_or_default();
        let codec_config = CodecConfig {
            codec_config_id: 0,
            codec_id: self.config.codec.fourcc(),
            num_samples_per_frame: self.config.frame_size as u32,
            audio_roll_distance: self.config.codec.audio_roll_distance(),
            decoder_config,
        };
        write_obu(
            &mut data,
            ObuType::CodecConfig,
            &ObuHeader::default(),
            &codec_config.write_payload()?,
        )?;

        for element in self.elements.values() {
            write_obu(
                &mut data,
                ObuType::AudioElement,
                &ObuHeader::default(),
                &self.element_descriptor(element).write_payload()?,
            )?;
        }

        for mix in &self.mixes {
            write_obu(
                &mut data,
                ObuType::MixPresentation,
                &ObuHeader::default(),
                &self.mix_descriptor(mix).write_payload()?,
            )?;
        }

        Ok(data)
    }

    fn element_descriptor(&self, element: &ElementState) -> AudioElementDescriptor {
        let definition = |parameter_id| ParamDefinition {
            parameter_id,
            parameter_rate: self.config.sample_rate,
            duration: self.config.frame_size as u32,
        };

        let parameters = if element.is_scalable() {
            let mut parameters = vec![(
                PARAM_DEFINITION_DEMIXING,
                definition(element.demixing_param_id),
            )];
            if element.recon_gain_flag {
                parameters.push((
                    PARAM_DEFINITION_RECON_GAIN,
                    definition(element.recon_param_id),
                ));
            }
            parameters
        } else {
            Vec::new()
        };

        let input_layout = element.ladder.input_layout();
        let top = element.ladder.steps.len() - 1;
        let layers = element
            .ladder
            .steps
            .iter()
            .enumerate()
            .map(|(si, step)| {
                let flagged = fold_flags(step.layout, input_layout, si == top);

                ChannelAudioLayer {
                    loudspeaker_layout: step.layout,
                    output_gain_is_present: !flagged.is_empty(),
                    recon_gain_is_present: element.recon_gain_flag && !step.demixed.is_empty(),
                    substream_count: step.stream_count() as u8,
                    coupled_substream_count: step.coupled_streams as u8,
                    output_gain_flags: if flagged.is_empty() { 0 } else { 0b100000 },
                    output_gain: element.dmix_gains_q[si],
                }
            })
            .collect();

        AudioElementDescriptor {
            audio_element_id: element.id,
            element_type: 0,
            codec_config_id: 0,
            substream_ids: element.substream_ids.iter().flatten().copied().collect(),
            parameters,
            layers,
        }
    }

    fn mix_descriptor(&self, mix: &MixPresentationState) -> MixPresentationDescriptor {
        let definition = |parameter_id| ParamDefinition {
            parameter_id,
            parameter_rate: self.config.sample_rate,
            duration: self.config.frame_size as u32,
        };

        MixPresentationDescriptor {
            mix_presentation_id: mix.id,
            elements: mix
                .config
                .elements
                .iter()
                .zip(&mix.element_mix_param_ids)
                .map(|(element, &param_id)| MixElement {
                    audio_element_id: element.element_id,
                    headphones_rendering_mode: element.headphones_rendering_mode,
                    mix_gain: definition(param_id),
                    default_mix_gain: q7_8_from_db(element.default_mix_gain_db),
                })
                .collect(),
            output_mix_gain: definition(mix.output_mix_param_id),
            default_output_mix_gain: q7_8_from_db(mix.config.default_output_mix_gain_db),
            layouts: mix
                .config
                .measured_layouts
                .iter()
                .zip(&mix.measured)
                .map(|(&layout, &loudness)| (layout, loudness))
                .collect(),
        }
    }
}

fn db_to_linear(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::layout::ChannelLayout::*;
    use crate::structs::obu::read_obus;
    use crate::utils::bitstream_io::BsIoSliceReader;
    use anyhow::Result;

    fn lpcm_encoder(frame_size: usize) -> Result<IamfEncoder> {
        IamfEncoder::new(EncoderConfig {
            sample_rate: 48000,
            sample_spec: SampleSpec::new(16, true)?,
            codec: CodecId::Lpcm,
            frame_size,
        })
    }

    fn interleaved_bytes(channels: &[Vec<i16>]) -> Vec<u8> {
        let frame_size = channels[0].len();
        let mut out = Vec::with_capacity(frame_size * channels.len() * 2);
        for i in 0..frame_size {
            for channel in channels {
                out.extend_from_slice(&channel[i].to_le_bytes());
            }
        }
        out
    }

    fn sine_i16(amplitude_db: f32, len: usize) -> Vec<i16> {
        let amplitude = 10.0f32.powf(amplitude_db / 20.0) * 32767.0;
        (0..len)
            .map(|i| {
                (amplitude
                    * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 48000.0).sin())
                .round() as i16
            })
            .collect()
    }

    #[test]
    fn mono_lpcm_passthrough() -> Result<()> {
        let mut encoder = lpcm_encoder(960)?;
        let id = encoder.add_element(ElementConfig::ChannelBased {
            chain: vec![Mono],
        })?;

        let tone = sine_i16(-6.0, 960);
        let pcm = interleaved_bytes(&[tone.clone()]);
        let packet = encoder.encode(&Frame {
            element_id: id,
            pcm: &pcm,
            frame_size: 960,
            ..Frame::default()
        })?;

        assert_eq!(packet.samples, 960);
        let obus = read_obus(&packet.data)?;
        assert_eq!(obus.len(), 2);
        assert_eq!(obus[0].obu_type, ObuType::TemporalDelimiter);
        assert_eq!(obus[1].obu_type, ObuType::AudioFrameId(0));

        // zero-delay codec: no trim signalled on the first frame
        assert!(!obus[1].header.trimming_status);

        // LPCM payload carries the input bit-exactly, big-endian
        let payload = &obus[1].payload;
        assert_eq!(payload.len(), 960 * 2);
        for (i, &sample) in tone.iter().enumerate() {
            assert_eq!(
                i16::from_be_bytes([payload[i * 2], payload[i * 2 + 1]]),
                sample
            );
        }

        Ok(())
    }

    #[test]
    fn silent_scalable_ladder_emits_full_scale_recon_gains() -> Result<()> {
        let mut encoder = lpcm_encoder(960)?;
        let id = encoder.add_element(ElementConfig::ChannelBased {
            chain: vec![Stereo, Surround512, Surround514],
        })?;

        let silent = interleaved_bytes(&vec![vec![0i16; 960]; 10]);

        encoder.dmpd_start(id)?;
        encoder.dmpd_process(id, &silent)?;
        encoder.dmpd_process(id, &silent)?;
        encoder.dmpd_stop(id)?;

        encoder.loudgain_start(id)?;
        encoder.loudgain_measure(id, &silent)?;
        encoder.loudgain_measure(id, &silent)?;
        encoder.loudgain_stop(id)?;

        let frame = Frame {
            element_id: id,
            pcm: &silent,
            frame_size: 960,
            ..Frame::default()
        };
        let first = encoder.encode(&frame)?;
        let second = encoder.encode(&frame)?;

        // deterministic output for identical input
        assert_eq!(first.data.len(), second.data.len());

        let obus = read_obus(&first.data)?;
        let audio_frames = obus
            .iter()
            .filter(|o| matches!(o.obu_type, ObuType::AudioFrameId(_)))
            .count();
        assert_eq!(audio_frames, 3);

        // recon gain parameter block: every byte 0xFF for silence
        let mut recon_seen = false;
        for obu in obus
            .iter()
            .filter(|o| o.obu_type == ObuType::ParameterBlock)
        {
            let mut r = BsIoSliceReader::from_slice(&obu.payload);
            let parameter_id = r.get_leb128()? as u32;
            if parameter_id != 101 {
                continue;
            }

            recon_seen = true;
            let num_layers = r.get_leb128()? as usize;
            assert_eq!(num_layers, 2);
            for _ in 0..num_layers {
                let mask = r.get_leb128()?;
                assert_eq!(mask, 0b11);
                for _ in 0..2 {
                    let gain: u8 = r.get_n(8)?;
                    assert_eq!(gain, 0xFF);
                }
            }
        }
        assert!(recon_seen);

        Ok(())
    }

    #[test]
    fn scalable_element_requires_pre_passes() -> Result<()> {
        let mut encoder = lpcm_encoder(960)?;
        let id = encoder.add_element(ElementConfig::ChannelBased {
            chain: vec![Stereo, Surround510],
        })?;

        let silent = interleaved_bytes(&vec![vec![0i16; 960]; 6]);
        let frame = Frame {
            element_id: id,
            pcm: &silent,
            frame_size: 960,
            ..Frame::default()
        };

        // encode before DMPD
        assert!(encoder.encode(&frame).is_err());

        encoder.dmpd_start(id)?;
        encoder.dmpd_process(id, &silent)?;
        encoder.dmpd_stop(id)?;

        // encode before loudness/gain measurement
        assert!(encoder.encode(&frame).is_err());

        // out-of-order calls are rejected
        assert!(encoder.loudgain_measure(id, &silent).is_err());

        encoder.loudgain_start(id)?;
        encoder.loudgain_measure(id, &silent)?;
        encoder.loudgain_stop(id)?;

        assert!(encoder.encode(&frame).is_ok());
        Ok(())
    }

    #[test]
    fn temporal_unit_waits_for_all_elements() -> Result<()> {
        let mut encoder = lpcm_encoder(960)?;
        let a = encoder.add_element(ElementConfig::ChannelBased { chain: vec![Mono] })?;
        let b = encoder.add_element(ElementConfig::ChannelBased {
            chain: vec![Stereo],
        })?;

        let mono = interleaved_bytes(&[vec![100i16; 960]]);
        let stereo = interleaved_bytes(&vec![vec![-100i16; 960]; 2]);

        let partial = encoder.encode(&Frame {
            element_id: a,
            pcm: &mono,
            frame_size: 960,
            ..Frame::default()
        })?;
        assert!(partial.data.is_empty());

        // same element twice within a unit is an error
        assert!(
            encoder
                .encode(&Frame {
                    element_id: a,
                    pcm: &mono,
                    frame_size: 960,
                    ..Frame::default()
                })
                .is_err()
        );

        let unit = encoder.encode(&Frame {
            element_id: b,
            pcm: &stereo,
            frame_size: 960,
            ..Frame::default()
        })?;
        assert!(!unit.data.is_empty());

        let obus = read_obus(&unit.data)?;
        let audio_frames = obus
            .iter()
            .filter(|o| matches!(o.obu_type, ObuType::AudioFrameId(_)))
            .count();
        assert_eq!(audio_frames, 2);

        Ok(())
    }

    #[test]
    fn descriptor_round_trip() -> Result<()> {
        let mut encoder = lpcm_encoder(960)?;
        let id = encoder.add_element(ElementConfig::ChannelBased {
            chain: vec![Stereo, Surround512],
        })?;
        encoder.set_mix_presentation(MixPresentation {
            elements: vec![MixElementConfig {
                element_id: id,
                headphones_rendering_mode: 0,
                default_mix_gain_db: -3.0,
                mix_gain_animation: None,
            }],
            default_output_mix_gain_db: 0.0,
            output_mix_gain_animation: None,
            measured_layouts: vec![
                MeasuredLayout::SoundSystem(Stereo),
                MeasuredLayout::Binaural,
            ],
        })?;

        let mut buf = vec![0u8; 4096];
        let len = encoder.get_descriptor(&mut buf)?;
        let obus = read_obus(&buf[..len])?;

        assert_eq!(obus.len(), 4);
        assert_eq!(obus[0].obu_type, ObuType::SequenceHeader);
        assert_eq!(obus[1].obu_type, ObuType::CodecConfig);
        assert_eq!(obus[2].obu_type, ObuType::AudioElement);
        assert_eq!(obus[3].obu_type, ObuType::MixPresentation);

        let header = SequenceHeader::read_payload(&obus[0].payload)?;
        assert_eq!(header.primary_profile, PROFILE_SIMPLE);

        let codec_config = CodecConfig::read_payload(&obus[1].payload)?;
        assert_eq!(codec_config.num_samples_per_frame, 960);
        assert_eq!(&codec_config.codec_id.to_be_bytes(), b"ipcm");

        let element = AudioElementDescriptor::read_payload(&obus[2].payload)?;
        assert_eq!(element.audio_element_id, id);
        assert_eq!(element.layers.len(), 2);
        assert_eq!(element.layers[0].loudspeaker_layout, Stereo);
        assert_eq!(element.layers[0].substream_count, 1);
        assert_eq!(element.layers[0].coupled_substream_count, 1);
        assert_eq!(element.layers[1].loudspeaker_layout, Surround512);
        assert_eq!(element.layers[1].substream_count, 4);
        assert_eq!(element.layers[1].coupled_substream_count, 2);
        assert_eq!(element.substream_ids, vec![0, 1, 2, 3, 4]);

        let mix = MixPresentationDescriptor::read_payload(&obus[3].payload)?;
        assert_eq!(mix.elements.len(), 1);
        assert_eq!(mix.elements[0].audio_element_id, id);
        assert_eq!(mix.elements[0].default_mix_gain, q7_8_from_db(-3.0));
        assert_eq!(mix.layouts.len(), 2);

        // no partial write on overflow
        let mut small = vec![0u8; 8];
        assert!(encoder.get_descriptor(&mut small).is_err());
        assert!(small.iter().all(|&b| b == 0));

        Ok(())
    }

    #[test]
    fn mix_loudness_measurement_writes_back() -> Result<()> {
        let mut encoder = lpcm_encoder(960)?;
        let id = encoder.add_element(ElementConfig::ChannelBased {
            chain: vec![Stereo],
        })?;
        let mix_id = encoder.set_mix_presentation(MixPresentation {
            elements: vec![MixElementConfig {
                element_id: id,
                headphones_rendering_mode: 0,
                default_mix_gain_db: 0.0,
                mix_gain_animation: None,
            }],
            default_output_mix_gain_db: 0.0,
            output_mix_gain_animation: None,
            measured_layouts: vec![MeasuredLayout::SoundSystem(Stereo)],
        })?;

        let tone = sine_i16(-6.0, 960);
        let pcm = interleaved_bytes(&[tone.clone(), tone]);

        encoder.loudness_start(mix_id)?;
        for _ in 0..60 {
            encoder.loudness_measure(
                mix_id,
                &[Frame {
                    element_id: id,
                    pcm: &pcm,
                    frame_size: 960,
                    ..Frame::default()
                }],
            )?;
        }
        encoder.loudness_stop(mix_id)?;

        let mix = &encoder.mixes[0];
        let integrated = mix.measured[0].integrated_loudness as f32 / 256.0;
        // a -6 dBFS stereo tone sits near -6.7 LUFS; the limiter leaves
        // it untouched
        assert!((-8.0..=-1.0).contains(&integrated), "got {integrated}");
        assert!(mix.measured[0].digital_peak <= 0);

        Ok(())
    }

    #[test]
    fn trim_accounting_balances() -> Result<()> {
        // exercised with Opus, which has real codec delay
        let mut encoder = IamfEncoder::new(EncoderConfig {
            sample_rate: 48000,
            sample_spec: SampleSpec::new(16, true)?,
            codec: CodecId::Opus,
            frame_size: 960,
        })?;
        let id = encoder.add_element(ElementConfig::ChannelBased {
            chain: vec![Stereo],
        })?;

        let delay = encoder.layer_delay(id, 0)?;
        assert!(delay > 0);

        let tone = sine_i16(-6.0, 960);
        let pcm = interleaved_bytes(&[tone.clone(), tone]);
        let frame = Frame {
            element_id: id,
            pcm: &pcm,
            frame_size: 960,
            ..Frame::default()
        };

        let mut trim_start = 0u64;
        let mut trim_end = 0u64;
        let mut units = 0u64;

        for packet in [encoder.encode(&frame)?, encoder.encode(&frame)?, encoder.flush()?] {
            for obu in read_obus(&packet.data)? {
                if matches!(obu.obu_type, ObuType::AudioFrameId(_)) {
                    units += 1;
                    trim_start += obu.header.num_samples_to_trim_at_start as u64;
                    trim_end += obu.header.num_samples_to_trim_at_end as u64;
                }
            }
        }

        // sum(trim_start) + input_samples + sum(trim_end) covers every
        // decoded sample
        assert_eq!(units, 3);
        assert_eq!(trim_start, delay as u64);
        assert_eq!(trim_end, (960 - delay) as u64);
        assert_eq!(units * 960, trim_start + 2 * 960 + trim_end);

        Ok(())
    }
}
