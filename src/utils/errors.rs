#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Unknown codec id: {0}")]
    UnknownCodecId(u32),

    #[error("Invalid frame size {frame_size} for codec {codec}")]
    InvalidFrameSize { frame_size: usize, codec: &'static str },

    #[error("Unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    #[error("bits_per_sample must be 16, 24 or 32. Got {0}")]
    InvalidBitDepth(u8),

    #[error("Scene-based audio elements are not implemented")]
    SceneBasedUnimplemented,

    #[error("Unknown audio element id: {0}")]
    UnknownElementId(u32),

    #[error("A mix presentation must reference 1 or 2 audio elements. Got {0}")]
    InvalidElementCount(usize),

    #[error("A mix presentation must measure at most {max} layouts. Got {actual}")]
    TooManyMeasuredLayouts { max: usize, actual: usize },

    #[error("Parameter block must have at least one segment")]
    EmptyParameterBlock,

    #[error("Segment intervals must sum to duration: {sum} != {duration}")]
    IntervalSumMismatch { sum: u32, duration: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum LayoutError {
    #[error("A scalable chain needs at least one layout")]
    EmptyChain,

    #[error("Binaural cannot appear inside a scalable chain")]
    BinauralInChain,

    #[error(
        "Illegal ladder step {prev:?} -> {next:?}: surround/subwoofer/height counts must not decrease and must not all stay equal"
    )]
    IllegalStep {
        prev: crate::structs::layout::ChannelLayout,
        next: crate::structs::layout::ChannelLayout,
    },

    #[error("Input layout {input:?} must terminate the chain, found {last:?}")]
    ChainInputMismatch {
        input: crate::structs::layout::ChannelLayout,
        last: crate::structs::layout::ChannelLayout,
    },

    #[error("PCM length {got} does not match {channels} channels of {frame_size} samples")]
    PcmLengthMismatch {
        got: usize,
        channels: usize,
        frame_size: usize,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum StateError {
    #[error("encode called before down-mix parameter determination finished for element {0}")]
    DmpdNotStopped(u32),

    #[error("encode called before loudness/gain measurement finished for element {0}")]
    LoudGainNotStopped(u32),

    #[error("{call} called in phase {phase:?} for element {element}")]
    WrongPhase {
        call: &'static str,
        phase: crate::process::ElementPhase,
        element: u32,
    },

    #[error("loudness_measure called before loudness_start for mix presentation {0}")]
    LoudnessNotStarted(u32),

    #[error("Element {element} already submitted a frame for the current temporal unit")]
    DuplicateFrame { element: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Sub-stream {stream} failed to encode: {reason}")]
    SubstreamEncode { stream: usize, reason: String },

    #[error("Sub-stream {stream} failed to decode: {reason}")]
    SubstreamDecode { stream: usize, reason: String },

    #[error("Codec {codec} rejected configuration: {reason}")]
    Open { codec: &'static str, reason: String },

    #[error("Codec backend for {0} is not compiled in")]
    BackendUnavailable(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum ObuError {
    #[error("Output buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("Invalid OBU type code: {0}")]
    InvalidObuType(u8),

    #[error("Invalid ia_code in sequence header: {0:#010X}")]
    InvalidIaCode(u32),

    #[error("Invalid loudspeaker_layout code: {0}")]
    InvalidLoudspeakerLayout(u8),

    #[error("Unsupported layout_type: {0}")]
    InvalidLayoutType(u8),

    #[error("Invalid animation type: {0}")]
    InvalidAnimationType(u64),

    #[error("Invalid down-mix matrix type: {0}")]
    InvalidMatrixType(u8),
}
