#![doc = include_str!("../README.md")]
//!
//! ## Technical Overview
//!
//! Encoder for IAMF scalable channel audio bitstreams.
//!
//! ### Bitstream Organization
//!
//! **Descriptors**: IA sequence header, codec configs, audio elements,
//! mix presentations.
//! **Temporal units**: audio frame OBUs per sub-stream group, then
//! parameter block OBUs (down-mix parameters, reconstruction gains,
//! mix gains).
//!
//! ### Scalable Channel Audio
//!
//! A high-channel-count source is decomposed into a nested ladder of
//! layouts (e.g. Stereo → 5.1.2 → 7.1.4). Each layer is compressed with
//! independent coupled/mono sub-streams, and per-frame metadata lets a
//! decoder reconstruct any intermediate layout with minimal error:
//!
//! - the **down-mixer** folds each layout from the one above with
//!   matrix coefficients picked per frame,
//! - the **up-mixer** inverts the fold on re-decoded lower layers,
//! - the **reconstruction-gain estimator** measures the residual and
//!   emits the restoring gain per demixed channel.
//!
//! ## Quick Start
//!
//! Steps for encoding a stream:
//!
//! 1. Create an [`IamfEncoder`](process::encode::IamfEncoder) and add
//!    audio elements.
//! 2. Run the DMPD and loudness/gain pre-passes over the source.
//! 3. Call `encode` once per element per frame; each completed
//!    temporal unit comes back as a [`Packet`](structs::frame::Packet).
//! 4. `flush` drains the codec delay and signs off the trim counts.

/// Waveform codec adapters.
///
/// - **Adapter** ([`codec::MultistreamCodec`]): lock-step coupled+mono
///   sub-streams per scalable layer
/// - **Backends**: Opus ([`codec::opus`]), AAC-LC ([`codec::aac`],
///   feature `aac`), LPCM ([`codec::lpcm`])
pub mod codec;

/// Per-frame encoding pipeline and orchestration.
///
/// 1. **Parameter determination** ([`process::dmpd`]): per-frame matrix
///    type and weight selection.
///
/// 2. **Down-mix** ([`process::downmix`]) and **up-mix**
///    ([`process::upmix`]) with reconstruction gains
///    ([`process::recon_gain`]).
///
/// 3. **Loudness** ([`process::loudness`]) and **limiting**
///    ([`process::limiter`]) for mix-presentation measurement.
///
/// 4. **Orchestration** ([`process::encode`]): registry, phase machine,
///    OBU scheduling.
pub mod process;

/// Data structures representing bitstream components.
///
/// - **OBU framing** ([`structs::obu`]): header byte, ULEB128 lengths,
///   trim fields
/// - **Descriptors** ([`structs::descriptor`]): sequence header, codec
///   config, audio element, mix presentation
/// - **Parameter blocks** ([`structs::parameter`]): animated mix gains,
///   down-mix parameters, reconstruction gains
/// - **Layouts** ([`structs::layout`]): channel layouts and the
///   scalable ladder tables
/// - **Frames** ([`structs::frame`]): caller-facing PCM and packets
pub mod structs;

/// Utility functions and supporting infrastructure.
///
/// - **Bitstream I/O** ([`utils::bitstream_io`]): bit-level writing and
///   ULEB128
/// - **Error handling** ([`utils::errors`]): error types
/// - **Peak ring** ([`utils::ring`]): limiter lookahead window
/// - **Windows** ([`utils::window`]): precomputed crossfades
pub mod utils;
