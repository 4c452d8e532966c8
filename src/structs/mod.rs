//! Data structures representing bitstream components.
//!
//! Contains structured representations of stream elements including
//! OBU framing, descriptor payloads, channel layouts, parameter blocks
//! and the caller-facing PCM frame types used throughout the encoding
//! pipeline.

pub mod descriptor;
pub mod frame;
pub mod layout;
pub mod obu;
pub mod parameter;
