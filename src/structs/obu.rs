//! Open Bitstream Unit framing.
//!
//! Every OBU starts with one header byte
//! `(obu_type << 3) | (redundant << 2) | (trimming << 1) | extension`,
//! followed by the ULEB128 payload length and the payload itself. When
//! the trimming flag is set the payload begins with the two ULEB128 trim
//! counts.

use anyhow::{Result, bail};

use crate::utils::bitstream_io::{BsIoSliceReader, BsIoWriter};
use crate::utils::errors::ObuError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObuType {
    CodecConfig,
    AudioElement,
    MixPresentation,
    ParameterBlock,
    TemporalDelimiter,
    AudioFrame,
    /// Implicit-id frame types for substreams 0..=17.
    AudioFrameId(u8),
    SequenceHeader,
}

impl ObuType {
    pub fn code(self) -> u8 {
        match self {
            ObuType::CodecConfig => 0,
            ObuType::AudioElement => 1,
            ObuType::MixPresentation => 2,
            ObuType::ParameterBlock => 3,
            ObuType::TemporalDelimiter => 4,
            ObuType::AudioFrame => 5,
            ObuType::AudioFrameId(id) => 6 + id,
            ObuType::SequenceHeader => 31,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ObuType::CodecConfig,
            1 => ObuType::AudioElement,
            2 => ObuType::MixPresentation,
            3 => ObuType::ParameterBlock,
            4 => ObuType::TemporalDelimiter,
            5 => ObuType::AudioFrame,
            6..=23 => ObuType::AudioFrameId(code - 6),
            31 => ObuType::SequenceHeader,
            _ => bail!(ObuError::InvalidObuType(code)),
        })
    }
}

/// A complete OBU ready for serialization.
#[derive(Debug, Clone, Default)]
pub struct ObuHeader {
    pub redundant_copy: bool,
    pub trimming_status: bool,
    pub extension: bool,
    pub num_samples_to_trim_at_end: u32,
    pub num_samples_to_trim_at_start: u32,
}

/// Serializes one OBU into `out`.
pub fn write_obu(
    out: &mut Vec<u8>,
    obu_type: ObuType,
    header: &ObuHeader,
    payload: &[u8],
) -> Result<()> {
    let mut w = BsIoWriter::default();

    w.put_n(5, obu_type.code())?;
    w.put(header.redundant_copy)?;
    w.put(header.trimming_status)?;
    w.put(header.extension)?;

    let mut trim = BsIoWriter::default();
    if header.trimming_status {
        trim.put_leb128(header.num_samples_to_trim_at_end as u64)?;
        trim.put_leb128(header.num_samples_to_trim_at_start as u64)?;
    }
    let trim = trim.finish()?;

    w.put_leb128((trim.len() + payload.len()) as u64)?;
    w.put_bytes(&trim)?;
    w.put_bytes(payload)?;

    out.extend_from_slice(&w.finish()?);
    Ok(())
}

/// One parsed OBU, as used by the descriptor round-trip tests.
#[derive(Debug, Clone)]
pub struct Obu {
    pub obu_type: ObuType,
    pub header: ObuHeader,
    pub payload: Vec<u8>,
}

/// Splits a byte stream into OBUs.
pub fn read_obus(mut data: &[u8]) -> Result<Vec<Obu>> {
    let mut obus = Vec::new();

    while !data.is_empty() {
        let mut r = BsIoSliceReader::from_slice(data);

        let obu_type = ObuType::from_code(r.get_n(5)?)?;
        let mut header = ObuHeader {
            redundant_copy: r.get()?,
            trimming_status: r.get()?,
            extension: r.get()?,
            ..Default::default()
        };

        let size = r.get_leb128()? as usize;
        let consumed_before_payload = (((data.len() as u64) << 3) - r.available()?) as usize / 8;

        let mut payload = vec![0u8; size];
        r.get_bytes(&mut payload)?;

        if header.trimming_status {
            let mut pr = BsIoSliceReader::from_slice(&payload);
            header.num_samples_to_trim_at_end = pr.get_leb128()? as u32;
            header.num_samples_to_trim_at_start = pr.get_leb128()? as u32;
            let trim_len = (payload.len() as u64 - pr.available()? / 8) as usize;
            payload.drain(..trim_len);
        }

        obus.push(Obu {
            obu_type,
            header,
            payload,
        });

        data = &data[consumed_before_payload + size..];
    }

    Ok(obus)
}
