//! Channel layouts and the scalable ladder tables.
//!
//! Enumerates the closed set of loudspeaker layouts, the symbolic
//! encoder channels that can appear in them, and the per-step tables of
//! a scalable chain: which channels are transmitted ("new") at each
//! layer and which ones a decoder reconstructs by demixing.

use anyhow::{Result, bail};

use crate::utils::errors::LayoutError;

/// Loudspeaker layout tags supported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    Surround312,
    Surround510,
    Surround512,
    Surround514,
    Surround710,
    Surround712,
    Surround714,
    Binaural,
}

impl ChannelLayout {
    /// 4-bit `loudspeaker_layout` code.
    pub fn code(self) -> u8 {
        match self {
            ChannelLayout::Mono => 0,
            ChannelLayout::Stereo => 1,
            ChannelLayout::Surround510 => 2,
            ChannelLayout::Surround512 => 3,
            ChannelLayout::Surround514 => 4,
            ChannelLayout::Surround710 => 5,
            ChannelLayout::Surround712 => 6,
            ChannelLayout::Surround714 => 7,
            ChannelLayout::Surround312 => 8,
            ChannelLayout::Binaural => 9,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => ChannelLayout::Mono,
            1 => ChannelLayout::Stereo,
            2 => ChannelLayout::Surround510,
            3 => ChannelLayout::Surround512,
            4 => ChannelLayout::Surround514,
            5 => ChannelLayout::Surround710,
            6 => ChannelLayout::Surround712,
            7 => ChannelLayout::Surround714,
            8 => ChannelLayout::Surround312,
            9 => ChannelLayout::Binaural,
            _ => bail!(crate::utils::errors::ObuError::InvalidLoudspeakerLayout(
                code
            )),
        })
    }

    /// `(surround, subwoofer, height)` speaker counts.
    pub fn swh(self) -> (u8, u8, u8) {
        match self {
            ChannelLayout::Mono => (1, 0, 0),
            ChannelLayout::Stereo => (2, 0, 0),
            ChannelLayout::Surround312 => (3, 1, 2),
            ChannelLayout::Surround510 => (5, 1, 0),
            ChannelLayout::Surround512 => (5, 1, 2),
            ChannelLayout::Surround514 => (5, 1, 4),
            ChannelLayout::Surround710 => (7, 1, 0),
            ChannelLayout::Surround712 => (7, 1, 2),
            ChannelLayout::Surround714 => (7, 1, 4),
            ChannelLayout::Binaural => (2, 0, 0),
        }
    }

    pub fn channel_count(self) -> usize {
        self.channels().len()
    }

    /// Rendering-order channel list of the layout.
    pub fn channels(self) -> &'static [EncChannel] {
        use EncChannel::*;
        match self {
            ChannelLayout::Mono => &[Mono],
            ChannelLayout::Stereo | ChannelLayout::Binaural => &[L2, R2],
            ChannelLayout::Surround312 => &[L3, R3, C, Lfe, Tl, Tr],
            ChannelLayout::Surround510 => &[L5, R5, C, Lfe, Sl5, Sr5],
            ChannelLayout::Surround512 => &[L5, R5, C, Lfe, Sl5, Sr5, Hl, Hr],
            ChannelLayout::Surround514 => &[L5, R5, C, Lfe, Sl5, Sr5, Hfl, Hfr, Hbl, Hbr],
            ChannelLayout::Surround710 => &[L7, R7, C, Lfe, Sl7, Sr7, Bl7, Br7],
            ChannelLayout::Surround712 => &[L7, R7, C, Lfe, Sl7, Sr7, Bl7, Br7, Hl, Hr],
            ChannelLayout::Surround714 => {
                &[L7, R7, C, Lfe, Sl7, Sr7, Bl7, Br7, Hfl, Hfr, Hbl, Hbr]
            }
        }
    }
}

/// Symbolic index of every distinct speaker position that can appear in
/// a supported layout. Channels with the same position but a different
/// ladder tier (`L2`/`L3`/`L5`/`L7`) are distinct because their sample
/// values differ once lower tiers have been folded down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncChannel {
    Mono,
    L2,
    R2,
    L3,
    R3,
    Tl,
    Tr,
    L5,
    R5,
    Sl5,
    Sr5,
    Hl,
    Hr,
    L7,
    R7,
    Sl7,
    Sr7,
    Bl7,
    Br7,
    Hfl,
    Hfr,
    Hbl,
    Hbr,
    C,
    Lfe,
}

pub const ENC_CHANNEL_COUNT: usize = 25;

impl EncChannel {
    pub fn index(self) -> usize {
        self as usize
    }

    /// True for the left/right siblings that encode as a coupled pair.
    pub fn coupled_sibling(self) -> Option<EncChannel> {
        use EncChannel::*;
        Some(match self {
            L2 => R2,
            L3 => R3,
            Tl => Tr,
            L5 => R5,
            Sl5 => Sr5,
            Hl => Hr,
            L7 => R7,
            Sl7 => Sr7,
            Bl7 => Br7,
            Hfl => Hfr,
            Hbl => Hbr,
            _ => return None,
        })
    }
}

/// One step of a scalable chain: the layout this layer decodes to, the
/// channels transmitted at this layer in wire order, and the channels a
/// decoder reconstructs by demixing.
#[derive(Debug, Clone)]
pub struct LadderStep {
    pub layout: ChannelLayout,
    pub transmitted: Vec<EncChannel>,
    pub demixed: Vec<EncChannel>,
    pub coupled_streams: usize,
    pub mono_streams: usize,
}

impl LadderStep {
    fn new(layout: ChannelLayout, transmitted: Vec<EncChannel>, demixed: Vec<EncChannel>) -> Self {
        let coupled_streams = transmitted
            .iter()
            .filter(|ch| ch.coupled_sibling().is_some())
            .count();
        let mono_streams = transmitted.len() - 2 * coupled_streams;

        Self {
            layout,
            transmitted,
            demixed,
            coupled_streams,
            mono_streams,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.coupled_streams + self.mono_streams
    }
}

/// A validated scalable chain `CL_0 .. CL_k`.
#[derive(Debug, Clone)]
pub struct ScalableLadder {
    pub steps: Vec<LadderStep>,
}

impl ScalableLadder {
    /// Validates the chain and computes the per-step channel tables.
    ///
    /// Successive layouts must not decrease any of the surround,
    /// subwoofer or height counts, and must not keep all three equal.
    pub fn new(chain: &[ChannelLayout]) -> Result<Self> {
        if chain.is_empty() {
            bail!(LayoutError::EmptyChain);
        }

        if chain.contains(&ChannelLayout::Binaural) {
            bail!(LayoutError::BinauralInChain);
        }

        let mut steps = Vec::with_capacity(chain.len());
        let mut prev: Option<ChannelLayout> = None;

        for &layout in chain {
            if let Some(p) = prev {
                let (ps, pw, ph) = p.swh();
                let (ns, nw, nh) = layout.swh();

                let legal = ns >= ps && nw >= pw && nh >= ph && (ns, nw, nh) != (ps, pw, ph);
                if !legal {
                    bail!(LayoutError::IllegalStep {
                        prev: p,
                        next: layout
                    });
                }
            }

            steps.push(LadderStep::new(
                layout,
                transmitted_channels(prev, layout),
                demixed_channels(prev, layout),
            ));
            prev = Some(layout);
        }

        Ok(Self { steps })
    }

    pub fn input_layout(&self) -> ChannelLayout {
        self.steps.last().expect("chain is non-empty").layout
    }

    pub fn is_scalable(&self) -> bool {
        self.steps.len() > 1
    }

    /// Transmission order over all layers, lowest layer first.
    pub fn transmission_order(&self) -> Vec<EncChannel> {
        self.steps
            .iter()
            .flat_map(|s| s.transmitted.iter().copied())
            .collect()
    }
}

/// Channels transmitted at a layer, in wire order: coupled pairs first,
/// lone channels after.
fn transmitted_channels(prev: Option<ChannelLayout>, next: ChannelLayout) -> Vec<EncChannel> {
    use EncChannel::*;

    let Some(prev) = prev else {
        // Base layer: the whole layout, pairs first.
        let mut pairs = Vec::new();
        let mut lone = Vec::new();
        for &ch in next.channels() {
            if let Some(sibling) = ch.coupled_sibling() {
                pairs.push(ch);
                pairs.push(sibling);
            } else if !matches!(ch, R2 | R3 | Tr | R5 | Sr5 | Hr | R7 | Sr7 | Br7 | Hfr | Hbr) {
                lone.push(ch);
            }
        }
        pairs.extend(lone);
        return pairs;
    };

    let (ps, pw, ph) = prev.swh();
    let (ns, nw, nh) = next.swh();

    let mut pairs = Vec::new();
    let mut lone = Vec::new();

    // Surround ladder: the transmitted channels are the ones the demix
    // equations take as knowns (sides for 7, fronts for 5, centre for 3).
    if ps < 2 && ns >= 2 {
        lone.push(L2);
    }
    if ps < 3 && ns >= 3 {
        lone.push(C);
    }
    if ps < 5 && ns >= 5 {
        let (l, r) = if ns >= 7 { (L7, R7) } else { (L5, R5) };
        pairs.push(l);
        pairs.push(r);
    }
    if ps < 7 && ns >= 7 {
        pairs.push(Sl7);
        pairs.push(Sr7);
    }

    // Height ladder: fronts are transmitted above a 2-height tier; a
    // 0-height predecessor gets every height channel, except when the
    // predecessor is 3.1.2 whose tops already carry the 2-height tier.
    let prev_has_h2 = ph >= 2;
    if nh >= 2 && !prev_has_h2 && nh == 2 {
        let (l, r) = if next == ChannelLayout::Surround312 {
            (Tl, Tr)
        } else {
            (Hl, Hr)
        };
        pairs.push(l);
        pairs.push(r);
    }
    if nh == 4 {
        pairs.push(Hfl);
        pairs.push(Hfr);
        if !prev_has_h2 {
            pairs.push(Hbl);
            pairs.push(Hbr);
        }
    }

    if pw < 1 && nw >= 1 {
        lone.push(Lfe);
    }

    pairs.extend(lone);
    pairs
}

/// Channels of `next` that a decoder reconstructs by demixing at this
/// step. Intermediate tiers (`L3` on the way from stereo to 5.1) do not
/// appear because they are not part of the target layout.
fn demixed_channels(prev: Option<ChannelLayout>, next: ChannelLayout) -> Vec<EncChannel> {
    use EncChannel::*;

    let Some(prev) = prev else {
        return Vec::new();
    };

    let (ps, _, ph) = prev.swh();
    let (ns, _, nh) = next.swh();

    let mut out = Vec::new();

    if ps < 2 && ns == 2 {
        out.push(R2);
    }
    if ps < 3 && ns == 3 {
        out.extend([L3, R3]);
    }
    if ps < 5 && ns == 5 {
        out.extend([Sl5, Sr5]);
    }
    if ps < 7 && ns == 7 {
        out.extend([Bl7, Br7]);
    }

    // Heights demix only when the predecessor carries a 2-height tier to
    // derive from; 3.1.2 tops feed the x.1.2 heights.
    if nh == 2 && ph == 2 && prev == ChannelLayout::Surround312 {
        out.extend([Hl, Hr]);
    }
    if nh == 4 && ph == 2 {
        out.extend([Hbl, Hbr]);
    }

    out
}
