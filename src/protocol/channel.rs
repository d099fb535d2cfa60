//! Channel tags and channel-set algebra.
//!
//! A channel is an 8-bit tag partitioned by range: `0..=31` video-like
//! (pixel data), `32..=63` audio-like, `64..=255` structured data. The tag
//! space is open; unknown tags are still routable, so `Channel` is a newtype
//! over the raw byte with named constants rather than a closed enum.

use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, BitOr, Sub, SubAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(pub u8);

impl Channel {
    // Video range 0..=31.
    pub const COLOUR: Channel = Channel(0);
    pub const DEPTH: Channel = Channel(1);
    pub const RIGHT: Channel = Channel(2);
    pub const DEPTH_RIGHT: Channel = Channel(3);
    pub const FLOW: Channel = Channel(4);
    pub const ENERGY: Channel = Channel(5);
    pub const NORMALS: Channel = Channel(6);
    pub const CONFIDENCE: Channel = Channel(7);
    pub const GROUND_TRUTH: Channel = Channel(8);
    pub const DENSITY: Channel = Channel(9);

    // Audio range 32..=63.
    pub const AUDIO_MONO: Channel = Channel(32);
    pub const AUDIO_STEREO: Channel = Channel(33);

    // Structured data range 64..=255.
    pub const CALIBRATION: Channel = Channel(64);
    pub const POSE: Channel = Channel(65);
    pub const DATA: Channel = Channel(66);
    pub const USER: Channel = Channel(67);
    pub const NONE: Channel = Channel(255);

    #[must_use]
    pub fn is_video(self) -> bool {
        self.0 < 32
    }

    #[must_use]
    pub fn is_audio(self) -> bool {
        (32..64).contains(&self.0)
    }

    #[must_use]
    pub fn is_data(self) -> bool {
        self.0 >= 64
    }

    /// Video channels whose pixels are floating point rather than bytes.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(
            self,
            Channel::DEPTH
                | Channel::DEPTH_RIGHT
                | Channel::FLOW
                | Channel::ENERGY
                | Channel::CONFIDENCE
                | Channel::GROUND_TRUTH
                | Channel::DENSITY
        )
    }

    /// Canonical lowercase name, used in URI queries and logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Channel::COLOUR => "colour",
            Channel::DEPTH => "depth",
            Channel::RIGHT => "right",
            Channel::DEPTH_RIGHT => "depth_right",
            Channel::FLOW => "flow",
            Channel::ENERGY => "energy",
            Channel::NORMALS => "normals",
            Channel::CONFIDENCE => "confidence",
            Channel::GROUND_TRUTH => "ground_truth",
            Channel::DENSITY => "density",
            Channel::AUDIO_MONO => "audio",
            Channel::AUDIO_STEREO => "audio_stereo",
            Channel::CALIBRATION => "calibration",
            Channel::POSE => "pose",
            Channel::DATA => "data",
            Channel::USER => "user",
            Channel::NONE => "none",
            _ => "unknown",
        }
    }

    /// Inverse of [`Channel::name`]. Unknown names map to [`Channel::NONE`].
    #[must_use]
    pub fn from_name(name: &str) -> Channel {
        match name {
            "colour" | "color" => Channel::COLOUR,
            "depth" => Channel::DEPTH,
            "right" => Channel::RIGHT,
            "depth_right" => Channel::DEPTH_RIGHT,
            "flow" => Channel::FLOW,
            "energy" => Channel::ENERGY,
            "normals" => Channel::NORMALS,
            "confidence" => Channel::CONFIDENCE,
            "ground_truth" => Channel::GROUND_TRUTH,
            "density" => Channel::DENSITY,
            "audio" => Channel::AUDIO_MONO,
            "audio_stereo" => Channel::AUDIO_STEREO,
            "calibration" => Channel::CALIBRATION,
            "pose" => Channel::POSE,
            "data" => Channel::DATA,
            "user" => Channel::USER,
            _ => Channel::NONE,
        }
    }

    /// Every tag that has a canonical name.
    pub(crate) const NAMED: [Channel; 17] = [
        Channel::COLOUR,
        Channel::DEPTH,
        Channel::RIGHT,
        Channel::DEPTH_RIGHT,
        Channel::FLOW,
        Channel::ENERGY,
        Channel::NORMALS,
        Channel::CONFIDENCE,
        Channel::GROUND_TRUTH,
        Channel::DENSITY,
        Channel::AUDIO_MONO,
        Channel::AUDIO_STEREO,
        Channel::CALIBRATION,
        Channel::POSE,
        Channel::DATA,
        Channel::USER,
        Channel::NONE,
    ];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if name == "unknown" {
            write!(f, "channel#{}", self.0)
        } else {
            f.write_str(name)
        }
    }
}

/// Unordered set of channels backed by a 256-bit bitmap. `Copy`, so it can
/// live inside per-frameset tables without allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelSet {
    bits: [u64; 4],
}

impl ChannelSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, c: Channel) {
        self.bits[(c.0 >> 6) as usize] |= 1u64 << (c.0 & 63);
    }

    pub fn remove(&mut self, c: Channel) {
        self.bits[(c.0 >> 6) as usize] &= !(1u64 << (c.0 & 63));
    }

    #[must_use]
    pub fn contains(&self, c: Channel) -> bool {
        self.bits[(c.0 >> 6) as usize] & (1u64 << (c.0 & 63)) != 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Channels in ascending tag order.
    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        (0..=255u8).map(Channel).filter(|c| self.contains(*c))
    }

    #[must_use]
    pub fn has_video(&self) -> bool {
        self.iter().any(Channel::is_video)
    }

    #[must_use]
    pub fn has_audio(&self) -> bool {
        self.iter().any(Channel::is_audio)
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.iter().any(Channel::is_data)
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<T: IntoIterator<Item = Channel>>(iter: T) -> Self {
        let mut set = ChannelSet::new();
        for c in iter {
            set.insert(c);
        }
        set
    }
}

impl BitOr for ChannelSet {
    type Output = ChannelSet;
    fn bitor(self, rhs: Self) -> Self {
        let mut out = self;
        for (w, r) in out.bits.iter_mut().zip(rhs.bits) {
            *w |= r;
        }
        out
    }
}

impl BitAnd for ChannelSet {
    type Output = ChannelSet;
    fn bitand(self, rhs: Self) -> Self {
        let mut out = self;
        for (w, r) in out.bits.iter_mut().zip(rhs.bits) {
            *w &= r;
        }
        out
    }
}

impl Sub for ChannelSet {
    type Output = ChannelSet;
    fn sub(self, rhs: Self) -> Self {
        let mut out = self;
        for (w, r) in out.bits.iter_mut().zip(rhs.bits) {
            *w &= !r;
        }
        out
    }
}

impl Add<Channel> for ChannelSet {
    type Output = ChannelSet;
    fn add(mut self, c: Channel) -> Self {
        self.insert(c);
        self
    }
}

impl AddAssign<Channel> for ChannelSet {
    fn add_assign(&mut self, c: Channel) {
        self.insert(c);
    }
}

impl SubAssign<Channel> for ChannelSet {
    fn sub_assign(&mut self, c: Channel) {
        self.remove(c);
    }
}

impl Add<Channel> for Channel {
    type Output = ChannelSet;
    fn add(self, rhs: Channel) -> ChannelSet {
        let mut set = ChannelSet::new();
        set.insert(self);
        set.insert(rhs);
        set
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, c) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, "}}")
    }
}
