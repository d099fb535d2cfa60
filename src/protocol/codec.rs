//! Payload codec tags.
//!
//! The library never encodes or decodes media; the tag just travels with the
//! blob so endpoints can hand it to the right decoder. The tag space is
//! partitioned like channels: image codecs `0..=31`, audio `32..=63`,
//! structured data from `100`, sentinels at the top.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Codec {
    Jpg = 0,
    Png = 1,
    H264 = 2,
    Hevc = 3,
    H264Lossless = 4,
    HevcLossless = 5,

    Wave = 32,
    Opus = 33,

    Json = 100,
    Calibration = 101,
    Pose = 102,
    MsgPack = 103,
    String = 104,
    Raw = 105,

    Invalid = 254,
    Any = 255,
}

impl Codec {
    /// Decode a wire tag. Unknown tags collapse to [`Codec::Invalid`].
    #[must_use]
    pub fn from_u8(v: u8) -> Codec {
        match v {
            0 => Codec::Jpg,
            1 => Codec::Png,
            2 => Codec::H264,
            3 => Codec::Hevc,
            4 => Codec::H264Lossless,
            5 => Codec::HevcLossless,
            32 => Codec::Wave,
            33 => Codec::Opus,
            100 => Codec::Json,
            101 => Codec::Calibration,
            102 => Codec::Pose,
            103 => Codec::MsgPack,
            104 => Codec::String,
            105 => Codec::Raw,
            255 => Codec::Any,
            _ => Codec::Invalid,
        }
    }

    #[must_use]
    pub fn is_image(self) -> bool {
        (self as u8) < 32
    }

    #[must_use]
    pub fn is_audio(self) -> bool {
        (32..64).contains(&(self as u8))
    }

    #[must_use]
    pub fn is_data(self) -> bool {
        let v = self as u8;
        (100..254).contains(&v)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::Codec;

    #[test]
    fn tags_round_trip() {
        for codec in [
            Codec::Jpg,
            Codec::Png,
            Codec::H264,
            Codec::Hevc,
            Codec::H264Lossless,
            Codec::HevcLossless,
            Codec::Wave,
            Codec::Opus,
            Codec::Json,
            Codec::Calibration,
            Codec::Pose,
            Codec::MsgPack,
            Codec::String,
            Codec::Raw,
            Codec::Any,
        ] {
            assert_eq!(Codec::from_u8(codec as u8), codec);
        }
        assert_eq!(Codec::from_u8(200), Codec::Invalid);
        assert_eq!(Codec::from_u8(254), Codec::Invalid);
    }

    #[test]
    fn tag_ranges() {
        assert!(Codec::Jpg.is_image());
        assert!(Codec::Opus.is_audio());
        assert!(Codec::MsgPack.is_data());
        assert!(!Codec::Any.is_data());
        assert!(!Codec::Invalid.is_data());
    }
}
