//! Structured payloads and the pack/unpack facility.
//!
//! Structured `DataPacket` blobs (`Codec::Json`, `Codec::Calibration`,
//! `Codec::Pose`) carry JSON. [`pack`] and [`unpack`] are the only
//! serialization surface the core needs; everything else on the wire is an
//! opaque blob.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::WireError;

/// Serialize one value into a payload blob.
pub fn pack<T: Serialize>(value: &T) -> Result<Bytes, WireError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Deserialize one value from a payload blob.
pub fn unpack<T: DeserializeOwned>(data: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(data)?)
}

/// Pinhole camera intrinsics, the payload of `Channel::CALIBRATION`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    pub min_depth: f64,
    pub max_depth: f64,
}

/// Full per-source calibration: intrinsics plus the stereo baseline and
/// disparity offset of the rig.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Calibration {
    pub intrinsics: Intrinsics,
    pub baseline: f64,
    pub disparity_offset: f64,
}

/// Rigid transform payload of `Channel::POSE`: a 4x4 row-major matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub matrix: [f64; 16],
}

impl Default for Pose {
    fn default() -> Self {
        let mut matrix = [0.0; 16];
        for i in 0..4 {
            matrix[i * 4 + i] = 1.0;
        }
        Pose { matrix }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calibration_round_trips_exactly() {
        let calib = Calibration {
            intrinsics: Intrinsics {
                fx: 10.0,
                ..Intrinsics::default()
            },
            baseline: 0.0,
            disparity_offset: 0.0,
        };
        let blob = pack(&calib).expect("pack");
        let back: Calibration = unpack(&blob).expect("unpack");
        assert_eq!(back.intrinsics.fx, 10.0);
        assert_eq!(back, calib);
    }

    #[test]
    fn pose_defaults_to_identity() {
        let pose = Pose::default();
        let blob = pack(&pose).expect("pack");
        let back: Pose = unpack(&blob).expect("unpack");
        assert_eq!(back, pose);
        assert_eq!(pose.matrix[0], 1.0);
        assert_eq!(pose.matrix[5], 1.0);
        assert_eq!(pose.matrix[1], 0.0);
    }

    #[test]
    fn unpack_rejects_garbage() {
        assert!(unpack::<Pose>(b"not json").is_err());
    }
}
