//! Frame classification and the frame value object.
//!
//! A fragment's single sample is classified on two independent axes:
//!
//! - **Keyframe status** comes from the container, not the codec: the
//!   32-bit sample flags word ([`SampleFlags`]) says whether the sample
//!   depends on other samples.
//! - **Slice type** comes from the coded payload: the first
//!   video-coding-layer unit's slice header ([`h264`]).
//!
//! All coded units within one sample are assumed to share a single slice
//! type; only the first VCL unit is inspected.

pub mod h264;

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;

use crate::error::Result;
use crate::fmp4::SampleFlags;

/// H.264 slice type of a coded picture.
///
/// Discriminants are the wire codes used by the stream envelope format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceType {
    /// Predicted slice.
    P,
    /// Bi-predicted slice.
    B,
    /// Intra slice.
    I,
    /// Switching-predicted slice.
    Sp,
    /// Switching-intra slice.
    Si,
    /// Slice type value outside the H.264 taxonomy.
    Unknown,
}

impl SliceType {
    /// Numeric wire code (matches the H.264 `slice_type` value mod 5).
    pub fn code(self) -> u8 {
        match self {
            Self::P => 0,
            Self::B => 1,
            Self::I => 2,
            Self::Sp => 3,
            Self::Si => 4,
            Self::Unknown => 0xff,
        }
    }

    /// Inverse of [`code`](Self::code); unassigned codes map to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::P,
            1 => Self::B,
            2 => Self::I,
            3 => Self::Sp,
            4 => Self::Si,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::P => "P",
            Self::B => "B",
            Self::I => "I",
            Self::Sp => "SP",
            Self::Si => "SI",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// One demuxed video frame: a self-contained single-sample fragment plus
/// the metadata a relay needs to address and schedule it.
///
/// `payload` is the re-encoded fragment-header + data-box pair. The frame
/// is immutable after creation; ownership passes from the demuxer through
/// the frame channel to the router.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub is_keyframe: bool,
    pub slice_type: SliceType,
    /// Running decode timestamp, in the track timescale from the init
    /// metadata.
    pub decode_time: u64,
    /// Presentation timestamp, same timescale.
    pub presentation_time: u64,
    /// Wall-clock instant the frame became available to this pipeline.
    /// Used for latency accounting; unrelated to media time.
    pub availability_time: SystemTime,
    pub payload: Bytes,
}

/// Classification result for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClass {
    pub is_keyframe: bool,
    pub slice_type: SliceType,
}

/// Whether a sample flags word marks a keyframe.
///
/// Pure function of the 32-bit word: bits 24–25 (`sample_depends_on`)
/// must be `10` and bit 16 (`sample_is_difference_sample`) must be 0.
pub fn is_keyframe(flags: u32) -> bool {
    SampleFlags(flags).is_keyframe()
}

/// Classify one sample from its flags word and coded payload.
pub fn classify_sample(flags: SampleFlags, payload: &[u8]) -> Result<FrameClass> {
    let slice_type = h264::first_slice_type(payload)?;
    Ok(FrameClass {
        is_keyframe: flags.is_keyframe(),
        slice_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Keyframe flag word ---

    #[test]
    fn keyframe_depends_on_none_not_difference() {
        assert!(is_keyframe(0x0200_0000));
    }

    #[test]
    fn not_keyframe_depends_on_others() {
        assert!(!is_keyframe(0x0100_0000));
    }

    #[test]
    fn not_keyframe_difference_sample() {
        assert!(!is_keyframe(0x0201_0000));
    }

    #[test]
    fn not_keyframe_dependency_unknown() {
        assert!(!is_keyframe(0x0000_0000));
    }

    #[test]
    fn unrelated_flag_bits_ignored() {
        // Padding/degradation bits do not participate.
        assert!(is_keyframe(0x0200_0000 | 0x000e_0000 | 0xffff));
    }

    // --- Slice type codes ---

    #[test]
    fn slice_type_codes_round_trip() {
        for ty in [
            SliceType::P,
            SliceType::B,
            SliceType::I,
            SliceType::Sp,
            SliceType::Si,
        ] {
            assert_eq!(SliceType::from_code(ty.code()), ty);
        }
        assert_eq!(SliceType::from_code(9), SliceType::Unknown);
    }

    // --- classify_sample ---

    #[test]
    fn classify_keyframe_idr_sample() {
        // One 4-byte-length-prefixed IDR unit with an I slice header.
        let sample = [0, 0, 0, 3, 0x65, 0x88, 0x80];
        let class = classify_sample(SampleFlags(0x0200_0000), &sample).expect("classify");
        assert!(class.is_keyframe);
        assert_eq!(class.slice_type, SliceType::I);
    }

    #[test]
    fn classify_difference_sample() {
        let sample = [0, 0, 0, 3, 0x41, 0x9A, 0x00];
        let class = classify_sample(SampleFlags(0x0101_0000), &sample).expect("classify");
        assert!(!class.is_keyframe);
        assert_eq!(class.slice_type, SliceType::P);
    }
}
