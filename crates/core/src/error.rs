//! Error types for the gopcast library.
//!
//! Variants map to specific failure modes across the stack:
//!
//! - **Container**: [`Decode`](GopcastError::Decode) — malformed box
//!   structure; [`Protocol`](GopcastError::Protocol) — well-formed boxes
//!   arriving outside the contract the upstream encoder promised.
//! - **Serialization**: [`Encode`](GopcastError::Encode) — a value that
//!   cannot be represented in the wire or box format.
//! - **Delivery**: [`TransportWrite`](GopcastError::TransportWrite),
//!   [`ChannelClosed`](GopcastError::ChannelClosed).
//! - **Byte source**: [`Io`](GopcastError::Io).
//!
//! Every error is fatal to the pipeline that raised it: nothing here is
//! retried or recovered locally. Clean end-of-input is not an error — the
//! demuxer signals it with `Ok(None)`.

use std::fmt;

/// Errors that can occur in the gopcast library.
#[derive(Debug, thiserror::Error)]
pub enum GopcastError {
    /// Underlying I/O error while reading the byte source or writing wire bytes.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed box structure in the input stream.
    #[error("decode error: {kind}")]
    Decode { kind: DecodeErrorKind },

    /// Structurally valid input that breaks the single-track,
    /// one-sample-per-fragment contract supplied by the upstream encoder.
    #[error("protocol violation: {kind}")]
    Protocol { kind: ProtocolViolationKind },

    /// A value could not be serialized into the box or wire format.
    #[error("encode error: {0}")]
    Encode(&'static str),

    /// The downstream "write object" operation failed. Not retried.
    #[error("transport write failed on track {track}: {reason}")]
    TransportWrite { track: String, reason: String },

    /// The frame consumer disconnected while the parser held a frame.
    #[error("frame consumer disconnected")]
    ChannelClosed,

    /// The parser thread terminated abnormally.
    #[error("parser thread panicked")]
    ParserPanicked,
}

/// Specific kind of container decode failure.
#[derive(Debug)]
pub enum DecodeErrorKind {
    /// End of input in the middle of a box header.
    TruncatedHeader,
    /// End of input in the middle of a box payload.
    TruncatedBox { kind: crate::fmp4::FourCc },
    /// A child box overran its parent's payload.
    TruncatedChild { parent: crate::fmp4::FourCc },
    /// Box size field smaller than its own header.
    BoxSizeTooSmall { kind: crate::fmp4::FourCc, size: u64 },
    /// Size-0 ("extends to end of file") box, meaningless in a live stream.
    UnboundedBox { kind: crate::fmp4::FourCc },
    /// Box payload exceeds the sanity cap.
    BoxTooLarge { kind: crate::fmp4::FourCc, size: u64 },
    /// A required child box was absent.
    MissingChild {
        parent: crate::fmp4::FourCc,
        child: crate::fmp4::FourCc,
    },
    /// Neither trun nor tfhd carried a sample size.
    UnresolvedSampleSize,
    /// Neither trun, first-sample-flags, nor tfhd carried sample flags.
    UnresolvedSampleFlags,
    /// Sample data range falls outside the mdat payload.
    SampleOutOfBounds { offset: i64, size: u32, available: usize },
    /// A length-prefixed coded unit overran the sample payload.
    TruncatedNalUnit,
    /// Unrecognized message tag in the stream envelope format.
    UnknownWireTag { tag: u8 },
    /// End of input while a fragment header was still awaiting its data box.
    TruncatedStream,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedHeader => write!(f, "truncated box header"),
            Self::TruncatedBox { kind } => write!(f, "truncated {kind} box"),
            Self::TruncatedChild { parent } => {
                write!(f, "child box overruns {parent} payload")
            }
            Self::BoxSizeTooSmall { kind, size } => {
                write!(f, "{kind} box size {size} smaller than header")
            }
            Self::UnboundedBox { kind } => {
                write!(f, "{kind} box with size 0 in unbounded stream")
            }
            Self::BoxTooLarge { kind, size } => {
                write!(f, "{kind} box size {size} exceeds sanity cap")
            }
            Self::MissingChild { parent, child } => {
                write!(f, "{parent} box missing required {child} child")
            }
            Self::UnresolvedSampleSize => write!(f, "sample size absent from trun and tfhd"),
            Self::UnresolvedSampleFlags => write!(f, "sample flags absent from trun and tfhd"),
            Self::SampleOutOfBounds {
                offset,
                size,
                available,
            } => write!(
                f,
                "sample range {offset}+{size} outside mdat payload of {available} bytes"
            ),
            Self::TruncatedNalUnit => write!(f, "coded unit overruns sample payload"),
            Self::UnknownWireTag { tag } => write!(f, "unknown message tag {tag:#04x}"),
            Self::TruncatedStream => write!(f, "stream ended with a pending fragment header"),
        }
    }
}

/// Specific kind of protocol contract violation.
#[derive(Debug)]
pub enum ProtocolViolationKind {
    /// A fragment-data box arrived with no pending fragment header.
    DataWithoutFragmentHeader,
    /// A second fragment header arrived while one was still pending.
    FragmentHeaderOverwrite,
    /// The fragment described a sample count other than exactly one.
    SampleCount { count: usize },
    /// The fragment carried a track-fragment count other than exactly one.
    TrackFragmentCount { count: usize },
    /// No video-coding-layer unit found in the sample payload.
    NoVclUnit,
    /// A movie-metadata box arrived before the type-and-compatibility box.
    MissingFileType,
}

impl fmt::Display for ProtocolViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataWithoutFragmentHeader => {
                write!(f, "fragment data with no pending fragment header")
            }
            Self::FragmentHeaderOverwrite => {
                write!(f, "fragment header arrived while another was pending")
            }
            Self::SampleCount { count } => {
                write!(f, "fragment describes {count} samples, expected exactly 1")
            }
            Self::TrackFragmentCount { count } => {
                write!(f, "fragment carries {count} track fragments, expected exactly 1")
            }
            Self::NoVclUnit => write!(f, "no video-coding-layer unit in sample"),
            Self::MissingFileType => {
                write!(f, "movie metadata arrived before the file-type box")
            }
        }
    }
}

/// Convenience alias for `Result<T, GopcastError>`.
pub type Result<T> = std::result::Result<T, GopcastError>;
