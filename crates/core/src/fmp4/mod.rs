//! Fragmented-MP4 container layer.
//!
//! [`boxes`] holds the box structures and their codecs; [`demux`] runs
//! the streaming state machine that turns an unbounded byte source into
//! an init segment followed by single-sample frames.

pub mod boxes;
pub mod demux;

pub use boxes::{
    BoxHeader, FourCc, MfhdBox, MoofBox, RawBox, SampleFlags, TfdtBox, TfhdBox, TrafBox, TrunBox,
    TrunEntry,
};
pub use demux::{BoxDecoder, DemuxEvent, Demuxer};

use bytes::Bytes;

/// The stream's initialization segment: the re-encoded
/// type-and-compatibility box followed by the movie-metadata box.
///
/// Created exactly once per stream and shared immutably; cloning is a
/// reference-count bump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSegment {
    data: Bytes,
}

impl InitSegment {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
