//! Transport collaborator seam.
//!
//! The pub/sub transport itself is external — session setup, subscription
//! acceptance, and delivery all live elsewhere. The relay depends on two
//! capabilities only: create a named track, and write addressable objects
//! to it. An embedding server resolves a subscriber's requested track
//! name with [`TrackKind::from_name`] and serves the matching data.

use bytes::Bytes;

use crate::error::Result;

/// Track name carrying the init segment.
pub const INIT_TRACK: &str = "init";
/// Track name carrying the video frames.
pub const VIDEO_TRACK: &str = "video";

/// Logical track a subscriber can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Init,
    Video,
}

impl TrackKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            INIT_TRACK => Some(Self::Init),
            VIDEO_TRACK => Some(Self::Video),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Init => INIT_TRACK,
            Self::Video => VIDEO_TRACK,
        }
    }
}

/// Transport-level hint for how a track's objects map onto delivery
/// streams: one stream per group, per object, or per track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingPreference {
    Group,
    Object,
    Track,
}

/// One addressable unit handed to the transport.
#[derive(Debug, Clone)]
pub struct TransportObject {
    pub group_id: u64,
    pub object_id: u64,
    pub forwarding: ForwardingPreference,
    pub payload: Bytes,
}

/// "Write addressable object" capability of one named track.
///
/// A write may block or fail independently per destination; failures are
/// surfaced as [`TransportWrite`](crate::GopcastError::TransportWrite)
/// and are not retried.
pub trait TrackSink: Send {
    fn write_object(&mut self, object: TransportObject) -> Result<()>;
}

/// "Create named track" capability of the transport collaborator.
pub trait Transport {
    fn create_track(&mut self, name: &str) -> Result<Box<dyn TrackSink>>;
}
