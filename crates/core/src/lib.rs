pub mod error;
pub mod fmp4;
pub mod media;
pub mod pipeline;
pub mod route;
pub mod track;
pub mod wire;

pub use error::{GopcastError, Result};
pub use fmp4::{DemuxEvent, Demuxer, InitSegment};
pub use media::{EncodedFrame, SliceType};
pub use pipeline::{InitHandle, Pipeline};
pub use route::{FrameRouter, GopRouter, TrackRouter};
pub use track::{ForwardingPreference, TrackSink, Transport, TransportObject};
