//! Group-of-pictures–aware object routing.
//!
//! A router consumes the frame handoff in arrival order (which equals
//! decode and presentation order under the one-sample-per-fragment,
//! no-reordering contract) and assigns each frame an address on the
//! transport's video track:
//!
//! - [`GopRouter`] — a keyframe opens a new group: the group id
//!   increments and the object id resets to 0. A subscriber can join
//!   mid-stream and start decoding at any group boundary. The first
//!   group ever emitted is number 1, because the increment happens
//!   before the first keyframe's object is assigned.
//! - [`TrackRouter`] — no group boundaries; one monotonically increasing
//!   object id on group 0. Used when the track is not meant to support
//!   GOP-granular join.
//!
//! Counter state is owned by the router instance, so concurrent output
//! tracks stay independent.

use std::sync::mpsc::Receiver;

use crate::error::Result;
use crate::fmp4::InitSegment;
use crate::media::EncodedFrame;
use crate::pipeline::Pipeline;
use crate::track::{self, ForwardingPreference, TrackSink, Transport, TransportObject};
use crate::wire;

/// A consumer that turns the demuxed stream into transport objects.
pub trait FrameRouter: Send {
    /// Publish the init segment on the init track.
    fn publish_init(&mut self, init: &InitSegment) -> Result<()>;

    /// Assign the next frame its object address and write it.
    fn route(&mut self, frame: &EncodedFrame) -> Result<()>;

    /// Drive a pipeline to completion: publish the init segment once it
    /// is available, then route every frame in arrival order.
    fn run(&mut self, pipeline: &Pipeline) -> Result<()> {
        if let Some(init) = pipeline.init().wait() {
            self.publish_init(&init)?;
        }
        for frame in pipeline.frames().iter() {
            self.route(&frame)?;
        }
        Ok(())
    }

    /// Route frames from a bare receiver (init already handled).
    fn route_all(&mut self, frames: &Receiver<EncodedFrame>) -> Result<()> {
        for frame in frames.iter() {
            self.route(&frame)?;
        }
        Ok(())
    }
}

/// Router that opens a new transport group at every keyframe.
pub struct GopRouter {
    init_track: Box<dyn TrackSink>,
    video_track: Box<dyn TrackSink>,
    group_id: u64,
    object_id: u64,
}

impl GopRouter {
    pub fn new(transport: &mut dyn Transport) -> Result<Self> {
        let init_track = transport.create_track(track::INIT_TRACK)?;
        let video_track = transport.create_track(track::VIDEO_TRACK)?;
        tracing::debug!("init and video tracks created");
        Ok(Self {
            init_track,
            video_track,
            group_id: 0,
            object_id: 0,
        })
    }
}

impl FrameRouter for GopRouter {
    fn publish_init(&mut self, init: &InitSegment) -> Result<()> {
        self.init_track.write_object(TransportObject {
            group_id: 0,
            object_id: 0,
            forwarding: ForwardingPreference::Track,
            payload: init.as_bytes().clone(),
        })
    }

    fn route(&mut self, frame: &EncodedFrame) -> Result<()> {
        if frame.is_keyframe {
            self.group_id += 1;
            self.object_id = 0;
            tracing::debug!(group = self.group_id, "group boundary");
        }
        self.video_track.write_object(TransportObject {
            group_id: self.group_id,
            object_id: self.object_id,
            forwarding: ForwardingPreference::Group,
            payload: wire::object_payload(frame)?,
        })?;
        tracing::trace!(
            group = self.group_id,
            object = self.object_id,
            keyframe = frame.is_keyframe,
            "object routed"
        );
        self.object_id += 1;
        Ok(())
    }
}

/// Router that numbers frames sequentially with no group boundaries.
pub struct TrackRouter {
    init_track: Box<dyn TrackSink>,
    video_track: Box<dyn TrackSink>,
    object_id: u64,
}

impl TrackRouter {
    pub fn new(transport: &mut dyn Transport) -> Result<Self> {
        let init_track = transport.create_track(track::INIT_TRACK)?;
        let video_track = transport.create_track(track::VIDEO_TRACK)?;
        tracing::debug!("init and video tracks created");
        Ok(Self {
            init_track,
            video_track,
            object_id: 0,
        })
    }
}

impl FrameRouter for TrackRouter {
    fn publish_init(&mut self, init: &InitSegment) -> Result<()> {
        self.init_track.write_object(TransportObject {
            group_id: 0,
            object_id: 0,
            forwarding: ForwardingPreference::Track,
            payload: init.as_bytes().clone(),
        })
    }

    fn route(&mut self, frame: &EncodedFrame) -> Result<()> {
        self.video_track.write_object(TransportObject {
            group_id: 0,
            object_id: self.object_id,
            forwarding: ForwardingPreference::Track,
            payload: wire::object_payload(frame)?,
        })?;
        self.object_id += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GopcastError;
    use crate::media::SliceType;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;

    type Written = Arc<Mutex<Vec<(String, TransportObject)>>>;

    /// Transport double that records every written object.
    #[derive(Default)]
    struct MemoryTransport {
        written: Written,
    }

    struct MemoryTrack {
        name: String,
        written: Written,
    }

    impl Transport for MemoryTransport {
        fn create_track(&mut self, name: &str) -> Result<Box<dyn TrackSink>> {
            Ok(Box::new(MemoryTrack {
                name: name.to_string(),
                written: self.written.clone(),
            }))
        }
    }

    impl TrackSink for MemoryTrack {
        fn write_object(&mut self, object: TransportObject) -> Result<()> {
            self.written.lock().push((self.name.clone(), object));
            Ok(())
        }
    }

    /// Transport double whose video track always fails.
    struct FailingTransport;

    struct FailingTrack {
        name: String,
    }

    impl Transport for FailingTransport {
        fn create_track(&mut self, name: &str) -> Result<Box<dyn TrackSink>> {
            Ok(Box::new(FailingTrack {
                name: name.to_string(),
            }))
        }
    }

    impl TrackSink for FailingTrack {
        fn write_object(&mut self, _object: TransportObject) -> Result<()> {
            Err(GopcastError::TransportWrite {
                track: self.name.clone(),
                reason: "session gone".to_string(),
            })
        }
    }

    fn make_frame(is_keyframe: bool, decode_time: u64) -> EncodedFrame {
        EncodedFrame {
            is_keyframe,
            slice_type: if is_keyframe {
                SliceType::I
            } else {
                SliceType::P
            },
            decode_time,
            presentation_time: decode_time,
            availability_time: UNIX_EPOCH,
            payload: Bytes::from_static(&[0xAB, 0xCD]),
        }
    }

    fn video_objects(written: &Written) -> Vec<TransportObject> {
        written
            .lock()
            .iter()
            .filter(|(name, _)| name == track::VIDEO_TRACK)
            .map(|(_, object)| object.clone())
            .collect()
    }

    // --- GopRouter ---

    #[test]
    fn group_ids_follow_keyframe_pattern() {
        let mut transport = MemoryTransport::default();
        let written = transport.written.clone();
        let mut router = GopRouter::new(&mut transport).expect("router");

        for (i, keyframe) in [true, false, false, true, false].into_iter().enumerate() {
            router.route(&make_frame(keyframe, i as u64)).expect("route");
        }

        let objects = video_objects(&written);
        let groups: Vec<u64> = objects.iter().map(|o| o.group_id).collect();
        let ids: Vec<u64> = objects.iter().map(|o| o.object_id).collect();
        assert_eq!(groups, [1, 1, 1, 2, 2]);
        assert_eq!(ids, [0, 1, 2, 0, 1]);
        assert!(objects
            .iter()
            .all(|o| o.forwarding == ForwardingPreference::Group));
    }

    #[test]
    fn init_published_on_init_track() {
        let mut transport = MemoryTransport::default();
        let written = transport.written.clone();
        let mut router = GopRouter::new(&mut transport).expect("router");

        let init = InitSegment::new(Bytes::from_static(b"ftyp+moov"));
        router.publish_init(&init).expect("publish");

        let written = written.lock();
        let (name, object) = &written[0];
        assert_eq!(name, track::INIT_TRACK);
        assert_eq!(object.group_id, 0);
        assert_eq!(object.object_id, 0);
        assert_eq!(object.forwarding, ForwardingPreference::Track);
        assert_eq!(object.payload, *init.as_bytes());
    }

    #[test]
    fn object_payload_carries_timestamps() {
        let mut transport = MemoryTransport::default();
        let written = transport.written.clone();
        let mut router = GopRouter::new(&mut transport).expect("router");

        let frame = make_frame(true, 512);
        router.route(&frame).expect("route");

        let objects = video_objects(&written);
        // availability (8) + presentation (8) + fragment bytes
        assert_eq!(&objects[0].payload[8..16], &512u64.to_be_bytes());
        assert_eq!(&objects[0].payload[16..], &[0xAB, 0xCD]);
    }

    #[test]
    fn transport_failure_is_fatal() {
        let mut transport = FailingTransport;
        let mut router = GopRouter::new(&mut transport).expect("router");
        assert!(matches!(
            router.route(&make_frame(true, 0)),
            Err(GopcastError::TransportWrite { .. })
        ));
    }

    // --- TrackRouter ---

    #[test]
    fn track_router_numbers_sequentially() {
        let mut transport = MemoryTransport::default();
        let written = transport.written.clone();
        let mut router = TrackRouter::new(&mut transport).expect("router");

        for (i, keyframe) in [true, false, true].into_iter().enumerate() {
            router.route(&make_frame(keyframe, i as u64)).expect("route");
        }

        let objects = video_objects(&written);
        let groups: Vec<u64> = objects.iter().map(|o| o.group_id).collect();
        let ids: Vec<u64> = objects.iter().map(|o| o.object_id).collect();
        assert_eq!(groups, [0, 0, 0]);
        assert_eq!(ids, [0, 1, 2]);
        assert!(objects
            .iter()
            .all(|o| o.forwarding == ForwardingPreference::Track));
    }
}
