//! The parsing thread of control and its consumer handoffs.
//!
//! One thread owns the demuxer and runs until clean end-of-input or a
//! fatal error. It talks to consumers through two handoffs:
//!
//! - the init segment goes into a set-once cell ([`InitHandle`]); every
//!   reader blocks until it is available and receives the same immutable
//!   buffer;
//! - frames go through a zero-capacity rendezvous channel — the parser
//!   blocks until the consumer accepts each frame, so a slow consumer
//!   stalls fragment extraction (and, transitively, the upstream read)
//!   instead of queueing unbounded frames.
//!
//! Errors are values throughout: the parser's final `Result` is retrieved
//! with [`Pipeline::join`], and a failure tears down this pipeline's
//! output only.

use std::io::Read;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::{GopcastError, Result};
use crate::fmp4::{DemuxEvent, Demuxer, InitSegment};
use crate::media::EncodedFrame;

enum InitState {
    Pending,
    Ready(InitSegment),
    Closed,
}

struct InitShared {
    state: Mutex<InitState>,
    ready: Condvar,
}

/// Handle to the stream's init segment.
///
/// Cloneable; all clones observe the same cell. The cell transitions
/// `Pending -> Ready` when the movie metadata arrives, or
/// `Pending -> Closed` if the parser exits without ever seeing it.
#[derive(Clone)]
pub struct InitHandle {
    shared: Arc<InitShared>,
}

impl InitHandle {
    fn new() -> Self {
        Self {
            shared: Arc::new(InitShared {
                state: Mutex::new(InitState::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    /// Block until the init segment is available. Returns `None` if the
    /// parser exited before producing one.
    pub fn wait(&self) -> Option<InitSegment> {
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                InitState::Ready(init) => return Some(init.clone()),
                InitState::Closed => return None,
                InitState::Pending => self.shared.ready.wait(&mut state),
            }
        }
    }

    /// Non-blocking read of the init segment.
    pub fn try_get(&self) -> Option<InitSegment> {
        match &*self.shared.state.lock() {
            InitState::Ready(init) => Some(init.clone()),
            _ => None,
        }
    }

    fn publish(&self, init: InitSegment) {
        let mut state = self.shared.state.lock();
        if matches!(*state, InitState::Pending) {
            *state = InitState::Ready(init);
            self.shared.ready.notify_all();
        }
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        if matches!(*state, InitState::Pending) {
            *state = InitState::Closed;
            self.shared.ready.notify_all();
        }
    }
}

/// A running demux pipeline: one parser thread plus the two handoffs.
pub struct Pipeline {
    init: InitHandle,
    frames: Receiver<EncodedFrame>,
    worker: thread::JoinHandle<Result<()>>,
}

impl Pipeline {
    /// Start the parser thread over the given byte source.
    pub fn spawn<R: Read + Send + 'static>(reader: R) -> Self {
        let init = InitHandle::new();
        let (tx, rx) = mpsc::sync_channel(0);
        let worker_init = init.clone();

        let worker = thread::spawn(move || {
            let result = parse_loop(reader, &worker_init, &tx);
            worker_init.close();
            match &result {
                Ok(()) => tracing::debug!("demux loop finished, stream ended"),
                Err(e) => tracing::warn!(error = %e, "demux loop exited"),
            }
            result
        });

        tracing::info!("demux pipeline started");
        Self {
            init,
            frames: rx,
            worker,
        }
    }

    /// Handle to the init segment handoff.
    pub fn init(&self) -> InitHandle {
        self.init.clone()
    }

    /// The frame handoff. Iterating drains frames in decode order; the
    /// iterator ends when the parser exits.
    pub fn frames(&self) -> &Receiver<EncodedFrame> {
        &self.frames
    }

    /// Wait for the parser thread and return its final result.
    ///
    /// Drops the frame receiver first, which unblocks a parser stuck
    /// mid-send; a pipeline abandoned with frames still flowing therefore
    /// reports [`GopcastError::ChannelClosed`].
    pub fn join(self) -> Result<()> {
        let Pipeline { frames, worker, .. } = self;
        drop(frames);
        match worker.join() {
            Ok(result) => result,
            Err(_) => Err(GopcastError::ParserPanicked),
        }
    }
}

fn parse_loop<R: Read>(
    reader: R,
    init: &InitHandle,
    frames: &SyncSender<EncodedFrame>,
) -> Result<()> {
    let mut demuxer = Demuxer::new(reader);
    loop {
        match demuxer.next_event()? {
            Some(DemuxEvent::Init(segment)) => init.publish(segment),
            Some(DemuxEvent::Frame(frame)) => {
                frames
                    .send(frame)
                    .map_err(|_| GopcastError::ChannelClosed)?;
            }
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmp4::{MfhdBox, MoofBox, TfdtBox, TfhdBox, TrafBox, TrunBox, TrunEntry};
    use bytes::BytesMut;
    use std::io::Cursor;

    fn raw_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&((payload.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    fn fragment(dts: u64, sample_flags: u32, sample: &[u8]) -> Vec<u8> {
        let moof = MoofBox {
            mfhd: MfhdBox { sequence_number: 1 },
            trafs: vec![TrafBox {
                tfhd: TfhdBox {
                    track_id: 1,
                    default_base_is_moof: true,
                    ..TfhdBox::default()
                },
                tfdt: TfdtBox {
                    version: 1,
                    base_media_decode_time: dts,
                },
                truns: vec![TrunBox {
                    version: 0,
                    flags: TrunBox::FLAG_SAMPLE_SIZE | TrunBox::FLAG_SAMPLE_FLAGS,
                    data_offset: None,
                    first_sample_flags: None,
                    entries: vec![TrunEntry {
                        size: Some(sample.len() as u32),
                        flags: Some(sample_flags),
                        ..TrunEntry::default()
                    }],
                }],
                other: vec![],
            }],
            other: vec![],
        };
        let mut out = BytesMut::new();
        moof.encode(&mut out).expect("encode moof");
        out.extend_from_slice(&raw_box(b"mdat", sample));
        out.to_vec()
    }

    fn stream_with_frames(count: usize) -> Vec<u8> {
        let mut stream = raw_box(b"ftyp", b"isom\x00\x00\x02\x00");
        stream.extend_from_slice(&raw_box(b"moov", b"metadata"));
        for i in 0..count {
            let flags = if i == 0 { 0x0200_0000 } else { 0x0101_0000 };
            let sample: &[u8] = if i == 0 {
                &[0, 0, 0, 3, 0x65, 0x88, 0x80]
            } else {
                &[0, 0, 0, 3, 0x41, 0x9A, 0x00]
            };
            stream.extend_from_slice(&fragment(i as u64 * 512, flags, sample));
        }
        stream
    }

    #[test]
    fn init_then_frames_then_clean_join() {
        let pipeline = Pipeline::spawn(Cursor::new(stream_with_frames(3)));
        let init = pipeline.init().wait().expect("init");
        assert!(!init.is_empty());

        let frames: Vec<_> = pipeline.frames().iter().collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_keyframe);
        assert!(!frames[1].is_keyframe);
        assert!(frames.windows(2).all(|w| w[0].decode_time <= w[1].decode_time));

        pipeline.join().expect("clean end");
    }

    #[test]
    fn every_init_reader_sees_same_buffer() {
        let pipeline = Pipeline::spawn(Cursor::new(stream_with_frames(1)));
        let a = pipeline.init();
        let b = pipeline.init();
        let first = a.wait().expect("init");
        let second = b.wait().expect("init");
        assert_eq!(first, second);
        let _: Vec<_> = pipeline.frames().iter().collect();
        pipeline.join().expect("clean end");
    }

    #[test]
    fn init_closed_when_parser_fails_early() {
        // moov with no ftyp: the parser errors before publishing an init.
        let stream = raw_box(b"moov", b"metadata");
        let pipeline = Pipeline::spawn(Cursor::new(stream));
        assert!(pipeline.init().wait().is_none());
        assert!(pipeline.join().is_err());
    }

    #[test]
    fn dropped_consumer_surfaces_as_channel_closed() {
        let pipeline = Pipeline::spawn(Cursor::new(stream_with_frames(2)));
        pipeline.init().wait().expect("init");
        // Join without draining: the parser is blocked handing over the
        // first frame and must observe the dropped receiver.
        assert!(matches!(
            pipeline.join(),
            Err(GopcastError::ChannelClosed)
        ));
    }
}
