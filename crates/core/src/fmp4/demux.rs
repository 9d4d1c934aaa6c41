//! Streaming demuxer for a live fragmented-MP4 elementary stream.
//!
//! The stream never ends from the parser's point of view: boxes are
//! decoded one at a time at the current offset and the offset advances by
//! each box's reported size. [`BoxDecoder`] blocks on short reads (the
//! byte source is expected to be a pipe or socket that simply hasn't
//! produced the bytes yet) and treats end-of-input at a box boundary as
//! clean termination.
//!
//! [`Demuxer`] layers the box-type dispatch on top:
//!
//! ```text
//! ftyp        -> stored
//! moov        -> init segment (ftyp + moov) emitted once
//! moof        -> held as the pending fragment header
//! mdat        -> paired with the pending moof, one frame extracted
//! anything    -> skipped
//! ```
//!
//! A fragment must describe exactly one sample (the upstream encoder is
//! configured to emit one coded frame per fragment); anything else is a
//! protocol violation, as is an mdat with no pending moof or a moof
//! arriving while another is still unpaired.

use std::io::{self, Read};
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};

use super::boxes::{put_box, BoxHeader, FourCc, MoofBox, RawBox, SampleFlags, MAX_BOX_PAYLOAD};
use super::InitSegment;
use crate::error::{DecodeErrorKind, GopcastError, ProtocolViolationKind, Result};
use crate::media::{self, EncodedFrame};

/// Streaming box reader: yields one `(header, payload)` pair per call,
/// tracking the running byte offset.
pub struct BoxDecoder<R> {
    reader: R,
    offset: u64,
}

impl<R: Read> BoxDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, offset: 0 }
    }

    /// Current stream offset (start of the next box).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decode the next box. `Ok(None)` on clean end-of-input at a box
    /// boundary; end-of-input anywhere else is a decode error.
    pub fn next_box(&mut self) -> Result<Option<(BoxHeader, Bytes)>> {
        let Some(header) = self.next_header()? else {
            return Ok(None);
        };

        let payload_size = header.payload_size();
        if payload_size > MAX_BOX_PAYLOAD {
            return Err(GopcastError::Decode {
                kind: DecodeErrorKind::BoxTooLarge {
                    kind: header.kind,
                    size: header.size,
                },
            });
        }

        let mut payload = vec![0u8; payload_size as usize];
        self.reader.read_exact(&mut payload).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                GopcastError::Decode {
                    kind: DecodeErrorKind::TruncatedBox { kind: header.kind },
                }
            } else {
                GopcastError::Io(e)
            }
        })?;
        self.offset += payload_size;

        tracing::trace!(kind = %header.kind, size = header.size, offset = header.offset, "box decoded");
        Ok(Some((header, Bytes::from(payload))))
    }

    fn next_header(&mut self) -> Result<Option<BoxHeader>> {
        // Fill the 8-byte header by hand so that zero bytes at a box
        // boundary reads as clean termination rather than truncation.
        let mut head = [0u8; 8];
        let mut filled = 0;
        while filled < head.len() {
            match self.reader.read(&mut head[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < head.len() {
            return Err(GopcastError::Decode {
                kind: DecodeErrorKind::TruncatedHeader,
            });
        }

        let size32 = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
        let kind = FourCc([head[4], head[5], head[6], head[7]]);
        let start = self.offset;

        let (size, header_len) = match size32 {
            0 => {
                return Err(GopcastError::Decode {
                    kind: DecodeErrorKind::UnboundedBox { kind },
                });
            }
            1 => {
                let mut large = [0u8; 8];
                self.reader.read_exact(&mut large).map_err(|e| {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        GopcastError::Decode {
                            kind: DecodeErrorKind::TruncatedHeader,
                        }
                    } else {
                        GopcastError::Io(e)
                    }
                })?;
                let size = u64::from_be_bytes(large);
                if size < 16 {
                    return Err(GopcastError::Decode {
                        kind: DecodeErrorKind::BoxSizeTooSmall { kind, size },
                    });
                }
                (size, 16u8)
            }
            2..=7 => {
                return Err(GopcastError::Decode {
                    kind: DecodeErrorKind::BoxSizeTooSmall {
                        kind,
                        size: u64::from(size32),
                    },
                });
            }
            _ => (u64::from(size32), 8u8),
        };

        self.offset += u64::from(header_len);
        Ok(Some(BoxHeader {
            kind,
            offset: start,
            size,
            header_len,
        }))
    }
}

/// One event produced by the demuxer state machine.
#[derive(Debug)]
pub enum DemuxEvent {
    /// The init segment, emitted exactly once when the movie metadata
    /// arrives.
    Init(InitSegment),
    /// One demuxed frame (a complete single-sample fragment).
    Frame(EncodedFrame),
}

/// A decoded fragment header waiting for its data box.
struct PendingFragment {
    moof: MoofBox,
    header: BoxHeader,
}

/// Box-dispatch state machine over a [`BoxDecoder`].
pub struct Demuxer<R> {
    boxes: BoxDecoder<R>,
    ftyp: Option<Bytes>,
    init_emitted: bool,
    pending: Option<PendingFragment>,
}

impl<R: Read> Demuxer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            boxes: BoxDecoder::new(reader),
            ftyp: None,
            init_emitted: false,
            pending: None,
        }
    }

    /// Pull boxes until the next init segment or frame. `Ok(None)` on
    /// clean end-of-input (no pending fragment).
    pub fn next_event(&mut self) -> Result<Option<DemuxEvent>> {
        loop {
            let Some((header, payload)) = self.boxes.next_box()? else {
                if self.pending.is_some() {
                    return Err(GopcastError::Decode {
                        kind: DecodeErrorKind::TruncatedStream,
                    });
                }
                return Ok(None);
            };

            match header.kind {
                FourCc::FTYP => {
                    self.ftyp = Some(reencode_raw(FourCc::FTYP, payload)?);
                }
                FourCc::MOOV => {
                    if self.init_emitted {
                        tracing::warn!("duplicate movie metadata box ignored");
                        continue;
                    }
                    let Some(ftyp) = self.ftyp.clone() else {
                        return Err(GopcastError::Protocol {
                            kind: ProtocolViolationKind::MissingFileType,
                        });
                    };
                    let moov = reencode_raw(FourCc::MOOV, payload)?;
                    let mut data = BytesMut::with_capacity(ftyp.len() + moov.len());
                    data.put_slice(&ftyp);
                    data.put_slice(&moov);
                    let init = InitSegment::new(data.freeze());
                    self.init_emitted = true;
                    tracing::info!(len = init.len(), "init segment assembled");
                    return Ok(Some(DemuxEvent::Init(init)));
                }
                FourCc::MOOF => {
                    if self.pending.is_some() {
                        return Err(GopcastError::Protocol {
                            kind: ProtocolViolationKind::FragmentHeaderOverwrite,
                        });
                    }
                    let moof = MoofBox::decode(payload)?;
                    self.pending = Some(PendingFragment { moof, header });
                }
                FourCc::MDAT => {
                    let Some(pending) = self.pending.take() else {
                        return Err(GopcastError::Protocol {
                            kind: ProtocolViolationKind::DataWithoutFragmentHeader,
                        });
                    };
                    let frame = extract_frame(pending, header, payload)?;
                    return Ok(Some(DemuxEvent::Frame(frame)));
                }
                other => {
                    tracing::trace!(kind = %other, size = header.size, "skipping box");
                }
            }
        }
    }
}

/// One reconstructed sample: timestamps, flags, and coded data.
struct FullSample {
    decode_time: u64,
    presentation_time: u64,
    flags: SampleFlags,
    data: Bytes,
}

fn extract_frame(
    pending: PendingFragment,
    mdat_header: BoxHeader,
    mdat: Bytes,
) -> Result<EncodedFrame> {
    let PendingFragment {
        moof,
        header: moof_header,
    } = pending;

    let sample = single_sample(&moof, &moof_header, &mdat_header, &mdat)?;
    let class = media::classify_sample(sample.flags, &sample.data)?;

    // The frame payload is the normalized re-encoding of the pair, so a
    // subscriber receives a self-contained fragment.
    let mut payload = BytesMut::with_capacity(mdat.len() + 256);
    moof.encode(&mut payload)?;
    put_box(&mut payload, FourCc::MDAT, |b| {
        b.put_slice(&mdat);
        Ok(())
    })?;

    tracing::trace!(
        sequence = moof.mfhd.sequence_number,
        keyframe = class.is_keyframe,
        slice_type = %class.slice_type,
        dts = sample.decode_time,
        "frame extracted"
    );

    Ok(EncodedFrame {
        is_keyframe: class.is_keyframe,
        slice_type: class.slice_type,
        decode_time: sample.decode_time,
        presentation_time: sample.presentation_time,
        availability_time: SystemTime::now(),
        payload: payload.freeze(),
    })
}

/// Reconstruct the fragment's single sample against the mdat payload.
fn single_sample(
    moof: &MoofBox,
    moof_header: &BoxHeader,
    mdat_header: &BoxHeader,
    mdat: &Bytes,
) -> Result<FullSample> {
    if moof.trafs.len() != 1 {
        return Err(GopcastError::Protocol {
            kind: ProtocolViolationKind::TrackFragmentCount {
                count: moof.trafs.len(),
            },
        });
    }
    let count = moof.sample_count();
    if count != 1 {
        return Err(GopcastError::Protocol {
            kind: ProtocolViolationKind::SampleCount { count },
        });
    }

    let traf = &moof.trafs[0];
    let trun = traf
        .truns
        .iter()
        .find(|t| !t.entries.is_empty())
        .ok_or(GopcastError::Protocol {
            kind: ProtocolViolationKind::SampleCount { count: 0 },
        })?;
    let entry = &trun.entries[0];

    let size = entry
        .size
        .or(traf.tfhd.default_sample_size)
        .ok_or(GopcastError::Decode {
            kind: DecodeErrorKind::UnresolvedSampleSize,
        })?;
    let flags = entry
        .flags
        .or(trun.first_sample_flags)
        .or(traf.tfhd.default_sample_flags)
        .ok_or(GopcastError::Decode {
            kind: DecodeErrorKind::UnresolvedSampleFlags,
        })?;

    let decode_time = traf.tfdt.base_media_decode_time;
    let presentation_time =
        decode_time.saturating_add_signed(i64::from(entry.cts_offset.unwrap_or(0)));

    // Sample data location: the trun data offset is relative to the base
    // data offset, which is the first byte of the moof unless tfhd says
    // otherwise. Absent a data offset, the sample sits at the start of
    // the mdat payload.
    let start = match trun.data_offset {
        Some(data_offset) => {
            let base = traf.tfhd.base_data_offset.unwrap_or(moof_header.offset);
            base as i64 + i64::from(data_offset) - mdat_header.payload_offset() as i64
        }
        None => 0,
    };
    let end = start + i64::from(size);
    if start < 0 || end > mdat.len() as i64 {
        return Err(GopcastError::Decode {
            kind: DecodeErrorKind::SampleOutOfBounds {
                offset: start,
                size,
                available: mdat.len(),
            },
        });
    }

    Ok(FullSample {
        decode_time,
        presentation_time,
        flags: SampleFlags(flags),
        data: mdat.slice(start as usize..end as usize),
    })
}

/// Re-encode an opaque box from its decoded payload.
fn reencode_raw(kind: FourCc, payload: Bytes) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(payload.len() + 8);
    RawBox { kind, payload }.encode(&mut buf)?;
    Ok(buf.freeze())
}
