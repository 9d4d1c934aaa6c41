//! ISO BMFF box structures for the fragmented-MP4 subset this library speaks.
//!
//! Only the boxes on the live-stream path get a structured representation:
//! the movie fragment header tree (`moof` > `mfhd`, `traf` > `tfhd`, `tfdt`,
//! `trun`) whose fields drive sample reconstruction. Everything else —
//! `ftyp`, `moov`, unrecognized children — is carried as an opaque
//! [`RawBox`] so re-encoding reproduces it byte for byte.
//!
//! Encoding uses the size-placeholder pattern: write a zero length word,
//! write the payload, patch the length. Decoded fragment boxes re-encode in
//! normalized child order (`mfhd`, `traf`, rest), which is the order every
//! conforming encoder emits anyway.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{DecodeErrorKind, GopcastError, Result};

/// Sanity cap on a single box payload to prevent OOM on a corrupt length
/// field (the stream is untrusted input).
pub const MAX_BOX_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Four-character box type code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const FTYP: FourCc = FourCc(*b"ftyp");
    pub const MOOV: FourCc = FourCc(*b"moov");
    pub const MOOF: FourCc = FourCc(*b"moof");
    pub const MDAT: FourCc = FourCc(*b"mdat");
    pub const MFHD: FourCc = FourCc(*b"mfhd");
    pub const TRAF: FourCc = FourCc(*b"traf");
    pub const TFHD: FourCc = FourCc(*b"tfhd");
    pub const TFDT: FourCc = FourCc(*b"tfdt");
    pub const TRUN: FourCc = FourCc(*b"trun");
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// Decoded header of one box: type tag, byte offset in the stream, total
/// size (header included), and the header's own length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: FourCc,
    pub offset: u64,
    pub size: u64,
    pub header_len: u8,
}

impl BoxHeader {
    /// Byte length of the payload following the header.
    pub fn payload_size(&self) -> u64 {
        self.size - u64::from(self.header_len)
    }

    /// Stream offset of the first payload byte.
    pub fn payload_offset(&self) -> u64 {
        self.offset + u64::from(self.header_len)
    }
}

/// An opaque box: type plus raw payload, re-encoded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBox {
    pub kind: FourCc,
    pub payload: Bytes,
}

impl RawBox {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_box(buf, self.kind, |b| {
            b.put_slice(&self.payload);
            Ok(())
        })
    }
}

/// Movie fragment header box (`mfhd`, ISO/IEC 14496-12 §8.8.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfhdBox {
    pub sequence_number: u32,
}

impl MfhdBox {
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        read_full_header(&mut payload, FourCc::MFHD)?;
        if payload.remaining() < 4 {
            return Err(truncated(FourCc::MFHD));
        }
        Ok(Self {
            sequence_number: payload.get_u32(),
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_box(buf, FourCc::MFHD, |b| {
            b.put_u32(0); // version 0, no flags
            b.put_u32(self.sequence_number);
            Ok(())
        })
    }
}

/// Track fragment header box (`tfhd`, ISO/IEC 14496-12 §8.8.7).
///
/// Optional fields are present on the wire iff the corresponding flag bit
/// is set; encoding recomputes the flag word from the populated options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TfhdBox {
    pub track_id: u32,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
    pub duration_is_empty: bool,
    pub default_base_is_moof: bool,
}

impl TfhdBox {
    const FLAG_BASE_DATA_OFFSET: u32 = 0x00_0001;
    const FLAG_SAMPLE_DESCRIPTION_INDEX: u32 = 0x00_0002;
    const FLAG_DEFAULT_SAMPLE_DURATION: u32 = 0x00_0008;
    const FLAG_DEFAULT_SAMPLE_SIZE: u32 = 0x00_0010;
    const FLAG_DEFAULT_SAMPLE_FLAGS: u32 = 0x00_0020;
    const FLAG_DURATION_IS_EMPTY: u32 = 0x01_0000;
    const FLAG_DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let (_, flags) = read_full_header(&mut payload, FourCc::TFHD)?;
        let mut tfhd = TfhdBox {
            track_id: read_u32(&mut payload, FourCc::TFHD)?,
            duration_is_empty: flags & Self::FLAG_DURATION_IS_EMPTY != 0,
            default_base_is_moof: flags & Self::FLAG_DEFAULT_BASE_IS_MOOF != 0,
            ..TfhdBox::default()
        };
        if flags & Self::FLAG_BASE_DATA_OFFSET != 0 {
            tfhd.base_data_offset = Some(read_u64(&mut payload, FourCc::TFHD)?);
        }
        if flags & Self::FLAG_SAMPLE_DESCRIPTION_INDEX != 0 {
            tfhd.sample_description_index = Some(read_u32(&mut payload, FourCc::TFHD)?);
        }
        if flags & Self::FLAG_DEFAULT_SAMPLE_DURATION != 0 {
            tfhd.default_sample_duration = Some(read_u32(&mut payload, FourCc::TFHD)?);
        }
        if flags & Self::FLAG_DEFAULT_SAMPLE_SIZE != 0 {
            tfhd.default_sample_size = Some(read_u32(&mut payload, FourCc::TFHD)?);
        }
        if flags & Self::FLAG_DEFAULT_SAMPLE_FLAGS != 0 {
            tfhd.default_sample_flags = Some(read_u32(&mut payload, FourCc::TFHD)?);
        }
        Ok(tfhd)
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.base_data_offset.is_some() {
            flags |= Self::FLAG_BASE_DATA_OFFSET;
        }
        if self.sample_description_index.is_some() {
            flags |= Self::FLAG_SAMPLE_DESCRIPTION_INDEX;
        }
        if self.default_sample_duration.is_some() {
            flags |= Self::FLAG_DEFAULT_SAMPLE_DURATION;
        }
        if self.default_sample_size.is_some() {
            flags |= Self::FLAG_DEFAULT_SAMPLE_SIZE;
        }
        if self.default_sample_flags.is_some() {
            flags |= Self::FLAG_DEFAULT_SAMPLE_FLAGS;
        }
        if self.duration_is_empty {
            flags |= Self::FLAG_DURATION_IS_EMPTY;
        }
        if self.default_base_is_moof {
            flags |= Self::FLAG_DEFAULT_BASE_IS_MOOF;
        }
        flags
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_box(buf, FourCc::TFHD, |b| {
            b.put_u32(self.flags());
            b.put_u32(self.track_id);
            if let Some(v) = self.base_data_offset {
                b.put_u64(v);
            }
            if let Some(v) = self.sample_description_index {
                b.put_u32(v);
            }
            if let Some(v) = self.default_sample_duration {
                b.put_u32(v);
            }
            if let Some(v) = self.default_sample_size {
                b.put_u32(v);
            }
            if let Some(v) = self.default_sample_flags {
                b.put_u32(v);
            }
            Ok(())
        })
    }
}

/// Track fragment decode time box (`tfdt`, ISO/IEC 14496-12 §8.8.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TfdtBox {
    pub version: u8,
    pub base_media_decode_time: u64,
}

impl TfdtBox {
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let (version, _) = read_full_header(&mut payload, FourCc::TFDT)?;
        let base_media_decode_time = if version == 0 {
            u64::from(read_u32(&mut payload, FourCc::TFDT)?)
        } else {
            read_u64(&mut payload, FourCc::TFDT)?
        };
        Ok(Self {
            version,
            base_media_decode_time,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_box(buf, FourCc::TFDT, |b| {
            b.put_u32(u32::from(self.version) << 24);
            if self.version == 0 {
                let t = u32::try_from(self.base_media_decode_time)
                    .map_err(|_| GopcastError::Encode("decode time exceeds 32-bit tfdt"))?;
                b.put_u32(t);
            } else {
                b.put_u64(self.base_media_decode_time);
            }
            Ok(())
        })
    }
}

/// Track fragment run box (`trun`, ISO/IEC 14496-12 §8.8.8).
///
/// The flag word is kept verbatim from decode so re-encoding reproduces
/// the same per-sample field layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrunBox {
    pub version: u8,
    pub flags: u32,
    pub data_offset: Option<i32>,
    pub first_sample_flags: Option<u32>,
    pub entries: Vec<TrunEntry>,
}

/// Per-sample fields of one trun entry; presence follows the trun flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrunEntry {
    pub duration: Option<u32>,
    pub size: Option<u32>,
    pub flags: Option<u32>,
    pub cts_offset: Option<i32>,
}

impl TrunBox {
    pub const FLAG_DATA_OFFSET: u32 = 0x00_0001;
    pub const FLAG_FIRST_SAMPLE_FLAGS: u32 = 0x00_0004;
    pub const FLAG_SAMPLE_DURATION: u32 = 0x00_0100;
    pub const FLAG_SAMPLE_SIZE: u32 = 0x00_0200;
    pub const FLAG_SAMPLE_FLAGS: u32 = 0x00_0400;
    pub const FLAG_SAMPLE_CTS: u32 = 0x00_0800;

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let (version, flags) = read_full_header(&mut payload, FourCc::TRUN)?;
        let sample_count = read_u32(&mut payload, FourCc::TRUN)? as usize;

        let data_offset = if flags & Self::FLAG_DATA_OFFSET != 0 {
            Some(read_u32(&mut payload, FourCc::TRUN)? as i32)
        } else {
            None
        };
        let first_sample_flags = if flags & Self::FLAG_FIRST_SAMPLE_FLAGS != 0 {
            Some(read_u32(&mut payload, FourCc::TRUN)?)
        } else {
            None
        };

        let mut entries = Vec::with_capacity(sample_count.min(64));
        for _ in 0..sample_count {
            let mut entry = TrunEntry::default();
            if flags & Self::FLAG_SAMPLE_DURATION != 0 {
                entry.duration = Some(read_u32(&mut payload, FourCc::TRUN)?);
            }
            if flags & Self::FLAG_SAMPLE_SIZE != 0 {
                entry.size = Some(read_u32(&mut payload, FourCc::TRUN)?);
            }
            if flags & Self::FLAG_SAMPLE_FLAGS != 0 {
                entry.flags = Some(read_u32(&mut payload, FourCc::TRUN)?);
            }
            if flags & Self::FLAG_SAMPLE_CTS != 0 {
                // Version 0 stores the offset unsigned; version 1 signed.
                let raw = read_u32(&mut payload, FourCc::TRUN)?;
                entry.cts_offset = Some(if version == 0 {
                    raw as i32
                } else {
                    i32::from_be_bytes(raw.to_be_bytes())
                });
            }
            entries.push(entry);
        }

        Ok(Self {
            version,
            flags,
            data_offset,
            first_sample_flags,
            entries,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_box(buf, FourCc::TRUN, |b| {
            b.put_u32((u32::from(self.version) << 24) | (self.flags & 0x00ff_ffff));
            let count = u32::try_from(self.entries.len())
                .map_err(|_| GopcastError::Encode("trun sample count exceeds 32 bits"))?;
            b.put_u32(count);
            if self.flags & Self::FLAG_DATA_OFFSET != 0 {
                b.put_i32(self.data_offset.unwrap_or(0));
            }
            if self.flags & Self::FLAG_FIRST_SAMPLE_FLAGS != 0 {
                b.put_u32(self.first_sample_flags.unwrap_or(0));
            }
            for entry in &self.entries {
                if self.flags & Self::FLAG_SAMPLE_DURATION != 0 {
                    b.put_u32(entry.duration.unwrap_or(0));
                }
                if self.flags & Self::FLAG_SAMPLE_SIZE != 0 {
                    b.put_u32(entry.size.unwrap_or(0));
                }
                if self.flags & Self::FLAG_SAMPLE_FLAGS != 0 {
                    b.put_u32(entry.flags.unwrap_or(0));
                }
                if self.flags & Self::FLAG_SAMPLE_CTS != 0 {
                    b.put_i32(entry.cts_offset.unwrap_or(0));
                }
            }
            Ok(())
        })
    }
}

/// Track fragment box (`traf`, ISO/IEC 14496-12 §8.8.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafBox {
    pub tfhd: TfhdBox,
    pub tfdt: TfdtBox,
    pub truns: Vec<TrunBox>,
    pub other: Vec<RawBox>,
}

impl TrafBox {
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let mut tfhd = None;
        let mut tfdt = None;
        let mut truns = Vec::new();
        let mut other = Vec::new();

        while let Some((kind, child)) = read_child(FourCc::TRAF, &mut payload)? {
            match kind {
                FourCc::TFHD => tfhd = Some(TfhdBox::decode(child)?),
                FourCc::TFDT => tfdt = Some(TfdtBox::decode(child)?),
                FourCc::TRUN => truns.push(TrunBox::decode(child)?),
                _ => other.push(RawBox {
                    kind,
                    payload: child,
                }),
            }
        }

        Ok(Self {
            tfhd: tfhd.ok_or_else(|| missing(FourCc::TRAF, FourCc::TFHD))?,
            tfdt: tfdt.ok_or_else(|| missing(FourCc::TRAF, FourCc::TFDT))?,
            truns,
            other,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_box(buf, FourCc::TRAF, |b| {
            self.tfhd.encode(b)?;
            self.tfdt.encode(b)?;
            for trun in &self.truns {
                trun.encode(b)?;
            }
            for raw in &self.other {
                raw.encode(b)?;
            }
            Ok(())
        })
    }
}

/// Movie fragment box (`moof`, ISO/IEC 14496-12 §8.8.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoofBox {
    pub mfhd: MfhdBox,
    pub trafs: Vec<TrafBox>,
    pub other: Vec<RawBox>,
}

impl MoofBox {
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let mut mfhd = None;
        let mut trafs = Vec::new();
        let mut other = Vec::new();

        while let Some((kind, child)) = read_child(FourCc::MOOF, &mut payload)? {
            match kind {
                FourCc::MFHD => mfhd = Some(MfhdBox::decode(child)?),
                FourCc::TRAF => trafs.push(TrafBox::decode(child)?),
                _ => other.push(RawBox {
                    kind,
                    payload: child,
                }),
            }
        }

        Ok(Self {
            mfhd: mfhd.ok_or_else(|| missing(FourCc::MOOF, FourCc::MFHD))?,
            trafs,
            other,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        put_box(buf, FourCc::MOOF, |b| {
            self.mfhd.encode(b)?;
            for traf in &self.trafs {
                traf.encode(b)?;
            }
            for raw in &self.other {
                raw.encode(b)?;
            }
            Ok(())
        })
    }

    /// Total sample count described across all track fragments.
    pub fn sample_count(&self) -> usize {
        self.trafs
            .iter()
            .map(|t| t.truns.iter().map(|r| r.entries.len()).sum::<usize>())
            .sum()
    }
}

/// 32-bit sample flags word (ISO/IEC 14496-12 §8.8.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFlags(pub u32);

impl SampleFlags {
    /// The two-bit `sample_depends_on` field (bits 24–25).
    pub fn sample_depends_on(self) -> u8 {
        ((self.0 >> 24) & 0x3) as u8
    }

    /// The `sample_is_difference_sample` bit (bit 16).
    pub fn is_difference_sample(self) -> bool {
        (self.0 >> 16) & 0x1 == 1
    }

    /// A sample is a keyframe iff it does not depend on other samples
    /// (`sample_depends_on == 2`) and is not a difference sample.
    pub fn is_keyframe(self) -> bool {
        self.sample_depends_on() == 0x2 && !self.is_difference_sample()
    }
}

/// Write one box with the size-placeholder pattern: zero length word,
/// payload, patched length.
pub(crate) fn put_box<F>(buf: &mut BytesMut, kind: FourCc, payload: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(&kind.0);
    payload(buf)?;
    let size = u32::try_from(buf.len() - start)
        .map_err(|_| GopcastError::Encode("box size exceeds 32 bits"))?;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
    Ok(())
}

/// Split the next child box off the front of a parent payload.
///
/// Returns `Ok(None)` once the payload is exhausted. Children may use
/// 32-bit or 64-bit sizes; a size-0 child is rejected the same way the
/// top-level decoder rejects it.
pub(crate) fn read_child(parent: FourCc, payload: &mut Bytes) -> Result<Option<(FourCc, Bytes)>> {
    if payload.is_empty() {
        return Ok(None);
    }
    if payload.remaining() < 8 {
        return Err(GopcastError::Decode {
            kind: DecodeErrorKind::TruncatedChild { parent },
        });
    }

    let size = u64::from(payload.get_u32());
    let mut kind = [0u8; 4];
    payload.copy_to_slice(&mut kind);
    let kind = FourCc(kind);

    let body_len = match size {
        0 => {
            return Err(GopcastError::Decode {
                kind: DecodeErrorKind::UnboundedBox { kind },
            });
        }
        1 => {
            if payload.remaining() < 8 {
                return Err(GopcastError::Decode {
                    kind: DecodeErrorKind::TruncatedChild { parent },
                });
            }
            let large = payload.get_u64();
            if large < 16 {
                return Err(GopcastError::Decode {
                    kind: DecodeErrorKind::BoxSizeTooSmall { kind, size: large },
                });
            }
            large - 16
        }
        2..=7 => {
            return Err(GopcastError::Decode {
                kind: DecodeErrorKind::BoxSizeTooSmall { kind, size },
            });
        }
        _ => size - 8,
    };

    let body_len = usize::try_from(body_len).map_err(|_| GopcastError::Decode {
        kind: DecodeErrorKind::BoxTooLarge {
            kind,
            size: body_len,
        },
    })?;
    if payload.remaining() < body_len {
        return Err(GopcastError::Decode {
            kind: DecodeErrorKind::TruncatedChild { parent },
        });
    }
    Ok(Some((kind, payload.split_to(body_len))))
}

/// Read a full-box version byte and 24-bit flag word.
fn read_full_header(payload: &mut Bytes, kind: FourCc) -> Result<(u8, u32)> {
    let word = read_u32(payload, kind)?;
    Ok(((word >> 24) as u8, word & 0x00ff_ffff))
}

fn read_u32(payload: &mut Bytes, kind: FourCc) -> Result<u32> {
    if payload.remaining() < 4 {
        return Err(truncated(kind));
    }
    Ok(payload.get_u32())
}

fn read_u64(payload: &mut Bytes, kind: FourCc) -> Result<u64> {
    if payload.remaining() < 8 {
        return Err(truncated(kind));
    }
    Ok(payload.get_u64())
}

fn truncated(kind: FourCc) -> GopcastError {
    GopcastError::Decode {
        kind: DecodeErrorKind::TruncatedBox { kind },
    }
}

fn missing(parent: FourCc, child: FourCc) -> GopcastError {
    GopcastError::Decode {
        kind: DecodeErrorKind::MissingChild { parent, child },
    }
}
