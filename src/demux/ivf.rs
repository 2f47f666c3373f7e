// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Demuxer for IVF files carrying VP8, VP9 or AV1 streams.
//!
//! The whole file is indexed when the demuxer is created, so seeking is just a matter of
//! finding the right entry in the index.

use std::path::Path;

use anyhow::anyhow;
use anyhow::Context;
use bitreader::BitReader;
use bytes::Buf;
use bytes::Bytes;

use crate::buffer::Buffer;
use crate::buffer::PacketData;
use crate::demux::DemuxError;
use crate::demux::DemuxedPacket;
use crate::demux::Demuxer;
use crate::demux::SeekContext;
use crate::demux::SeekTarget;
use crate::demux::VideoParams;
use crate::Codec;
use crate::ColorRange;
use crate::ColorSpace;
use crate::PixelFormat;

const FILE_HEADER_SIZE: usize = 32;
const FRAME_HEADER_SIZE: usize = 12;

const OBU_SEQUENCE_HEADER: u8 = 1;

/// The 32-byte header at the start of every IVF file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IvfFileHeader {
    pub version: u16,
    pub header_size: u16,
    pub codec: [u8; 4],
    pub width: u16,
    pub height: u16,
    /// Timebase denominator.
    pub rate: u32,
    /// Timebase numerator.
    pub scale: u32,
    pub frame_count: u32,
}

impl IvfFileHeader {
    pub const MAGIC: [u8; 4] = *b"DKIF";

    pub fn parse(data: &[u8]) -> Result<Self, DemuxError> {
        let mut reader = data
            .get(..FILE_HEADER_SIZE)
            .ok_or_else(|| DemuxError::InvalidData("truncated IVF file header".into()))?;

        let mut magic = [0u8; 4];
        reader.copy_to_slice(&mut magic);
        if magic != Self::MAGIC {
            return Err(DemuxError::InvalidData("not an IVF file".into()));
        }

        let version = reader.get_u16_le();
        let header_size = reader.get_u16_le();
        let mut codec = [0u8; 4];
        reader.copy_to_slice(&mut codec);

        let header = Self {
            version,
            header_size,
            codec,
            width: reader.get_u16_le(),
            height: reader.get_u16_le(),
            rate: reader.get_u32_le(),
            scale: reader.get_u32_le(),
            frame_count: reader.get_u32_le(),
        };

        if header.rate == 0 || header.scale == 0 {
            return Err(DemuxError::InvalidData("IVF timebase is zero".into()));
        }

        Ok(header)
    }

    /// Writes the header into `writer`.
    #[cfg(test)]
    pub(crate) fn write_into(&self, writer: &mut impl std::io::Write) -> std::io::Result<()> {
        writer.write_all(&Self::MAGIC)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.header_size.to_le_bytes())?;
        writer.write_all(&self.codec)?;
        writer.write_all(&self.width.to_le_bytes())?;
        writer.write_all(&self.height.to_le_bytes())?;
        writer.write_all(&self.rate.to_le_bytes())?;
        writer.write_all(&self.scale.to_le_bytes())?;
        writer.write_all(&self.frame_count.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;

        Ok(())
    }
}

fn vp9_is_key_frame(frame: &[u8]) -> anyhow::Result<bool> {
    let mut r = BitReader::new(frame);

    if r.read_u32(2)? != 2 {
        return Err(anyhow!("invalid VP9 frame marker"));
    }

    let profile_low = r.read_u32(1)?;
    let profile_high = r.read_u32(1)?;
    if (profile_high << 1) | profile_low == 3 {
        let _reserved_zero = r.read_bool()?;
    }

    let show_existing_frame = r.read_bool()?;
    if show_existing_frame {
        return Ok(false);
    }

    // frame_type is 0 for key frames.
    Ok(!r.read_bool()?)
}

fn read_leb128(data: &[u8]) -> anyhow::Result<(usize, usize)> {
    let mut value = 0usize;
    for (i, byte) in data.iter().take(8).enumerate() {
        value |= ((byte & 0x7f) as usize) << (i * 7);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    Err(anyhow!("invalid leb128 value"))
}

/// AV1 temporal units starting a coded video sequence carry a sequence header.
fn av1_has_sequence_header(mut data: &[u8]) -> anyhow::Result<bool> {
    while !data.is_empty() {
        let mut r = BitReader::new(data);
        let _forbidden_bit = r.read_bool()?;
        let obu_type = r.read_u8(4)?;
        let extension_flag = r.read_bool()?;
        let has_size_field = r.read_bool()?;

        if obu_type == OBU_SEQUENCE_HEADER {
            return Ok(true);
        }
        if !has_size_field {
            // The OBU extends to the end of the temporal unit.
            return Ok(false);
        }

        let header_len = 1 + extension_flag as usize;
        let (size, size_len) = read_leb128(data.get(header_len..).unwrap_or_default())?;
        data = data
            .get(header_len + size_len + size..)
            .ok_or_else(|| anyhow!("truncated OBU"))?;
    }

    Ok(false)
}

fn is_key_frame(codec: Codec, frame: &[u8]) -> bool {
    let key = match codec {
        Codec::VP8 => Ok(frame.first().map(|tag| tag & 1 == 0).unwrap_or(false)),
        Codec::VP9 => vp9_is_key_frame(frame),
        Codec::AV1 => av1_has_sequence_header(frame),
        _ => Ok(false),
    };

    key.unwrap_or_else(|e| {
        log::debug!("Cannot tell whether frame is a key frame: {:#}", e);
        false
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct IndexEntry {
    /// Position of the frame header in the file.
    pos: usize,
    size: usize,
    pts: i64,
    key: bool,
}

impl IndexEntry {
    fn data_range(&self) -> std::ops::Range<usize> {
        let start = self.pos + FRAME_HEADER_SIZE;
        start..start + self.size
    }
}

pub struct IvfDemuxer {
    data: Bytes,
    header: IvfFileHeader,
    codec: Codec,
    index: Vec<IndexEntry>,
    next: usize,
}

impl IvfDemuxer {
    pub fn new(data: impl Into<Bytes>) -> Result<Self, DemuxError> {
        let data = data.into();
        let header = IvfFileHeader::parse(&data)?;
        let codec = Codec::from_fourcc(&header.codec).ok_or_else(|| {
            DemuxError::InvalidData(format!(
                "unsupported IVF codec {}",
                String::from_utf8_lossy(&header.codec)
            ))
        })?;

        // The frame count is only a hint, every frame needs at least a frame header.
        let capacity = (header.frame_count as usize).min(data.len() / FRAME_HEADER_SIZE);
        let mut index = Vec::with_capacity(capacity);
        let mut pos = (header.header_size as usize).max(FILE_HEADER_SIZE);
        while data.len().saturating_sub(pos) >= FRAME_HEADER_SIZE {
            let mut frame_header = &data[pos..pos + FRAME_HEADER_SIZE];
            let size = frame_header.get_u32_le() as usize;
            let pts = frame_header.get_u64_le() as i64;

            let entry = IndexEntry {
                pos,
                size,
                pts,
                key: false,
            };
            let Some(frame) = data.get(entry.data_range()) else {
                log::warn!("Frame {} of IVF file is truncated, ignoring it", index.len());
                break;
            };

            index.push(IndexEntry {
                // The first frame of a stream is always decodable on its own.
                key: index.is_empty() || is_key_frame(codec, frame),
                ..entry
            });
            pos = entry.data_range().end;
        }

        log::debug!(
            "Indexed {} frames of {:?} IVF stream ({} key frames)",
            index.len(),
            codec,
            index.iter().filter(|e| e.key).count()
        );

        Ok(Self {
            data,
            header,
            codec,
            index,
            next: 0,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, DemuxError> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read IVF file {}", path.display()))?;

        Self::new(data)
    }

    pub fn header(&self) -> &IvfFileHeader {
        &self.header
    }

    fn time_base(&self) -> f64 {
        self.header.scale as f64 / self.header.rate as f64
    }

    /// Average distance between the timestamps of two consecutive frames.
    fn avg_pts_delta(&self) -> f64 {
        match (self.index.first(), self.index.last()) {
            (Some(first), Some(last)) if self.index.len() > 1 && last.pts > first.pts => {
                last.pts.saturating_sub(first.pts) as f64 / (self.index.len() - 1) as f64
            }
            _ => 1.0,
        }
    }

    fn target_pts(&self, seek: &SeekContext) -> i64 {
        match seek.target {
            SeekTarget::FrameNumber(frame) => self.ts_from_frame_number(frame),
            SeekTarget::Timestamp(seconds) => self.ts_from_time(seconds),
        }
    }
}

impl Demuxer for IvfDemuxer {
    fn params(&self) -> Result<VideoParams, DemuxError> {
        let frame_rate = self.header.rate as f64 / self.header.scale as f64;
        let avg_frame_rate = match self.index.len() {
            0 | 1 => frame_rate,
            _ => 1.0 / (self.avg_pts_delta() * self.time_base()),
        };

        let mut deltas = self.index.windows(2).map(|w| w[1].pts.saturating_sub(w[0].pts));
        let is_vfr = match deltas.next() {
            Some(first) => deltas.any(|d| d != first),
            None => false,
        };

        Ok(VideoParams {
            width: self.header.width as u32,
            height: self.header.height as u32,
            codec: self.codec,
            format: PixelFormat::NV12,
            color_space: ColorSpace::Unspecified,
            color_range: ColorRange::Unspecified,
            frame_rate,
            avg_frame_rate,
            is_vfr,
            time_base: self.time_base(),
            num_frames: Some(self.index.len() as u64),
        })
    }

    fn ts_from_frame_number(&self, frame: u64) -> i64 {
        if let Some(entry) = self.index.get(frame as usize) {
            return entry.pts;
        }

        // Past the end of the stream: extrapolate from the last frame.
        let (last, last_pts) = match self.index.last() {
            Some(entry) => (self.index.len() as u64 - 1, entry.pts),
            None => (0, 0),
        };
        last_pts.saturating_add(((frame - last) as f64 * self.avg_pts_delta()).round() as i64)
    }

    fn ts_from_time(&self, seconds: f64) -> i64 {
        (seconds / self.time_base()).round() as i64
    }

    fn demux(
        &mut self,
        seek: Option<&SeekContext>,
        _need_sei: bool,
    ) -> Result<DemuxedPacket, DemuxError> {
        if let Some(seek) = seek {
            let target = self.target_pts(seek);
            self.next = self
                .index
                .iter()
                .rposition(|e| e.key && e.pts <= target)
                .unwrap_or(0);
            log::debug!("Seeking to frame {} for target pts {}", self.next, target);
        }

        let entry = *self.index.get(self.next).ok_or(DemuxError::EndOfStream)?;
        self.next += 1;

        let duration = match self.index.get(self.next) {
            Some(next) => next.pts.saturating_sub(entry.pts),
            None => self.avg_pts_delta().round() as i64,
        };

        Ok(DemuxedPacket {
            data: Buffer::copy_from(&self.data[entry.data_range()]),
            packet_data: PacketData {
                pts: entry.pts,
                dts: entry.pts,
                duration,
                pos: entry.pos as i64,
                key: entry.key,
            },
            // IVF has no room for SEI.
            sei: None,
        })
    }
}
