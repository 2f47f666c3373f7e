// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Splitting of container files into compressed packets.
//!
//! The [`Demuxer`] trait is what the decoder expects from a container reader. [`ivf`] provides
//! a built-in implementation for IVF files.

pub mod ivf;

#[cfg(test)]
pub(crate) mod dummy;

use thiserror::Error;

use crate::buffer::Buffer;
use crate::buffer::PacketData;
use crate::buffer::NO_PTS;
use crate::Codec;
use crate::ColorRange;
use crate::ColorSpace;
use crate::PixelFormat;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SeekMode {
    /// Land exactly on the requested frame.
    ExactFrame,
    /// Land on the closest key frame preceding the requested frame.
    #[default]
    PrevKeyFrame,
}

/// Where to seek to.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SeekTarget {
    FrameNumber(u64),
    /// Time in seconds from the start of the stream.
    Timestamp(f64),
}

/// A seek request, along with what the seek actually achieved once it has been served.
#[derive(Clone, Debug, PartialEq)]
pub struct SeekContext {
    pub target: SeekTarget,
    pub mode: SeekMode,
    /// Whether the demuxer still has to reposition before reading the next packet.
    pub use_seek: bool,
    /// Number of decode iterations performed while serving the request.
    pub num_frames_decoded: u64,
    /// Timestamp of the first packet read after repositioning.
    pub out_frame_pts: i64,
    /// Duration of the first packet read after repositioning.
    pub out_frame_duration: i64,
}

impl SeekContext {
    fn new(target: SeekTarget) -> Self {
        Self {
            target,
            mode: Default::default(),
            use_seek: true,
            num_frames_decoded: 0,
            out_frame_pts: NO_PTS,
            out_frame_duration: 0,
        }
    }

    pub fn frame_number(frame: u64) -> Self {
        Self::new(SeekTarget::FrameNumber(frame))
    }

    pub fn timestamp(seconds: f64) -> Self {
        Self::new(SeekTarget::Timestamp(seconds))
    }

    pub fn with_mode(self, mode: SeekMode) -> Self {
        Self { mode, ..self }
    }
}

/// Properties of the video stream of a container.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub codec: Codec,
    pub format: PixelFormat,
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
    pub frame_rate: f64,
    pub avg_frame_rate: f64,
    /// Whether the stream has a variable frame rate.
    pub is_vfr: bool,
    /// Duration of one timestamp unit, in seconds.
    pub time_base: f64,
    /// Number of frames, if known.
    pub num_frames: Option<u64>,
}

/// A packet read from a container.
#[derive(Clone, Debug, Default)]
pub struct DemuxedPacket {
    pub data: Buffer,
    pub packet_data: PacketData,
    /// SEI payload attached to the packet, if requested and present.
    pub sei: Option<Buffer>,
}

#[derive(Error, Debug)]
pub enum DemuxError {
    #[error("end of stream")]
    EndOfStream,
    #[error("invalid container data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub trait Demuxer: Send {
    fn params(&self) -> Result<VideoParams, DemuxError>;

    /// Timestamp of the `frame`-th frame, in timebase units.
    fn ts_from_frame_number(&self, frame: u64) -> i64;

    /// Timestamp corresponding to `seconds`, in timebase units.
    fn ts_from_time(&self, seconds: f64) -> i64;

    /// Reads the next packet. If `seek` is given the demuxer first repositions according to it.
    /// Packets may be empty, in which case the caller is expected to read again.
    fn demux(
        &mut self,
        seek: Option<&SeekContext>,
        need_sei: bool,
    ) -> Result<DemuxedPacket, DemuxError>;
}
