// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A synthetic demuxer producing a stream of numbered packets, used to test the decoder in
//! isolation.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;

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

/// Timestamp increment between two frames. With a 1/15360 timebase this gives 30 fps.
pub(crate) const FRAME_DURATION: i64 = 512;
pub(crate) const TIME_BASE: f64 = 1.0 / 15360.0;

/// Returns the number of the frame carried by a synthetic packet.
pub(crate) fn frame_number(packet: &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(packet.get(..8)?.try_into().ok()?))
}

#[derive(Debug)]
struct Control {
    width: u32,
    height: u32,
    fail_params: bool,
    empty_packet_after_seek: bool,
    num_seeks: usize,
}

/// Lets a test alter a [`SyntheticDemuxer`] after it has been handed to a decoder.
#[derive(Clone, Debug)]
pub(crate) struct SyntheticHandle(Arc<Mutex<Control>>);

impl SyntheticHandle {
    pub(crate) fn set_resolution(&self, width: u32, height: u32) {
        let mut control = self.0.lock().unwrap();
        control.width = width;
        control.height = height;
    }

    pub(crate) fn fail_params(&self, fail: bool) {
        self.0.lock().unwrap().fail_params = fail;
    }

    /// Makes the demuxer return an empty packet right after each seek.
    pub(crate) fn empty_packet_after_seek(&self) {
        self.0.lock().unwrap().empty_packet_after_seek = true;
    }

    pub(crate) fn num_seeks(&self) -> usize {
        self.0.lock().unwrap().num_seeks
    }
}

/// `num_frames` frames of `codec`, with a key frame every `gop` frames.
pub(crate) struct SyntheticDemuxer {
    codec: Codec,
    num_frames: u64,
    gop: u64,
    next: u64,
    pending_empty_packet: bool,
    control: Arc<Mutex<Control>>,
}

impl SyntheticDemuxer {
    pub(crate) fn new(width: u32, height: u32, num_frames: u64, gop: u64) -> Self {
        Self {
            codec: Codec::H264,
            num_frames,
            gop,
            next: 0,
            pending_empty_packet: false,
            control: Arc::new(Mutex::new(Control {
                width,
                height,
                fail_params: false,
                empty_packet_after_seek: false,
                num_seeks: 0,
            })),
        }
    }

    pub(crate) fn handle(&self) -> SyntheticHandle {
        SyntheticHandle(Arc::clone(&self.control))
    }
}

impl Demuxer for SyntheticDemuxer {
    fn params(&self) -> Result<VideoParams, DemuxError> {
        let control = self.control.lock().unwrap();
        if control.fail_params {
            return Err(anyhow!("injected metadata failure").into());
        }

        Ok(VideoParams {
            width: control.width,
            height: control.height,
            codec: self.codec,
            format: PixelFormat::NV12,
            color_space: ColorSpace::Bt709,
            color_range: ColorRange::Mpeg,
            frame_rate: 30.0,
            avg_frame_rate: 30.0,
            is_vfr: false,
            time_base: TIME_BASE,
            num_frames: Some(self.num_frames),
        })
    }

    fn ts_from_frame_number(&self, frame: u64) -> i64 {
        frame as i64 * FRAME_DURATION
    }

    fn ts_from_time(&self, seconds: f64) -> i64 {
        (seconds / TIME_BASE).round() as i64
    }

    fn demux(
        &mut self,
        seek: Option<&SeekContext>,
        need_sei: bool,
    ) -> Result<DemuxedPacket, DemuxError> {
        if let Some(seek) = seek {
            let target = match seek.target {
                SeekTarget::FrameNumber(frame) => self.ts_from_frame_number(frame),
                SeekTarget::Timestamp(seconds) => self.ts_from_time(seconds),
            };
            let frame = (target.max(0) / FRAME_DURATION) as u64;
            self.next = frame.min(self.num_frames.saturating_sub(1)) / self.gop * self.gop;

            let mut control = self.control.lock().unwrap();
            control.num_seeks += 1;
            self.pending_empty_packet = control.empty_packet_after_seek;
        }

        if std::mem::take(&mut self.pending_empty_packet) {
            return Ok(Default::default());
        }

        if self.next >= self.num_frames {
            return Err(DemuxError::EndOfStream);
        }

        let frame = self.next;
        self.next += 1;
        let key = frame % self.gop == 0;

        let mut data = frame.to_le_bytes().to_vec();
        data.push(key as u8);

        Ok(DemuxedPacket {
            data: Buffer::copy_from(&data),
            packet_data: PacketData {
                pts: self.ts_from_frame_number(frame),
                dts: self.ts_from_frame_number(frame),
                duration: FRAME_DURATION,
                pos: frame as i64 * data.len() as i64,
                key,
            },
            sei: (need_sei && key).then(|| Buffer::copy_from(format!("sei{}", frame).as_bytes())),
        })
    }
}
