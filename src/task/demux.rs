// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::buffer::Buffer;
use crate::buffer::PacketData;
use crate::demux::DemuxError;
use crate::demux::Demuxer;
use crate::demux::SeekContext;
use crate::demux::VideoParams;
use crate::task::record;
use crate::task::Task;
use crate::task::TaskError;
use crate::task::TaskExecDetails;
use crate::task::TaskExecInfo;

pub struct DemuxInput<'a> {
    /// Pending seek request. Served by the first read, then marked as done.
    pub seek: Option<&'a mut SeekContext>,
    pub need_sei: bool,
}

#[derive(Clone, Debug)]
pub struct DemuxOutput {
    pub packet: Buffer,
    pub packet_data: PacketData,
    pub sei: Option<Buffer>,
}

/// Reads one non-empty packet from a [`Demuxer`] per execution.
pub struct DemuxTask {
    demuxer: Box<dyn Demuxer>,
    details: TaskExecDetails,
    last_packet_data: Option<PacketData>,
}

impl DemuxTask {
    pub fn new(demuxer: Box<dyn Demuxer>) -> Self {
        Self {
            demuxer,
            details: Default::default(),
            last_packet_data: None,
        }
    }

    pub fn params(&self) -> Result<VideoParams, DemuxError> {
        self.demuxer.params()
    }

    pub fn ts_from_frame_number(&self, frame: u64) -> i64 {
        self.demuxer.ts_from_frame_number(frame)
    }

    pub fn ts_from_time(&self, seconds: f64) -> i64 {
        self.demuxer.ts_from_time(seconds)
    }

    /// Metadata of the last packet read.
    pub fn last_packet_data(&self) -> Option<PacketData> {
        self.last_packet_data
    }

    fn read(&mut self, input: DemuxInput<'_>) -> Result<DemuxOutput, TaskError> {
        let DemuxInput { mut seek, need_sei } = input;
        let seeking = seek.as_deref().is_some_and(|s| s.use_seek);

        let packet = loop {
            let request = seek.as_deref().filter(|s| s.use_seek);
            let result = self.demuxer.demux(request, need_sei);
            if let Some(seek) = seek.as_deref_mut() {
                seek.use_seek = false;
            }

            match result {
                Ok(packet) if packet.data.is_empty() => continue,
                Ok(packet) => break packet,
                Err(DemuxError::EndOfStream) => {
                    return Err(TaskError::Failed(TaskExecDetails::fail(
                        TaskExecInfo::EndOfStream,
                        "demuxer reached the end of the stream",
                    )))
                }
                Err(e) => {
                    return Err(TaskError::Failed(TaskExecDetails::fail(
                        TaskExecInfo::Fail,
                        e.to_string(),
                    )))
                }
            }
        };

        if let Some(seek) = seek.filter(|_| seeking) {
            seek.out_frame_pts = packet.packet_data.pts;
            seek.out_frame_duration = packet.packet_data.duration;
        }
        self.last_packet_data = Some(packet.packet_data);

        Ok(DemuxOutput {
            packet: packet.data,
            packet_data: packet.packet_data,
            sei: packet.sei,
        })
    }
}

impl Task for DemuxTask {
    type Input<'a> = DemuxInput<'a>;
    type Output = DemuxOutput;

    fn name(&self) -> &'static str {
        "DemuxFrame"
    }

    fn execute(&mut self, input: Self::Input<'_>) -> Result<Self::Output, TaskError> {
        let result = self.read(input);
        record(&mut self.details, result, TaskExecInfo::Success)
    }

    fn exec_details(&self) -> &TaskExecDetails {
        &self.details
    }
}
