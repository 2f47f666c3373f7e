// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::buffer::Buffer;
use crate::buffer::PacketData;
use crate::hw::DecodedFrame;
use crate::hw::DecoderCapability;
use crate::hw::HwDecodeError;
use crate::hw::HwDecoder;
use crate::task::record;
use crate::task::Task;
use crate::task::TaskError;
use crate::task::TaskExecDetails;
use crate::task::TaskExecInfo;

pub struct DecodeInput<'a> {
    /// Compressed packet. `None` or an empty packet signals the end of the stream.
    pub packet: Option<&'a Buffer>,
    pub packet_data: Option<&'a PacketData>,
    /// Do not latch the end-of-stream condition, used to drain the engine in the middle of a
    /// stream.
    pub no_eos: bool,
}

/// Feeds one packet to a [`HwDecoder`] per execution and returns the frame it produced, if any.
pub struct DecodeTask {
    decoder: Box<dyn HwDecoder>,
    details: TaskExecDetails,
}

impl DecodeTask {
    pub fn new(decoder: Box<dyn HwDecoder>) -> Self {
        Self {
            decoder,
            details: Default::default(),
        }
    }

    pub fn capability(&self, cap: DecoderCapability) -> i32 {
        self.decoder.capability(cap)
    }

    fn decode(&mut self, input: DecodeInput<'_>) -> Result<Option<DecodedFrame>, TaskError> {
        let packet = input.packet.filter(|p| !p.is_empty());

        let decoded = self
            .decoder
            .decode(packet.map(Buffer::as_slice), input.packet_data, input.no_eos)
            .map_err(|e| match e {
                HwDecodeError::Engine(e) => TaskError::DecoderEngine(e),
                HwDecodeError::Parser(e) => TaskError::Parser(e),
            })?;

        match decoded {
            // Flushing without anything left to output.
            None if packet.is_none() && !input.no_eos => Err(TaskError::Failed(
                TaskExecDetails::fail(TaskExecInfo::EndOfStream, "no more frames to flush"),
            )),
            decoded => Ok(decoded),
        }
    }
}

impl Task for DecodeTask {
    type Input<'a> = DecodeInput<'a>;
    type Output = Option<DecodedFrame>;

    fn name(&self) -> &'static str {
        "DecodeFrame"
    }

    fn execute(&mut self, input: Self::Input<'_>) -> Result<Self::Output, TaskError> {
        let result = self.decode(input);
        let info = match &result {
            Ok(None) => TaskExecInfo::MoreDataNeeded,
            _ => TaskExecInfo::Success,
        };

        record(&mut self.details, result, info)
    }

    fn exec_details(&self) -> &TaskExecDetails {
        &self.details
    }
}
