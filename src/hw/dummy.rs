// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A pipelined fake hardware decoder for packets produced by the synthetic demuxer.
//!
//! Each decoded frame is written into a surface of the decoder's pool, with the luma plane
//! filled with a value derived from the frame number so tests can tell frames apart.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;

use crate::buffer::PacketData;
use crate::demux::dummy::frame_number;
use crate::device::dummy::DummyDevice;
use crate::hw::DecodedFrame;
use crate::hw::DecoderCapability;
use crate::hw::DecoderParams;
use crate::hw::HwDecodeError;
use crate::hw::HwDecoder;
use crate::hw::HwDecoderFactory;
use crate::surface::Surface;

/// Byte value the luma plane of frame `frame` is filled with.
pub(crate) fn luma_value(frame: u64) -> u8 {
    (frame % 251) as u8
}

#[derive(Debug, Default)]
struct Faults {
    engine_fault_at: Option<u64>,
    parser_fault_at: Option<u64>,
    fail_creation: bool,
    num_created: usize,
}

#[derive(Clone)]
pub(crate) struct DummyHwFactory {
    device: Arc<DummyDevice>,
    latency: usize,
    faults: Arc<Mutex<Faults>>,
}

impl DummyHwFactory {
    /// Decoders created by this factory hold `latency` packets before outputting frames.
    pub(crate) fn new(device: Arc<DummyDevice>, latency: usize) -> Self {
        Self {
            device,
            latency,
            faults: Default::default(),
        }
    }

    /// Makes the engine fail once when it is fed the packet of frame `frame`.
    pub(crate) fn inject_engine_fault(&self, frame: u64) {
        self.faults.lock().unwrap().engine_fault_at = Some(frame);
    }

    /// Makes the parser fail once when it is fed the packet of frame `frame`.
    pub(crate) fn inject_parser_fault(&self, frame: u64) {
        self.faults.lock().unwrap().parser_fault_at = Some(frame);
    }

    /// Makes every further call to `create` fail.
    pub(crate) fn fail_creation(&self) {
        self.faults.lock().unwrap().fail_creation = true;
    }

    pub(crate) fn num_created(&self) -> usize {
        self.faults.lock().unwrap().num_created
    }
}

impl HwDecoderFactory for DummyHwFactory {
    fn create(&self, params: &DecoderParams) -> Result<Box<dyn HwDecoder>, HwDecodeError> {
        if self.faults.lock().unwrap().fail_creation {
            return Err(HwDecodeError::Engine(anyhow!("no decoder instance available")));
        }

        let pool = (0..params.pool_frame_size.max(1))
            .map(|_| Surface::new(params.format, params.width, params.height, &params.ctx))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HwDecodeError::Engine(e.into()))?;

        self.faults.lock().unwrap().num_created += 1;

        Ok(Box::new(DummyHwDecoder {
            device: Arc::clone(&self.device),
            latency: self.latency,
            pool,
            next_slot: 0,
            queue: Default::default(),
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct DummyHwDecoder {
    device: Arc<DummyDevice>,
    latency: usize,
    pool: Vec<Surface>,
    next_slot: usize,
    queue: VecDeque<(u64, Option<PacketData>)>,
    faults: Arc<Mutex<Faults>>,
}

impl DummyHwDecoder {
    fn output(&mut self, frame: u64, packet_data: Option<PacketData>) -> DecodedFrame {
        let surface = &self.pool[self.next_slot % self.pool.len()];
        self.next_slot += 1;

        let plane = surface.plane(0).unwrap();
        self.device.fill_2d(
            plane.gpu_mem().unwrap(),
            plane.pitch() as usize,
            plane.width() as usize * plane.elem_size(),
            surface.height() as usize,
            luma_value(frame),
        );

        DecodedFrame {
            surface: surface.clone(),
            packet_data,
        }
    }
}

impl HwDecoder for DummyHwDecoder {
    fn decode(
        &mut self,
        packet: Option<&[u8]>,
        packet_data: Option<&PacketData>,
        _no_eos: bool,
    ) -> Result<Option<DecodedFrame>, HwDecodeError> {
        if let Some(packet) = packet {
            let frame = frame_number(packet)
                .ok_or_else(|| HwDecodeError::Parser(anyhow!("packet is too short")))?;

            let mut faults = self.faults.lock().unwrap();
            if faults.engine_fault_at == Some(frame) {
                faults.engine_fault_at = None;
                return Err(HwDecodeError::Engine(anyhow!("engine fault at frame {}", frame)));
            }
            if faults.parser_fault_at == Some(frame) {
                faults.parser_fault_at = None;
                return Err(HwDecodeError::Parser(anyhow!("corrupt slice in frame {}", frame)));
            }
            drop(faults);

            self.queue.push_back((frame, packet_data.copied()));
            if self.queue.len() <= self.latency {
                return Ok(None);
            }
        }

        Ok(self
            .queue
            .pop_front()
            .map(|(frame, packet_data)| self.output(frame, packet_data)))
    }

    fn capability(&self, cap: DecoderCapability) -> i32 {
        match cap {
            DecoderCapability::IsCodecSupported => 1,
            DecoderCapability::BitDepthMinus8 => 0,
            DecoderCapability::OutputFormatMask => 1,
            DecoderCapability::MaxWidth | DecoderCapability::MaxHeight => 4096,
            DecoderCapability::MaxMbCount => 65536,
            DecoderCapability::MinWidth => 48,
            DecoderCapability::MinHeight => 16,
            DecoderCapability::IsHistSupported
            | DecoderCapability::HistCountBitDepth
            | DecoderCapability::HistCountBins => 0,
        }
    }
}
