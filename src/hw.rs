// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the hardware decoding engine.
//!
//! The engine is pipelined: a packet submitted with [`HwDecoder::decode`] may only come out as a
//! decoded frame several calls later, so a call returning no frame is not an error.

#[cfg(test)]
pub(crate) mod dummy;

use std::sync::Arc;

use enumn::N;
use thiserror::Error;

use crate::buffer::PacketData;
use crate::device::DeviceContext;
use crate::surface::Surface;
use crate::Codec;
use crate::PixelFormat;

/// Capabilities that can be queried from a hardware decoder for its codec.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum DecoderCapability {
    IsCodecSupported = 0,
    BitDepthMinus8 = 1,
    /// Bitmask of the output formats the engine can produce.
    OutputFormatMask = 2,
    MaxWidth = 3,
    MaxHeight = 4,
    /// Maximum number of macroblocks per frame.
    MaxMbCount = 5,
    MinWidth = 6,
    MinHeight = 7,
    IsHistSupported = 8,
    HistCountBitDepth = 9,
    HistCountBins = 10,
}

impl DecoderCapability {
    /// Returns all the capabilities, in code order.
    pub fn all() -> impl Iterator<Item = DecoderCapability> {
        (0..).map_while(DecoderCapability::n)
    }
}

#[derive(Error, Debug)]
pub enum HwDecodeError {
    /// The engine itself failed. The decoder instance is unusable afterwards.
    #[error("decoder engine fault: {0:#}")]
    Engine(anyhow::Error),
    /// The bitstream could not be parsed.
    #[error("bitstream parser fault: {0:#}")]
    Parser(anyhow::Error),
}

/// Parameters a hardware decoder instance is created with.
#[derive(Clone, Debug)]
pub struct DecoderParams {
    pub ctx: Arc<DeviceContext>,
    pub codec: Codec,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Number of surfaces the decoder may keep in flight.
    pub pool_frame_size: usize,
}

/// A frame produced by the hardware decoder.
#[derive(Debug)]
pub struct DecodedFrame {
    /// Surfaces usually come from the decoder's pool, in which case this is a non-owning handle
    /// that becomes invalid once the decoder is destroyed.
    pub surface: Surface,
    /// Metadata of the packet this frame was decoded from.
    pub packet_data: Option<PacketData>,
}

pub trait HwDecoder: Send {
    /// Submits `packet` for decoding and returns the next frame that is ready, if any.
    ///
    /// A `None` packet signals the end of the stream and makes the engine output the frames it
    /// is still holding, one per call. If `no_eos` is set, the end-of-stream condition is not
    /// latched so the decoder can be fed new packets afterwards.
    fn decode(
        &mut self,
        packet: Option<&[u8]>,
        packet_data: Option<&PacketData>,
        no_eos: bool,
    ) -> Result<Option<DecodedFrame>, HwDecodeError>;

    /// Returns the value of `cap` for the codec this decoder was created for.
    fn capability(&self, cap: DecoderCapability) -> i32;
}

/// Creates hardware decoder instances, e.g. to replace one after an engine fault.
pub trait HwDecoderFactory: Send {
    fn create(&self, params: &DecoderParams) -> Result<Box<dyn HwDecoder>, HwDecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_in_code_order() {
        let caps: Vec<_> = DecoderCapability::all().collect();
        assert_eq!(caps.len(), 11);
        assert_eq!(caps[0], DecoderCapability::IsCodecSupported);
        assert_eq!(caps[10], DecoderCapability::HistCountBins);
        assert_eq!(DecoderCapability::n(5), Some(DecoderCapability::MaxMbCount));
    }
}
