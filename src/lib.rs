// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hardware-accelerated video decoding into device-resident surfaces.
//!
//! The entry point is [`decoder::Decoder`], which drives a [`demux::Demuxer`] and a
//! [`hw::HwDecoder`] through the [`task`] abstraction and hands out [`surface::Surface`]s whose
//! planes live in device memory. Device memory, contexts and streams are provided by an
//! implementation of [`device::Device`], usually obtained through the process-wide
//! [`device::resource_manager::ResourceManager`].

pub mod buffer;
pub mod decoder;
pub mod demux;
pub mod device;
pub mod hw;
pub mod image_processing;
pub mod surface;
pub mod task;

use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Pixel formats a [`surface::Surface`] can hold.
#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Luma only.
    Y,
    /// Luma plane followed by interleaved 2x2 subsampled chroma, stored as a single plane.
    NV12,
    YUV420,
    YUV422,
    YUV444,
    RGB,
    BGR,
    RGBPlanar,
    RGB32F,
    RGB32FPlanar,
    /// NV12 layout with 16-bit samples holding 10 significant bits.
    P10,
    /// NV12 layout with 16-bit samples holding 12 significant bits.
    P12,
    YUV444_10bit,
    #[default]
    Undefined,
}

impl FromStr for PixelFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "y" | "Y" => Ok(PixelFormat::Y),
            "nv12" | "NV12" => Ok(PixelFormat::NV12),
            "yuv420" | "YUV420" | "i420" | "I420" => Ok(PixelFormat::YUV420),
            "yuv422" | "YUV422" => Ok(PixelFormat::YUV422),
            "yuv444" | "YUV444" => Ok(PixelFormat::YUV444),
            "rgb" | "RGB" => Ok(PixelFormat::RGB),
            "bgr" | "BGR" => Ok(PixelFormat::BGR),
            "rgb_planar" | "RGB_PLANAR" => Ok(PixelFormat::RGBPlanar),
            "rgb32f" | "RGB32F" => Ok(PixelFormat::RGB32F),
            "rgb32f_planar" | "RGB32F_PLANAR" => Ok(PixelFormat::RGB32FPlanar),
            "p10" | "P10" => Ok(PixelFormat::P10),
            "p12" | "P12" => Ok(PixelFormat::P12),
            "yuv444_10bit" | "YUV444_10bit" => Ok(PixelFormat::YUV444_10bit),
            _ => Err("unrecognized pixel format"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    Bt601,
    Bt709,
    #[default]
    Unspecified,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorRange {
    /// Limited ("TV") range.
    Mpeg,
    /// Full ("PC") range.
    Jpeg,
    #[default]
    Unspecified,
}

/// Compressed video codecs the hardware decoder may be asked to handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    H265,
    VP8,
    VP9,
    AV1,
    MPEG2,
    MPEG4,
    JPEG,
}

impl Codec {
    /// Returns the codec matching an IVF fourcc, if any.
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"VP80" => Some(Codec::VP8),
            b"VP90" => Some(Codec::VP9),
            b"AV01" => Some(Codec::AV1),
            b"H264" => Some(Codec::H264),
            b"H265" | b"HEVC" => Some(Codec::H265),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_format_from_str() {
        assert_eq!(PixelFormat::from_str("nv12"), Ok(PixelFormat::NV12));
        assert_eq!(PixelFormat::from_str("I420"), Ok(PixelFormat::YUV420));
        assert!(PixelFormat::from_str("yuyv").is_err());
    }

    #[test]
    fn codec_from_ivf_fourcc() {
        assert_eq!(Codec::from_fourcc(b"VP90"), Some(Codec::VP9));
        assert_eq!(Codec::from_fourcc(b"AV01"), Some(Codec::AV1));
        assert_eq!(Codec::from_fourcc(b"XXXX"), None);
    }
}
