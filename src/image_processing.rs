// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software conversions between tightly packed host frames.
//!
//! All the functions here expect even frame dimensions, so that each chroma sample covers exactly
//! a 2x2 block of luma samples.

use anyhow::anyhow;
use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::task::convert::ColorspaceConversionContext;
use crate::task::convert::Conversion;
use crate::task::convert::Resampler;
use crate::ColorRange;
use crate::ColorSpace;
use crate::PixelFormat;

/// Copies NV12 `src` into `dst` as I420, de-interleaving the chroma plane.
pub fn nv12_to_i420(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    let y_size = width * height;
    let uv_width = width / 2;
    let uv_size = uv_width * (height / 2);

    dst[..y_size].copy_from_slice(&src[..y_size]);

    let (dst_u_plane, dst_v_plane) = dst[y_size..y_size + 2 * uv_size].split_at_mut(uv_size);
    let src_uv_lines = src[y_size..].chunks(width).take(height / 2);
    let dst_u_lines = dst_u_plane.chunks_mut(uv_width);
    let dst_v_lines = dst_v_plane.chunks_mut(uv_width);

    for (src_line, (dst_u_line, dst_v_line)) in src_uv_lines.zip(dst_u_lines.zip(dst_v_lines)) {
        for (uv, (u, v)) in src_line
            .chunks_exact(2)
            .zip(dst_u_line.iter_mut().zip(dst_v_line.iter_mut()))
        {
            *u = uv[0];
            *v = uv[1];
        }
    }
}

/// Copies I420 `src` into `dst` as NV12, interleaving the chroma planes.
pub fn i420_to_nv12(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    let y_size = width * height;
    let uv_width = width / 2;
    let uv_size = uv_width * (height / 2);

    dst[..y_size].copy_from_slice(&src[..y_size]);

    let src_u_lines = src[y_size..y_size + uv_size].chunks(uv_width);
    let src_v_lines = src[y_size + uv_size..y_size + 2 * uv_size].chunks(uv_width);
    let dst_uv_lines = dst[y_size..].chunks_mut(width);

    for ((src_u_line, src_v_line), dst_line) in src_u_lines.zip(src_v_lines).zip(dst_uv_lines) {
        for ((u, v), uv) in src_u_line
            .iter()
            .zip(src_v_line)
            .zip(dst_line.chunks_exact_mut(2))
        {
            uv[0] = *u;
            uv[1] = *v;
        }
    }
}

/// Truncates MSB-aligned 16-bit NV12 (P010, P012) samples to 8 bits.
pub fn p01x_to_nv12(src: &[u8], dst: &mut [u8], width: usize, height: usize) {
    let num_samples = width * (height + height / 2);

    for (sample, dst) in src.chunks_exact(2).zip(dst.iter_mut()).take(num_samples) {
        *dst = (LittleEndian::read_u16(sample) >> 8) as u8;
    }
}

/// YCbCr to RGB transform for a given colorimetry.
///
/// An unspecified color space is treated as BT.601 and an unspecified range as limited (MPEG).
#[derive(Copy, Clone, Debug)]
pub struct YuvToRgb {
    kr: f32,
    kb: f32,
    full_range: bool,
}

impl YuvToRgb {
    pub fn new(cc: &ColorspaceConversionContext) -> Self {
        let (kr, kb) = match cc.color_space {
            ColorSpace::Bt709 => (0.2126, 0.0722),
            ColorSpace::Bt601 | ColorSpace::Unspecified => (0.299, 0.114),
        };

        Self {
            kr,
            kb,
            full_range: cc.color_range == ColorRange::Jpeg,
        }
    }

    pub fn apply(&self, y: u8, u: u8, v: u8) -> [u8; 3] {
        let (y, cb, cr) = if self.full_range {
            (y as f32, u as f32 - 128.0, v as f32 - 128.0)
        } else {
            (
                (y as f32 - 16.0) * 255.0 / 219.0,
                (u as f32 - 128.0) * 255.0 / 224.0,
                (v as f32 - 128.0) * 255.0 / 224.0,
            )
        };

        let kg = 1.0 - self.kr - self.kb;
        let r = y + 2.0 * (1.0 - self.kr) * cr;
        let b = y + 2.0 * (1.0 - self.kb) * cb;
        let g = (y - self.kr * r - self.kb * b) / kg;

        [r, g, b].map(|c| c.round().clamp(0.0, 255.0) as u8)
    }
}

/// Converts a 4:2:0 frame into packed RGB (or BGR if `bgr` is set).
///
/// `chroma(x, y)` returns the (U, V) sample pair of chroma column `x` and row `y`.
fn yuv420_to_rgb(
    y_plane: &[u8],
    chroma: impl Fn(usize, usize) -> (u8, u8),
    dst: &mut [u8],
    width: usize,
    height: usize,
    transform: &YuvToRgb,
    bgr: bool,
) {
    let y_lines = y_plane.chunks(width);
    let dst_lines = dst.chunks_mut(width * 3);

    for (row, (y_line, dst_line)) in y_lines.zip(dst_lines).take(height).enumerate() {
        for (col, (y, pixel)) in y_line.iter().zip(dst_line.chunks_exact_mut(3)).enumerate() {
            let (u, v) = chroma(col / 2, row / 2);
            let [r, g, b] = transform.apply(*y, u, v);
            pixel.copy_from_slice(&if bgr { [b, g, r] } else { [r, g, b] });
        }
    }
}

pub fn nv12_to_rgb(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    transform: &YuvToRgb,
    bgr: bool,
) {
    let (y_plane, uv_plane) = src.split_at(width * height);
    let chroma = |x: usize, y: usize| {
        let i = y * width + 2 * x;
        (uv_plane[i], uv_plane[i + 1])
    };

    yuv420_to_rgb(y_plane, chroma, dst, width, height, transform, bgr);
}

pub fn i420_to_rgb(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    transform: &YuvToRgb,
    bgr: bool,
) {
    let uv_width = width / 2;
    let uv_size = uv_width * (height / 2);
    let (y_plane, uv_planes) = src.split_at(width * height);
    let (u_plane, v_plane) = uv_planes.split_at(uv_size);
    let chroma = |x: usize, y: usize| (u_plane[y * uv_width + x], v_plane[y * uv_width + x]);

    yuv420_to_rgb(y_plane, chroma, dst, width, height, transform, bgr);
}

/// A [`Resampler`] running on the host.
#[derive(Copy, Clone, Debug, Default)]
pub struct SoftwareResampler;

impl Resampler for SoftwareResampler {
    fn supports(&self, conversion: &Conversion, _cc: &ColorspaceConversionContext) -> bool {
        use PixelFormat::*;

        if conversion.width == 0
            || conversion.height == 0
            || conversion.width % 2 != 0
            || conversion.height % 2 != 0
        {
            return false;
        }

        match (conversion.src_format, conversion.dst_format) {
            (Undefined, _) | (_, Undefined) => false,
            (src, dst) if src == dst => true,
            (NV12, YUV420) | (YUV420, NV12) => true,
            (NV12 | YUV420, RGB | BGR) => true,
            (P10 | P12, NV12) => true,
            _ => false,
        }
    }

    fn convert(
        &mut self,
        conversion: &Conversion,
        cc: &ColorspaceConversionContext,
        src: &[u8],
        dst: &mut [u8],
    ) -> anyhow::Result<()> {
        use PixelFormat::*;

        let (width, height) = (conversion.width as usize, conversion.height as usize);
        let transform = YuvToRgb::new(cc);

        match (conversion.src_format, conversion.dst_format) {
            (src_format, dst_format) if src_format == dst_format => {
                let size = conversion.src_size();
                dst[..size].copy_from_slice(&src[..size]);
            }
            (NV12, YUV420) => nv12_to_i420(src, dst, width, height),
            (YUV420, NV12) => i420_to_nv12(src, dst, width, height),
            (NV12, RGB) => nv12_to_rgb(src, dst, width, height, &transform, false),
            (NV12, BGR) => nv12_to_rgb(src, dst, width, height, &transform, true),
            (YUV420, RGB) => i420_to_rgb(src, dst, width, height, &transform, false),
            (YUV420, BGR) => i420_to_rgb(src, dst, width, height, &transform, true),
            (P10 | P12, NV12) => p01x_to_nv12(src, dst, width, height),
            (src_format, dst_format) => {
                return Err(anyhow!(
                    "no software conversion from {:?} to {:?}",
                    src_format,
                    dst_format
                ))
            }
        }

        Ok(())
    }
}
