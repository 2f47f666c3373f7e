// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded frames resident in device memory.

pub mod interop;
pub mod plane;

use thiserror::Error;

use crate::device::DeviceContext;
use crate::device::DeviceError;
use crate::surface::interop::ArrayInterface;
use crate::surface::interop::DataType;
use crate::surface::interop::TensorLayout;
use crate::PixelFormat;

pub use plane::SurfacePlane;

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("failed to allocate device memory: {0}")]
    Allocation(#[source] DeviceError),
    #[error("invalid surface parameters: {0}")]
    InvalidParameters(String),
    #[error("unsupported tensor: {0}")]
    UnsupportedTensor(&'static str),
    #[error("planes wrapping an external tensor cannot be exported")]
    DoubleExport,
    #[error("plane has no accessible device memory")]
    InvalidPlane,
    #[error("destination buffer is too small: {needed} bytes needed, {actual} provided")]
    BufferTooSmall { needed: usize, actual: usize },
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Width, height and element type of each plane of a `width` x `height` frame of `format`.
fn plane_layout(format: PixelFormat, width: u32, height: u32) -> Vec<(u32, u32, DataType)> {
    let half_width = (width + 1) / 2;
    let half_height = (height + 1) / 2;

    match format {
        PixelFormat::Y => vec![(width, height, DataType::U8)],
        PixelFormat::NV12 => vec![(width, height + half_height, DataType::U8)],
        PixelFormat::P10 | PixelFormat::P12 => {
            vec![(width, height + half_height, DataType::U16)]
        }
        PixelFormat::YUV420 => vec![
            (width, height, DataType::U8),
            (half_width, half_height, DataType::U8),
            (half_width, half_height, DataType::U8),
        ],
        PixelFormat::YUV422 => vec![
            (width, height, DataType::U8),
            (half_width, height, DataType::U8),
            (half_width, height, DataType::U8),
        ],
        PixelFormat::YUV444 => vec![(width, height, DataType::U8); 3],
        PixelFormat::YUV444_10bit => vec![(width, height, DataType::U16); 3],
        PixelFormat::RGB | PixelFormat::BGR => vec![(width * 3, height, DataType::U8)],
        PixelFormat::RGBPlanar => vec![(width, height * 3, DataType::U8)],
        PixelFormat::RGB32F => vec![(width * 3, height, DataType::F32)],
        PixelFormat::RGB32FPlanar => vec![(width, height * 3, DataType::F32)],
        PixelFormat::Undefined => vec![],
    }
}

impl PixelFormat {
    /// Size of a tightly packed host copy of a `width` x `height` frame of this format.
    pub fn host_frame_size(&self, width: u32, height: u32) -> usize {
        plane_layout(*self, width, height)
            .iter()
            .map(|&(w, h, dtype)| w as usize * h as usize * dtype.element_size())
            .sum()
    }

    /// How an array interface describing a frame of this format is folded into a plane.
    pub fn tensor_layout(&self) -> TensorLayout {
        match self {
            PixelFormat::RGB | PixelFormat::BGR | PixelFormat::RGB32F => TensorLayout::HWC,
            PixelFormat::RGBPlanar | PixelFormat::RGB32FPlanar => TensorLayout::CHW,
            _ => TensorLayout::HW,
        }
    }
}

/// A video frame made of one or more [`SurfacePlane`]s.
///
/// Cloning a surface clones its planes, so the clone observes the same device memory without
/// owning it. Use [`Surface::deep_clone`] to get an independent copy.
#[derive(Clone, Debug, Default)]
pub struct Surface {
    format: PixelFormat,
    width: u32,
    height: u32,
    planes: Vec<SurfacePlane>,
}

impl Surface {
    /// Allocates a surface of `format` with all of its planes owned and pitched.
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        ctx: &DeviceContext,
    ) -> Result<Self, SurfaceError> {
        if format == PixelFormat::Undefined {
            return Err(SurfaceError::InvalidParameters(
                "cannot allocate a surface of undefined format".into(),
            ));
        }

        let planes = plane_layout(format, width, height)
            .into_iter()
            .map(|(w, h, dtype)| SurfacePlane::new(w, h, dtype, ctx, true))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            format,
            width,
            height,
            planes,
        })
    }

    /// Returns a surface without any memory attached.
    pub fn empty(format: PixelFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    /// Assembles a surface from existing planes, e.g. planes produced by a hardware decoder.
    pub fn from_planes(
        format: PixelFormat,
        width: u32,
        height: u32,
        planes: Vec<SurfacePlane>,
    ) -> Result<Self, SurfaceError> {
        let expected = plane_layout(format, width, height);
        let matches = expected.len() == planes.len()
            && expected.iter().zip(&planes).all(|(&(w, h, dtype), plane)| {
                (plane.width(), plane.height(), plane.dtype()) == (w, h, dtype)
            });
        if !matches {
            return Err(SurfaceError::InvalidParameters(format!(
                "planes do not describe a {}x{} {:?} frame",
                width, height, format
            )));
        }

        Ok(Self {
            format,
            width,
            height,
            planes,
        })
    }

    /// Wraps a single-plane frame described by a CUDA array interface without copying it.
    pub fn from_array_interface(
        format: PixelFormat,
        cai: &ArrayInterface,
        ctx: &DeviceContext,
    ) -> Result<Self, SurfaceError> {
        let plane = SurfacePlane::from_array_interface(cai, format.tensor_layout(), ctx)?;

        let (width, height) = match format {
            PixelFormat::Y => (plane.width(), plane.height()),
            PixelFormat::NV12 | PixelFormat::P10 | PixelFormat::P12 => {
                (plane.width(), plane.height() * 2 / 3)
            }
            PixelFormat::RGB | PixelFormat::BGR | PixelFormat::RGB32F => {
                (plane.width() / 3, plane.height())
            }
            PixelFormat::RGBPlanar | PixelFormat::RGB32FPlanar => {
                (plane.width(), plane.height() / 3)
            }
            _ => {
                return Err(SurfaceError::InvalidParameters(format!(
                    "{:?} frames cannot be described by a single array",
                    format
                )))
            }
        };

        Self::from_planes(format, width, height, vec![plane])
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pitch of the first plane, in bytes.
    pub fn pitch(&self) -> u32 {
        self.planes.first().map(SurfacePlane::pitch).unwrap_or(0)
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn plane(&self, index: usize) -> Option<&SurfacePlane> {
        self.planes.get(index)
    }

    pub fn planes(&self) -> &[SurfacePlane] {
        &self.planes
    }

    /// Whether this surface has no usable memory.
    pub fn is_empty(&self) -> bool {
        self.planes.is_empty() || self.planes.iter().any(|p| !p.is_valid())
    }

    pub fn owns_memory(&self) -> bool {
        !self.planes.is_empty() && self.planes.iter().all(SurfacePlane::owns_memory)
    }

    /// Size of a tightly packed host copy of the whole frame.
    pub fn host_mem_size(&self) -> usize {
        self.planes.iter().map(SurfacePlane::host_mem_size).sum()
    }

    /// Allocates a new surface and copies the content of this one into it.
    pub fn deep_clone(&self, ctx: &DeviceContext) -> Result<Self, SurfaceError> {
        if self.is_empty() {
            return Ok(Self::empty(self.format));
        }

        let clone = Self::new(self.format, self.width, self.height, ctx)?;
        for (src, dst) in self.planes.iter().zip(&clone.planes) {
            src.copy_to(dst, ctx)?;
        }

        Ok(clone)
    }

    /// Copies all planes one after the other into `dst`, removing any padding.
    pub fn download(&self, ctx: &DeviceContext, dst: &mut [u8]) -> Result<(), SurfaceError> {
        let needed = self.host_mem_size();
        if dst.len() < needed {
            return Err(SurfaceError::BufferTooSmall {
                needed,
                actual: dst.len(),
            });
        }

        let mut dst = dst;
        for plane in &self.planes {
            let (plane_dst, rest) =
                std::mem::take(&mut dst).split_at_mut(plane.host_mem_size());
            plane.download(ctx, plane_dst)?;
            dst = rest;
        }

        Ok(())
    }
}
