// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Neutral descriptors for zero-copy exchange of device memory with other libraries.
//!
//! Two protocols are supported. [`TensorDescriptor`] follows DLPack: strides are counted in
//! elements and the data type is a (code, bits, lanes) triple. [`ArrayInterface`] follows the
//! CUDA array interface: strides are counted in bytes and the data type is a typestr such as
//! `"<u2"`. Neither type owns the memory it points to.

use std::str::FromStr;

use crate::device::DevicePtr;
use crate::device::StreamHandle;
use crate::surface::SurfaceError;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DataTypeCode {
    Int,
    #[default]
    UInt,
    Float,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataType {
    pub code: DataTypeCode,
    pub bits: u8,
    pub lanes: u16,
}

impl Default for DataType {
    fn default() -> Self {
        Self::U8
    }
}

impl DataType {
    pub const U8: DataType = DataType {
        code: DataTypeCode::UInt,
        bits: 8,
        lanes: 1,
    };
    pub const U16: DataType = DataType {
        code: DataTypeCode::UInt,
        bits: 16,
        lanes: 1,
    };
    pub const F32: DataType = DataType {
        code: DataTypeCode::Float,
        bits: 32,
        lanes: 1,
    };

    /// Size in bytes of one element.
    pub fn element_size(&self) -> usize {
        (self.bits as usize * self.lanes as usize + 7) / 8
    }

    /// Whether planes can be made of elements of this type.
    pub fn is_supported(&self) -> bool {
        *self == Self::U8 || *self == Self::U16 || *self == Self::F32
    }

    pub fn from_typestr(typestr: &str) -> Option<Self> {
        match typestr {
            "<u1" | "|u1" => Some(Self::U8),
            "<u2" | "|u2" => Some(Self::U16),
            "<f4" | "|f4" => Some(Self::F32),
            _ => None,
        }
    }

    pub fn typestr(&self) -> Option<&'static str> {
        match *self {
            Self::U8 => Some("|u1"),
            Self::U16 => Some("<u2"),
            Self::F32 => Some("<f4"),
            _ => None,
        }
    }
}

/// Where the memory described by a [`TensorDescriptor`] lives.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    CudaHost,
}

/// DLPack-style tensor descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorDescriptor {
    pub data: DevicePtr,
    pub byte_offset: u64,
    pub device: DeviceKind,
    pub device_id: i32,
    pub shape: Vec<i64>,
    /// Strides in elements. Empty for compact row-major tensors.
    pub strides: Vec<i64>,
    pub dtype: DataType,
    pub read_only: bool,
    /// Stream the producer last used the memory on.
    pub stream: StreamHandle,
}

/// CUDA array interface (version 3) style descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayInterface {
    pub shape: Vec<u64>,
    /// Strides in bytes. Empty for compact row-major arrays.
    pub strides: Vec<u64>,
    pub typestr: String,
    pub data: DevicePtr,
    pub read_only: bool,
    pub stream: StreamHandle,
    pub version: u32,
}

/// How the dimensions of an [`ArrayInterface`] map onto the rows and columns of a plane.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TensorLayout {
    #[default]
    HW,
    HWC,
    CHW,
}

impl FromStr for TensorLayout {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hw" | "HW" => Ok(TensorLayout::HW),
            "hwc" | "HWC" => Ok(TensorLayout::HWC),
            "chw" | "CHW" => Ok(TensorLayout::CHW),
            _ => Err("unrecognized tensor layout. Valid values: HW, HWC, CHW"),
        }
    }
}

/// 2D geometry of a plane described by an external tensor, after validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PlaneGeometry {
    pub ptr: DevicePtr,
    /// Width in elements.
    pub width: u32,
    pub height: u32,
    /// Pitch in bytes.
    pub pitch: u32,
    pub dtype: DataType,
}

const TOO_LARGE: SurfaceError = SurfaceError::UnsupportedTensor("tensor is too large");

fn checked_mul(a: u64, b: u64) -> Result<u64, SurfaceError> {
    a.checked_mul(b).ok_or(TOO_LARGE)
}

impl PlaneGeometry {
    fn new(
        ptr: DevicePtr,
        width: u64,
        height: u64,
        pitch: u64,
        dtype: DataType,
    ) -> Result<Self, SurfaceError> {
        let width_bytes = checked_mul(width, dtype.element_size() as u64)?;
        if width == 0 || height == 0 {
            return Err(SurfaceError::UnsupportedTensor("tensor has an empty dimension"));
        }
        if pitch < width_bytes {
            return Err(SurfaceError::UnsupportedTensor("rows of the tensor overlap"));
        }

        let to_u32 = |v: u64| u32::try_from(v).map_err(|_| TOO_LARGE);

        Ok(Self {
            ptr,
            width: to_u32(width)?,
            height: to_u32(height)?,
            pitch: to_u32(pitch)?,
            dtype,
        })
    }
}

fn check_access(read_only: bool, stream: StreamHandle) -> Result<(), SurfaceError> {
    if read_only {
        return Err(SurfaceError::UnsupportedTensor("read-only tensors are not supported"));
    }
    if stream.is_null() {
        return Err(SurfaceError::UnsupportedTensor("the null stream is not supported"));
    }

    Ok(())
}

impl TensorDescriptor {
    pub(crate) fn geometry(&self) -> Result<PlaneGeometry, SurfaceError> {
        if self.shape.len() != 2 {
            return Err(SurfaceError::UnsupportedTensor("only 2D tensors are supported"));
        }
        if self.device != DeviceKind::Cuda {
            return Err(SurfaceError::UnsupportedTensor("tensor is not in device memory"));
        }
        if self.dtype.lanes != 1 {
            return Err(SurfaceError::UnsupportedTensor("multi-lane elements are not supported"));
        }
        if !self.dtype.is_supported() {
            return Err(SurfaceError::UnsupportedTensor("unsupported element type"));
        }
        check_access(self.read_only, self.stream)?;

        let dim = |v: i64| {
            u64::try_from(v).map_err(|_| SurfaceError::UnsupportedTensor("negative dimension"))
        };
        let height = dim(self.shape[0])?;
        let width = dim(self.shape[1])?;
        let elem_size = self.dtype.element_size() as u64;

        let pitch = match self.strides.as_slice() {
            [] => checked_mul(width, elem_size)?,
            [row, 1] => checked_mul(dim(*row)?, elem_size)?,
            _ => {
                return Err(SurfaceError::UnsupportedTensor(
                    "elements within a row must be contiguous",
                ))
            }
        };

        let ptr = self
            .data
            .0
            .checked_add(self.byte_offset)
            .map(DevicePtr)
            .ok_or(TOO_LARGE)?;

        PlaneGeometry::new(
            ptr,
            width,
            height,
            pitch,
            self.dtype,
        )
    }
}

impl ArrayInterface {
    pub(crate) fn geometry(&self, layout: TensorLayout) -> Result<PlaneGeometry, SurfaceError> {
        if self.shape.len() < 2 {
            return Err(SurfaceError::UnsupportedTensor("at least 2 dimensions are required"));
        }
        let dtype = DataType::from_typestr(&self.typestr)
            .ok_or(SurfaceError::UnsupportedTensor("unsupported typestr"))?;
        check_access(self.read_only, self.stream)?;

        let shape = |i: usize| {
            self.shape
                .get(i)
                .copied()
                .ok_or(SurfaceError::UnsupportedTensor("layout needs 3 dimensions"))
        };
        let stride = |i: usize| self.strides.get(i).copied().unwrap_or(0);

        let (height, width, pitch) = match layout {
            TensorLayout::HW => (shape(0)?, shape(1)?, stride(0)),
            TensorLayout::HWC => (shape(0)?, checked_mul(shape(1)?, shape(2)?)?, stride(0)),
            TensorLayout::CHW => (checked_mul(shape(0)?, shape(1)?)?, shape(2)?, stride(1)),
        };
        let pitch = match pitch {
            0 => checked_mul(width, dtype.element_size() as u64)?,
            pitch => pitch,
        };

        PlaneGeometry::new(self.data, width, height, pitch, dtype)
    }
}
