// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A single 2D region of device memory.
//!
//! A [`SurfacePlane`] either owns its allocation, observes an allocation owned by another plane,
//! or points into memory handed over by a foreign library through one of the [`interop`]
//! descriptors. Cloning a plane never duplicates device memory, and never extends the lifetime
//! of the allocation either: the clone only observes it, and stops being valid once the owner is
//! gone.
//!
//! [`interop`]: crate::surface::interop

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;

use crate::device::Copy2d;
use crate::device::Device;
use crate::device::DeviceContext;
use crate::device::DevicePtr;
use crate::device::StreamHandle;
use crate::surface::interop::ArrayInterface;
use crate::surface::interop::DataType;
use crate::surface::interop::DeviceKind;
use crate::surface::interop::PlaneGeometry;
use crate::surface::interop::TensorDescriptor;
use crate::surface::interop::TensorLayout;
use crate::surface::SurfaceError;

/// Device memory released when the last owning plane goes away.
#[derive(Debug)]
pub(crate) struct DeviceAllocation {
    ptr: DevicePtr,
    device: Arc<dyn Device>,
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        let device = &self.device;
        let ptr = self.ptr;
        match catch_unwind(AssertUnwindSafe(|| device.free(ptr))) {
            Ok(Ok(())) => (),
            Ok(Err(e)) => log::warn!("Failed to free device memory at {:#x}: {}", ptr.0, e),
            Err(_) => log::error!("Device driver panicked while freeing {:#x}", ptr.0),
        }
    }
}

#[derive(Debug, Default)]
enum Memory {
    #[default]
    Blank,
    Owned(Arc<DeviceAllocation>),
    Borrowed(Weak<DeviceAllocation>),
    /// Memory of an external tensor. Its producer keeps it alive.
    External { ptr: DevicePtr, device_id: i32 },
}

#[derive(Debug, Default)]
pub struct SurfacePlane {
    memory: Memory,
    width: u32,
    height: u32,
    pitch: u32,
    dtype: DataType,
}

impl Clone for SurfacePlane {
    /// Returns a plane observing the same memory. The clone never owns it.
    fn clone(&self) -> Self {
        let memory = match &self.memory {
            Memory::Blank => Memory::Blank,
            Memory::Owned(allocation) => Memory::Borrowed(Arc::downgrade(allocation)),
            Memory::Borrowed(allocation) => Memory::Borrowed(Weak::clone(allocation)),
            Memory::External { ptr, device_id } => Memory::External {
                ptr: *ptr,
                device_id: *device_id,
            },
        };

        Self {
            memory,
            ..*self
        }
    }
}

impl SurfacePlane {
    /// Allocates a new plane of `width` x `height` elements of type `dtype`. If `pitched` is set
    /// the device picks the pitch, otherwise rows are tightly packed.
    pub fn new(
        width: u32,
        height: u32,
        dtype: DataType,
        ctx: &DeviceContext,
        pitched: bool,
    ) -> Result<Self, SurfaceError> {
        if width == 0 || height == 0 {
            return Err(SurfaceError::InvalidParameters(format!(
                "cannot allocate a {}x{} plane",
                width, height
            )));
        }
        if !dtype.is_supported() {
            return Err(SurfaceError::InvalidParameters(format!(
                "unsupported element type {:?}",
                dtype
            )));
        }

        let elem_size = dtype.element_size();
        let width_bytes = width as usize * elem_size;
        let device = ctx.device();
        let (ptr, pitch) = if pitched {
            device
                .alloc_pitch(width_bytes, height as usize, elem_size)
                .map_err(SurfaceError::Allocation)?
        } else {
            let ptr = device
                .alloc(width_bytes * height as usize)
                .map_err(SurfaceError::Allocation)?;
            (ptr, width_bytes)
        };

        // Wrap the memory right away so it is released if anything below fails.
        let allocation = Arc::new(DeviceAllocation {
            ptr,
            device: Arc::clone(device),
        });
        let pitch = u32::try_from(pitch)
            .map_err(|_| SurfaceError::InvalidParameters(format!("pitch {} is too large", pitch)))?;

        Ok(Self {
            memory: Memory::Owned(allocation),
            width,
            height,
            pitch,
            dtype,
        })
    }

    fn from_geometry(geometry: PlaneGeometry, device_id: i32) -> Self {
        Self {
            memory: Memory::External {
                ptr: geometry.ptr,
                device_id,
            },
            width: geometry.width,
            height: geometry.height,
            pitch: geometry.pitch,
            dtype: geometry.dtype,
        }
    }

    /// Wraps the memory of a DLPack tensor without copying it. The producer's stream is
    /// synchronized before returning.
    pub fn from_dlpack(desc: &TensorDescriptor, ctx: &DeviceContext) -> Result<Self, SurfaceError> {
        let geometry = desc.geometry()?;
        if desc.device_id != ctx.ordinal() as i32 {
            return Err(SurfaceError::UnsupportedTensor("tensor lives on another device"));
        }
        ctx.device().synchronize(desc.stream)?;

        Ok(Self::from_geometry(geometry, desc.device_id))
    }

    /// Wraps the memory of a CUDA array interface without copying it. `layout` tells how 3D
    /// arrays are folded into rows. The producer's stream is synchronized before returning.
    pub fn from_array_interface(
        cai: &ArrayInterface,
        layout: TensorLayout,
        ctx: &DeviceContext,
    ) -> Result<Self, SurfaceError> {
        let geometry = cai.geometry(layout)?;
        ctx.device().synchronize(cai.stream)?;

        Ok(Self::from_geometry(geometry, ctx.ordinal() as i32))
    }

    /// Returns the allocation backing this plane along with the ordinal of its device, failing
    /// for planes whose memory came from an external tensor.
    fn exportable(&self) -> Result<(DevicePtr, i32), SurfaceError> {
        let allocation = match &self.memory {
            Memory::Blank => return Err(SurfaceError::InvalidPlane),
            Memory::External { .. } => return Err(SurfaceError::DoubleExport),
            Memory::Owned(allocation) => Arc::clone(allocation),
            Memory::Borrowed(allocation) => allocation.upgrade().ok_or(SurfaceError::InvalidPlane)?,
        };

        Ok((allocation.ptr, allocation.device.ordinal() as i32))
    }

    /// Describes this plane as a DLPack tensor of shape `[height, width]`. Consumers must use
    /// `stream` to order their accesses.
    pub fn to_dlpack(&self, stream: StreamHandle) -> Result<TensorDescriptor, SurfaceError> {
        let (data, device_id) = self.exportable()?;

        Ok(TensorDescriptor {
            data,
            byte_offset: 0,
            device: DeviceKind::Cuda,
            device_id,
            shape: vec![self.height as i64, self.width as i64],
            strides: vec![(self.pitch as usize / self.elem_size()) as i64, 1],
            dtype: self.dtype,
            read_only: false,
            stream,
        })
    }

    /// Describes this plane as a CUDA array interface of shape `[height, width]`.
    pub fn to_array_interface(&self, stream: StreamHandle) -> Result<ArrayInterface, SurfaceError> {
        let (data, _) = self.exportable()?;
        let typestr = self.dtype.typestr().ok_or(SurfaceError::InvalidPlane)?;

        Ok(ArrayInterface {
            shape: vec![self.height as u64, self.width as u64],
            strides: vec![self.pitch as u64, self.elem_size() as u64],
            typestr: typestr.into(),
            data,
            read_only: false,
            stream,
            version: 3,
        })
    }

    /// Whether the memory of this plane can be accessed. Planes wrapping an external tensor are
    /// always considered valid.
    pub fn is_valid(&self) -> bool {
        match &self.memory {
            Memory::Blank => false,
            Memory::Owned(_) | Memory::External { .. } => true,
            Memory::Borrowed(allocation) => allocation.strong_count() > 0,
        }
    }

    pub fn owns_memory(&self) -> bool {
        matches!(self.memory, Memory::Owned(_))
    }

    pub fn is_external(&self) -> bool {
        matches!(self.memory, Memory::External { .. })
    }

    /// Address of the first element, if the memory is still alive.
    pub fn gpu_mem(&self) -> Option<DevicePtr> {
        match &self.memory {
            Memory::Blank => None,
            Memory::Owned(allocation) => Some(allocation.ptr),
            Memory::Borrowed(allocation) => allocation.upgrade().map(|a| a.ptr),
            Memory::External { ptr, .. } => Some(*ptr),
        }
    }

    /// Ordinal of the device the memory lives on.
    pub fn device_id(&self) -> Option<i32> {
        match &self.memory {
            Memory::Blank => None,
            Memory::Owned(allocation) => Some(allocation.device.ordinal() as i32),
            Memory::Borrowed(allocation) => {
                allocation.upgrade().map(|a| a.device.ordinal() as i32)
            }
            Memory::External { device_id, .. } => Some(*device_id),
        }
    }

    /// Width in elements.
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Distance between the start of two rows, in bytes.
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn elem_size(&self) -> usize {
        self.dtype.element_size()
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Size of a tightly packed host copy of this plane.
    pub fn host_mem_size(&self) -> usize {
        self.width as usize * self.height as usize * self.elem_size()
    }

    /// Moves the content of this plane out, leaving a blank plane behind.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    fn copy_desc(&self) -> Result<Copy2d, SurfaceError> {
        let src = self.gpu_mem().ok_or(SurfaceError::InvalidPlane)?;
        let width_bytes = self.width as usize * self.elem_size();

        Ok(Copy2d {
            src,
            src_pitch: self.pitch as usize,
            dst_pitch: width_bytes,
            width_bytes,
            height: self.height as usize,
        })
    }

    /// Copies the content of this plane into `dst`, which must have the same geometry.
    pub fn copy_to(&self, dst: &SurfacePlane, ctx: &DeviceContext) -> Result<(), SurfaceError> {
        if (dst.width, dst.height, dst.dtype) != (self.width, self.height, self.dtype) {
            return Err(SurfaceError::InvalidParameters(format!(
                "cannot copy a {}x{} plane into a {}x{} one",
                self.width, self.height, dst.width, dst.height
            )));
        }

        let dst_ptr = dst.gpu_mem().ok_or(SurfaceError::InvalidPlane)?;
        let copy = Copy2d {
            dst_pitch: dst.pitch as usize,
            ..self.copy_desc()?
        };
        ctx.device().copy_2d(dst_ptr, &copy, ctx.stream())?;

        Ok(())
    }

    /// Copies the content of this plane into `dst`, removing any padding. `dst` must be at least
    /// [`host_mem_size`](Self::host_mem_size) bytes long.
    pub fn download(&self, ctx: &DeviceContext, dst: &mut [u8]) -> Result<(), SurfaceError> {
        let needed = self.host_mem_size();
        if dst.len() < needed {
            return Err(SurfaceError::BufferTooSmall {
                needed,
                actual: dst.len(),
            });
        }

        let copy = self.copy_desc()?;
        ctx.device()
            .copy_2d_to_host(&mut dst[..needed], &copy, ctx.stream())?;
        ctx.synchronize()?;

        Ok(())
    }
}
