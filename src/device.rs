// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device memory and execution primitives.
//!
//! A [`Device`] is the thin driver-facing layer everything else in this crate sits on: it hands
//! out execution contexts and command streams, allocates and frees device memory, and performs
//! 2D copies. Implementations are expected to wrap a GPU driver API. A [`DeviceContext`] bundles
//! a device with the context and stream a decoder instance should use.

pub mod resource_manager;

#[cfg(test)]
pub(crate) mod dummy;

use std::fmt::Debug;
use std::sync::Arc;

use thiserror::Error;

/// Address of a region of device memory.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Returns the address `bytes` past this one.
    pub fn offset(&self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

/// Opaque handle to a device execution context.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Opaque handle to a device command stream. The null stream is not accepted for interop.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

impl StreamHandle {
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no device with ordinal {0}")]
    NoSuchDevice(u32),
    #[error("device rejected an allocation of {0} bytes")]
    OutOfMemory(usize),
    #[error("invalid device pointer {0:#x}")]
    InvalidPointer(u64),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Geometry of a pitched 2D copy. The destination is passed separately since it can live on the
/// device or on the host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Copy2d {
    pub src: DevicePtr,
    pub src_pitch: usize,
    pub dst_pitch: usize,
    /// Number of bytes to copy per row.
    pub width_bytes: usize,
    pub height: usize,
}

pub trait Device: Debug + Send + Sync {
    /// Index of this device among the devices of its provider.
    fn ordinal(&self) -> u32;

    fn create_context(&self) -> Result<ContextHandle, DeviceError>;

    fn create_stream(&self, context: ContextHandle) -> Result<StreamHandle, DeviceError>;

    /// Allocates `size` bytes of linear device memory.
    fn alloc(&self, size: usize) -> Result<DevicePtr, DeviceError>;

    /// Allocates `height` rows of at least `width_bytes` bytes each and returns the allocation
    /// together with the pitch chosen by the driver. `element_size` is the size of the elements
    /// the rows are made of, which drivers may use to pick an alignment.
    fn alloc_pitch(
        &self,
        width_bytes: usize,
        height: usize,
        element_size: usize,
    ) -> Result<(DevicePtr, usize), DeviceError>;

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError>;

    /// Blocks until all the work queued on `stream` has completed.
    fn synchronize(&self, stream: StreamHandle) -> Result<(), DeviceError>;

    fn copy_2d(
        &self,
        dst: DevicePtr,
        copy: &Copy2d,
        stream: StreamHandle,
    ) -> Result<(), DeviceError>;

    fn copy_2d_to_host(
        &self,
        dst: &mut [u8],
        copy: &Copy2d,
        stream: StreamHandle,
    ) -> Result<(), DeviceError>;
}

/// Enumerates and opens the devices present in the system.
pub trait DeviceProvider: Send + Sync {
    fn num_devices(&self) -> u32;

    fn open(&self, ordinal: u32) -> Result<Arc<dyn Device>, DeviceError>;
}

/// A device together with the execution context and command stream work is submitted on.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    device: Arc<dyn Device>,
    context: ContextHandle,
    stream: StreamHandle,
}

impl DeviceContext {
    pub fn new(device: Arc<dyn Device>, context: ContextHandle, stream: StreamHandle) -> Self {
        Self {
            device,
            context,
            stream,
        }
    }

    /// Opens a fresh context and stream on `device`.
    pub fn create(device: Arc<dyn Device>) -> Result<Self, DeviceError> {
        let context = device.create_context()?;
        let stream = device.create_stream(context)?;

        Ok(Self::new(device, context, stream))
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    pub fn ordinal(&self) -> u32 {
        self.device.ordinal()
    }

    pub fn synchronize(&self) -> Result<(), DeviceError> {
        self.device.synchronize(self.stream)
    }
}
