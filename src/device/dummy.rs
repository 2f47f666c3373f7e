// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A device backed by host memory whose only purpose is to let the rest of the crate run in
//! tests. It keeps track of every allocation and free, and can be told to fail them.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use anyhow::anyhow;

use crate::device::resource_manager::ResourceManager;
use crate::device::ContextHandle;
use crate::device::Copy2d;
use crate::device::Device;
use crate::device::DeviceContext;
use crate::device::DeviceError;
use crate::device::DevicePtr;
use crate::device::DeviceProvider;
use crate::device::StreamHandle;

/// Row alignment used by pitched allocations.
pub(crate) const PITCH_ALIGNMENT: usize = 256;

#[derive(Debug, Default)]
struct State {
    next_address: u64,
    allocations: BTreeMap<u64, Vec<u8>>,
    num_allocs: usize,
    num_frees: usize,
    num_syncs: usize,
    /// Number of allocations left before one is made to fail.
    allocs_before_failure: Option<usize>,
    fail_frees: bool,
}

impl State {
    /// Finds the allocation containing `ptr` and returns it along with the offset of `ptr`
    /// inside of it.
    fn lookup_mut(
        &mut self,
        ptr: DevicePtr,
        len: usize,
    ) -> Result<(&mut Vec<u8>, usize), DeviceError> {
        let (base, mem) = self
            .allocations
            .range_mut(..=ptr.0)
            .next_back()
            .ok_or(DeviceError::InvalidPointer(ptr.0))?;
        let offset = (ptr.0 - *base) as usize;
        if offset + len > mem.len() {
            return Err(DeviceError::InvalidPointer(ptr.0));
        }

        Ok((mem, offset))
    }
}

#[derive(Debug)]
pub(crate) struct DummyDevice {
    ordinal: u32,
    state: Mutex<State>,
}

impl DummyDevice {
    pub(crate) fn new(ordinal: u32) -> Self {
        Self {
            ordinal,
            state: Mutex::new(State {
                next_address: 0x1000_0000 * (ordinal as u64 + 1),
                ..Default::default()
            }),
        }
    }

    pub(crate) fn num_allocs(&self) -> usize {
        self.state.lock().unwrap().num_allocs
    }

    pub(crate) fn num_frees(&self) -> usize {
        self.state.lock().unwrap().num_frees
    }

    pub(crate) fn num_syncs(&self) -> usize {
        self.state.lock().unwrap().num_syncs
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.state.lock().unwrap().allocations.len()
    }

    pub(crate) fn fail_next_alloc(&self) {
        self.fail_alloc_after(0);
    }

    /// Lets `count` allocations succeed, then fails the next one.
    pub(crate) fn fail_alloc_after(&self, count: usize) {
        self.state.lock().unwrap().allocs_before_failure = Some(count);
    }

    pub(crate) fn fail_frees(&self, fail: bool) {
        self.state.lock().unwrap().fail_frees = fail;
    }

    /// Writes `data` at `ptr`, as the hardware decoder would when producing a frame.
    pub(crate) fn write(&self, ptr: DevicePtr, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let (mem, offset) = state.lookup_mut(ptr, data.len()).unwrap();
        mem[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Fills `height` rows of `width_bytes` bytes at `ptr` with `value`.
    pub(crate) fn fill_2d(
        &self,
        ptr: DevicePtr,
        pitch: usize,
        width_bytes: usize,
        height: usize,
        value: u8,
    ) {
        for row in 0..height {
            self.write(ptr.offset((row * pitch) as u64), &vec![value; width_bytes]);
        }
    }
}

impl Device for DummyDevice {
    fn ordinal(&self) -> u32 {
        self.ordinal
    }

    fn create_context(&self) -> Result<ContextHandle, DeviceError> {
        Ok(ContextHandle(0xc0 + self.ordinal as u64))
    }

    fn create_stream(&self, context: ContextHandle) -> Result<StreamHandle, DeviceError> {
        Ok(StreamHandle(context.0 << 8 | 1))
    }

    fn alloc(&self, size: usize) -> Result<DevicePtr, DeviceError> {
        let mut state = self.state.lock().unwrap();
        match state.allocs_before_failure {
            Some(0) => {
                state.allocs_before_failure = None;
                return Err(DeviceError::OutOfMemory(size));
            }
            Some(ref mut count) => *count -= 1,
            None => (),
        }
        if size == 0 {
            return Err(DeviceError::OutOfMemory(size));
        }

        let address = state.next_address;
        // Leave a gap between allocations so out-of-bounds accesses are caught.
        state.next_address += (size as u64).next_multiple_of(0x1000) + 0x1000;
        state.allocations.insert(address, vec![0u8; size]);
        state.num_allocs += 1;

        Ok(DevicePtr(address))
    }

    fn alloc_pitch(
        &self,
        width_bytes: usize,
        height: usize,
        _element_size: usize,
    ) -> Result<(DevicePtr, usize), DeviceError> {
        let pitch = width_bytes.next_multiple_of(PITCH_ALIGNMENT);
        let ptr = self.alloc(pitch * height)?;

        Ok((ptr, pitch))
    }

    fn free(&self, ptr: DevicePtr) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_frees {
            return Err(anyhow!("injected free failure").into());
        }

        state
            .allocations
            .remove(&ptr.0)
            .ok_or(DeviceError::InvalidPointer(ptr.0))?;
        state.num_frees += 1;

        Ok(())
    }

    fn synchronize(&self, _stream: StreamHandle) -> Result<(), DeviceError> {
        self.state.lock().unwrap().num_syncs += 1;
        Ok(())
    }

    fn copy_2d(
        &self,
        dst: DevicePtr,
        copy: &Copy2d,
        _stream: StreamHandle,
    ) -> Result<(), DeviceError> {
        let mut rows = vec![0u8; copy.width_bytes * copy.height];
        self.copy_2d_to_host(
            &mut rows,
            &Copy2d {
                dst_pitch: copy.width_bytes,
                ..*copy
            },
            StreamHandle::default(),
        )?;

        let mut state = self.state.lock().unwrap();
        let lines = rows.chunks(copy.width_bytes.max(1));
        for (row, line) in lines.enumerate().take(copy.height) {
            let (mem, offset) =
                state.lookup_mut(dst.offset((row * copy.dst_pitch) as u64), line.len())?;
            mem[offset..offset + line.len()].copy_from_slice(line);
        }

        Ok(())
    }

    fn copy_2d_to_host(
        &self,
        dst: &mut [u8],
        copy: &Copy2d,
        _stream: StreamHandle,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock().unwrap();
        let dst_lines = dst.chunks_mut(copy.dst_pitch.max(1));
        for (row, dst_line) in dst_lines.enumerate().take(copy.height) {
            let src = copy.src.offset((row * copy.src_pitch) as u64);
            let (mem, offset) = state.lookup_mut(src, copy.width_bytes)?;
            dst_line[..copy.width_bytes].copy_from_slice(&mem[offset..offset + copy.width_bytes]);
        }

        Ok(())
    }
}

pub(crate) struct DummyProvider {
    devices: Vec<Arc<DummyDevice>>,
    num_opens: AtomicUsize,
}

impl DummyProvider {
    pub(crate) fn new(num_devices: u32) -> Self {
        Self {
            devices: (0..num_devices).map(|i| Arc::new(DummyDevice::new(i))).collect(),
            num_opens: AtomicUsize::new(0),
        }
    }

    pub(crate) fn num_opens(&self) -> usize {
        self.num_opens.load(Ordering::SeqCst)
    }

    pub(crate) fn device(&self, ordinal: u32) -> Option<Arc<DummyDevice>> {
        self.devices.get(ordinal as usize).cloned()
    }
}

impl DeviceProvider for DummyProvider {
    fn num_devices(&self) -> u32 {
        self.devices.len() as u32
    }

    fn open(&self, ordinal: u32) -> Result<Arc<dyn Device>, DeviceError> {
        let device = self
            .devices
            .get(ordinal as usize)
            .ok_or(DeviceError::NoSuchDevice(ordinal))?;
        self.num_opens.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::clone(device) as Arc<dyn Device>)
    }
}

/// Returns a fresh dummy device along with a context on it.
pub(crate) fn dummy_context() -> (Arc<DummyDevice>, DeviceContext) {
    let device = Arc::new(DummyDevice::new(0));
    let context = DeviceContext::create(Arc::clone(&device) as Arc<dyn Device>).unwrap();

    (device, context)
}

static GLOBAL_PROVIDER: OnceLock<Arc<DummyProvider>> = OnceLock::new();

/// Returns the process-wide resource manager, installing it over two dummy devices if no test
/// did so yet, along with the provider backing it.
pub(crate) fn global_dummy_manager() -> (&'static ResourceManager, Arc<DummyProvider>) {
    let provider = GLOBAL_PROVIDER.get_or_init(|| Arc::new(DummyProvider::new(2)));
    let manager = match ResourceManager::install(Arc::clone(provider) as Arc<dyn DeviceProvider>)
    {
        Ok(manager) => manager,
        Err(_) => ResourceManager::global().unwrap(),
    };

    (manager, Arc::clone(provider))
}
