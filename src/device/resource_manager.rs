// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide registry of one execution context and one command stream per device.
//!
//! Contexts are created lazily the first time a device ordinal is requested and then shared by
//! every decoder running on that device for the rest of the process lifetime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;

use anyhow::anyhow;

use crate::device::DeviceContext;
use crate::device::DeviceError;
use crate::device::DeviceProvider;

type Slot = Arc<Mutex<Option<Arc<DeviceContext>>>>;

static GLOBAL: OnceLock<ResourceManager> = OnceLock::new();

pub struct ResourceManager {
    provider: Arc<dyn DeviceProvider>,
    /// One slot per ordinal. A slot is locked for the whole duration of its initialization so
    /// concurrent first users of the same device wait instead of creating a second context.
    slots: Mutex<BTreeMap<u32, Slot>>,
}

impl ResourceManager {
    pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
        Self {
            provider,
            slots: Default::default(),
        }
    }

    /// Installs the process-wide resource manager. Fails if one has already been installed.
    pub fn install(provider: Arc<dyn DeviceProvider>) -> Result<&'static Self, DeviceError> {
        let mut installed = false;
        let manager = GLOBAL.get_or_init(|| {
            installed = true;
            Self::new(provider)
        });

        if installed {
            Ok(manager)
        } else {
            Err(anyhow!("a process-wide resource manager is already installed").into())
        }
    }

    /// Returns the process-wide resource manager, if one has been installed.
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    pub fn num_devices(&self) -> u32 {
        self.provider.num_devices()
    }

    /// Maps a requested GPU id to a valid ordinal. Ids that do not name an existing device fall
    /// back to the first one.
    pub fn resolve_ordinal(&self, gpu_id: i32) -> u32 {
        match u32::try_from(gpu_id) {
            Ok(ordinal) if ordinal < self.num_devices() => ordinal,
            _ => {
                log::debug!("GPU id {} does not exist, using device 0", gpu_id);
                0
            }
        }
    }

    /// Returns the shared context of device `ordinal`, creating it on first use.
    pub fn get(&self, ordinal: u32) -> Result<Arc<DeviceContext>, DeviceError> {
        if ordinal >= self.num_devices() {
            return Err(DeviceError::NoSuchDevice(ordinal));
        }

        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(ordinal).or_default())
        };

        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(context) = slot.as_ref() {
            return Ok(Arc::clone(context));
        }

        let device = self.provider.open(ordinal)?;
        let context = Arc::new(DeviceContext::create(device)?);
        log::debug!("Created execution context and stream for device {}", ordinal);

        *slot = Some(Arc::clone(&context));
        Ok(context)
    }
}
