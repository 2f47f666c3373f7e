// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side containers for compressed packets and their metadata.

use bytes::Bytes;

/// Timestamp value meaning "not set".
pub const NO_PTS: i64 = i64::MIN;

/// Host-owned byte blob. The content is always copied on construction, so the buffer never
/// borrows memory from its producer. Clones share the same bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Bytes,
}

impl Buffer {
    pub fn copy_from(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Metadata attached to a compressed packet and propagated to the frame decoded from it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PacketData {
    /// Presentation timestamp in stream timebase units, or [`NO_PTS`].
    pub pts: i64,
    /// Decode timestamp in stream timebase units, or [`NO_PTS`].
    pub dts: i64,
    pub duration: i64,
    /// Byte position of the packet in its container, -1 if unknown.
    pub pos: i64,
    pub key: bool,
}

impl Default for PacketData {
    fn default() -> Self {
        Self {
            pts: NO_PTS,
            dts: NO_PTS,
            duration: 0,
            pos: -1,
            key: false,
        }
    }
}

impl PacketData {
    pub fn has_pts(&self) -> bool {
        self.pts != NO_PTS
    }
}
