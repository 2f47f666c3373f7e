// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::task::record;
use crate::task::Task;
use crate::task::TaskError;
use crate::task::TaskExecDetails;
use crate::task::TaskExecInfo;
use crate::ColorRange;
use crate::ColorSpace;
use crate::PixelFormat;

/// Colorimetry of the source frame of a conversion.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorspaceConversionContext {
    pub color_space: ColorSpace,
    pub color_range: ColorRange,
}

/// Geometry and formats of a frame conversion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Conversion {
    pub width: u32,
    pub height: u32,
    pub src_format: PixelFormat,
    pub dst_format: PixelFormat,
}

impl Conversion {
    pub fn src_size(&self) -> usize {
        self.src_format.host_frame_size(self.width, self.height)
    }

    pub fn dst_size(&self) -> usize {
        self.dst_format.host_frame_size(self.width, self.height)
    }
}

/// Converts tightly packed host frames between pixel formats.
pub trait Resampler: Send {
    /// Whether `conversion` can be performed for a source with colorimetry `cc`.
    fn supports(&self, conversion: &Conversion, cc: &ColorspaceConversionContext) -> bool;

    /// Converts `src` into `dst`. Both buffers hold at least one full frame of their format.
    fn convert(
        &mut self,
        conversion: &Conversion,
        cc: &ColorspaceConversionContext,
        src: &[u8],
        dst: &mut [u8],
    ) -> anyhow::Result<()>;
}

pub struct ConvertInput<'a> {
    pub src: &'a [u8],
    pub dst: &'a mut [u8],
    pub cc: ColorspaceConversionContext,
}

/// Converts one host frame per execution using a [`Resampler`].
pub struct ConvertTask {
    conversion: Conversion,
    resampler: Box<dyn Resampler>,
    details: TaskExecDetails,
}

impl ConvertTask {
    pub fn new(
        width: u32,
        height: u32,
        src_format: PixelFormat,
        dst_format: PixelFormat,
        resampler: Box<dyn Resampler>,
    ) -> Self {
        Self {
            conversion: Conversion {
                width,
                height,
                src_format,
                dst_format,
            },
            resampler,
            details: Default::default(),
        }
    }

    pub fn conversion(&self) -> &Conversion {
        &self.conversion
    }

    fn run(&mut self, input: ConvertInput<'_>) -> Result<(), TaskError> {
        let invalid = |message: String| {
            TaskError::Failed(TaskExecDetails::fail(TaskExecInfo::InvalidInput, message))
        };

        if input.src.is_empty() || input.dst.is_empty() {
            return Err(invalid("empty source or destination buffer".into()));
        }

        let (src_size, dst_size) = (self.conversion.src_size(), self.conversion.dst_size());
        if input.src.len() < src_size {
            return Err(invalid(format!(
                "source holds {} bytes, {} needed",
                input.src.len(),
                src_size
            )));
        }
        if input.dst.len() < dst_size {
            return Err(invalid(format!(
                "destination holds {} bytes, {} needed",
                input.dst.len(),
                dst_size
            )));
        }

        if !self.resampler.supports(&self.conversion, &input.cc) {
            return Err(TaskError::Failed(TaskExecDetails::fail(
                TaskExecInfo::UnsupportedFmtConvParams,
                format!(
                    "cannot convert {:?} to {:?} with {:?}",
                    self.conversion.src_format, self.conversion.dst_format, input.cc
                ),
            )));
        }

        self.resampler
            .convert(&self.conversion, &input.cc, input.src, input.dst)
            .map_err(|e| {
                log::warn!("frame conversion failed: {:#}", e);
                TaskError::Failed(TaskExecDetails::fail(TaskExecInfo::Fail, format!("{:#}", e)))
            })
    }
}

impl Task for ConvertTask {
    type Input<'a> = ConvertInput<'a>;
    type Output = ();

    fn name(&self) -> &'static str {
        "ConvertFrame"
    }

    fn execute(&mut self, input: Self::Input<'_>) -> Result<Self::Output, TaskError> {
        let result = self.run(input);
        record(&mut self.details, result, TaskExecInfo::Success)
    }

    fn exec_details(&self) -> &TaskExecDetails {
        &self.details
    }
}
