// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Units of work the decoder is built from.
//!
//! A [`Task`] takes a typed input, produces a typed output and records the outcome of its last
//! execution as [`TaskExecDetails`], so callers can tell a graceful condition such as the end of
//! the stream apart from a failure.

pub mod convert;
pub mod decode;
pub mod demux;

use std::fmt;

use thiserror::Error;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskExecStatus {
    #[default]
    Success,
    Fail,
}

/// Additional information about the outcome of a task execution.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum TaskExecInfo {
    #[default]
    Success,
    Fail,
    EndOfStream,
    MoreDataNeeded,
    BitDepthNotSupported,
    InvalidInput,
    UnsupportedFmtConvParams,
    NotSupported,
    ResChange,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TaskExecDetails {
    pub status: TaskExecStatus,
    pub info: TaskExecInfo,
    pub message: Option<String>,
}

impl TaskExecDetails {
    pub fn success(info: TaskExecInfo) -> Self {
        Self {
            status: TaskExecStatus::Success,
            info,
            message: None,
        }
    }

    pub fn fail(info: TaskExecInfo, message: impl Into<String>) -> Self {
        Self {
            status: TaskExecStatus::Fail,
            info,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskExecStatus::Success
    }
}

impl fmt::Display for TaskExecDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:?})", self.status, self.info)?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }

        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(TaskExecDetails),
    #[error("decoder engine fault: {0:#}")]
    DecoderEngine(anyhow::Error),
    #[error("bitstream parser fault: {0:#}")]
    Parser(anyhow::Error),
}

impl TaskError {
    /// Returns the details the failing task recorded.
    pub fn details(&self) -> TaskExecDetails {
        match self {
            TaskError::Failed(details) => details.clone(),
            TaskError::DecoderEngine(e) | TaskError::Parser(e) => {
                TaskExecDetails::fail(TaskExecInfo::Fail, format!("{:#}", e))
            }
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, TaskError::Failed(d) if d.info == TaskExecInfo::EndOfStream)
    }
}

pub trait Task {
    type Input<'a>;
    type Output;

    fn name(&self) -> &'static str;

    /// Runs the task once.
    fn execute(&mut self, input: Self::Input<'_>) -> Result<Self::Output, TaskError>;

    /// Outcome of the last call to [`execute`](Task::execute).
    fn exec_details(&self) -> &TaskExecDetails;
}

/// Records the outcome of a task execution into `details` and passes it through.
pub(crate) fn record<T>(
    details: &mut TaskExecDetails,
    result: Result<T, TaskError>,
    success: TaskExecInfo,
) -> Result<T, TaskError> {
    *details = match &result {
        Ok(_) => TaskExecDetails::success(success),
        Err(e) => e.details(),
    };

    result
}
