// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding of a video stream into device surfaces.
//!
//! A [`Decoder`] either reads packets from a built-in [`Demuxer`], in which case it can also seek
//! and recover from hardware faults on its own, or is fed packets by its caller (standalone
//! mode). Both modes share the same hardware pipeline, which may hold several packets before
//! outputting a frame: a call that produces no frame is reported through
//! [`TaskExecInfo::MoreDataNeeded`] or [`TaskExecInfo::EndOfStream`], never as an error.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::buffer::Buffer;
use crate::buffer::PacketData;
use crate::demux::DemuxError;
use crate::demux::Demuxer;
use crate::demux::SeekContext;
use crate::demux::SeekMode;
use crate::demux::SeekTarget;
use crate::demux::VideoParams;
use crate::device::resource_manager::ResourceManager;
use crate::device::DeviceContext;
use crate::device::DeviceError;
use crate::hw::DecodedFrame;
use crate::hw::DecoderCapability;
use crate::hw::DecoderParams;
use crate::hw::HwDecodeError;
use crate::hw::HwDecoderFactory;
use crate::surface::Surface;
use crate::surface::SurfaceError;
use crate::task::decode::DecodeInput;
use crate::task::decode::DecodeTask;
use crate::task::demux::DemuxInput;
use crate::task::demux::DemuxTask;
use crate::task::Task;
use crate::task::TaskError;
use crate::task::TaskExecDetails;
use crate::task::TaskExecInfo;
use crate::Codec;
use crate::ColorRange;
use crate::ColorSpace;
use crate::PixelFormat;
use crate::Resolution;

const NO_DEMUXER: &str = "decoder was created without a built-in demuxer";

#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Ordinal of the device to decode on. Ids that do not name a device select device 0.
    pub gpu_id: i32,
    /// Number of surfaces the hardware decoder may keep in flight.
    pub pool_frame_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            gpu_id: 0,
            pool_frame_size: 4,
        }
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("precondition violated: {0}")]
    Precondition(&'static str),
    #[error("cannot seek with mode {0:?}, only seeking to the previous key frame is supported")]
    UnsupportedSeekMode(SeekMode),
    #[error("decoded frame has no presentation timestamp, cannot seek")]
    MissingTimestamp,
    #[error("bitstream parser fault: {0:#}")]
    Parser(anyhow::Error),
    /// The hardware decoder failed. If `recovered` is set it has been rebuilt and the next call
    /// can proceed, otherwise the decoder must be recreated.
    #[error("hardware decoder fault (recovered: {recovered}): {error:#}")]
    DecoderReset {
        recovered: bool,
        error: anyhow::Error,
    },
    #[error("task failed: {0}")]
    Task(TaskExecDetails),
    #[error(transparent)]
    Demux(#[from] DemuxError),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a single decode call should do.
#[derive(Debug)]
pub enum DecodeContext<'a> {
    /// Read packets from the built-in demuxer until a frame comes out. If `seek` holds a pending
    /// request, the decoder first seeks to the key frame preceding the target and decodes up to
    /// it.
    Demux {
        seek: Option<&'a mut SeekContext>,
        want_sei: bool,
    },
    /// Decode a packet provided by the caller. An empty packet signals the end of the stream.
    Packet {
        data: &'a [u8],
        packet_data: Option<PacketData>,
    },
    /// Retrieve a frame still held by the hardware decoder after the end of the stream.
    Flush,
}

/// Result of a decode call that did not fail.
#[derive(Debug, Default)]
pub struct DecodeOutput {
    /// The decoded frame, if one came out of the pipeline.
    pub surface: Option<Surface>,
    /// [`TaskExecInfo::Success`] when a frame is returned, otherwise the reason why there is none.
    pub info: TaskExecInfo,
    /// Metadata of the packet the frame was decoded from.
    pub packet_data: Option<PacketData>,
    /// SEI attached to the last packet read from the demuxer, if requested.
    pub sei: Option<Buffer>,
}

impl DecodeOutput {
    fn no_frame(info: TaskExecInfo) -> Self {
        Self {
            info,
            ..Default::default()
        }
    }
}

/// Stream properties of a decoder fed by its caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StandaloneParams {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub codec: Codec,
}

/// Outcome of one trip through the decoding pipeline.
enum Step {
    Frame {
        frame: DecodedFrame,
        sei: Option<Buffer>,
    },
    NoFrame(TaskExecInfo),
}

impl From<Step> for DecodeOutput {
    fn from(step: Step) -> Self {
        match step {
            Step::Frame { frame, sei } => DecodeOutput {
                surface: Some(frame.surface),
                info: TaskExecInfo::Success,
                packet_data: frame.packet_data,
                sei,
            },
            Step::NoFrame(info) => DecodeOutput::no_frame(info),
        }
    }
}

fn hw_create_error(e: HwDecodeError) -> DecodeError {
    match e {
        HwDecodeError::Engine(e) | HwDecodeError::Parser(e) => {
            DecodeError::Other(e.context("failed to create the hardware decoder"))
        }
    }
}

/// Returns the shared context of the device selected by `gpu_id`.
fn global_context(gpu_id: i32) -> Result<Arc<DeviceContext>, DecodeError> {
    let manager = ResourceManager::global()
        .ok_or(DecodeError::Precondition("no resource manager has been installed"))?;

    Ok(manager.get(manager.resolve_ordinal(gpu_id))?)
}

pub struct Decoder {
    ctx: Arc<DeviceContext>,
    config: DecoderConfig,
    factory: Box<dyn HwDecoderFactory>,
    decode: DecodeTask,
    demux: Option<DemuxTask>,
    format: PixelFormat,
    /// Resolution snapshotted at the start of the last decode call.
    last_resolution: Option<Resolution>,
}

impl Decoder {
    /// Creates a decoder reading from `demuxer`, on the device `config` selects through the
    /// process-wide [`ResourceManager`].
    pub fn new(
        demuxer: Box<dyn Demuxer>,
        factory: Box<dyn HwDecoderFactory>,
        config: DecoderConfig,
    ) -> Result<Self, DecodeError> {
        let ctx = global_context(config.gpu_id)?;
        Self::with_context(demuxer, factory, config, ctx)
    }

    /// Creates a decoder reading from `demuxer` on an explicitly provided device context.
    pub fn with_context(
        demuxer: Box<dyn Demuxer>,
        factory: Box<dyn HwDecoderFactory>,
        config: DecoderConfig,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self, DecodeError> {
        let params = demuxer.params()?;
        let hw_params = DecoderParams {
            ctx: Arc::clone(&ctx),
            codec: params.codec,
            format: params.format,
            width: params.width,
            height: params.height,
            pool_frame_size: config.pool_frame_size,
        };
        let decode = DecodeTask::new(factory.create(&hw_params).map_err(hw_create_error)?);
        log::debug!(
            "Created {:?} decoder for {}x{} {:?} stream on device {}",
            params.codec,
            params.width,
            params.height,
            params.format,
            ctx.ordinal()
        );

        Ok(Self {
            ctx,
            config,
            factory,
            decode,
            demux: Some(DemuxTask::new(demuxer)),
            format: params.format,
            last_resolution: Some(Resolution::from((params.width, params.height))),
        })
    }

    /// Creates a decoder fed with packets by its caller, on the device `config` selects through
    /// the process-wide [`ResourceManager`].
    pub fn standalone(
        params: StandaloneParams,
        factory: Box<dyn HwDecoderFactory>,
        config: DecoderConfig,
    ) -> Result<Self, DecodeError> {
        let ctx = global_context(config.gpu_id)?;
        Self::standalone_with_context(params, factory, config, ctx)
    }

    pub fn standalone_with_context(
        params: StandaloneParams,
        factory: Box<dyn HwDecoderFactory>,
        config: DecoderConfig,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self, DecodeError> {
        let hw_params = DecoderParams {
            ctx: Arc::clone(&ctx),
            codec: params.codec,
            format: params.format,
            width: params.width,
            height: params.height,
            pool_frame_size: config.pool_frame_size,
        };
        let decode = DecodeTask::new(factory.create(&hw_params).map_err(hw_create_error)?);

        Ok(Self {
            ctx,
            config,
            factory,
            decode,
            demux: None,
            format: params.format,
            last_resolution: None,
        })
    }

    pub fn device_context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    fn params(&self) -> Result<VideoParams, DecodeError> {
        let demux = self
            .demux
            .as_ref()
            .ok_or(DecodeError::Precondition(NO_DEMUXER))?;

        Ok(demux.params()?)
    }

    pub fn width(&self) -> Result<u32, DecodeError> {
        Ok(self.params()?.width)
    }

    pub fn height(&self) -> Result<u32, DecodeError> {
        Ok(self.params()?.height)
    }

    pub fn color_space(&self) -> Result<ColorSpace, DecodeError> {
        Ok(self.params()?.color_space)
    }

    pub fn color_range(&self) -> Result<ColorRange, DecodeError> {
        Ok(self.params()?.color_range)
    }

    pub fn framerate(&self) -> Result<f64, DecodeError> {
        Ok(self.params()?.frame_rate)
    }

    pub fn avg_framerate(&self) -> Result<f64, DecodeError> {
        Ok(self.params()?.avg_frame_rate)
    }

    pub fn is_vfr(&self) -> Result<bool, DecodeError> {
        Ok(self.params()?.is_vfr)
    }

    pub fn timebase(&self) -> Result<f64, DecodeError> {
        Ok(self.params()?.time_base)
    }

    pub fn num_frames(&self) -> Result<Option<u64>, DecodeError> {
        Ok(self.params()?.num_frames)
    }

    /// Size in bytes of a decoded frame once downloaded to the host.
    pub fn frame_size(&self) -> Result<usize, DecodeError> {
        let params = self.params()?;
        Ok(self.format.host_frame_size(params.width, params.height))
    }

    /// Metadata of the last packet read from the built-in demuxer.
    pub fn last_packet_data(&self) -> Result<Option<PacketData>, DecodeError> {
        let demux = self
            .demux
            .as_ref()
            .ok_or(DecodeError::Precondition(NO_DEMUXER))?;

        Ok(demux.last_packet_data())
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    pub fn capabilities(&self) -> BTreeMap<DecoderCapability, i32> {
        DecoderCapability::all()
            .map(|cap| (cap, self.decode.capability(cap)))
            .collect()
    }

    /// Whether the stream resolution differs from the one seen at the start of the last decode
    /// call. Always false for standalone decoders or when the stream properties cannot be read.
    pub fn is_resolution_changed(&self) -> bool {
        match (self.params(), self.last_resolution) {
            (Ok(params), Some(last)) => Resolution::from((params.width, params.height)) != last,
            _ => false,
        }
    }

    fn update_state(&mut self) {
        if let Ok(params) = self.params() {
            self.last_resolution = Some(Resolution::from((params.width, params.height)));
        }
    }

    /// Decodes according to `ctx` and returns the frame as a surface the caller owns.
    pub fn decode_surface(&mut self, ctx: DecodeContext<'_>) -> Result<DecodeOutput, DecodeError> {
        let mut output = self.decode_impl(ctx)?;
        if let Some(surface) = output.surface.take() {
            output.surface = Some(surface.deep_clone(&self.ctx)?);
        }

        Ok(output)
    }

    /// Decodes the next frame from the built-in demuxer, seeking first if `seek` holds a pending
    /// request.
    pub fn decode_single_surface(
        &mut self,
        seek: Option<&mut SeekContext>,
        want_sei: bool,
    ) -> Result<DecodeOutput, DecodeError> {
        self.decode_surface(DecodeContext::Demux { seek, want_sei })
    }

    pub fn decode_surface_from_packet(
        &mut self,
        data: &[u8],
        packet_data: Option<PacketData>,
    ) -> Result<DecodeOutput, DecodeError> {
        self.decode_surface(DecodeContext::Packet { data, packet_data })
    }

    pub fn flush_single_surface(&mut self) -> Result<DecodeOutput, DecodeError> {
        self.decode_surface(DecodeContext::Flush)
    }

    /// Decodes according to `ctx` and downloads the frame into `dst`, which is resized to the
    /// frame size.
    ///
    /// The returned surface, if any, is the decoder's own and only remains valid until the
    /// decoder reuses or releases it.
    pub fn decode_single_frame(
        &mut self,
        ctx: DecodeContext<'_>,
        dst: &mut Vec<u8>,
    ) -> Result<DecodeOutput, DecodeError> {
        let output = self.decode_impl(ctx)?;
        if let Some(surface) = &output.surface {
            dst.resize(surface.host_mem_size(), 0);
            surface.download(&self.ctx, dst)?;
        }

        Ok(output)
    }

    fn decode_impl(&mut self, ctx: DecodeContext<'_>) -> Result<DecodeOutput, DecodeError> {
        match (&ctx, self.demux.is_some()) {
            (DecodeContext::Demux { .. }, false) => {
                return Err(DecodeError::Precondition(
                    "decoder has no built-in demuxer, feed it packets instead",
                ))
            }
            (DecodeContext::Packet { .. }, true) => {
                return Err(DecodeError::Precondition(
                    "decoder reads its packets from its built-in demuxer",
                ))
            }
            _ => (),
        }

        self.update_state();

        let step = match ctx {
            DecodeContext::Demux {
                seek: Some(seek),
                want_sei,
            } if seek.use_seek => return self.seek(seek, want_sei),
            DecodeContext::Demux { seek, want_sei } => self.demux_and_decode(seek, want_sei),
            DecodeContext::Packet { data, packet_data } => {
                let packet = Buffer::copy_from(data);
                self.feed(Some(&packet), packet_data.as_ref())
            }
            DecodeContext::Flush => self.feed(None, None),
        };

        Ok(step.map_err(|e| self.fault(e))?.into())
    }

    fn seek(
        &mut self,
        seek: &mut SeekContext,
        want_sei: bool,
    ) -> Result<DecodeOutput, DecodeError> {
        if seek.mode != SeekMode::PrevKeyFrame {
            return Err(DecodeError::UnsupportedSeekMode(seek.mode));
        }

        let demux = self
            .demux
            .as_ref()
            .ok_or(DecodeError::Precondition(NO_DEMUXER))?;
        let target = match seek.target {
            SeekTarget::FrameNumber(frame) => demux.ts_from_frame_number(frame),
            SeekTarget::Timestamp(seconds) => demux.ts_from_time(seconds),
        };

        // Frames queued before the seek must not come out after it.
        self.drain().map_err(|e| self.fault(e))?;
        seek.num_frames_decoded = 0;

        loop {
            let step = self.demux_and_decode(Some(&mut *seek), want_sei);
            if !matches!(step, Ok(Step::NoFrame(_))) {
                seek.num_frames_decoded += 1;
            }

            match step.map_err(|e| self.fault(e))? {
                Step::Frame { frame, sei } => {
                    let pts = frame
                        .packet_data
                        .filter(PacketData::has_pts)
                        .ok_or(DecodeError::MissingTimestamp)?
                        .pts;
                    if pts >= target {
                        return Ok(Step::Frame { frame, sei }.into());
                    }
                }
                Step::NoFrame(info) => return Ok(DecodeOutput::no_frame(info)),
            }
        }
    }

    /// Empties the hardware pipeline without ending the stream.
    fn drain(&mut self) -> Result<(), TaskError> {
        loop {
            let drained = self.decode.execute(DecodeInput {
                packet: None,
                packet_data: None,
                no_eos: true,
            })?;
            if drained.is_none() {
                return Ok(());
            }
        }
    }

    /// Reads packets and feeds them to the decoder until a frame comes out. Once the demuxer
    /// runs dry, the decoder is flushed instead.
    fn demux_and_decode(
        &mut self,
        mut seek: Option<&mut SeekContext>,
        want_sei: bool,
    ) -> Result<Step, TaskError> {
        let Some(demux) = self.demux.as_mut() else {
            return Err(TaskError::Failed(TaskExecDetails::fail(
                TaskExecInfo::NotSupported,
                NO_DEMUXER,
            )));
        };

        loop {
            let demuxed = match demux.execute(DemuxInput {
                seek: seek.as_deref_mut(),
                need_sei: want_sei,
            }) {
                Ok(demuxed) => Some(demuxed),
                Err(e) => {
                    if !e.is_end_of_stream() {
                        log::warn!("{}: {}, flushing the decoder", demux.name(), e);
                    }
                    None
                }
            };

            let decoded = self.decode.execute(DecodeInput {
                packet: demuxed.as_ref().map(|d| &d.packet),
                packet_data: demuxed.as_ref().map(|d| &d.packet_data),
                no_eos: false,
            });

            match decoded {
                Ok(Some(frame)) => {
                    return Ok(Step::Frame {
                        frame,
                        sei: demuxed.and_then(|d| d.sei),
                    })
                }
                Ok(None) => continue,
                Err(e) if e.is_end_of_stream() => {
                    return Ok(Step::NoFrame(TaskExecInfo::EndOfStream))
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn feed(
        &mut self,
        packet: Option<&Buffer>,
        packet_data: Option<&PacketData>,
    ) -> Result<Step, TaskError> {
        let decoded = self.decode.execute(DecodeInput {
            packet,
            packet_data,
            no_eos: false,
        });

        match decoded {
            Ok(Some(frame)) => Ok(Step::Frame { frame, sei: None }),
            Ok(None) => Ok(Step::NoFrame(TaskExecInfo::MoreDataNeeded)),
            Err(e) if e.is_end_of_stream() => Ok(Step::NoFrame(TaskExecInfo::EndOfStream)),
            Err(e) => Err(e),
        }
    }

    /// Classifies a pipeline failure, rebuilding the hardware decoder after an engine fault if
    /// the stream properties needed to do so are known.
    fn fault(&mut self, e: TaskError) -> DecodeError {
        match e {
            TaskError::Parser(e) => {
                log::error!("bitstream parser fault: {:#}", e);
                DecodeError::Parser(e)
            }
            TaskError::DecoderEngine(e) => {
                log::error!("hardware decoder fault: {:#}", e);

                let recovered = match self.demux {
                    Some(_) => match self.rebuild_decoder() {
                        Ok(()) => true,
                        Err(rebuild) => {
                            log::error!("failed to rebuild the hardware decoder: {}", rebuild);
                            false
                        }
                    },
                    None => {
                        log::warn!("standalone decoder must be recreated after a hardware fault");
                        false
                    }
                };

                DecodeError::DecoderReset {
                    recovered,
                    error: e,
                }
            }
            TaskError::Failed(details) => DecodeError::Task(details),
        }
    }

    fn rebuild_decoder(&mut self) -> Result<(), DecodeError> {
        let started = Instant::now();

        let params = self.params()?;
        let hw_params = DecoderParams {
            ctx: Arc::clone(&self.ctx),
            codec: params.codec,
            format: self.format,
            width: params.width,
            height: params.height,
            pool_frame_size: self.config.pool_frame_size,
        };
        self.decode = DecodeTask::new(self.factory.create(&hw_params).map_err(hw_create_error)?);

        log::warn!(
            "Hardware decoder rebuilt in {} ms",
            started.elapsed().as_millis()
        );

        Ok(())
    }
}
