// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the VPU firmware.
//!
//! The VPU is driven through a small set of blocking calls: open a decoder instance on a bitstream
//! ring, ask it to parse the sequence header, register frame buffers, then start frames one at a
//! time and collect what it reports when they complete. [`VpuBackend`] captures that call surface
//! so the rest of the crate can be exercised without the hardware, see [`dummy`].

pub mod dummy;

use std::time::Duration;

use thiserror::Error;

use crate::codec::JpegSourceFormat;
use crate::codec::StreamFormat;
use crate::config::BitstreamMode;
use crate::MapType;
use crate::Rect;

/// Size to pass to [`VpuBackend::update_bitstream`] to tell the decoder that no more bitstream is
/// coming.
pub const STREAM_END_SIZE: usize = 0;

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The decoder instance cannot be closed because a frame is still being processed.
    #[error("a frame is still being decoded")]
    FrameNotComplete,
    #[error("timed out waiting for the decoder")]
    Timeout,
    #[error("{operation} failed with code {code}")]
    Failed { operation: &'static str, code: i32 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type returned by backend methods.
pub type BackendResult<T> = Result<T, BackendError>;

/// Parameters used to open a decoder instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenParams {
    pub format: StreamFormat,
    pub bitstream_phys: u64,
    pub bitstream_size: usize,
    pub reorder: bool,
    pub deblocking: bool,
    pub chroma_interleave: bool,
    pub map_type: MapType,
    pub tiled_to_linear: bool,
    pub bitstream_mode: BitstreamMode,
    pub jpeg_line_buffer: bool,
    /// Parameter-set save area, only needed for H.264.
    pub ps_save_buffer: Option<(u64, usize)>,
}

/// Size of the per-frame report areas the decoder is able to fill.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportBufferSizes {
    pub frame_buffer_status: usize,
    pub macroblock_info: usize,
    pub motion_vectors: usize,
}

/// Stream properties reported by the decoder after parsing the sequence header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitialInfo {
    pub pic_width: u32,
    pub pic_height: u32,
    pub min_frame_buffer_count: usize,
    pub interlaced: bool,
    pub profile: u32,
    pub level: u32,
    pub aspect_ratio: u32,
    pub frame_rate_res: u32,
    pub frame_rate_div: u32,
    pub crop: Rect,
    /// Worst case slice size, in KiB.
    pub worst_slice_size: u32,
    pub jpeg_source_format: JpegSourceFormat,
    pub vc1_psf: bool,
    pub vp8_scale: (u32, u32),
    pub report_buffer_sizes: ReportBufferSizes,
    pub stream_info_obtained: bool,
}

/// Physical addresses of a frame buffer, as handed to the decoder.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameBufferDesc {
    pub y: u64,
    pub cb: u64,
    pub cr: u64,
    /// Co-located motion vector area. Zero for formats that do not use one.
    pub mv_col: u64,
    pub stride: u32,
    pub height: u32,
}

/// Auxiliary working areas registered with the frame buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub slice_buffer: Option<(u64, usize)>,
    pub macroblock_buffer: Option<(u64, usize)>,
    pub max_mb_x: u32,
    pub max_mb_y: u32,
    pub max_mb_num: u32,
}

/// Current state of the bitstream ring, as seen by the decoder.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BitstreamPointers {
    pub read: u64,
    pub write: u64,
    /// Number of bytes that can be written without overrunning the read pointer.
    pub space: usize,
}

/// Parameters of a single frame submission.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodeParams {
    /// Location and size of the picture when JPEG pictures are fed one by one.
    pub chunk: Option<(u64, usize)>,
    pub jpeg_scale_down: (u8, u8),
}

/// Outcome of [`VpuBackend::start_one_frame`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartStatus {
    Started,
    /// The decoder needs more bitstream before it can start this frame.
    BitstreamEmpty,
    /// The end of the JPEG sequence has been reached.
    EndOfSequence,
}

/// Configuration commands understood by an open decoder instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SetRotationAngle(u32),
    SetMirrorDirection(u32),
    SetRotatorStride(u32),
    SetRotatorOutput(FrameBufferDesc),
    SetDeblockOutput(FrameBufferDesc),
    EnableRotation,
    EnableMirroring,
    EnableDering,
    /// Number of frames the decoder may hold before display. `-1` leaves it to the decoder.
    SetFrameDelay(i32),
    SetReportFrameBufferStatus(usize),
    SetReportMacroblockInfo(usize),
    SetReportMotionVectors(usize),
    SetReportUserData(usize),
}

/// Bits of [`OutputInfo::decoding_success`].
pub mod success_flags {
    /// The frame was not complete in the ring and must be resubmitted after a refill.
    pub const ROLLBACK: u32 = 0x10;
    /// The sequence parameters changed in the middle of the stream.
    pub const SEQUENCE_CHANGED: u32 = 0x10_0000;
}

/// What the decoder says about the picture to display after a frame completes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisplayIndex {
    Frame(usize),
    /// All frames have been decoded and displayed.
    Finished,
    /// No picture is ready for display this time. The raw sentinel is kept for logging.
    NotAvailable(i32),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionVectorReport {
    pub data: Vec<u8>,
    pub per_macroblock: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserDataReport {
    pub data: Vec<u8>,
    pub buffer_full: bool,
}

/// Optional per-frame report payloads, present only when enabled through [`Command`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameReports {
    pub frame_buffer_status: Option<Vec<u8>>,
    pub macroblock_info: Option<Vec<u8>>,
    pub motion_vectors: Option<MotionVectorReport>,
    pub user_data: Option<UserDataReport>,
}

/// Result of a completed frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputInfo {
    pub index_decoded: i32,
    pub index_display: i32,
    pub decoding_success: u32,
    pub error_macroblocks: u32,
    pub not_sufficient_ps_buffer: bool,
    pub not_sufficient_slice_buffer: bool,
    pub decoded_width: u32,
    pub decoded_height: u32,
    pub reports: FrameReports,
}

impl OutputInfo {
    pub fn display(&self) -> DisplayIndex {
        match self.index_display {
            i if i >= 0 => DisplayIndex::Frame(i as usize),
            -1 => DisplayIndex::Finished,
            i => DisplayIndex::NotAvailable(i),
        }
    }

    /// Index of the buffer the frame was decoded into, if any.
    pub fn decoded(&self) -> Option<usize> {
        usize::try_from(self.index_decoded).ok()
    }

    pub fn is_incomplete(&self) -> bool {
        self.decoding_success == 0
    }

    pub fn needs_rollback(&self) -> bool {
        self.decoding_success & success_flags::ROLLBACK != 0
    }

    pub fn sequence_changed(&self) -> bool {
        self.decoding_success & success_flags::SEQUENCE_CHANGED != 0
    }
}

/// Plane of a tiled frame buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TiledPlane {
    Luma,
    Chroma,
}

/// Blocking interface to a VPU decoder instance.
///
/// Calls other than [`VpuBackend::open`] are only valid between a successful `open` and the
/// matching [`VpuBackend::close`].
pub trait VpuBackend {
    fn open(&mut self, params: &OpenParams) -> BackendResult<()>;

    /// Closes the decoder instance. Fails with [`BackendError::FrameNotComplete`] if a frame is
    /// still in flight, in which case the caller is expected to reset the decoder and retry.
    fn close(&mut self) -> BackendResult<()>;

    /// While enabled, parsing the sequence header does not block waiting for more bitstream.
    fn set_escape_sequence_init(&mut self, enable: bool);

    fn initial_info(&mut self) -> BackendResult<InitialInfo>;

    /// Registers `buffers` with the decoder. The first `decode_count` entries are decoding
    /// targets, the remaining ones are only ever written by the post-processing path.
    fn register_frame_buffers(
        &mut self,
        buffers: &[FrameBufferDesc],
        decode_count: usize,
        stride: u32,
        info: &BufferInfo,
    ) -> BackendResult<()>;

    fn bitstream_pointers(&mut self) -> BackendResult<BitstreamPointers>;

    /// Tells the decoder that `size` bytes have been written at the write pointer. A size of
    /// [`STREAM_END_SIZE`] signals the end of the stream.
    fn update_bitstream(&mut self, size: usize) -> BackendResult<()>;

    fn command(&mut self, command: Command) -> BackendResult<()>;

    fn start_one_frame(&mut self, params: &DecodeParams) -> BackendResult<StartStatus>;

    fn is_busy(&mut self) -> bool;

    /// Waits until the decoder raises its interrupt or `timeout` expires.
    fn wait_for_interrupt(&mut self, timeout: Duration) -> BackendResult<()>;

    fn output_info(&mut self) -> BackendResult<OutputInfo>;

    /// Gives buffer `index` back to the decoder after its picture has been consumed.
    fn clear_display_flag(&mut self, index: usize) -> BackendResult<()>;

    fn software_reset(&mut self) -> BackendResult<()>;

    /// Returns the physical address of pixel (`x`, `y`) of `plane` in the tiled buffer `buffer`.
    fn tiled_address(&self, buffer: &FrameBufferDesc, plane: TiledPlane, x: u32, y: u32) -> u64;
}
