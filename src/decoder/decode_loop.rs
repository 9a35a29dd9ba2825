// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-frame protocol with the decoder.
//!
//! Every frame goes through the same states:
//!
//! ```text
//! AwaitingSubmit -> Submitted -> AwaitingCompletion -> ResultReady -> Dispatched
//!       ^                                                          -> Skipped
//!       |                                                          -> Retry
//!       +----------------------------------------------------------+
//!                                                                  -> Terminal
//! ```
//!
//! [`DecodeLoop::step`] performs one transition and returns the next state, [`DecodeLoop::run`]
//! drives it until a terminal state is reached or an error occurs.
//!
//! Decoding targets are given back to the decoder one frame late: the buffer released after a
//! frame has been dispatched is the one displayed by the previous frame, never the current one.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;

use crate::backend::Command;
use crate::backend::DecodeParams;
use crate::backend::DisplayIndex;
use crate::backend::OutputInfo;
use crate::backend::StartStatus;
use crate::backend::VpuBackend;
use crate::bitstream_utils::BitstreamSource;
use crate::codec::descriptor;
use crate::config::DecoderConfig;
use crate::config::SourceKind;
use crate::config::Tunables;
use crate::decoder::crop::remap_crop;
use crate::decoder::negotiate::StreamInfo;
use crate::decoder::output::Dispatcher;
use crate::decoder::pool::FrameBufferPool;
use crate::decoder::report::DiagnosticReports;
use crate::decoder::ring::BitstreamRing;
use crate::decoder::ring::ChunkFeeder;
use crate::decoder::ring::FillOutcome;
use crate::decoder::ring::STREAM_FILL_SIZE;
use crate::decoder::DecodeError;
use crate::decoder::Result;
use crate::Rect;
use crate::Resolution;

/// Number of interrupt waits after which a busy decoder is considered hung.
pub const HANG_POLL_LIMIT: u32 = 50;
pub const INTERRUPT_TIMEOUT: Duration = Duration::from_millis(100);
/// Size of the area the decoder reports user data into.
pub const USER_DATA_BUFFER_SIZE: usize = 0x1000;

/// Why a decoding run ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The bitstream source has no more pictures.
    EndOfStream,
    /// The decoder has output every frame.
    Finished,
    /// The configured number of frames has been output.
    FrameLimit,
    /// The quit flag was raised.
    Quit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopState {
    AwaitingSubmit,
    Submitted,
    AwaitingCompletion,
    ResultReady(OutputInfo),
    Dispatched,
    Skipped,
    /// The frame has to be submitted again once more bitstream is available.
    Retry,
    Terminal(Termination),
}

/// What a completed frame amounts to. Variants are listed in decreasing priority.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// The frame could not be fully decoded. Nothing is displayed.
    Partial,
    /// The frame is truncated in the ring and must be resubmitted after a refill.
    Rollback,
    /// Every frame has been decoded and displayed.
    Finished,
    /// No picture is ready for display yet.
    NoDisplay(i32),
    Display(usize),
}

/// Classifies the result of a frame. Buffer overflows are fatal and reported as errors.
pub fn classify(info: &OutputInfo) -> Result<Classification> {
    if info.is_incomplete() {
        return Ok(Classification::Partial);
    }
    if info.needs_rollback() {
        return Ok(Classification::Rollback);
    }
    if info.not_sufficient_ps_buffer {
        return Err(DecodeError::PsBufferOverflow);
    }
    if info.not_sufficient_slice_buffer {
        return Err(DecodeError::SliceBufferOverflow);
    }

    Ok(match info.display() {
        DisplayIndex::Frame(index) => Classification::Display(index),
        DisplayIndex::Finished => Classification::Finished,
        DisplayIndex::NotAvailable(raw) => Classification::NoDisplay(raw),
    })
}

/// A picture handed to the output sink.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DispatchRecord {
    /// Frame buffer the picture was read from.
    pub index: usize,
    pub crop: Rect,
    pub size: usize,
}

/// Statistics of a session. They survive failed runs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodeStats {
    /// Pictures handed to the output sink.
    pub frames: u64,
    /// Frames decoded into a frame buffer.
    pub decoded: u64,
    pub error_macroblocks: u64,
    pub partial: u64,
    pub rollbacks: u64,
    pub no_display: u64,
    pub resolution_changes: u64,
    /// Time spent waiting for the decoder.
    pub decode_time: Duration,
    pub total_time: Duration,
    pub last_dispatch: Option<DispatchRecord>,
}

impl DecodeStats {
    /// Number of recoverable anomalies the decoder reported.
    pub fn anomalies(&self) -> u64 {
        self.partial + self.rollbacks + self.no_display
    }

    fn fps(frames: u64, time: Duration) -> Option<f64> {
        (!time.is_zero()).then(|| frames as f64 / time.as_secs_f64())
    }

    pub fn decode_fps(&self) -> Option<f64> {
        Self::fps(self.frames, self.decode_time)
    }

    pub fn total_fps(&self) -> Option<f64> {
        Self::fps(self.frames, self.total_time)
    }
}

/// State carried from one frame to the next.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopCounters {
    /// Number of dispatched frames.
    pub frame_id: u64,
    /// Number of decoded frames.
    pub decode_index: u64,
    /// Decoding target displayed by the previous frame, to be given back after the next dispatch.
    pub pending_release: Option<usize>,
    pub last_resolution: Resolution,
    pub decode_finished: bool,
    /// Rotation, mirroring and deringing have been enabled on the decoder.
    pub post_processing_latched: bool,
}

/// Scratch state of the frame being decoded.
#[derive(Clone, Debug, Default)]
pub struct IterationState {
    pub params: DecodeParams,
    pub submitted_at: Option<Instant>,
    pub polls: u32,
    pub waited: bool,
}

/// Everything the loop needs from the session.
pub struct LoopContext<'a, B: VpuBackend + ?Sized> {
    pub backend: &'a mut B,
    pub ring: &'a mut BitstreamRing,
    pub source: &'a mut dyn BitstreamSource,
    /// Set when JPEG pictures are fed one at a time.
    pub chunks: Option<&'a mut ChunkFeeder>,
    pub pool: &'a mut FrameBufferPool,
    pub dispatcher: &'a mut Dispatcher,
    pub reports: Option<&'a mut DiagnosticReports>,
    pub stream: &'a StreamInfo,
    pub config: &'a DecoderConfig,
    pub tunables: &'a Tunables,
    pub quit: &'a AtomicBool,
}

pub struct DecodeLoop<'a, B: VpuBackend + ?Sized> {
    ctx: LoopContext<'a, B>,
    stats: &'a mut DecodeStats,
    counters: LoopCounters,
    iteration: IterationState,
}

impl<'a, B: VpuBackend + ?Sized> DecodeLoop<'a, B> {
    pub fn new(ctx: LoopContext<'a, B>, stats: &'a mut DecodeStats) -> Self {
        let counters = LoopCounters {
            last_resolution: ctx.stream.picture_resolution,
            ..Default::default()
        };
        Self {
            ctx,
            stats,
            counters,
            iteration: Default::default(),
        }
    }

    pub fn counters(&self) -> &LoopCounters {
        &self.counters
    }

    fn still_picture(&self) -> bool {
        descriptor(self.ctx.config.format).is_still_picture()
    }

    fn quit_requested(&self) -> bool {
        self.ctx.quit.load(Ordering::Relaxed)
    }

    fn fill(&mut self, min_chunk: usize) -> Result<FillOutcome> {
        Ok(self
            .ctx
            .ring
            .fill(&mut *self.ctx.backend, &mut *self.ctx.source, min_chunk)?)
    }

    /// Points the rotator at its output for this frame and enables the post-processing features
    /// on the first one.
    fn configure_frame(&mut self) -> Result<()> {
        let config = self.ctx.config;
        if config.post_processing() || self.still_picture() {
            let rotator = self.ctx.pool.rotator_index();
            let desc = *self
                .ctx
                .pool
                .get(rotator)
                .ok_or_else(|| anyhow!("no rotator output at index {}", rotator))?
                .desc();
            self.ctx.backend.command(Command::SetRotatorOutput(desc))?;

            if !self.counters.post_processing_latched {
                if config.rotation_enabled {
                    self.ctx.backend.command(Command::EnableRotation)?;
                    self.ctx.backend.command(Command::EnableMirroring)?;
                }
                if config.deringing {
                    self.ctx.backend.command(Command::EnableDering)?;
                }
                self.counters.post_processing_latched = true;
            }
        }

        if config.reports.user_data && descriptor(config.format).has_user_data() {
            self.ctx
                .backend
                .command(Command::SetReportUserData(USER_DATA_BUFFER_SIZE))?;
        }

        Ok(())
    }

    /// Makes sure the bitstream of the next frame is available and starts decoding it.
    fn submit(&mut self) -> Result<LoopState> {
        self.iteration = Default::default();
        self.configure_frame()?;

        if self.still_picture() {
            if let Some(chunks) = self.ctx.chunks.as_deref_mut() {
                match chunks.next_chunk(&mut *self.ctx.ring, &mut *self.ctx.source)? {
                    Some(chunk) => self.iteration.params.chunk = Some(chunk),
                    None => return Ok(LoopState::Terminal(Termination::EndOfStream)),
                }
            } else {
                self.fill(STREAM_FILL_SIZE)?;
            }
            self.iteration.params.jpeg_scale_down = self.ctx.config.jpeg_scale_down;
        }

        self.iteration.submitted_at = Some(Instant::now());
        match self
            .ctx
            .backend
            .start_one_frame(&self.iteration.params)
            .map_err(DecodeError::StartFailed)?
        {
            StartStatus::Started => Ok(LoopState::Submitted),
            StartStatus::BitstreamEmpty => {
                log::debug!("bitstream empty at frame {}", self.counters.frame_id);
                if self.still_picture() && self.ctx.chunks.is_none() {
                    self.fill(STREAM_FILL_SIZE)?;
                }
                Ok(LoopState::AwaitingSubmit)
            }
            StartStatus::EndOfSequence => {
                log::info!("JPEG bitstream is end");
                Ok(LoopState::Terminal(Termination::EndOfStream))
            }
        }
    }

    /// Keeps the ring topped up while the decoder works, and gives up if it never finishes.
    fn poll(&mut self) -> Result<LoopState> {
        let still_picture = self.still_picture();
        while self.ctx.backend.is_busy() {
            if !still_picture {
                self.fill(STREAM_FILL_SIZE)?;
            }

            if self.iteration.polls == HANG_POLL_LIMIT {
                log::error!(
                    "decoder still busy after {} waits on frame {}, resetting it",
                    HANG_POLL_LIMIT,
                    self.counters.frame_id
                );
                if let Err(e) = self.ctx.backend.software_reset() {
                    log::error!("software reset failed: {}", e);
                }
                return Err(DecodeError::Hang {
                    polls: self.iteration.polls,
                });
            }

            if self
                .ctx
                .backend
                .wait_for_interrupt(INTERRUPT_TIMEOUT)
                .is_ok()
            {
                self.iteration.waited = true;
            }
            self.iteration.polls += 1;
        }

        Ok(LoopState::AwaitingCompletion)
    }

    fn collect(&mut self) -> Result<LoopState> {
        if !self.iteration.waited {
            if let Err(e) = self.ctx.backend.wait_for_interrupt(INTERRUPT_TIMEOUT) {
                log::debug!("no interrupt after frame {}: {}", self.counters.frame_id, e);
            }
        }
        if let Some(submitted_at) = self.iteration.submitted_at {
            self.stats.decode_time += submitted_at.elapsed();
        }

        let info = self
            .ctx
            .backend
            .output_info()
            .map_err(DecodeError::OutputInfo)?;
        // Give other decoding sessions a chance to run.
        std::thread::yield_now();

        log::debug!(
            "frame_id {}, decidx {}, disidx {}, rotid {}, decodingSuccess {:#x}",
            self.counters.frame_id,
            info.index_decoded,
            info.index_display,
            self.ctx.pool.rotator_index(),
            info.decoding_success
        );

        Ok(LoopState::ResultReady(info))
    }

    fn record_reports(&mut self, info: &OutputInfo) -> Result<()> {
        let Some(reports) = self.ctx.reports.as_deref_mut() else {
            return Ok(());
        };

        if info.decoded().is_some() {
            if let Some(user_data) = &info.reports.user_data {
                reports
                    .record_user_data(user_data)
                    .map_err(DecodeError::Report)?;
            }
        }
        reports
            .record(self.counters.decode_index, &info.reports)
            .map_err(DecodeError::Report)
    }

    /// Gives the decoding target displayed by the previous frame back to the decoder.
    fn release_pending(&mut self) {
        if let Some(index) = self.counters.pending_release.take() {
            if let Err(e) = self.ctx.pool.clear_display(&mut *self.ctx.backend, index) {
                log::error!("failed to release frame buffer {}: {}", index, e);
            }
        }
    }

    fn handle_result(&mut self, info: OutputInfo) -> Result<LoopState> {
        let config = self.ctx.config;
        let still_picture = self.still_picture();

        let class = classify(&info)?;
        match class {
            Classification::Partial => {
                log::warn!(
                    "Incomplete finish of decoding process, frame_id = {}",
                    self.counters.frame_id
                );
                self.stats.partial += 1;
                self.stats.error_macroblocks += u64::from(info.error_macroblocks);
                return Ok(if self.quit_requested() {
                    LoopState::Terminal(Termination::Quit)
                } else {
                    LoopState::Skipped
                });
            }
            Classification::Rollback => {
                log::warn!(
                    "vpu needs more bitstream in rollback mode, frame_id = {}",
                    self.counters.frame_id
                );
                self.stats.rollbacks += 1;
                self.fill(0)?;
                return Ok(if self.quit_requested() {
                    LoopState::Terminal(Termination::Quit)
                } else {
                    LoopState::Retry
                });
            }
            _ => (),
        }

        if info.sequence_changed() {
            log::warn!("sequence parameters have been changed");
        }
        self.record_reports(&info)?;

        if class == Classification::Finished {
            self.counters.decode_finished = true;
            if !config.post_processing() || still_picture {
                return Ok(LoopState::Terminal(Termination::Finished));
            }
        }

        if self.quit_requested() {
            return Ok(LoopState::Terminal(Termination::Quit));
        }

        if info.decoded().is_some() {
            let decoded = Resolution::new(info.decoded_width, info.decoded_height);
            if decoded != self.counters.last_resolution {
                log::warn!(
                    "resolution changed from {}x{} to {}x{}",
                    self.counters.last_resolution.width,
                    self.counters.last_resolution.height,
                    decoded.width,
                    decoded.height
                );
                self.counters.last_resolution = decoded;
                self.stats.resolution_changes += 1;
            }
            if info.error_macroblocks > 0 {
                self.stats.error_macroblocks += u64::from(info.error_macroblocks);
                log::info!(
                    "Num of Error Mbs : {}, in Frame : {}",
                    info.error_macroblocks,
                    self.counters.decode_index
                );
            }
            self.counters.decode_index += 1;
            self.stats.decoded += 1;
        }

        let display = match class {
            Classification::NoDisplay(raw) => {
                log::debug!("VPU doesn't have picture to be displayed ({})", raw);
                self.stats.no_display += 1;
                if !still_picture {
                    self.release_pending();
                }
                return Ok(LoopState::Skipped);
            }
            Classification::Display(index) => Some(index),
            _ => None,
        };

        if !still_picture {
            if let Some(index) = display {
                self.ctx.pool.mark_displayed(index)?;
            }
        }

        let target = if config.post_processing() || still_picture {
            // The rotator lags one frame behind: its first output is only shown with the next
            // frame.
            if !still_picture && self.counters.pending_release.is_none() {
                if self.counters.decode_finished {
                    return Ok(LoopState::Terminal(Termination::Finished));
                }
                self.counters.pending_release = display;
                return Ok(LoopState::Skipped);
            }
            self.ctx.pool.rotator_index()
        } else {
            match display {
                Some(index) => index,
                None => return Ok(LoopState::Terminal(Termination::Finished)),
            }
        };

        let crop = if config.rotation_enabled {
            remap_crop(
                self.ctx.stream.crop,
                config.rotation,
                config.mirror,
                self.ctx.stream.coded_resolution,
            )
        } else {
            self.ctx.stream.crop
        };

        let buffer = self
            .ctx
            .pool
            .get(target)
            .ok_or_else(|| anyhow!("no frame buffer at index {}", target))?;
        let size = self
            .ctx
            .dispatcher
            .dispatch(&*self.ctx.backend, buffer, crop)?;
        self.stats.last_dispatch = Some(DispatchRecord {
            index: target,
            crop,
            size,
        });

        if !still_picture {
            self.release_pending();
            self.counters.pending_release = display;
        }
        self.ctx.pool.advance_rotator();
        self.counters.frame_id += 1;
        self.stats.frames += 1;

        if config.frame_count != 0 && self.counters.frame_id >= config.frame_count {
            return Ok(LoopState::Terminal(Termination::FrameLimit));
        }

        if config.source == SourceKind::Network {
            self.fill(STREAM_FILL_SIZE)?;
        }

        if !self.ctx.tunables.frame_delay.is_zero() {
            std::thread::sleep(self.ctx.tunables.frame_delay);
        }

        if self.counters.decode_finished {
            return Ok(LoopState::Terminal(Termination::Finished));
        }

        Ok(LoopState::Dispatched)
    }

    /// Performs one transition of the state machine.
    pub fn step(&mut self, state: LoopState) -> Result<LoopState> {
        match state {
            LoopState::AwaitingSubmit => self.submit(),
            LoopState::Submitted => self.poll(),
            LoopState::AwaitingCompletion => self.collect(),
            LoopState::ResultReady(info) => self.handle_result(info),
            LoopState::Dispatched | LoopState::Skipped | LoopState::Retry => {
                Ok(LoopState::AwaitingSubmit)
            }
            LoopState::Terminal(termination) => Ok(LoopState::Terminal(termination)),
        }
    }

    /// Decodes frames until a terminal state is reached.
    pub fn run(&mut self) -> Result<Termination> {
        let mut state = LoopState::AwaitingSubmit;
        loop {
            state = self.step(state)?;
            if let LoopState::Terminal(termination) = state {
                return Ok(termination);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::success_flags;

    fn info(decoded: i32, display: i32, success: u32) -> OutputInfo {
        OutputInfo {
            index_decoded: decoded,
            index_display: display,
            decoding_success: success,
            ..Default::default()
        }
    }

    #[test]
    fn classification_priority() {
        // Incompleteness wins over everything else.
        let mut partial = info(0, 0, 0);
        partial.not_sufficient_ps_buffer = true;
        assert_eq!(classify(&partial).unwrap(), Classification::Partial);

        let mut rollback = info(-2, -3, 1 | success_flags::ROLLBACK);
        rollback.not_sufficient_slice_buffer = true;
        assert_eq!(classify(&rollback).unwrap(), Classification::Rollback);

        let mut overflow = info(0, 0, 1);
        overflow.not_sufficient_slice_buffer = true;
        assert!(matches!(
            classify(&overflow),
            Err(DecodeError::SliceBufferOverflow)
        ));
        overflow.not_sufficient_ps_buffer = true;
        assert!(matches!(
            classify(&overflow),
            Err(DecodeError::PsBufferOverflow)
        ));
    }

    #[test]
    fn display_classification() {
        assert_eq!(
            classify(&info(1, 0, 1)).unwrap(),
            Classification::Display(0)
        );
        assert_eq!(
            classify(&info(-1, -1, 1)).unwrap(),
            Classification::Finished
        );
        assert_eq!(
            classify(&info(2, -3, 1)).unwrap(),
            Classification::NoDisplay(-3)
        );
        assert_eq!(
            classify(&info(-2, -2, 1 | success_flags::SEQUENCE_CHANGED)).unwrap(),
            Classification::NoDisplay(-2)
        );
    }

    #[test]
    fn frame_rates() {
        let stats = DecodeStats {
            frames: 50,
            decode_time: Duration::from_secs(2),
            total_time: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(stats.decode_fps(), Some(25.0));
        assert_eq!(stats.total_fps(), Some(10.0));
        assert_eq!(DecodeStats::default().decode_fps(), None);
    }
}
