// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lifecycle of a decoding session.
//!
//! A session moves through the following states:
//!
//! ```text
//! Uninitialized -> Opened -> GeometryParsed -> BuffersAllocated <-> Decoding
//!                    ^                               |
//!                    +-------- restart() ------------+
//! ```
//!
//! and ends up `Closed` either through [`Session::close`], when dropped, or after any fatal error.
//! Resources are acquired in this order: bitstream ring, parameter-set save area, decoder
//! instance, auxiliary working areas, frame buffers. They are released in the reverse order.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;

use crate::backend::BackendError;
use crate::backend::BufferInfo;
use crate::backend::Command;
use crate::backend::OpenParams;
use crate::backend::VpuBackend;
use crate::bitstream_utils::BitstreamSource;
use crate::codec::descriptor;
use crate::config::DecoderConfig;
use crate::config::SourceKind;
use crate::config::Tunables;
use crate::decoder::decode_loop::DecodeLoop;
use crate::decoder::decode_loop::DecodeStats;
use crate::decoder::decode_loop::LoopContext;
use crate::decoder::decode_loop::Termination;
use crate::decoder::decode_loop::USER_DATA_BUFFER_SIZE;
use crate::decoder::negotiate::negotiate;
use crate::decoder::negotiate::StreamInfo;
use crate::decoder::output::Dispatcher;
use crate::decoder::output::OutputSink;
use crate::decoder::pool::FrameBufferPool;
use crate::decoder::pool::PoolOptions;
use crate::decoder::report::DiagnosticReports;
use crate::decoder::ring::BitstreamRing;
use crate::decoder::ring::ChunkFeeder;
use crate::decoder::ring::NETWORK_FIRST_FILL_SIZE;
use crate::decoder::ring::STREAM_BUF_SIZE;
use crate::decoder::DecodeError;
use crate::decoder::Result;
use crate::memory::DmaAllocator;
use crate::memory::DmaBuffer;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// The decoder instance is open and the ring holds the start of the stream.
    Opened,
    GeometryParsed,
    BuffersAllocated,
    Decoding,
    Closed,
}

impl SessionState {
    /// Whether the decoder instance is open in this state.
    fn has_instance(self) -> bool {
        !matches!(self, SessionState::Uninitialized | SessionState::Closed)
    }
}

/// Working areas some formats need on top of the frame buffers.
#[derive(Default)]
struct AuxBuffers {
    slice: Option<DmaBuffer>,
    macroblock: Option<DmaBuffer>,
}

impl AuxBuffers {
    fn info(&self) -> BufferInfo {
        let region = |b: &DmaBuffer| (b.phys_addr(), b.size());
        BufferInfo {
            slice_buffer: self.slice.as_ref().map(region),
            macroblock_buffer: self.macroblock.as_ref().map(region),
            ..Default::default()
        }
    }
}

/// A decoding session on backend `B`.
pub struct Session<B: VpuBackend> {
    backend: B,
    allocator: Arc<dyn DmaAllocator>,
    config: DecoderConfig,
    tunables: Tunables,
    state: SessionState,
    dispatcher: Dispatcher,
    quit: Arc<AtomicBool>,
    stats: DecodeStats,

    ring: Option<BitstreamRing>,
    ps_save: Option<DmaBuffer>,
    source: Option<Box<dyn BitstreamSource>>,
    chunks: Option<ChunkFeeder>,
    reports: Option<DiagnosticReports>,
    stream: Option<StreamInfo>,
    aux: AuxBuffers,
    pool: Option<FrameBufferPool>,
}

impl<B: VpuBackend> Session<B> {
    /// Creates a session decoding with `backend` into memory obtained from `allocator`, and
    /// handing pictures to `sink`. Tunables are read from the environment.
    pub fn new(
        backend: B,
        allocator: Arc<dyn DmaAllocator>,
        config: DecoderConfig,
        sink: Box<dyn OutputSink>,
    ) -> Self {
        let config = config.normalized();
        let dispatcher = Dispatcher::new(&config, sink);

        Self {
            backend,
            allocator,
            config,
            tunables: Tunables::from_env(),
            state: SessionState::Uninitialized,
            dispatcher,
            quit: Default::default(),
            stats: Default::default(),
            ring: None,
            ps_save: None,
            source: None,
            chunks: None,
            reports: None,
            stream: None,
            aux: Default::default(),
            pool: None,
        }
    }

    /// Replaces the tunables read from the environment.
    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Statistics of every run so far, including an aborted one.
    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream.as_ref()
    }

    /// Flag stopping the current run after the frame being decoded when raised.
    pub fn quit_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.quit)
    }

    fn expect_state(&self, operation: &'static str, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(DecodeError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Runs `f`, tearing the whole session down if it fails.
    fn or_abort<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let result = f(self);
        if let Err(e) = &result {
            log::error!("aborting decoding session: {}", e);
            if let Err(e) = self.teardown() {
                log::error!("failed to tear down session: {}", e);
            }
        }
        result
    }

    /// Opens the decoder instance and loads the start of `source` into the bitstream ring.
    pub fn open(&mut self, source: Box<dyn BitstreamSource>) -> Result<()> {
        self.expect_state("open", SessionState::Uninitialized)?;
        let codec = descriptor(self.config.format);

        let ring = BitstreamRing::new(self.allocator.allocate(STREAM_BUF_SIZE)?);
        let ps_save = codec
            .ps_save_buffer_size()
            .map(|size| self.allocator.allocate(size))
            .transpose()?;

        let config = &self.config;
        let params = OpenParams {
            format: config.format,
            bitstream_phys: ring.phys_addr(),
            bitstream_size: ring.size(),
            reorder: config.reorder,
            deblocking: config.deblocking,
            chroma_interleave: config.chroma_interleave,
            map_type: config.map_type,
            tiled_to_linear: config.tiled_to_linear,
            bitstream_mode: config.bitstream_mode,
            jpeg_line_buffer: config.jpeg_line_buffer,
            ps_save_buffer: ps_save.as_ref().map(|b| (b.phys_addr(), b.size())),
        };
        self.backend.open(&params)?;
        log::info!("opened {} decoder", codec.name());

        self.ring = Some(ring);
        self.ps_save = ps_save;
        self.state = SessionState::Opened;
        if config.reports.any_enabled() {
            self.reports = Some(DiagnosticReports::new(config.reports.clone()));
        }

        self.or_abort(|s| {
            if s.config.reports.user_data && codec.has_user_data() {
                s.backend
                    .command(Command::SetReportUserData(USER_DATA_BUFFER_SIZE))?;
            }
            s.load_stream(source)
        })
    }

    /// Makes `source` the bitstream of the session and hands its first bytes to the decoder.
    fn load_stream(&mut self, source: Box<dyn BitstreamSource>) -> Result<()> {
        let ring = self
            .ring
            .as_mut()
            .ok_or_else(|| anyhow!("no bitstream ring"))?;
        let source = self.source.insert(source);

        if self.config.jpeg_line_buffer {
            let mut chunks = ChunkFeeder::new();
            let len = chunks.prime(ring, &mut **source)?;
            log::debug!("first picture is {} bytes", len);
            self.chunks = Some(chunks);
        } else {
            let min_chunk = match self.config.source {
                SourceKind::Network => NETWORK_FIRST_FILL_SIZE,
                SourceKind::File => 0,
            };
            let outcome = ring.fill(&mut self.backend, &mut **source, min_chunk)?;
            log::debug!("initial fill: {:?}", outcome);
        }

        Ok(())
    }

    /// Has the decoder parse the sequence header.
    pub fn parse(&mut self) -> Result<&StreamInfo> {
        self.expect_state("parse", SessionState::Opened)?;

        let stream = self.or_abort(|s| {
            Ok(negotiate(
                &mut s.backend,
                s.config.format,
                s.tunables.extended_buffer_count,
                s.config.jpeg_scale_down,
            )?)
        })?;
        self.state = SessionState::GeometryParsed;
        Ok(&*self.stream.insert(stream))
    }

    /// Allocates and registers the frame buffers and programs the post-processing path.
    pub fn allocate(&mut self) -> Result<()> {
        self.expect_state("allocate", SessionState::GeometryParsed)?;
        self.or_abort(Self::allocate_buffers)?;
        self.state = SessionState::BuffersAllocated;
        Ok(())
    }

    fn allocate_buffers(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| anyhow!("stream geometry is unknown"))?;
        let config = &self.config;
        let codec = descriptor(config.format);

        if stream.slice_buffer_size > 0 {
            self.aux.slice = Some(self.allocator.allocate(stream.slice_buffer_size)?);
        }
        if let Some(size) = codec.macroblock_buffer_size(stream.coded_resolution) {
            self.aux.macroblock = Some(self.allocator.allocate(size)?);
        }

        let options = PoolOptions {
            map_type: config.map_type,
            tiled_to_linear: config.tiled_to_linear,
            post_processing: config.post_processing(),
            deblocking: config.deblocking,
        };
        let pool = FrameBufferPool::allocate(
            &mut self.backend,
            &*self.allocator,
            stream,
            &options,
            &self.aux.info(),
        )?;

        if let Some(index) = pool.layout().deblock_index() {
            if let Some(buffer) = pool.get(index) {
                self.backend
                    .command(Command::SetDeblockOutput(*buffer.desc()))?;
            }
        }

        // Still pictures always go through the rotator.
        if config.post_processing() || codec.is_still_picture() {
            let angle = if config.rotation_enabled {
                config.rotation.hardware_angle()
            } else {
                0
            };
            self.backend.command(Command::SetRotationAngle(angle))?;
            self.backend
                .command(Command::SetMirrorDirection(config.mirror.to_raw()))?;
            let stride = if config.rotation_enabled && config.rotation.is_transposing() {
                stream.coded_resolution.height
            } else {
                stream.stride
            };
            self.backend.command(Command::SetRotatorStride(stride))?;
        }

        let sizes = stream.report_buffer_sizes;
        if config.reports.frame_buffer_status {
            self.backend
                .command(Command::SetReportFrameBufferStatus(sizes.frame_buffer_status))?;
        }
        if config.reports.macroblock_info {
            self.backend
                .command(Command::SetReportMacroblockInfo(sizes.macroblock_info))?;
        }
        if config.reports.motion_vectors {
            self.backend
                .command(Command::SetReportMotionVectors(sizes.motion_vectors))?;
        }

        self.dispatcher.prepare(stream);
        self.pool = Some(pool);
        Ok(())
    }

    /// Decodes frames until the stream ends, the frame limit is reached or the quit flag is
    /// raised. The session can be run again afterwards.
    pub fn run(&mut self) -> Result<Termination> {
        self.expect_state("run", SessionState::BuffersAllocated)?;
        self.state = SessionState::Decoding;

        let termination = self.or_abort(|s| {
            let start = Instant::now();
            let result = s.decode();
            s.stats.total_time += start.elapsed();
            let termination = result?;
            s.dispatcher.finish()?;
            Ok(termination)
        })?;

        let stats = &self.stats;
        log::info!(
            "{} frames decoded ({} with errors), decode fps {:.2}, total fps {:.2}",
            stats.frames,
            stats.anomalies(),
            stats.decode_fps().unwrap_or_default(),
            stats.total_fps().unwrap_or_default()
        );

        self.state = SessionState::BuffersAllocated;
        Ok(termination)
    }

    fn decode(&mut self) -> Result<Termination> {
        let (Some(ring), Some(source), Some(pool), Some(stream)) = (
            self.ring.as_mut(),
            self.source.as_mut(),
            self.pool.as_mut(),
            self.stream.as_ref(),
        ) else {
            return Err(anyhow!("session resources are missing").into());
        };

        let ctx = LoopContext {
            backend: &mut self.backend,
            ring,
            source: &mut **source,
            chunks: self.chunks.as_mut(),
            pool,
            dispatcher: &mut self.dispatcher,
            reports: self.reports.as_mut(),
            stream,
            config: &self.config,
            tunables: &self.tunables,
            quit: &self.quit,
        };
        DecodeLoop::new(ctx, &mut self.stats).run()
    }

    /// Releases the frame buffers and switches to `source`, keeping the decoder instance open.
    /// The new stream has to be parsed and buffers allocated again before running.
    pub fn restart(&mut self, source: Box<dyn BitstreamSource>) -> Result<()> {
        self.expect_state("restart", SessionState::BuffersAllocated)?;

        self.pool = None;
        self.aux = Default::default();
        self.stream = None;
        self.chunks = None;
        self.source = None;
        if let Some(ring) = self.ring.as_mut() {
            ring.rearm();
        }
        self.state = SessionState::Opened;

        self.or_abort(|s| s.load_stream(source))
    }

    fn teardown(&mut self) -> Result<()> {
        self.pool = None;
        self.aux = Default::default();

        let mut result = Ok(());
        if self.state.has_instance() {
            result = match self.backend.close() {
                Err(BackendError::FrameNotComplete) => {
                    log::warn!("frame still in flight at close, resetting the decoder");
                    if let Err(e) = self.backend.software_reset() {
                        log::error!("software reset failed: {}", e);
                    }
                    self.backend.close()
                }
                r => r,
            };
        }

        self.ps_save = None;
        self.chunks = None;
        self.source = None;
        self.ring = None;
        self.stream = None;
        if let Some(mut reports) = self.reports.take() {
            if let Err(e) = reports.close() {
                log::error!("failed to close diagnostic reports: {}", e);
            }
        }
        self.state = SessionState::Closed;

        result.map_err(DecodeError::from)
    }

    /// Closes the decoder instance and releases every buffer. Closing twice is harmless.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed => Ok(()),
            _ => self.teardown(),
        }
    }
}

impl<B: VpuBackend> Drop for Session<B> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("failed to close decoding session: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::backend::dummy::luma_pattern;
    use crate::backend::dummy::progressive_info;
    use crate::backend::dummy::synthetic_stream;
    use crate::backend::dummy::FrameEvent;
    use crate::backend::dummy::SimulatedVpu;
    use crate::backend::InitialInfo;
    use crate::codec::StreamFormat;
    use crate::decoder::decode_loop::HANG_POLL_LIMIT;
    use crate::decoder::output::BufferSink;
    use crate::memory::heap::HeapAllocator;
    use crate::MirrorDirection;
    use crate::Rect;
    use crate::Rotation;

    fn session(
        config: DecoderConfig,
        info: InitialInfo,
        vpu: impl FnOnce(SimulatedVpu) -> SimulatedVpu,
    ) -> (Session<SimulatedVpu>, BufferSink) {
        let allocator = HeapAllocator::default();
        let vpu = vpu(SimulatedVpu::new(allocator.bus().clone(), info));
        let sink = BufferSink::new();
        let session = Session::new(vpu, Arc::new(allocator), config, Box::new(sink.clone()))
            .with_tunables(Tunables::default());
        (session, sink)
    }

    fn start(session: &mut Session<SimulatedVpu>, stream: Vec<u8>) {
        session.open(Box::new(Cursor::new(stream))).unwrap();
        session.parse().unwrap();
        session.allocate().unwrap();
    }

    #[test]
    fn frame_limit() {
        let mut config = DecoderConfig::new(StreamFormat::Avc);
        config.frame_count = 10;
        let (mut session, sink) = session(config, progressive_info(64, 48, 2), |v| v);
        start(&mut session, synthetic_stream(12, 64));

        assert_eq!(session.run().unwrap(), Termination::FrameLimit);
        assert_eq!(sink.len(), 10);
        for (n, frame) in sink.frames().iter().enumerate() {
            assert_eq!(frame.len(), 64 * 48 * 3 / 2);
            assert_eq!(frame[0], luma_pattern(n as u64));
        }
        assert_eq!(session.stats().frames, 10);
        assert_eq!(session.stats().anomalies(), 0);

        session.close().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.backend().journal().closed, 1);
    }

    #[test]
    fn full_ring_is_retried() {
        let (mut session, sink) = session(
            DecoderConfig::new(StreamFormat::Mpeg2),
            progressive_info(64, 48, 2),
            |v| v.with_stalled_space(1),
        );
        start(&mut session, synthetic_stream(3, 64));
        // Nothing could be loaded when opening.
        assert!(session.backend().journal().bitstream_updates.is_empty());

        assert_eq!(session.run().unwrap(), Termination::Finished);
        assert_eq!(sink.len(), 3);
        assert_eq!(session.backend().journal().end_of_stream_markers, 1);
    }

    #[test]
    fn hang_resets_once_and_aborts() {
        let (mut session, sink) = session(
            DecoderConfig::new(StreamFormat::Mpeg2),
            progressive_info(64, 48, 2),
            |v| v.with_event(3, FrameEvent::Hang),
        );
        start(&mut session, synthetic_stream(10, 64));

        assert!(matches!(
            session.run(),
            Err(DecodeError::Hang {
                polls: HANG_POLL_LIMIT
            })
        ));
        let journal = session.backend().journal();
        assert_eq!(journal.resets, 1);
        assert_eq!(journal.closed, 1);
        assert_eq!(session.state(), SessionState::Closed);
        // What was done before the hang is still known.
        assert_eq!(session.stats().frames, 3);
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn rotated_and_mirrored_crop() {
        let mut config = DecoderConfig::new(StreamFormat::Mpeg2);
        config.rotation_enabled = true;
        config.rotation = Rotation::Rotate90;
        config.mirror = MirrorDirection::Horizontal;
        let mut info = progressive_info(64, 48, 2);
        info.crop = Rect::new(2, 4, 60, 44);
        let (mut session, sink) = session(config, info, |v| v);
        start(&mut session, synthetic_stream(4, 64));

        assert_eq!(session.run().unwrap(), Termination::Finished);
        let last = session.stats().last_dispatch.unwrap();
        assert_eq!(last.crop, Rect::new(4, 2, 44, 60));
        let geometry = sink.geometry().unwrap();
        assert_eq!((geometry.width, geometry.height), (40, 58));

        let commands = &session.backend().journal().commands;
        assert!(commands.contains(&Command::SetRotationAngle(270)));
        assert!(commands.contains(&Command::SetMirrorDirection(2)));
        assert!(commands.contains(&Command::SetRotatorStride(48)));
        let enables = commands
            .iter()
            .filter(|c| **c == Command::EnableRotation)
            .count();
        assert_eq!(enables, 1);
        // The first picture is held back one frame, then every one of them is shown.
        assert_eq!(sink.len(), 4);
    }

    #[test]
    fn buffers_are_released_one_frame_late() {
        let (mut session, _sink) = session(
            DecoderConfig::new(StreamFormat::Mpeg2),
            progressive_info(64, 48, 2),
            |v| v,
        );
        start(&mut session, synthetic_stream(5, 64));

        assert_eq!(session.run().unwrap(), Termination::Finished);
        // Pictures were shown from buffers 0, 1, 2, 3 and 0 again.
        assert_eq!(session.backend().journal().cleared, vec![0, 1, 2, 3]);
        assert_eq!(session.stats().last_dispatch.unwrap().index, 0);
    }

    #[test]
    fn recoverable_anomalies_are_counted() {
        let (mut session, sink) = session(
            DecoderConfig::new(StreamFormat::Mpeg2),
            progressive_info(64, 48, 2),
            |v| {
                v.with_event(
                    1,
                    FrameEvent::Incomplete {
                        error_macroblocks: 7,
                    },
                )
                .with_event(2, FrameEvent::Corrupted {
                    error_macroblocks: 3,
                })
                .with_event(3, FrameEvent::ResolutionChange(crate::Resolution::new(32, 48)))
            },
        );
        start(&mut session, synthetic_stream(5, 64));

        assert_eq!(session.run().unwrap(), Termination::Finished);
        let stats = session.stats();
        assert_eq!(stats.partial, 1);
        assert_eq!(stats.error_macroblocks, 10);
        assert_eq!(stats.resolution_changes, 1);
        assert_eq!(stats.decoded, 4);
        assert_eq!(sink.len(), 4);
    }

    #[test]
    fn buffer_overflow_is_fatal() {
        let (mut session, _sink) = session(
            DecoderConfig::new(StreamFormat::Avc),
            progressive_info(64, 48, 2),
            |v| v.with_event(0, FrameEvent::SliceBufferOverflow),
        );
        start(&mut session, synthetic_stream(2, 64));

        assert!(matches!(
            session.run(),
            Err(DecodeError::SliceBufferOverflow)
        ));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.backend().journal().resets, 0);
    }

    #[test]
    fn quit_stops_before_output() {
        let (mut session, sink) = session(
            DecoderConfig::new(StreamFormat::Mpeg2),
            progressive_info(64, 48, 2),
            |v| v,
        );
        start(&mut session, synthetic_stream(3, 64));

        session.quit_handle().store(true, Ordering::Relaxed);
        assert_eq!(session.run().unwrap(), Termination::Quit);
        assert!(sink.is_empty());
    }

    #[test]
    fn restart_keeps_the_instance() {
        let (mut session, sink) = session(
            DecoderConfig::new(StreamFormat::Mpeg2),
            progressive_info(64, 48, 2),
            |v| v,
        );
        start(&mut session, synthetic_stream(3, 64));
        assert_eq!(session.run().unwrap(), Termination::Finished);

        session
            .restart(Box::new(Cursor::new(synthetic_stream(2, 64))))
            .unwrap();
        assert_eq!(session.state(), SessionState::Opened);
        session.parse().unwrap();
        session.allocate().unwrap();
        assert_eq!(session.run().unwrap(), Termination::Finished);

        assert_eq!(sink.len(), 5);
        assert_eq!(session.stats().frames, 5);
        let journal = session.backend().journal();
        assert_eq!(journal.opened, 1);
        assert_eq!(journal.end_of_stream_markers, 2);
    }

    #[test]
    fn transitions_are_checked() {
        let (mut session, _sink) = session(
            DecoderConfig::new(StreamFormat::Mpeg2),
            progressive_info(64, 48, 2),
            |v| v,
        );
        assert!(matches!(
            session.run(),
            Err(DecodeError::InvalidState {
                operation: "run",
                state: SessionState::Uninitialized,
            })
        ));

        session
            .open(Box::new(Cursor::new(synthetic_stream(1, 64))))
            .unwrap();
        assert!(matches!(
            session.allocate(),
            Err(DecodeError::InvalidState {
                state: SessionState::Opened,
                ..
            })
        ));
        // A rejected transition leaves the session usable.
        assert_eq!(session.state(), SessionState::Opened);
        session.parse().unwrap();
        assert_eq!(session.state(), SessionState::GeometryParsed);
    }

    #[test]
    fn failed_negotiation_tears_down() {
        let (mut session, _sink) = session(
            DecoderConfig::new(StreamFormat::Avc),
            progressive_info(64, 48, 2),
            |v| v.with_failing_initial_info(),
        );
        session
            .open(Box::new(Cursor::new(synthetic_stream(1, 64))))
            .unwrap();

        assert!(matches!(session.parse(), Err(DecodeError::Negotiate(_))));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.backend().journal().closed, 1);
        assert!(!session.backend().is_open());
    }

    #[test]
    fn busy_close_resets_and_retries() {
        let (mut session, _sink) = session(
            DecoderConfig::new(StreamFormat::Mpeg2),
            progressive_info(64, 48, 2),
            |v| v.with_incomplete_closes(1),
        );
        start(&mut session, synthetic_stream(1, 64));

        session.close().unwrap();
        let journal = session.backend().journal();
        assert_eq!(journal.close_attempts, 2);
        assert_eq!(journal.resets, 1);
        assert_eq!(journal.closed, 1);
        session.close().unwrap();
        assert_eq!(session.backend().journal().close_attempts, 2);
    }

    #[test]
    fn jpeg_pictures_one_at_a_time() {
        let mut config = DecoderConfig::new(StreamFormat::Mjpg);
        config.jpeg_line_buffer = true;
        let (mut session, sink) = session(config, progressive_info(32, 16, 1), |v| v);
        let picture = [0xff, 0xd8, 1, 2, 3, 0xff, 0xd9];
        start(&mut session, picture.repeat(3));

        assert_eq!(session.run().unwrap(), Termination::EndOfStream);
        assert_eq!(sink.len(), 3);
        assert_eq!(session.backend().journal().submissions, 3);

        let commands = &session.backend().journal().commands;
        assert!(commands.contains(&Command::SetRotationAngle(0)));
        assert!(commands.contains(&Command::SetMirrorDirection(0)));
        assert!(commands.contains(&Command::SetRotatorStride(32)));
    }

    #[test]
    fn deringing_programs_an_unrotated_rotator() {
        let mut config = DecoderConfig::new(StreamFormat::Mpeg2);
        config.deringing = true;
        config.mirror = MirrorDirection::Vertical;
        let (mut session, _sink) = session(config, progressive_info(64, 48, 2), |v| v);
        start(&mut session, synthetic_stream(2, 64));
        session.run().unwrap();

        let commands = &session.backend().journal().commands;
        assert!(commands.contains(&Command::SetRotationAngle(0)));
        assert!(commands.contains(&Command::SetMirrorDirection(1)));
        assert!(commands.contains(&Command::SetRotatorStride(64)));
    }
}
