// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a simulated VPU whose only purpose is to let the decoder run without the
//! hardware, so it can be tested in isolation.
//!
//! The simulated decoder understands a trivial container produced by [`synthetic_stream`]: each
//! frame is a 4-byte magic, a little-endian payload length and the payload. It reads it from the
//! bitstream ring through a [`PhysicalBus`], paints every decoded frame with a recognizable
//! pattern and can be scripted to misbehave on given frames through [`FrameEvent`].

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::backend::success_flags;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::BitstreamPointers;
use crate::backend::BufferInfo;
use crate::backend::Command;
use crate::backend::DecodeParams;
use crate::backend::FrameBufferDesc;
use crate::backend::InitialInfo;
use crate::backend::OpenParams;
use crate::backend::OutputInfo;
use crate::backend::StartStatus;
use crate::backend::TiledPlane;
use crate::backend::VpuBackend;
use crate::backend::STREAM_END_SIZE;
use crate::codec::StreamFormat;
use crate::config::BitstreamMode;
use crate::memory::heap::PhysicalBus;
use crate::Resolution;

/// Marks the start of every frame of a synthetic stream.
pub const FRAME_MAGIC: [u8; 4] = *b"VPUF";
pub const FRAME_HEADER_SIZE: usize = 8;

/// Luma value the simulated decoder paints frame `n` with.
pub fn luma_pattern(n: u64) -> u8 {
    (n % 251) as u8 + 1
}

/// Chroma value the simulated decoder paints frame `n` with.
pub fn chroma_pattern(n: u64) -> u8 {
    0x80 ^ luma_pattern(n)
}

/// Builds a stream of `frames` frames of `payload_size` bytes each.
pub fn synthetic_stream(frames: usize, payload_size: usize) -> Vec<u8> {
    let mut stream = Vec::with_capacity(frames * (FRAME_HEADER_SIZE + payload_size));
    for i in 0..frames {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[..4].copy_from_slice(&FRAME_MAGIC);
        LittleEndian::write_u32(&mut header[4..], payload_size as u32);
        stream.extend_from_slice(&header);
        stream.extend(std::iter::repeat(i as u8).take(payload_size));
    }
    stream
}

/// Returns initial information describing a progressive stream of `width`x`height` pixels.
pub fn progressive_info(width: u32, height: u32, min_buffers: usize) -> InitialInfo {
    InitialInfo {
        pic_width: width,
        pic_height: height,
        min_frame_buffer_count: min_buffers,
        frame_rate_res: 30,
        frame_rate_div: 1,
        worst_slice_size: 64,
        stream_info_obtained: true,
        ..Default::default()
    }
}

/// Anomalies the simulated decoder can be told to report for a given frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// The frame is reported as not fully decoded and is not displayed.
    Incomplete { error_macroblocks: u32 },
    /// The frame is decoded with concealed macroblocks.
    Corrupted { error_macroblocks: u32 },
    /// The frame is reported as truncated once, and decoded normally when resubmitted.
    Rollback,
    PsBufferOverflow,
    SliceBufferOverflow,
    /// The frame is decoded but held back, and the display index reports `sentinel` instead.
    NoDisplay(i32),
    /// The decoded size changes to the given resolution from this frame on.
    ResolutionChange(Resolution),
    SequenceChanged,
    /// The decoder never becomes idle.
    Hang,
    /// Retrieving the result of the frame fails.
    OutputInfoFailure,
}

/// Record of the calls made to the simulated decoder.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    pub opened: usize,
    pub closed: usize,
    pub close_attempts: usize,
    pub commands: Vec<Command>,
    pub escape_sequence_init: Vec<bool>,
    pub registered: Vec<FrameBufferDesc>,
    pub decode_count: usize,
    pub buffer_info: BufferInfo,
    pub bitstream_updates: Vec<usize>,
    pub end_of_stream_markers: usize,
    pub submissions: usize,
    pub waits: usize,
    pub cleared: Vec<usize>,
    pub resets: usize,
}

#[derive(Default)]
struct RingModel {
    base: u64,
    size: usize,
    read: usize,
    fullness: usize,
    ended: bool,
}

impl RingModel {
    fn write(&self) -> usize {
        (self.read + self.fullness) % self.size.max(1)
    }

    fn space(&self) -> usize {
        self.size - self.fullness
    }

    fn peek(&self, bus: &PhysicalBus, offset: usize, dst: &mut [u8]) -> BackendResult<()> {
        let start = (self.read + offset) % self.size;
        let first = dst.len().min(self.size - start);
        bus.read(self.base + start as u64, &mut dst[..first])
            .context("reading bitstream ring")?;
        if first < dst.len() {
            bus.read(self.base, &mut dst[first..])
                .context("reading bitstream ring")?;
        }
        Ok(())
    }

    fn consume(&mut self, len: usize) {
        let len = len.min(self.fullness);
        self.read = (self.read + len) % self.size;
        self.fullness -= len;
    }
}

/// What the next frame in the ring looks like.
enum Pending {
    Frame(usize),
    Garbage,
    Starved,
}

/// A decoder instance emulated in software.
pub struct SimulatedVpu {
    bus: PhysicalBus,
    info: InitialInfo,
    events: BTreeMap<u64, FrameEvent>,
    start_statuses: VecDeque<StartStatus>,
    stalled_space_queries: usize,
    display_delay: usize,
    fail_registration: bool,
    fail_initial_info: bool,
    incomplete_closes: usize,

    journal: Journal,

    params: Option<OpenParams>,
    ring: RingModel,
    buffers: Vec<FrameBufferDesc>,
    decode_count: usize,
    held: Vec<bool>,
    display_queue: VecDeque<usize>,
    rotator_output: Option<FrameBufferDesc>,
    in_flight: Option<DecodeParams>,
    result: Option<BackendResult<OutputInfo>>,
    frames_decoded: u64,
    next_target: usize,
    resolution: Resolution,
}

impl SimulatedVpu {
    pub fn new(bus: PhysicalBus, info: InitialInfo) -> Self {
        let resolution = Resolution::new(info.pic_width, info.pic_height);
        Self {
            bus,
            info,
            events: Default::default(),
            start_statuses: Default::default(),
            stalled_space_queries: 0,
            display_delay: 0,
            fail_registration: false,
            fail_initial_info: false,
            incomplete_closes: 0,
            journal: Default::default(),
            params: None,
            ring: Default::default(),
            buffers: Default::default(),
            decode_count: 0,
            held: Default::default(),
            display_queue: Default::default(),
            rotator_output: None,
            in_flight: None,
            result: None,
            frames_decoded: 0,
            next_target: 0,
            resolution,
        }
    }

    /// Reports `event` when frame number `frame` (starting at zero) completes.
    pub fn with_event(mut self, frame: u64, event: FrameEvent) -> Self {
        self.events.insert(frame, event);
        self
    }

    /// Makes the next call to `start_one_frame` return `status` without starting anything.
    pub fn with_start_status(mut self, status: StartStatus) -> Self {
        self.start_statuses.push_back(status);
        self
    }

    /// Reports a full ring for the next `queries` calls to `bitstream_pointers`.
    pub fn with_stalled_space(mut self, queries: usize) -> Self {
        self.stalled_space_queries = queries;
        self
    }

    /// Number of decoded frames held back before display.
    pub fn with_display_delay(mut self, delay: usize) -> Self {
        self.display_delay = delay;
        self
    }

    pub fn with_failing_registration(mut self) -> Self {
        self.fail_registration = true;
        self
    }

    pub fn with_failing_initial_info(mut self) -> Self {
        self.fail_initial_info = true;
        self
    }

    /// Makes the next `count` calls to `close` report a frame still in flight.
    pub fn with_incomplete_closes(mut self, count: usize) -> Self {
        self.incomplete_closes = count;
        self
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn is_open(&self) -> bool {
        self.params.is_some()
    }

    /// Number of frames taken out of the bitstream so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Drops `len` bytes from the ring as if the decoder had consumed them.
    pub fn consume_bitstream(&mut self, len: usize) {
        self.ring.consume(len);
    }

    fn params(&self) -> BackendResult<&OpenParams> {
        self.params.as_ref().ok_or(BackendError::Failed {
            operation: "decoder access",
            code: -1,
        })
    }

    fn is_still_picture(&self) -> bool {
        self.params
            .as_ref()
            .map(|p| p.format == StreamFormat::Mjpg)
            .unwrap_or(false)
    }

    fn next_in_ring(&self) -> BackendResult<Pending> {
        if self.ring.fullness < FRAME_HEADER_SIZE {
            return Ok(Pending::Starved);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.ring.peek(&self.bus, 0, &mut header)?;
        if header[..4] != FRAME_MAGIC {
            return Ok(Pending::Garbage);
        }

        let len = FRAME_HEADER_SIZE + LittleEndian::read_u32(&header[4..]) as usize;
        if len > self.ring.fullness {
            Ok(Pending::Starved)
        } else {
            Ok(Pending::Frame(len))
        }
    }

    fn paint(&self, buffer: &FrameBufferDesc, frame: u64) -> BackendResult<()> {
        let luma_size = buffer.stride as usize * buffer.height as usize;
        let chroma_size = if buffer.cr > buffer.cb {
            2 * (buffer.cr - buffer.cb) as usize
        } else {
            luma_size / 2
        };

        self.bus
            .fill(buffer.y, luma_size, luma_pattern(frame))
            .context("painting luma")?;
        self.bus
            .fill(buffer.cb, chroma_size, chroma_pattern(frame))
            .context("painting chroma")?;
        Ok(())
    }

    fn free_target(&mut self) -> Option<usize> {
        (0..self.decode_count)
            .map(|i| (self.next_target + i) % self.decode_count)
            .find(|&i| !self.held[i])
    }

    /// Decodes one frame and returns what the decoder reports about it.
    fn decode(&mut self, frame_len: usize) -> BackendResult<OutputInfo> {
        let frame = self.frames_decoded;
        let event = self.events.get(&frame).copied();
        let mut info = OutputInfo {
            index_decoded: -2,
            index_display: -3,
            decoding_success: 1,
            ..Default::default()
        };

        match event {
            Some(FrameEvent::Rollback) => {
                self.events.remove(&frame);
                info.decoding_success |= success_flags::ROLLBACK;
                return Ok(info);
            }
            Some(FrameEvent::OutputInfoFailure) => {
                return Err(BackendError::Failed {
                    operation: "output_info",
                    code: -3,
                })
            }
            Some(FrameEvent::ResolutionChange(resolution)) => self.resolution = resolution,
            _ => (),
        }

        self.ring.consume(frame_len);
        self.frames_decoded += 1;
        info.decoded_width = self.resolution.width;
        info.decoded_height = self.resolution.height;

        match event {
            Some(FrameEvent::Incomplete { error_macroblocks }) => {
                info.decoding_success = 0;
                info.error_macroblocks = error_macroblocks;
                return Ok(info);
            }
            Some(FrameEvent::PsBufferOverflow) => info.not_sufficient_ps_buffer = true,
            Some(FrameEvent::SliceBufferOverflow) => info.not_sufficient_slice_buffer = true,
            Some(FrameEvent::SequenceChanged) => {
                info.decoding_success |= success_flags::SEQUENCE_CHANGED
            }
            Some(FrameEvent::Corrupted { error_macroblocks }) => {
                info.error_macroblocks = error_macroblocks
            }
            _ => (),
        }

        if self.is_still_picture() {
            // Pictures always go straight through the rotator.
            if let Some(rotator) = self.rotator_output {
                self.paint(&rotator, frame)?;
            }
            info.index_decoded = 0;
            info.index_display = 0;
            return Ok(info);
        }

        let Some(target) = self.free_target() else {
            log::warn!("simulated decoder has no free frame buffer");
            return Ok(info);
        };
        self.next_target = (target + 1) % self.decode_count;
        let buffer = self.buffers[target];
        self.paint(&buffer, frame)?;
        self.held[target] = true;
        self.display_queue.push_back(target);
        info.index_decoded = target as i32;

        if let Some(FrameEvent::NoDisplay(sentinel)) = event {
            info.index_display = sentinel;
            self.display_delay += 1;
            return Ok(info);
        }

        if self.display_queue.len() > self.display_delay {
            self.display(&mut info)?;
        }

        Ok(info)
    }

    fn display(&mut self, info: &mut OutputInfo) -> BackendResult<()> {
        if let Some(index) = self.display_queue.pop_front() {
            info.index_display = index as i32;
            if let Some(rotator) = self.rotator_output {
                // The rotator output carries the picture being displayed.
                let mut pixel = [0u8; 1];
                self.bus
                    .read(self.buffers[index].y, &mut pixel)
                    .context("reading displayed frame")?;
                let frame = u64::from(pixel[0].wrapping_sub(1));
                self.paint(&rotator, frame)?;
            }
        }
        Ok(())
    }

    /// Produces the result of the frame in flight if the decoder is able to finish it.
    fn try_complete(&mut self) -> BackendResult<bool> {
        let Some(params) = self.in_flight else {
            return Ok(false);
        };
        if self.result.is_some() {
            return Ok(true);
        }
        if self.events.get(&self.frames_decoded) == Some(&FrameEvent::Hang) {
            return Ok(false);
        }

        let result = if params.chunk.is_some() {
            self.decode(0)
        } else {
            match self.next_in_ring()? {
                Pending::Frame(len) => self.decode(len),
                Pending::Garbage => {
                    let len = self.ring.fullness;
                    self.ring.consume(len);
                    Ok(OutputInfo {
                        index_decoded: -2,
                        index_display: -3,
                        decoding_success: 0,
                        ..Default::default()
                    })
                }
                Pending::Starved if self.ring.ended => {
                    let mut info = OutputInfo {
                        index_decoded: -1,
                        index_display: -1,
                        decoding_success: 1,
                        ..Default::default()
                    };
                    if !self.display_queue.is_empty() {
                        self.display(&mut info)?;
                    }
                    Ok(info)
                }
                Pending::Starved if self.params()?.bitstream_mode == BitstreamMode::Rollback => {
                    Ok(OutputInfo {
                        index_decoded: -2,
                        index_display: -3,
                        decoding_success: 1 | success_flags::ROLLBACK,
                        ..Default::default()
                    })
                }
                Pending::Starved => return Ok(false),
            }
        };

        self.result = Some(result);
        Ok(true)
    }
}

impl VpuBackend for SimulatedVpu {
    fn open(&mut self, params: &OpenParams) -> BackendResult<()> {
        if self.params.is_some() {
            return Err(anyhow!("decoder instance already open").into());
        }

        self.ring = RingModel {
            base: params.bitstream_phys,
            size: params.bitstream_size,
            ..Default::default()
        };
        self.params = Some(params.clone());
        self.journal.opened += 1;
        Ok(())
    }

    fn close(&mut self) -> BackendResult<()> {
        self.params()?;
        self.journal.close_attempts += 1;
        if self.incomplete_closes > 0 {
            self.incomplete_closes -= 1;
            return Err(BackendError::FrameNotComplete);
        }
        if self.in_flight.is_some() {
            return Err(BackendError::FrameNotComplete);
        }

        self.params = None;
        self.buffers.clear();
        self.journal.closed += 1;
        Ok(())
    }

    fn set_escape_sequence_init(&mut self, enable: bool) {
        self.journal.escape_sequence_init.push(enable);
    }

    fn initial_info(&mut self) -> BackendResult<InitialInfo> {
        self.params()?;
        if self.fail_initial_info {
            return Err(BackendError::Failed {
                operation: "initial_info",
                code: -1,
            });
        }
        Ok(self.info.clone())
    }

    fn register_frame_buffers(
        &mut self,
        buffers: &[FrameBufferDesc],
        decode_count: usize,
        _stride: u32,
        info: &BufferInfo,
    ) -> BackendResult<()> {
        self.params()?;
        if self.fail_registration || decode_count == 0 || decode_count > buffers.len() {
            return Err(BackendError::Failed {
                operation: "register_frame_buffers",
                code: -2,
            });
        }

        self.buffers = buffers.to_vec();
        self.decode_count = decode_count;
        self.held = vec![false; decode_count];
        self.journal.registered = buffers.to_vec();
        self.journal.decode_count = decode_count;
        self.journal.buffer_info = *info;
        Ok(())
    }

    fn bitstream_pointers(&mut self) -> BackendResult<BitstreamPointers> {
        self.params()?;
        let space = if self.stalled_space_queries > 0 {
            self.stalled_space_queries -= 1;
            0
        } else {
            self.ring.space()
        };

        Ok(BitstreamPointers {
            read: self.ring.base + self.ring.read as u64,
            write: self.ring.base + self.ring.write() as u64,
            space,
        })
    }

    fn update_bitstream(&mut self, size: usize) -> BackendResult<()> {
        self.params()?;
        self.journal.bitstream_updates.push(size);
        if size == STREAM_END_SIZE {
            self.ring.ended = true;
            self.journal.end_of_stream_markers += 1;
            return Ok(());
        }
        if size > self.ring.space() {
            return Err(anyhow!(
                "bitstream update of {} bytes overruns the read pointer ({} bytes free)",
                size,
                self.ring.space()
            )
            .into());
        }

        // Data written after the end marker starts a new stream.
        self.ring.ended = false;
        self.ring.fullness += size;
        Ok(())
    }

    fn command(&mut self, command: Command) -> BackendResult<()> {
        self.params()?;
        if let Command::SetRotatorOutput(buffer) = command {
            self.rotator_output = Some(buffer);
        }
        self.journal.commands.push(command);
        Ok(())
    }

    fn start_one_frame(&mut self, params: &DecodeParams) -> BackendResult<StartStatus> {
        self.params()?;
        if let Some(status) = self.start_statuses.pop_front() {
            return Ok(status);
        }
        if self.in_flight.is_some() {
            return Err(anyhow!("a frame is already being decoded").into());
        }

        self.journal.submissions += 1;
        self.in_flight = Some(*params);
        Ok(StartStatus::Started)
    }

    fn is_busy(&mut self) -> bool {
        match self.try_complete() {
            Ok(done) => self.in_flight.is_some() && !done,
            Err(e) => {
                self.result = Some(Err(e));
                false
            }
        }
    }

    fn wait_for_interrupt(&mut self, _timeout: Duration) -> BackendResult<()> {
        self.journal.waits += 1;
        Ok(())
    }

    fn output_info(&mut self) -> BackendResult<OutputInfo> {
        if !self.try_complete()? {
            return Err(anyhow!("no frame has completed").into());
        }

        self.in_flight = None;
        self.result
            .take()
            .ok_or_else(|| anyhow!("no frame has completed"))?
    }

    fn clear_display_flag(&mut self, index: usize) -> BackendResult<()> {
        self.params()?;
        let held = self.held.get_mut(index).ok_or(BackendError::Failed {
            operation: "clear_display_flag",
            code: -4,
        })?;
        *held = false;
        self.journal.cleared.push(index);
        Ok(())
    }

    fn software_reset(&mut self) -> BackendResult<()> {
        self.journal.resets += 1;
        self.in_flight = None;
        self.result = None;
        Ok(())
    }

    fn tiled_address(&self, buffer: &FrameBufferDesc, plane: TiledPlane, x: u32, y: u32) -> u64 {
        // Simulated tiled buffers are laid out linearly.
        let base = match plane {
            TiledPlane::Luma => buffer.y,
            TiledPlane::Chroma => buffer.cb,
        };
        base + y as u64 * buffer.stride as u64 + x as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::heap::HeapAllocator;
    use crate::memory::DmaAllocator;
    use crate::MapType;

    fn open_params(phys: u64, size: usize) -> OpenParams {
        OpenParams {
            format: StreamFormat::Avc,
            bitstream_phys: phys,
            bitstream_size: size,
            reorder: true,
            deblocking: false,
            chroma_interleave: false,
            map_type: MapType::Linear,
            tiled_to_linear: false,
            bitstream_mode: BitstreamMode::Normal,
            jpeg_line_buffer: false,
            ps_save_buffer: None,
        }
    }

    #[test]
    fn synthetic_stream_layout() {
        let stream = synthetic_stream(2, 3);
        assert_eq!(stream.len(), 2 * (FRAME_HEADER_SIZE + 3));
        assert_eq!(&stream[..4], b"VPUF");
        assert_eq!(&stream[4..8], &[3, 0, 0, 0]);
        assert_eq!(&stream[8..11], &[0, 0, 0]);
        assert_eq!(&stream[19..22], &[1, 1, 1]);
    }

    #[test]
    fn decodes_frames_written_to_the_ring() {
        let allocator = HeapAllocator::default();
        let mut ring = allocator.allocate(4096).unwrap();
        let frames = [
            allocator.allocate(64 * 48).unwrap(),
            allocator.allocate(64 * 48).unwrap(),
        ];
        let mut vpu = SimulatedVpu::new(allocator.bus().clone(), progressive_info(64, 32, 1));
        vpu.open(&open_params(ring.phys_addr(), ring.size())).unwrap();

        let descs: Vec<_> = frames
            .iter()
            .map(|f| FrameBufferDesc {
                y: f.phys_addr(),
                cb: f.phys_addr() + 64 * 32,
                cr: f.phys_addr() + 64 * 40,
                mv_col: 0,
                stride: 64,
                height: 32,
            })
            .collect();
        vpu.register_frame_buffers(&descs, 2, 64, &Default::default())
            .unwrap();

        let stream = synthetic_stream(1, 100);
        ring.write_at(0, &stream).unwrap();
        vpu.update_bitstream(stream.len()).unwrap();

        assert_eq!(
            vpu.start_one_frame(&Default::default()).unwrap(),
            StartStatus::Started
        );
        assert!(!vpu.is_busy());
        let info = vpu.output_info().unwrap();
        assert_eq!(info.index_decoded, 0);
        assert_eq!(info.index_display, 0);
        assert_eq!(frames[0].map()[0], luma_pattern(0));
        assert_eq!(frames[0].map()[64 * 32], chroma_pattern(0));

        // Nothing left: the decoder waits for more bitstream until the end is signalled.
        vpu.start_one_frame(&Default::default()).unwrap();
        assert!(vpu.is_busy());
        vpu.update_bitstream(STREAM_END_SIZE).unwrap();
        assert!(!vpu.is_busy());
        assert_eq!(vpu.output_info().unwrap().index_display, -1);
    }

    #[test]
    fn overrunning_the_ring_is_an_error() {
        let allocator = HeapAllocator::default();
        let ring = allocator.allocate(1024).unwrap();
        let mut vpu = SimulatedVpu::new(allocator.bus().clone(), progressive_info(16, 16, 1));
        vpu.open(&open_params(ring.phys_addr(), ring.size())).unwrap();
        vpu.update_bitstream(1000).unwrap();
        assert_eq!(vpu.bitstream_pointers().unwrap().space, 24);
        assert!(vpu.update_bitstream(25).is_err());
        vpu.consume_bitstream(500);
        let pointers = vpu.bitstream_pointers().unwrap();
        assert_eq!(pointers.space, 524);
        assert_eq!(pointers.read, ring.phys_addr() + 500);
        assert_eq!(pointers.write, ring.phys_addr() + 1000);
    }

    #[test]
    fn close_reports_frames_in_flight() {
        let allocator = HeapAllocator::default();
        let ring = allocator.allocate(1024).unwrap();
        let mut vpu = SimulatedVpu::new(allocator.bus().clone(), progressive_info(16, 16, 1));
        vpu.open(&open_params(ring.phys_addr(), ring.size())).unwrap();
        vpu.start_one_frame(&Default::default()).unwrap();
        assert!(matches!(vpu.close(), Err(BackendError::FrameNotComplete)));
        vpu.software_reset().unwrap();
        vpu.close().unwrap();
        assert!(!vpu.is_open());
    }
}
