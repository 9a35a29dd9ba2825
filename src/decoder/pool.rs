// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Frame buffers shared with the decoder.
//!
//! The pool is laid out as follows:
//!
//! ```text
//! | decoding targets | post-processing outputs | deblocking output |
//! 0                  decode_count
//! ```
//!
//! Decoding targets are registered with the decoder, which picks among them for every frame.
//! Post-processing outputs receive the rotated, mirrored, deringed or detiled pictures and are
//! used round-robin. They are never handed back to the decoder as decoding targets.

use std::collections::BTreeSet;
use std::ops::Range;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::BufferInfo;
use crate::backend::Command;
use crate::backend::FrameBufferDesc;
use crate::backend::VpuBackend;
use crate::codec::descriptor;
use crate::codec::JpegSourceFormat;
use crate::codec::StreamFormat;
use crate::decoder::negotiate::StreamInfo;
use crate::memory::DmaAllocator;
use crate::memory::DmaBuffer;
use crate::memory::MemoryError;
use crate::utils::align_up;
use crate::MapType;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to allocate frame buffer {index}: {source}")]
    Allocation { index: usize, source: MemoryError },
    #[error("failed to register frame buffers: {0}")]
    Registration(#[source] BackendError),
    #[error("buffer {0} is not a decoding target")]
    NotADecodeTarget(usize),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Options affecting the composition of the pool.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolOptions {
    pub map_type: MapType,
    pub tiled_to_linear: bool,
    /// Rotation, mirroring, deringing or detiling is performed on decoded pictures.
    pub post_processing: bool,
    pub deblocking: bool,
}

/// Number and role of the buffers in a pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PoolLayout {
    pub decode_count: usize,
    pub post_processing_count: usize,
    pub deblocking: bool,
}

impl PoolLayout {
    /// Computes the layout for `buffer_count` decoding targets out of which the decoder needs at
    /// least `min_count`.
    pub fn new(buffer_count: usize, min_count: usize, options: &PoolOptions) -> Self {
        let post_processing_count = if options.post_processing {
            buffer_count.saturating_sub(min_count) + 1
        } else {
            0
        };

        Self {
            decode_count: buffer_count,
            post_processing_count,
            deblocking: options.deblocking,
        }
    }

    pub fn total(&self) -> usize {
        self.decode_count + self.post_processing_count + usize::from(self.deblocking)
    }

    pub fn post_processing_range(&self) -> Range<usize> {
        self.decode_count..self.decode_count + self.post_processing_count
    }

    pub fn deblock_index(&self) -> Option<usize> {
        self.deblocking
            .then_some(self.decode_count + self.post_processing_count)
    }
}

/// A frame buffer and the addresses of its planes.
pub struct FrameBuffer {
    memory: DmaBuffer,
    desc: FrameBufferDesc,
    tiled: bool,
}

impl FrameBuffer {
    fn allocate(
        allocator: &dyn DmaAllocator,
        stride: u32,
        height: u32,
        tiled: bool,
        jpeg_format: Option<JpegSourceFormat>,
        mv_col: bool,
    ) -> Result<Self, MemoryError> {
        // Tiled buffers are made of 32-line high luma tiles.
        let height = if tiled {
            align_up(height as usize, 32) as u32
        } else {
            height
        };
        let luma_size = stride as usize * height as usize;
        let chroma_size = match jpeg_format {
            Some(format) => format.chroma_size(luma_size),
            None => luma_size / 4,
        };
        let mv_col_size = if mv_col { luma_size / 4 } else { 0 };

        let memory = allocator.allocate(luma_size + 2 * chroma_size + mv_col_size)?;
        let y = memory.phys_addr();
        let cb = y + luma_size as u64;
        let cr = cb + chroma_size as u64;
        let desc = FrameBufferDesc {
            y,
            cb,
            cr,
            mv_col: if mv_col { cr + chroma_size as u64 } else { 0 },
            stride,
            height,
        };

        Ok(Self {
            memory,
            desc,
            tiled,
        })
    }

    pub fn desc(&self) -> &FrameBufferDesc {
        &self.desc
    }

    pub fn is_tiled(&self) -> bool {
        self.tiled
    }

    pub fn memory(&self) -> &DmaBuffer {
        &self.memory
    }
}

/// Frame buffers of a decoding session, registered with the decoder.
pub struct FrameBufferPool {
    buffers: Vec<FrameBuffer>,
    layout: PoolLayout,
    still_picture: bool,
    next_post_processing: usize,
    /// Decoding targets whose picture has been output but not yet given back to the decoder.
    held: BTreeSet<usize>,
}

impl FrameBufferPool {
    /// Allocates the frame buffers for `stream` and registers them with the decoder.
    ///
    /// # Arguments
    ///
    /// * `backend` - decoder to register the buffers with.
    /// * `allocator` - source of contiguous memory for the buffers.
    /// * `stream` - negotiated stream geometry and buffer count.
    /// * `options` - post-processing and memory layout options.
    /// * `aux` - auxiliary working areas registered along with the buffers.
    ///
    /// On failure, every buffer allocated so far is released.
    pub fn allocate<B: VpuBackend + ?Sized>(
        backend: &mut B,
        allocator: &dyn DmaAllocator,
        stream: &StreamInfo,
        options: &PoolOptions,
        aux: &BufferInfo,
    ) -> Result<Self, PoolError> {
        let layout = PoolLayout::new(stream.buffer_count, stream.min_buffer_count, options);
        let still_picture = descriptor(stream.format).is_still_picture();
        let mv_col = descriptor(stream.format).has_mv_col();
        let jpeg_format =
            (stream.format == StreamFormat::Mjpg).then_some(stream.jpeg_source_format);
        let stride = stream.stride;
        let height = stream.coded_resolution.height;

        let mut buffers = Vec::with_capacity(layout.total());
        for index in 0..layout.total() {
            let tiled = match options.map_type {
                MapType::Linear => false,
                // Post-processed pictures come out linear when detiling.
                _ => index < layout.decode_count || !options.tiled_to_linear,
            };
            let buffer =
                FrameBuffer::allocate(allocator, stride, height, tiled, jpeg_format, mv_col)
                    .map_err(|source| PoolError::Allocation { index, source })?;
            buffers.push(buffer);
        }

        log::debug!(
            "allocated {} frame buffers: {} decoding targets, {} post-processing, deblocking: {}",
            layout.total(),
            layout.decode_count,
            layout.post_processing_count,
            layout.deblocking
        );

        let descs: Vec<FrameBufferDesc> = buffers.iter().map(|b| b.desc).collect();
        let mut info = *aux;
        info.max_mb_x = stride / 16;
        info.max_mb_y = height / 16;
        info.max_mb_num = stride * height / 256;

        backend.command(Command::SetFrameDelay(-1))?;
        backend
            .register_frame_buffers(&descs, layout.decode_count, stride, &info)
            .map_err(PoolError::Registration)?;

        Ok(Self {
            buffers,
            layout,
            still_picture,
            next_post_processing: 0,
            held: Default::default(),
        })
    }

    pub fn layout(&self) -> &PoolLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FrameBuffer> {
        self.buffers.get(index)
    }

    /// Index of the buffer the post-processing path writes the next picture to.
    pub fn rotator_index(&self) -> usize {
        if self.still_picture || self.layout.post_processing_count == 0 {
            0
        } else {
            self.layout.decode_count + self.next_post_processing
        }
    }

    /// Moves to the next post-processing output.
    pub fn advance_rotator(&mut self) {
        if self.layout.post_processing_count > 0 {
            self.next_post_processing =
                (self.next_post_processing + 1) % self.layout.post_processing_count;
        }
    }

    /// Records that the picture in decoding target `index` has been output and must be given
    /// back later with [`FrameBufferPool::clear_display`].
    pub fn mark_displayed(&mut self, index: usize) -> Result<(), PoolError> {
        if index >= self.layout.decode_count {
            return Err(PoolError::NotADecodeTarget(index));
        }
        self.held.insert(index);
        Ok(())
    }

    /// Gives decoding target `index` back to the decoder.
    pub fn clear_display<B: VpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        index: usize,
    ) -> Result<(), PoolError> {
        if index >= self.layout.decode_count {
            return Err(PoolError::NotADecodeTarget(index));
        }
        if !self.held.remove(&index) {
            log::debug!("clearing buffer {} which was not marked as displayed", index);
        }
        backend.clear_display_flag(index)?;
        Ok(())
    }
}
