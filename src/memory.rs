// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Physically contiguous memory shared with the hardware blocks.
//!
//! The VPU and IPU address memory physically, so every buffer they touch has to come from a
//! contiguous allocator and be mapped into the process for the CPU side. [`DmaBuffer`] ties both
//! views together and releases the allocation when dropped.

pub mod heap;
pub mod mxc;

use std::fmt::Debug;
use std::ops::Deref;
use std::ops::DerefMut;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("cannot allocate a zero-sized buffer")]
    ZeroSize,
    #[error("failed to allocate {size} bytes of contiguous memory: {source}")]
    AllocationFailed { size: usize, source: nix::Error },
    #[error("failed to map buffer at {phys:#x}: {source}")]
    MapFailed { phys: u64, source: nix::Error },
    #[error("range {phys:#x}+{len} is not backed by any buffer")]
    Unmapped { phys: u64, len: usize },
    #[error("access at offset {offset}+{len} exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A contiguous allocation visible both to the hardware, through its physical address, and to
/// the CPU, through its mapping.
pub trait DmaMemory: Send {
    fn phys_addr(&self) -> u64;

    fn size(&self) -> usize;

    fn map(&self) -> Box<dyn Deref<Target = [u8]> + '_>;

    fn map_mut(&mut self) -> Box<dyn DerefMut<Target = [u8]> + '_>;
}

/// Owned contiguous buffer. The memory is given back to its allocator on drop.
pub struct DmaBuffer(Box<dyn DmaMemory>);

impl DmaBuffer {
    pub fn new(memory: Box<dyn DmaMemory>) -> Self {
        Self(memory)
    }

    pub fn phys_addr(&self) -> u64 {
        self.0.phys_addr()
    }

    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub fn map(&self) -> Box<dyn Deref<Target = [u8]> + '_> {
        self.0.map()
    }

    pub fn map_mut(&mut self) -> Box<dyn DerefMut<Target = [u8]> + '_> {
        self.0.map_mut()
    }

    /// Copies `data` into the buffer, starting at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let size = self.size();
        if offset + data.len() > size {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: data.len(),
                size,
            });
        }

        self.map_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&mut self, value: u8) {
        self.map_mut().fill(value);
    }
}

impl Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("phys_addr", &format_args!("{:#x}", self.phys_addr()))
            .field("size", &self.size())
            .finish()
    }
}

/// Source of contiguous memory.
pub trait DmaAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<DmaBuffer, MemoryError>;
}
