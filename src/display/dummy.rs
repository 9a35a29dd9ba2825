// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Display surface kept in contiguous memory, for running without a screen.

use std::sync::Arc;

use crate::display::DisplayError;
use crate::display::DisplaySurface;
use crate::display::SurfaceConfig;
use crate::memory::DmaAllocator;
use crate::memory::DmaBuffer;

/// Surface whose memory comes from a [`DmaAllocator`], so that simulated devices can DMA into it.
pub struct SimulatedDisplay {
    allocator: Arc<dyn DmaAllocator>,
    memory: Option<DmaBuffer>,
    config: Option<SurfaceConfig>,
    pans: usize,
    blanked: bool,
}

impl SimulatedDisplay {
    pub fn new(allocator: Arc<dyn DmaAllocator>) -> Self {
        Self {
            allocator,
            memory: None,
            config: None,
            pans: 0,
            blanked: true,
        }
    }

    pub fn config(&self) -> Option<&SurfaceConfig> {
        self.config.as_ref()
    }

    /// Number of times the surface has been flipped.
    pub fn pans(&self) -> usize {
        self.pans
    }

    pub fn is_blanked(&self) -> bool {
        self.blanked
    }

    /// Current content of the surface.
    pub fn contents(&self) -> Vec<u8> {
        self.memory
            .as_ref()
            .map(|m| m.map().to_vec())
            .unwrap_or_default()
    }
}

impl DisplaySurface for SimulatedDisplay {
    fn configure(&mut self, config: &SurfaceConfig) -> Result<u64, DisplayError> {
        let memory = self.allocator.allocate(config.frame_size().max(1))?;
        let phys = memory.phys_addr();
        self.memory = Some(memory);
        self.config = Some(*config);
        self.blanked = false;
        Ok(phys)
    }

    fn pan(&mut self) -> Result<(), DisplayError> {
        if self.memory.is_none() {
            return Err(DisplayError::NotConfigured);
        }
        self.pans += 1;
        Ok(())
    }

    fn blank(&mut self, blank: bool) -> Result<(), DisplayError> {
        self.blanked = blank;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), DisplayError> {
        let memory = self.memory.as_mut().ok_or(DisplayError::NotConfigured)?;
        let size = memory.size();
        memory
            .write_at(0, data)
            .map_err(|_| DisplayError::TooLarge {
                len: data.len(),
                size,
            })
    }
}
