// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! IPU emulated in software.
//!
//! Tasks are "run" by copying the input into the output, as far as both sizes allow: no
//! conversion, scaling or composition takes place. What matters is that the driver gets its
//! buffers, checks and submissions right, which the device records.

use anyhow::Context;

use crate::ipu::CheckResult;
use crate::ipu::IpuDevice;
use crate::ipu::IpuError;
use crate::ipu::IpuTask;
use crate::ipu::TaskBuffers;
use crate::memory::heap::HeapAllocator;
use crate::memory::DmaAllocator;
use crate::memory::DmaBuffer;
use crate::memory::MemoryError;

pub struct SimulatedIpu {
    allocator: HeapAllocator,
    /// Largest crop the device is able to split a task for.
    split_limit: Option<(u32, u32)>,
    check_failure: Option<i32>,
    checks: usize,
    queued: Vec<(IpuTask, TaskBuffers)>,
}

impl SimulatedIpu {
    pub fn new(allocator: HeapAllocator) -> Self {
        Self {
            allocator,
            split_limit: None,
            check_failure: None,
            checks: 0,
            queued: Vec::new(),
        }
    }

    /// Rejects crops wider than `width` or higher than `height` as split overflows.
    pub fn with_split_limit(mut self, width: u32, height: u32) -> Self {
        self.split_limit = Some((width, height));
        self
    }

    /// Fails every check with `code`.
    pub fn with_check_failure(mut self, code: i32) -> Self {
        self.check_failure = Some(code);
        self
    }

    /// Number of times a task has been checked.
    pub fn checks(&self) -> usize {
        self.checks
    }

    pub fn queued(&self) -> &[(IpuTask, TaskBuffers)] {
        &self.queued
    }
}

impl IpuDevice for SimulatedIpu {
    fn allocate(&self, size: usize) -> Result<DmaBuffer, MemoryError> {
        self.allocator.allocate(size)
    }

    fn check_task(&mut self, task: &IpuTask) -> Result<CheckResult, IpuError> {
        self.checks += 1;
        if let Some(code) = self.check_failure {
            return Ok(CheckResult::Failed(code));
        }

        let Some((max_w, max_h)) = self.split_limit else {
            return Ok(CheckResult::Ok);
        };
        Ok(if task.input.crop.w > max_w {
            CheckResult::SplitInputWidthOver
        } else if task.input.crop.h > max_h {
            CheckResult::SplitInputHeightOver
        } else if task.output.crop.w > max_w {
            CheckResult::SplitOutputWidthOver
        } else if task.output.crop.h > max_h {
            CheckResult::SplitOutputHeightOver
        } else {
            CheckResult::Ok
        })
    }

    fn queue_task(&mut self, task: &IpuTask, buffers: &TaskBuffers) -> Result<(), IpuError> {
        let len = task.input.frame_size().min(task.output.frame_size());
        let mut pixels = vec![0u8; len];
        let bus = self.allocator.bus();
        bus.read(buffers.input, &mut pixels)
            .context("reading task input")?;
        bus.write(buffers.output, &pixels)
            .context("writing task output")?;

        self.queued.push((*task, *buffers));
        Ok(())
    }
}
