// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side driver for the i.MX VPU hardware decoder and the IPU post-processing engine.
//!
//! The hardware does the actual decoding. This crate keeps it fed with bitstream, hands it frame
//! buffers, reacts to what it reports after each frame and forwards decoded pictures to an output
//! sink. The entry point is [`decoder::session::Session`].

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod display;
pub mod image_processing;
pub mod ipu;
pub mod memory;
pub mod utils;

use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns a copy of this resolution with width and height swapped, i.e. the resolution of
    /// the picture after a quarter turn.
    pub fn transposed(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// A rectangle expressed by its edges, in pixels. `right` and `bottom` are exclusive.
///
/// An all-zero rectangle means "no cropping".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Clockwise rotation applied by the post-processing path.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::Rotate90 => 90,
            Rotation::Rotate180 => 180,
            Rotation::Rotate270 => 270,
        }
    }

    /// The rotator turns counter-clockwise, so a clockwise quarter turn has to be programmed as
    /// its complement.
    pub fn hardware_angle(self) -> u32 {
        match self {
            Rotation::Rotate90 | Rotation::Rotate270 => 360 - self.degrees(),
            _ => self.degrees(),
        }
    }

    /// Whether the picture comes out of the rotator with width and height swapped.
    pub fn is_transposing(self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }
}

impl FromStr for Rotation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(Rotation::None),
            "90" => Ok(Rotation::Rotate90),
            "180" => Ok(Rotation::Rotate180),
            "270" => Ok(Rotation::Rotate270),
            _ => Err("unrecognized rotation angle. Valid values: 0, 90, 180, 270"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MirrorDirection {
    #[default]
    None,
    Vertical,
    Horizontal,
    Both,
}

impl MirrorDirection {
    /// Value of the direction as understood by the VPU firmware.
    pub fn to_raw(self) -> u32 {
        match self {
            MirrorDirection::None => 0,
            MirrorDirection::Vertical => 1,
            MirrorDirection::Horizontal => 2,
            MirrorDirection::Both => 3,
        }
    }
}

impl FromStr for MirrorDirection {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "0" => Ok(MirrorDirection::None),
            "ver" | "vertical" | "1" => Ok(MirrorDirection::Vertical),
            "hor" | "horizontal" | "2" => Ok(MirrorDirection::Horizontal),
            "both" | "hor-ver" | "3" => Ok(MirrorDirection::Both),
            _ => Err("unrecognized mirror direction. Valid values: none, ver, hor, both"),
        }
    }
}

/// Memory layout of the decoded frame buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MapType {
    #[default]
    Linear,
    TiledFrame,
    TiledField,
}

impl MapType {
    pub fn is_tiled(self) -> bool {
        self != MapType::Linear
    }
}

impl FromStr for MapType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" | "0" => Ok(MapType::Linear),
            "tiled-frame" | "1" => Ok(MapType::TiledFrame),
            "tiled-field" | "2" => Ok(MapType::TiledField),
            _ => Err("unrecognized map type. Valid values: linear, tiled-frame, tiled-field"),
        }
    }
}
