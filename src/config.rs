// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder session configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::codec::StreamFormat;
use crate::MapType;
use crate::MirrorDirection;
use crate::Rotation;

/// Environment variable overriding the number of frame buffers allocated on top of the minimum
/// the decoder asks for.
pub const EXTENDED_BUFFER_COUNT_VAR: &str = "VPU_EXTENDED_BUFFER_COUNT";
/// Environment variable adding a delay, in milliseconds, after every dispatched frame.
pub const DECODER_DELAY_VAR: &str = "VPU_DECODER_DELAY_MS";

const DEFAULT_EXTENDED_BUFFER_COUNT: usize = 2;

/// Knobs read from the environment once, when a session is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tunables {
    pub extended_buffer_count: usize,
    pub frame_delay: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            extended_buffer_count: DEFAULT_EXTENDED_BUFFER_COUNT,
            frame_delay: Duration::ZERO,
        }
    }
}

impl Tunables {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the tunables using `lookup` to resolve variable names. Values that cannot be parsed
    /// are reported and replaced by their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut tunables = Self::default();

        if let Some(value) = lookup(EXTENDED_BUFFER_COUNT_VAR) {
            match value.trim().parse() {
                Ok(count) => tunables.extended_buffer_count = count,
                Err(_) => log::warn!(
                    "ignoring invalid {}={:?}, using {}",
                    EXTENDED_BUFFER_COUNT_VAR,
                    value,
                    DEFAULT_EXTENDED_BUFFER_COUNT
                ),
            }
        }

        if let Some(value) = lookup(DECODER_DELAY_VAR) {
            match value.trim().parse() {
                Ok(ms) => tunables.frame_delay = Duration::from_millis(ms),
                Err(_) => log::warn!("ignoring invalid {}={:?}", DECODER_DELAY_VAR, value),
            }
        }

        tunables
    }
}

/// Where the bitstream comes from. Network sources are topped up after every frame and use a
/// small first fill so that decoding can start before the whole ring is full.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SourceKind {
    #[default]
    File,
    Network,
}

impl FromStr for SourceKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(SourceKind::File),
            "network" | "net" => Ok(SourceKind::Network),
            _ => Err("unrecognized source kind. Valid values: file, network"),
        }
    }
}

/// How the decoder behaves when a frame is not fully present in the ring.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BitstreamMode {
    /// The decoder waits for more data while it is busy.
    #[default]
    Normal,
    /// The decoder gives up on the incomplete frame and asks to be restarted once the ring has
    /// been topped up.
    Rollback,
}

/// Optional per-frame diagnostic reports, written as text files under `directory`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportConfig {
    pub directory: PathBuf,
    pub frame_buffer_status: bool,
    pub macroblock_info: bool,
    pub motion_vectors: bool,
    pub user_data: bool,
}

impl ReportConfig {
    pub fn any_enabled(&self) -> bool {
        self.frame_buffer_status || self.macroblock_info || self.motion_vectors || self.user_data
    }
}

/// Everything a session needs to know before it is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    pub format: StreamFormat,
    /// Route decoded pictures through the rotator even when `rotation` is `Rotation::None`, so
    /// that `mirror` can be applied.
    pub rotation_enabled: bool,
    pub rotation: Rotation,
    pub mirror: MirrorDirection,
    pub deblocking: bool,
    pub deringing: bool,
    pub map_type: MapType,
    pub tiled_to_linear: bool,
    pub chroma_interleave: bool,
    pub reorder: bool,
    pub bitstream_mode: BitstreamMode,
    pub source: SourceKind,
    /// Number of frames to output before stopping. Zero means no limit.
    pub frame_count: u64,
    /// Feed JPEG pictures one at a time instead of through the ring.
    pub jpeg_line_buffer: bool,
    /// Horizontal and vertical JPEG downscaling, as powers of two.
    pub jpeg_scale_down: (u8, u8),
    pub reports: ReportConfig,
}

impl DecoderConfig {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            format,
            rotation_enabled: false,
            rotation: Rotation::None,
            mirror: MirrorDirection::None,
            deblocking: false,
            deringing: false,
            map_type: MapType::Linear,
            tiled_to_linear: false,
            chroma_interleave: false,
            reorder: true,
            bitstream_mode: BitstreamMode::Normal,
            source: SourceKind::File,
            frame_count: 0,
            jpeg_line_buffer: false,
            jpeg_scale_down: (0, 0),
            reports: Default::default(),
        }
    }

    /// Whether decoded pictures go through the rotator before being output.
    pub fn post_processing(&self) -> bool {
        self.rotation_enabled || self.deringing || self.tiled_to_linear
    }

    /// Applies the combinations the hardware imposes: linear buffers cannot be detiled and tiled
    /// buffers always carry interleaved chroma.
    pub fn normalized(mut self) -> Self {
        if self.map_type == MapType::Linear {
            self.tiled_to_linear = false;
        } else {
            self.chroma_interleave = true;
        }
        if self.format != StreamFormat::Mjpg {
            self.jpeg_line_buffer = false;
        }
        self
    }
}
