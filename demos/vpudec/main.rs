// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vpudec, a decoding session run against the simulated VPU. Capable of computing MD5 checksums
//! of the decoded pictures and writing them to a file or a framebuffer.

use std::fs::File;
use std::io::BufWriter;
use std::io::Cursor;
use std::io::Write;
use std::sync::Arc;

use mxc_codecs::backend::dummy::progressive_info;
use mxc_codecs::backend::dummy::synthetic_stream;
use mxc_codecs::backend::dummy::SimulatedVpu;
use mxc_codecs::bitstream_utils::BitstreamSource;
use mxc_codecs::config::DecoderConfig;
use mxc_codecs::decoder::output::FrameGeometry;
use mxc_codecs::decoder::output::FramebufferSink;
use mxc_codecs::decoder::output::OutputError;
use mxc_codecs::decoder::output::OutputSink;
use mxc_codecs::decoder::session::Session;
use mxc_codecs::display::FramebufferDevice;
use mxc_codecs::memory::heap::HeapAllocator;
use mxc_codecs::MirrorDirection;

use crate::util::Args;
use crate::util::Md5Computation;

mod util;

/// Writes pictures to an optional file while computing their MD5.
struct Md5Sink {
    output: Option<BufWriter<File>>,
    mode: Option<Md5Computation>,
    stream: md5::Context,
    frames: usize,
}

impl OutputSink for Md5Sink {
    fn configure(&mut self, geometry: &FrameGeometry) -> Result<(), OutputError> {
        log::info!(
            "output is {}x{}, {} bytes per picture",
            geometry.width,
            geometry.height,
            geometry.frame_size
        );
        Ok(())
    }

    fn deliver(&mut self, picture: &[u8]) -> Result<(), OutputError> {
        if let Some(output) = &mut self.output {
            output.write_all(picture)?;
        }
        match self.mode {
            Some(Md5Computation::Frame) => println!("{:x}", md5::compute(picture)),
            Some(Md5Computation::Stream) => self.stream.consume(picture),
            None => (),
        }
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), OutputError> {
        if let Some(output) = &mut self.output {
            output.flush()?;
        }
        if self.mode == Some(Md5Computation::Stream) {
            let context = std::mem::replace(&mut self.stream, md5::Context::new());
            println!("{:x}", context.compute());
        }
        log::info!("{} pictures written", self.frames);
        Ok(())
    }
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let source: Box<dyn BitstreamSource> = match &args.input {
        Some(path) => Box::new(File::open(path).expect("error opening input file")),
        None => Box::new(Cursor::new(synthetic_stream(args.frames, 256))),
    };

    let mut config = DecoderConfig::new(args.format);
    if let Some(rotation) = args.rotation {
        config.rotation_enabled = true;
        config.rotation = rotation;
    }
    // Mirroring goes through the rotator as well.
    config.mirror = args.mirror;
    config.rotation_enabled |= args.mirror != MirrorDirection::None;
    config.map_type = args.map_type;
    config.chroma_interleave = args.chroma_interleave;
    config.bitstream_mode = args.bitstream_mode();
    config.frame_count = args.frame_count;

    let sink: Box<dyn OutputSink> = match &args.framebuffer {
        Some(path) => Box::new(FramebufferSink::new(
            FramebufferDevice::open_path(path).expect("error opening framebuffer"),
        )),
        None => Box::new(Md5Sink {
            output: args
                .output
                .as_ref()
                .map(|p| BufWriter::new(File::create(p).expect("error creating output file"))),
            mode: args.compute_md5,
            stream: md5::Context::new(),
            frames: 0,
        }),
    };

    let allocator = HeapAllocator::default();
    let vpu = SimulatedVpu::new(
        allocator.bus().clone(),
        progressive_info(args.width, args.height, 2),
    );
    let mut session = Session::new(vpu, Arc::new(allocator), config, sink);

    session.open(source).expect("error opening decoder");
    let stream = session.parse().expect("error parsing stream");
    log::info!(
        "{}x{} stream, {} frame buffers",
        stream.display_resolution.width,
        stream.display_resolution.height,
        stream.buffer_count
    );
    session.allocate().expect("error allocating frame buffers");

    let termination = session.run();
    let stats = session.stats().clone();
    if let Err(e) = session.close() {
        log::error!("error closing decoder: {}", e);
    }

    match termination {
        Ok(termination) => log::info!("decoding ended: {:?}", termination),
        Err(e) => panic!("decoding failed after {} frames: {}", stats.frames, e),
    }
    log::info!(
        "{} frames, {} decoded, {} anomalies, {} error macroblocks",
        stats.frames,
        stats.decoded,
        stats.anomalies(),
        stats.error_macroblocks
    );
}
