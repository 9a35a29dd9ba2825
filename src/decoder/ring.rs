// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Feeding of the circular bitstream buffer the VPU reads compressed data from.

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::VpuBackend;
use crate::backend::STREAM_END_SIZE;
use crate::bitstream_utils::BitstreamSource;
use crate::bitstream_utils::JpegChunkReader;
use crate::bitstream_utils::SourceError;
use crate::memory::DmaBuffer;
use crate::utils::align_down;

/// Size of the bitstream ring.
pub const STREAM_BUF_SIZE: usize = 0x200000;
/// Minimum amount of data written by the top-ups performed between frames.
pub const STREAM_FILL_SIZE: usize = 0x40000;
/// First fill size for network sources, to start decoding as soon as possible.
pub const NETWORK_FIRST_FILL_SIZE: usize = 1024;

/// Granularity of opportunistic fills.
const FILL_ALIGNMENT: usize = 512;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("write pointer {write:#x} is outside of the ring at {base:#x}")]
    WritePointerOutOfRange { write: u64, base: u64 },
    #[error("JPEG picture of {len} bytes does not fit in the {size} bytes ring")]
    ChunkTooLarge { len: usize, size: usize },
    #[error("no picture found in the JPEG stream")]
    NoPicture,
    #[error("failed to read bitstream: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result of a [`BitstreamRing::fill`] call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FillOutcome {
    /// This many bytes were committed to the decoder.
    Filled(usize),
    /// Nothing could be written this time: the ring is full, less than the requested chunk is
    /// free or the source has nothing to give right now.
    NoProgress,
    /// The source is exhausted. Any remaining data has been committed and the decoder knows that
    /// no more is coming.
    EndOfStream,
}

/// The bitstream ring and its end-of-stream bookkeeping.
pub struct BitstreamRing {
    buffer: DmaBuffer,
    end_signalled: bool,
}

impl BitstreamRing {
    pub fn new(buffer: DmaBuffer) -> Self {
        Self {
            buffer,
            end_signalled: false,
        }
    }

    pub fn phys_addr(&self) -> u64 {
        self.buffer.phys_addr()
    }

    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    /// Whether the end-of-stream marker has been sent to the decoder.
    pub fn end_signalled(&self) -> bool {
        self.end_signalled
    }

    /// Makes the ring ready for a new stream. The end of that stream will be signalled again.
    pub fn rearm(&mut self) {
        self.end_signalled = false;
    }

    pub fn buffer_mut(&mut self) -> &mut DmaBuffer {
        &mut self.buffer
    }

    fn read_into<S: BitstreamSource + ?Sized>(
        &mut self,
        source: &mut S,
        offset: usize,
        len: usize,
    ) -> Result<usize, SourceError> {
        let mut mapping = self.buffer.map_mut();
        let n = source.read_bitstream(&mut mapping[offset..offset + len])?;
        Ok(n.min(len))
    }

    /// Copies as much data as the decoder can take from `source` into the ring.
    ///
    /// If `min_chunk` is not zero, exactly `min_chunk` bytes are requested, and nothing happens
    /// if less room than that is available. Otherwise all the free space, rounded down to a
    /// multiple of 512 bytes, is requested. A request crossing the end of the ring is split in two
    /// reads; if the first one comes back short the second one is skipped.
    ///
    /// The decoder is told about the end of the stream only once, the first time the source
    /// reports it.
    pub fn fill<B, S>(
        &mut self,
        backend: &mut B,
        source: &mut S,
        min_chunk: usize,
    ) -> Result<FillOutcome, FeedError>
    where
        B: VpuBackend + ?Sized,
        S: BitstreamSource + ?Sized,
    {
        let pointers = backend.bitstream_pointers()?;
        if pointers.space == 0 {
            log::trace!("no space left in the bitstream ring");
            return Ok(FillOutcome::NoProgress);
        }

        let size = if min_chunk > 0 {
            if pointers.space < min_chunk {
                return Ok(FillOutcome::NoProgress);
            }
            min_chunk
        } else {
            align_down(pointers.space, FILL_ALIGNMENT)
        };
        if size == 0 {
            return Ok(FillOutcome::NoProgress);
        }

        let base = self.phys_addr();
        let ring_size = self.size();
        let offset = pointers
            .write
            .checked_sub(base)
            .map(|o| o as usize)
            .filter(|&o| o < ring_size)
            .ok_or(FeedError::WritePointerOutOfRange {
                write: pointers.write,
                base,
            })?;
        let size = size.min(ring_size);

        let mut committed = 0;
        let mut exhausted = false;
        let first = size.min(ring_size - offset);
        match self.read_into(source, offset, first) {
            Err(SourceError::WouldBlock) => return Ok(FillOutcome::NoProgress),
            Err(e) => return Err(e.into()),
            Ok(0) => exhausted = true,
            Ok(n) => {
                committed = n;
                if n == first && first < size {
                    match self.read_into(source, 0, size - first) {
                        Err(SourceError::WouldBlock) => (),
                        Err(e) => return Err(e.into()),
                        Ok(0) => exhausted = true,
                        Ok(m) => committed += m,
                    }
                }
            }
        }

        if committed > 0 {
            backend.update_bitstream(committed)?;
        }

        if exhausted {
            if !self.end_signalled {
                log::debug!("end of bitstream reached");
                backend.update_bitstream(STREAM_END_SIZE)?;
                self.end_signalled = true;
            }
            return Ok(FillOutcome::EndOfStream);
        }

        Ok(if committed > 0 {
            FillOutcome::Filled(committed)
        } else {
            FillOutcome::NoProgress
        })
    }
}

/// Feeds JPEG pictures one at a time, each copied at the start of the ring.
pub struct ChunkFeeder {
    reader: JpegChunkReader,
    /// Size of the picture loaded before parsing, not decoded yet.
    primed: Option<usize>,
}

impl Default for ChunkFeeder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkFeeder {
    pub fn new() -> Self {
        Self {
            reader: JpegChunkReader::new(),
            primed: None,
        }
    }

    fn load<S: BitstreamSource + ?Sized>(
        &mut self,
        ring: &mut BitstreamRing,
        source: &mut S,
    ) -> Result<Option<usize>, FeedError> {
        let Some(chunk) = self.reader.next_chunk(source)? else {
            return Ok(None);
        };
        let size = ring.size();
        ring.buffer
            .write_at(0, &chunk)
            .map_err(|_| FeedError::ChunkTooLarge {
                len: chunk.len(),
                size,
            })?;
        Ok(Some(chunk.len()))
    }

    /// Loads the first picture so that the decoder can parse its header.
    pub fn prime<S: BitstreamSource + ?Sized>(
        &mut self,
        ring: &mut BitstreamRing,
        source: &mut S,
    ) -> Result<usize, FeedError> {
        let len = self.load(ring, source)?.ok_or(FeedError::NoPicture)?;
        self.primed = Some(len);
        Ok(len)
    }

    /// Loads the next picture and returns its location, or `None` once the stream is exhausted.
    /// The primed picture comes first.
    pub fn next_chunk<S: BitstreamSource + ?Sized>(
        &mut self,
        ring: &mut BitstreamRing,
        source: &mut S,
    ) -> Result<Option<(u64, usize)>, FeedError> {
        let len = match self.primed.take() {
            Some(len) => Some(len),
            None => self.load(ring, source)?,
        };
        Ok(len.map(|len| (ring.phys_addr(), len)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::io::ErrorKind;
    use std::io::Read;

    use proptest::prelude::*;

    use super::*;
    use crate::backend::dummy::progressive_info;
    use crate::backend::dummy::SimulatedVpu;
    use crate::backend::OpenParams;
    use crate::codec::StreamFormat;
    use crate::config::BitstreamMode;
    use crate::memory::heap::HeapAllocator;
    use crate::memory::DmaAllocator;
    use crate::MapType;

    const RING_SIZE: usize = 8192;

    fn setup() -> (SimulatedVpu, BitstreamRing) {
        let allocator = HeapAllocator::default();
        let ring = BitstreamRing::new(allocator.allocate(RING_SIZE).unwrap());
        let mut vpu = SimulatedVpu::new(allocator.bus().clone(), progressive_info(16, 16, 1));
        vpu.open(&OpenParams {
            format: StreamFormat::Mpeg2,
            bitstream_phys: ring.phys_addr(),
            bitstream_size: ring.size(),
            reorder: false,
            deblocking: false,
            chroma_interleave: false,
            map_type: MapType::Linear,
            tiled_to_linear: false,
            bitstream_mode: BitstreamMode::Normal,
            jpeg_line_buffer: false,
            ps_save_buffer: None,
        })
        .unwrap();
        (vpu, ring)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    /// Source returning at most `limit` bytes per read.
    struct Limited {
        data: Cursor<Vec<u8>>,
        limit: usize,
    }

    impl Read for Limited {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let len = buf.len().min(self.limit);
            self.data.read(&mut buf[..len])
        }
    }

    #[test]
    fn fills_free_space_rounded_down() {
        let (mut vpu, mut ring) = setup();
        vpu.update_bitstream(100).unwrap();
        let mut source = Cursor::new(pattern(RING_SIZE * 2));
        let outcome = ring.fill(&mut vpu, &mut source, 0).unwrap();
        // 8092 free bytes, rounded down to 7680.
        assert_eq!(outcome, FillOutcome::Filled(7680));
        assert_eq!(vpu.bitstream_pointers().unwrap().space, RING_SIZE - 100 - 7680);
    }

    #[test]
    fn minimum_chunk_not_available() {
        let (mut vpu, mut ring) = setup();
        vpu.update_bitstream(RING_SIZE - 1000).unwrap();
        let mut source = Cursor::new(pattern(4096));
        assert_eq!(
            ring.fill(&mut vpu, &mut source, 1024).unwrap(),
            FillOutcome::NoProgress
        );
        assert_eq!(source.position(), 0);
        assert_eq!(
            ring.fill(&mut vpu, &mut source, 512).unwrap(),
            FillOutcome::Filled(512)
        );
    }

    #[test]
    fn full_ring_is_no_progress() {
        let (mut vpu, mut ring) = setup();
        vpu.update_bitstream(RING_SIZE).unwrap();
        let mut source = Cursor::new(pattern(16));
        assert_eq!(
            ring.fill(&mut vpu, &mut source, 0).unwrap(),
            FillOutcome::NoProgress
        );
    }

    #[test]
    fn wrapped_write_is_split() {
        let (mut vpu, mut ring) = setup();
        // Move both pointers close to the end of the ring.
        vpu.update_bitstream(RING_SIZE - 1024).unwrap();
        vpu.consume_bitstream(RING_SIZE - 1024);

        let data = pattern(4096);
        let mut source = Cursor::new(data.clone());
        assert_eq!(
            ring.fill(&mut vpu, &mut source, 4096).unwrap(),
            FillOutcome::Filled(4096)
        );

        let mapping = ring.buffer_mut().map();
        assert_eq!(&mapping[RING_SIZE - 1024..], &data[..1024]);
        assert_eq!(&mapping[..3072], &data[1024..]);
    }

    #[test]
    fn short_read_at_wrap_skips_second_segment() {
        let (mut vpu, mut ring) = setup();
        vpu.update_bitstream(RING_SIZE - 1024).unwrap();
        vpu.consume_bitstream(RING_SIZE - 1024);

        let mut source = Limited {
            data: Cursor::new(pattern(4096)),
            limit: 700,
        };
        assert_eq!(
            ring.fill(&mut vpu, &mut source, 4096).unwrap(),
            FillOutcome::Filled(700)
        );
        assert_eq!(vpu.journal().bitstream_updates.last(), Some(&700));
        assert_eq!(source.data.position(), 700);
    }

    #[test]
    fn end_of_stream_is_signalled_once() {
        let (mut vpu, mut ring) = setup();
        let mut source = Cursor::new(pattern(1000));
        assert_eq!(
            ring.fill(&mut vpu, &mut source, 0).unwrap(),
            FillOutcome::Filled(1000)
        );
        assert_eq!(
            ring.fill(&mut vpu, &mut source, 0).unwrap(),
            FillOutcome::EndOfStream
        );
        assert_eq!(
            ring.fill(&mut vpu, &mut source, 0).unwrap(),
            FillOutcome::EndOfStream
        );
        assert!(ring.end_signalled());
        assert_eq!(vpu.journal().end_of_stream_markers, 1);
        assert_eq!(vpu.journal().bitstream_updates, vec![1000, STREAM_END_SIZE]);
    }

    #[test]
    fn would_block_is_no_progress() {
        struct Starved;

        impl Read for Starved {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(ErrorKind::WouldBlock.into())
            }
        }

        let (mut vpu, mut ring) = setup();
        assert_eq!(
            ring.fill(&mut vpu, &mut Starved, 0).unwrap(),
            FillOutcome::NoProgress
        );
        assert!(vpu.journal().bitstream_updates.is_empty());
    }

    #[test]
    fn source_errors_are_reported() {
        struct Broken;

        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(ErrorKind::BrokenPipe.into())
            }
        }

        let (mut vpu, mut ring) = setup();
        assert!(matches!(
            ring.fill(&mut vpu, &mut Broken, 0),
            Err(FeedError::Source(SourceError::Io(_)))
        ));
    }

    #[test]
    fn pictures_are_fed_one_at_a_time() {
        let (_, mut ring) = setup();
        let mut stream = vec![0xff, 0xd8, 1, 2, 3];
        stream.extend_from_slice(&[0xff, 0xd8, 4, 5]);
        let mut source = Cursor::new(stream);
        let mut feeder = ChunkFeeder::new();

        assert_eq!(feeder.prime(&mut ring, &mut source).unwrap(), 5);
        assert_eq!(
            feeder.next_chunk(&mut ring, &mut source).unwrap(),
            Some((ring.phys_addr(), 5))
        );
        assert_eq!(
            feeder.next_chunk(&mut ring, &mut source).unwrap(),
            Some((ring.phys_addr(), 4))
        );
        assert_eq!(&ring.buffer_mut().map()[..4], &[0xff, 0xd8, 4, 5]);
        assert_eq!(feeder.next_chunk(&mut ring, &mut source).unwrap(), None);
    }

    #[test]
    fn empty_jpeg_stream_has_no_picture() {
        let (_, mut ring) = setup();
        let mut source = Cursor::new(vec![1u8, 2, 3]);
        assert!(matches!(
            ChunkFeeder::new().prime(&mut ring, &mut source),
            Err(FeedError::NoPicture)
        ));
    }

    proptest! {
        /// Whatever the interleaving of fills and consumption, the feeder never writes past the
        /// read pointer and the bytes come out of the ring in order.
        #[test]
        fn never_overruns_the_reader(
            steps in proptest::collection::vec((0usize..3000, 0usize..4096, 1usize..5000), 1..40)
        ) {
            let (mut vpu, mut ring) = setup();
            let data = pattern(64 * 1024);
            let mut source = Limited { data: Cursor::new(data.clone()), limit: usize::MAX };
            let mut consumed = Vec::new();

            for (min_chunk, consume, limit) in steps {
                source.limit = limit;
                // The simulated decoder rejects updates larger than the free space.
                ring.fill(&mut vpu, &mut source, min_chunk).unwrap();

                let pointers = vpu.bitstream_pointers().unwrap();
                let available = RING_SIZE - pointers.space;
                let consume = consume.min(available);
                let start = (pointers.read - ring.phys_addr()) as usize;
                let mapping = ring.buffer_mut().map();
                for i in 0..consume {
                    consumed.push(mapping[(start + i) % RING_SIZE]);
                }
                drop(mapping);
                vpu.consume_bitstream(consume);
            }

            prop_assert_eq!(&consumed[..], &data[..consumed.len()]);
        }
    }
}
