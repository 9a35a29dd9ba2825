// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bitstream sources and helpers to read from them.

use std::io::ErrorKind;
use std::io::Read;

use bytes::Buf;
use bytes::Bytes;
use bytes::BytesMut;
use thiserror::Error;

/// Amount of data read from the source at a time when looking for JPEG pictures.
pub const MJPG_FILL_SIZE: usize = 0x1000;

const SOI: [u8; 2] = [0xff, 0xd8];

#[derive(Error, Debug)]
pub enum SourceError {
    /// No data is available right now, but more may come later.
    #[error("no data available from the source yet")]
    WouldBlock,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Anything compressed data can be pulled from.
///
/// A read returning `Ok(0)` means the end of the stream has been reached. Short reads are
/// allowed and simply mean fewer bytes are available at the moment.
pub trait BitstreamSource {
    fn read_bitstream(&mut self, buf: &mut [u8]) -> Result<usize, SourceError>;
}

impl<R: Read + ?Sized> BitstreamSource for R {
    fn read_bitstream(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        loop {
            match self.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Err(SourceError::WouldBlock),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Start-of-image marker detection state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum SoiState {
    #[default]
    Idle,
    /// Last byte was 0xff.
    Marker,
    /// Last two bytes were a start-of-image marker.
    Found,
}

impl SoiState {
    fn next(self, byte: u8) -> Self {
        match (self, byte) {
            (SoiState::Marker, 0xd8) => SoiState::Found,
            (_, 0xff) => SoiState::Marker,
            _ => SoiState::Idle,
        }
    }
}

/// Splits a motion JPEG stream into individual pictures by looking for start-of-image markers.
///
/// Pictures embedding a thumbnail (SOI-SOI-EOI-EOI) are not supported, since they would be split
/// at the thumbnail.
#[derive(Default)]
pub struct JpegChunkReader {
    /// Data read from the source and not returned yet. Once synchronized, starts with the SOI
    /// marker of the next picture.
    cache: BytesMut,
    /// Position up to which `cache` has been scanned.
    scanned: usize,
    state: SoiState,
    synchronized: bool,
    eof: bool,
}

impl JpegChunkReader {
    pub fn new() -> Self {
        Default::default()
    }

    /// Scans the cache for the next SOI marker, reading more data from `source` as needed.
    /// Returns the position right after the marker, or `None` once the source is exhausted.
    ///
    /// When the source runs dry, a synthetic SOI is appended once so the last picture can be
    /// delimited like the others.
    fn seek_soi<S: BitstreamSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<usize>, SourceError> {
        loop {
            if self.scanned == self.cache.len() {
                let mut chunk = [0u8; MJPG_FILL_SIZE];
                match source.read_bitstream(&mut chunk)? {
                    0 if self.eof => return Ok(None),
                    0 => {
                        log::debug!("end of JPEG stream, padding SOI");
                        self.cache.extend_from_slice(&SOI);
                        self.eof = true;
                    }
                    n => self.cache.extend_from_slice(&chunk[..n]),
                }
            }

            while self.scanned < self.cache.len() {
                self.state = self.state.next(self.cache[self.scanned]);
                self.scanned += 1;
                if self.state == SoiState::Found {
                    return Ok(Some(self.scanned));
                }
            }
        }
    }

    /// Returns the next complete picture, starting with its SOI marker, or `None` at the end of
    /// the stream.
    pub fn next_chunk<S: BitstreamSource + ?Sized>(
        &mut self,
        source: &mut S,
    ) -> Result<Option<Bytes>, SourceError> {
        if !self.synchronized {
            let Some(pos) = self.seek_soi(source)? else {
                return Ok(None);
            };
            // Drop anything before the first picture.
            self.cache.advance(pos - SOI.len());
            self.scanned = SOI.len();
            self.synchronized = true;
        }

        let Some(pos) = self.seek_soi(source)? else {
            return Ok(None);
        };
        let chunk = self.cache.split_to(pos - SOI.len()).freeze();
        self.scanned = SOI.len();
        log::trace!("JPEG chunk of {} bytes", chunk.len());

        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn picture(fill: u8, len: usize) -> Vec<u8> {
        let mut data = vec![0xff, 0xd8];
        data.extend(std::iter::repeat(fill).take(len));
        data.extend_from_slice(&[0xff, 0xd9]);
        data
    }

    /// Returns at most `step` bytes per read, to exercise markers straddling reads.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let len = buf.len().min(self.step);
            self.data.read(&mut buf[..len])
        }
    }

    #[test]
    fn splits_pictures_at_soi() {
        let mut stream = vec![0x00, 0x12];
        let first = picture(0x11, 100);
        let second = picture(0x22, 5000);
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);

        let mut source = Cursor::new(stream);
        let mut reader = JpegChunkReader::new();
        assert_eq!(reader.next_chunk(&mut source).unwrap().unwrap(), first);
        assert_eq!(reader.next_chunk(&mut source).unwrap().unwrap(), second);
        assert!(reader.next_chunk(&mut source).unwrap().is_none());
        assert!(reader.next_chunk(&mut source).unwrap().is_none());
    }

    #[test]
    fn markers_straddling_reads() {
        let first = picture(0xff, 7);
        let second = picture(0x33, 3);
        let mut source = Trickle {
            data: Cursor::new([first.clone(), second.clone()].concat()),
            step: 1,
        };
        let mut reader = JpegChunkReader::new();
        assert_eq!(reader.next_chunk(&mut source).unwrap().unwrap(), first);
        assert_eq!(reader.next_chunk(&mut source).unwrap().unwrap(), second);
        assert!(reader.next_chunk(&mut source).unwrap().is_none());
    }

    #[test]
    fn empty_stream() {
        let mut reader = JpegChunkReader::new();
        assert!(reader
            .next_chunk(&mut Cursor::new(Vec::<u8>::new()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn would_block_is_reported() {
        struct Starved;

        impl Read for Starved {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(ErrorKind::WouldBlock.into())
            }
        }

        assert!(matches!(
            Starved.read_bitstream(&mut [0u8; 4]),
            Err(SourceError::WouldBlock)
        ));
    }
}
