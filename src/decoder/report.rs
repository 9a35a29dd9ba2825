// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Text dumps of the per-frame reports the decoder can produce.
//!
//! Every report goes to its own file under [`ReportConfig::directory`]. Files are only created
//! the first time something is written to them and are flushed after every frame, so they can be
//! followed while decoding.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::io::Write;

use byteorder::BigEndian;
use byteorder::ByteOrder;

use crate::backend::FrameReports;
use crate::backend::MotionVectorReport;
use crate::backend::UserDataReport;
use crate::config::ReportConfig;

/// Offset of the user data payload in the user data report, after the entry table.
pub const USER_DATA_INFO_OFFSET: usize = 8 * 17;

const USER_DATA_ENTRY_SIZE: usize = 8;
const MOTION_VECTOR_SIZE: usize = 4;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ReportFile {
    FrameBufferStatus,
    ErrorMap,
    Qp,
    SliceBoundary,
    MotionVectors,
    UserData,
}

impl ReportFile {
    fn file_name(self) -> &'static str {
        match self {
            ReportFile::FrameBufferStatus => "frame_buffer_status.log",
            ReportFile::ErrorMap => "error_map.log",
            ReportFile::Qp => "qp.log",
            ReportFile::SliceBoundary => "slice_boundary.log",
            ReportFile::MotionVectors => "motion_vectors.log",
            ReportFile::UserData => "user_data.log",
        }
    }
}

/// Writes the status of every frame buffer, one nibble per buffer.
pub fn write_frame_buffer_status<W: Write>(
    out: &mut W,
    frame: u64,
    status: &[u8],
) -> io::Result<()> {
    writeln!(out, "FRAME [{}]", frame)?;
    for (i, byte) in status.iter().enumerate() {
        write!(out, "[{}] {} ", i * 2, (byte >> 4) & 0x0f)?;
        write!(out, "[{}] {} ", i * 2 + 1, byte & 0x0f)?;
    }
    writeln!(out)
}

/// Splits the macroblock parameters into quantizer, slice boundary and error map dumps.
pub fn write_macroblock_info<Q, S, E>(
    qp: &mut Q,
    slice_boundary: &mut S,
    error_map: &mut E,
    frame: u64,
    info: &[u8],
) -> io::Result<()>
where
    Q: Write,
    S: Write,
    E: Write,
{
    writeln!(qp, "FRAME [{}]", frame)?;
    writeln!(slice_boundary, "FRAME [{}]", frame)?;
    writeln!(error_map, "FRAME [{}]", frame)?;

    for (i, byte) in info.iter().enumerate() {
        writeln!(qp, "MbAddr[{:4}]: MbQs[{:2}]", i, byte & 0x3f)?;
        writeln!(
            slice_boundary,
            "MbAddr[{:4}]: Slice Boundary Flag[{}]",
            i,
            (byte >> 6) & 1
        )?;
        writeln!(error_map, "MbAddr[{:4}]: ErrMap[{}]", i, (byte >> 7) & 1)?;
    }

    Ok(())
}

/// Motion vector components are 14-bit two's complement values, with bit 15 flagging an inter
/// macroblock.
fn motion_vector_component(raw: u16) -> i16 {
    if raw & 0x2000 != 0 {
        (raw | 0xc000) as i16
    } else {
        (raw & 0x1fff) as i16
    }
}

pub fn write_motion_vectors<W: Write>(
    out: &mut W,
    frame: u64,
    report: &MotionVectorReport,
) -> io::Result<()> {
    writeln!(out, "FRAME [{}]", frame)?;

    let per_macroblock = report.per_macroblock.max(1);
    for (i, macroblock) in report
        .data
        .chunks_exact(per_macroblock * MOTION_VECTOR_SIZE)
        .enumerate()
    {
        for (j, vector) in macroblock.chunks_exact(MOTION_VECTOR_SIZE).enumerate() {
            let direction = match j {
                0 => "For ",
                1 => "Back",
                _ => continue,
            };

            let raw_x = BigEndian::read_u16(&vector[0..2]);
            let raw_y = BigEndian::read_u16(&vector[2..4]);
            let (available, x, y) = if raw_x & 0x8000 == 0 {
                // Intra macroblock.
                (0, 0, 0)
            } else {
                (
                    1,
                    motion_vector_component(raw_x),
                    motion_vector_component(raw_y),
                )
            };

            writeln!(
                out,
                "MbAddr[{:4}:{}]: Avail[{}] Mv[{:5}:{:5}]",
                i, direction, available, x, y
            )?;
        }
    }

    Ok(())
}

/// Writes the user data entry table followed by a hex dump of the payload.
pub fn write_user_data<W: Write>(out: &mut W, report: &UserDataReport) -> io::Result<()> {
    let data = &report.data;
    if data.len() < 4 {
        return Ok(());
    }

    let entries = BigEndian::read_u16(&data[0..2]) as usize;
    let total_size = BigEndian::read_u16(&data[2..4]) as usize;

    let table = data.get(USER_DATA_ENTRY_SIZE..).unwrap_or_default();
    for (i, entry) in table
        .chunks_exact(USER_DATA_ENTRY_SIZE)
        .take(entries)
        .enumerate()
    {
        let kind = BigEndian::read_u16(&entry[0..2]);
        let size = BigEndian::read_u16(&entry[2..4]);
        write!(out, "\n[Idx Type Size] : [{:4} {:4} {:4}]", i, kind, size)?;
    }
    writeln!(out)?;

    let payload = data.get(USER_DATA_INFO_OFFSET..).unwrap_or_default();
    for (i, byte) in payload.iter().take(total_size).enumerate() {
        write!(out, "{:02x}", byte)?;
        if i & 7 == 7 {
            writeln!(out)?;
        }
    }
    writeln!(out)
}

/// Sink for the per-frame reports of a session.
pub struct DiagnosticReports {
    config: ReportConfig,
    files: BTreeMap<ReportFile, BufWriter<File>>,
}

impl DiagnosticReports {
    pub fn new(config: ReportConfig) -> Self {
        Self {
            config,
            files: Default::default(),
        }
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    fn file(&mut self, report: ReportFile) -> io::Result<&mut BufWriter<File>> {
        use std::collections::btree_map::Entry;

        match self.files.entry(report) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = self.config.directory.join(report.file_name());
                log::debug!("creating report file {}", path.display());
                Ok(entry.insert(BufWriter::new(File::create(path)?)))
            }
        }
    }

    /// Writes the enabled reports of frame `frame` and flushes them.
    pub fn record(&mut self, frame: u64, reports: &FrameReports) -> io::Result<()> {
        if self.config.frame_buffer_status {
            if let Some(status) = &reports.frame_buffer_status {
                let out = self.file(ReportFile::FrameBufferStatus)?;
                write_frame_buffer_status(out, frame, status)?;
                out.flush()?;
            }
        }

        if self.config.macroblock_info {
            if let Some(info) = &reports.macroblock_info {
                let (mut qp, mut slice_boundary, mut error_map) =
                    (Vec::new(), Vec::new(), Vec::new());
                write_macroblock_info(&mut qp, &mut slice_boundary, &mut error_map, frame, info)?;
                for (report, text) in [
                    (ReportFile::Qp, qp),
                    (ReportFile::SliceBoundary, slice_boundary),
                    (ReportFile::ErrorMap, error_map),
                ] {
                    let out = self.file(report)?;
                    out.write_all(&text)?;
                    out.flush()?;
                }
            }
        }

        if self.config.motion_vectors {
            if let Some(vectors) = &reports.motion_vectors {
                let out = self.file(ReportFile::MotionVectors)?;
                write_motion_vectors(out, frame, vectors)?;
                out.flush()?;
            }
        }

        Ok(())
    }

    pub fn record_user_data(&mut self, report: &UserDataReport) -> io::Result<()> {
        if !self.config.user_data {
            return Ok(());
        }

        if report.buffer_full {
            log::warn!("user data buffer is full");
        }
        let out = self.file(ReportFile::UserData)?;
        write_user_data(out, report)?;
        out.flush()
    }

    /// Flushes and closes every report file.
    pub fn close(&mut self) -> io::Result<()> {
        for (_, mut file) in std::mem::take(&mut self.files) {
            file.flush()?;
        }
        Ok(())
    }
}
