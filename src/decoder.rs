// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding sessions on the VPU.
//!
//! A [`session::Session`] owns everything a decoding run needs: the bitstream [`ring`] the VPU
//! reads from, the frame buffer [`pool`] it decodes into and the [`output`] sink decoded pictures
//! are handed to. The per-frame protocol with the hardware lives in [`decode_loop`].

pub mod crop;
pub mod decode_loop;
pub mod negotiate;
pub mod output;
pub mod pool;
pub mod report;
pub mod ring;
pub mod session;

use thiserror::Error;

use crate::backend::BackendError;
use crate::decoder::negotiate::NegotiateError;
use crate::decoder::output::OutputError;
use crate::decoder::pool::PoolError;
use crate::decoder::ring::FeedError;
use crate::decoder::session::SessionState;
use crate::memory::MemoryError;

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Error returned by a decoding session.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("cannot {operation} while the session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("decoder still busy after {polls} polls, giving up")]
    Hang { polls: u32 },
    #[error("parameter set buffer is too small for this stream")]
    PsBufferOverflow,
    #[error("slice buffer is too small for this stream")]
    SliceBufferOverflow,
    #[error("failed to start decoding a frame: {0}")]
    StartFailed(#[source] BackendError),
    #[error("failed to retrieve the decoding result: {0}")]
    OutputInfo(#[source] BackendError),
    #[error("failed to write diagnostic report: {0}")]
    Report(#[source] std::io::Error),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Negotiate(#[from] NegotiateError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
