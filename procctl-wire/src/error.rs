// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("i/o error on frame stream: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream before the declared length was satisfied.
    #[error("stream closed after {received} of {expected} frame bytes")]
    Truncated { expected: usize, received: usize },

    #[error("declared frame length {len} exceeds the maximum of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("unexpected frame separator {0:?}")]
    BadSeparator([u8; 2]),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}
