// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Wire format for streaming log records over a TCP connection.
//!
//! Every record travels as one frame:
//!
//! ```text
//! +----------------+-----------+------------------------+
//! | u32 BE length  | b"  "     | UTF-8 JSON (length B)  |
//! +----------------+-----------+------------------------+
//! ```
//!
//! The JSON object is flat and self-contained (message already interpolated,
//! errors flattened to text), so emitter and receiver share no types beyond
//! the field names. A frame with length 0 carries neither separator nor
//! payload.
//!
//! The same framing is used for any other serde message, which is how the
//! controller talks to its pool workers.

mod error;
mod frame;
mod record;

pub use error::FramingError;
pub use frame::{
    decode, encode, encode_frame, encode_with_limit, read_frame, read_message, write_frame,
    write_message, FRAME_SEPARATOR,
};
pub use record::{Level, LogRecord};

/// Default port of the log receiver (the well-known TCP logging port).
pub const DEFAULT_TCP_LOGGING_PORT: u16 = 9020;

/// Upper bound for a single frame unless a receiver is configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;
