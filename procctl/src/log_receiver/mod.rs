// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Server side of the log stream.
//!
//! ```text
//! +-----------+   frames    +--------------+
//! | emitter A +------------>+ conn thread  +--+
//! +-----------+             +--------------+  |   +-------------------------+
//!                                             +-->+ SinkRegistry (per name) |
//! +-----------+             +--------------+  |   +-------------------------+
//! | emitter B +------------>+ conn thread  +--+
//! +-----------+             +--------------+
//! ```
//!
//! The accept loop only hands out connections and checks the abort flag.

mod cli;
mod embedded;
mod server;
mod sink;

pub use cli::{cli_main, ReceiverArgs};
pub use embedded::EmbeddedReceiver;
pub use server::LogReceiver;
pub use sink::{format_record, SinkRegistry, TimedRotatingFile};

#[cfg(test)]
mod tests;
