// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Client side of the log stream. Every process (controller or worker) owns
//! one [`LogContext`]; components log through [`ProcessLogger`] handles.

mod context;
mod emitter;
mod facade;

pub use context::LogContext;
pub use emitter::{EmitError, LogEmitter, ProcessLogger};
pub use facade::install_facade;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use procctl_wire::{FramingError, Level, DEFAULT_MAX_FRAME_LEN};
    use std::io::ErrorKind;
    use std::net::TcpListener;
    use std::sync::Arc;

    fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new("127.0.0.1", port))
    }

    fn unused_endpoint() -> Endpoint {
        let (listener, endpoint) = listener();
        drop(listener);
        endpoint
    }

    #[test]
    fn same_name_shares_one_emitter_and_connection() {
        let (listener, endpoint) = listener();
        let context = LogContext::new(Some(endpoint), Level::Debug);

        let first = context.emitter("controller");
        let second = context.emitter("controller");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(context.emitter_count(), 1);

        context.logger("controller").info("one").unwrap();
        context.logger("controller").warn("two").unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let one = procctl_wire::decode(&mut stream, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
        let two = procctl_wire::decode(&mut stream, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!((one.msg.as_str(), two.levelname), ("one", Level::Warning));
        assert!(one.pathname.ends_with("mod.rs"));

        listener.set_nonblocking(true).unwrap();
        let again = listener.accept().map(|_| ()).unwrap_err();
        assert_eq!(again.kind(), ErrorKind::WouldBlock);
    }

    #[test]
    fn unreachable_receiver_is_reported() {
        let context = LogContext::new(Some(unused_endpoint()), Level::Info);
        let err = context.logger("worker").info("lost").unwrap_err();
        assert!(matches!(err, EmitError::Connect { .. }));
        assert!(!context.emitter("worker").is_connected());
    }

    #[test]
    fn filtered_records_never_touch_the_network() {
        let context = LogContext::new(Some(unused_endpoint()), Level::Warning);
        context.logger("worker").info("below threshold").unwrap();
        context.logger("worker").debug("below threshold").unwrap();
    }

    #[test]
    fn error_chain_travels_as_exc_text() {
        let (listener, endpoint) = listener();
        let context = LogContext::with_process_name(Some(endpoint), Level::Info, "Process-7");
        let err = anyhow::anyhow!("disk full").context("writing batch");
        context.logger("worker").error_with("job failed", &err).unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let record = procctl_wire::decode(&mut stream, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!(record.process_name, "Process-7");
        let exc_text = record.exc_text.unwrap();
        assert!(exc_text.contains("writing batch"));
        assert!(exc_text.contains("disk full"));
    }

    #[test]
    fn oversized_record_is_refused_and_the_connection_survives() {
        let (listener, endpoint) = listener();
        let context = LogContext::new(Some(endpoint), Level::Info);
        let logger = context.logger("worker");
        assert_eq!(context.emitter("worker").max_frame_len(), DEFAULT_MAX_FRAME_LEN);

        let err = logger.info("x".repeat(DEFAULT_MAX_FRAME_LEN + 100_000)).unwrap_err();
        assert!(matches!(
            err,
            EmitError::Encode(FramingError::TooLarge { max: DEFAULT_MAX_FRAME_LEN, .. })
        ));
        logger.info("small").unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let record = procctl_wire::decode(&mut stream, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!(record.msg, "small");
    }

    #[test]
    fn frame_limit_follows_the_context() {
        let context = LogContext::new(Some(unused_endpoint()), Level::Info).with_max_frame_len(256);
        let err = context.logger("worker").warn("y".repeat(512)).unwrap_err();
        assert!(matches!(err, EmitError::Encode(FramingError::TooLarge { max: 256, .. })));
        assert!(!context.emitter("worker").is_connected());
    }

    #[test]
    fn local_emitter_needs_no_receiver() {
        let context = LogContext::new(None, Level::Info);
        context.logger("local").info("to the log facade").unwrap();
        assert!(!context.emitter("local").is_connected());
        assert!(install_facade(context.emitter("local")).is_err());
    }
}
